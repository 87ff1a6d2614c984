//! Fixed-size worker pool.
//!
//! Work items are fed through a bounded channel to `threads` scoped worker
//! threads. The call returns only after every worker joined, so everything
//! the items wrote happens-before whatever the caller does next.

use anyhow::{Result, anyhow, bail};
use crossbeam::channel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadConfig {
    pub threads: usize,
    /// Work items per thread.
    pub multiplier: usize,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            threads: 1,
            multiplier: 4,
        }
    }
}

impl ThreadConfig {
    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            bail!("number of threads must be at least 1");
        }
        if self.multiplier == 0 {
            bail!("thread multiplier must be at least 1");
        }
        Ok(())
    }

    /// Total number of work items.
    pub fn num_chunks(&self) -> usize {
        self.threads * self.multiplier
    }
}

/// Run `job` on every item using `threads` workers and collect the results
/// in item order. The first error (or a worker panic) fails the whole call.
pub fn run_pool<T, R, F>(threads: usize, items: Vec<T>, job: F) -> Result<Vec<R>>
where
    T: Send,
    R: Send,
    F: Fn(T) -> Result<R> + Sync,
{
    if threads == 0 {
        bail!("number of threads must be at least 1");
    }
    let n = items.len();
    let (work_tx, work_rx) = channel::bounded::<(usize, T)>(threads * 2);
    let (done_tx, done_rx) = channel::unbounded::<(usize, Result<R>)>();

    let scope_result = crossbeam::scope(|s| {
        for _ in 0..threads {
            let rx = work_rx.clone();
            let tx = done_tx.clone();
            let job = &job;
            s.spawn(move |_| {
                for (i, item) in rx.iter() {
                    let r = job(item);
                    let failed = r.is_err();
                    // receiver outlives the scope
                    let _ = tx.send((i, r));
                    if failed {
                        break;
                    }
                }
            });
        }
        drop(work_rx);
        drop(done_tx);

        for (i, item) in items.into_iter().enumerate() {
            if work_tx.send((i, item)).is_err() {
                // every worker stopped early
                break;
            }
        }
        drop(work_tx);
    });
    scope_result.map_err(|_| anyhow!("a worker thread panicked"))?;

    let mut results: Vec<Option<R>> = (0..n).map(|_| None).collect();
    for (i, r) in done_rx.try_iter() {
        results[i] = Some(r?);
    }
    results
        .into_iter()
        .enumerate()
        .map(|(i, r)| r.ok_or_else(|| anyhow!("work item {} did not run", i)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_results_in_item_order() {
        let out = run_pool(3, (0..50).collect(), |x: u32| Ok(x * 2)).unwrap();
        assert_eq!(out, (0..50).map(|x| x * 2).collect::<Vec<_>>());
    }

    #[test]
    fn test_all_writes_visible_after_join() {
        let counter = AtomicUsize::new(0);
        run_pool(4, vec![(); 100], |_| {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
        .unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn test_error_fails_run() {
        let r = run_pool(2, (0..10).collect(), |x: u32| {
            if x == 7 {
                bail!("item {} failed", x)
            }
            Ok(x)
        });
        assert!(r.unwrap_err().to_string().contains("failed"));
    }

    #[test]
    fn test_panic_fails_run() {
        let r = run_pool(2, vec![1u32, 2, 3], |x| {
            if x == 2 {
                panic!("boom");
            }
            Ok(x)
        });
        assert!(r.is_err());
    }

    #[test]
    fn test_thread_config() {
        let c = ThreadConfig {
            threads: 3,
            multiplier: 2,
        };
        c.validate().unwrap();
        assert_eq!(c.num_chunks(), 6);
        assert!(
            ThreadConfig {
                threads: 0,
                multiplier: 1
            }
            .validate()
            .is_err()
        );
    }
}
