//! Output processors: per-region temp streams and the final merge.
//!
//! The parent [`OutputProcessor`] hands every work item a [`RegionOutput`]
//! through [`thread_clone`](OutputProcessor::thread_clone). Each clone owns
//! one temp stream and writes the records of its region in coordinate
//! order. Once the worker pool has joined, [`finish`](OutputProcessor::finish)
//! merges the streams into the final SAM files and writes the statistics.
//!
//! ```text
//! CREATED -> thread_clone* -> (per clone: process* -> thread_finish)
//!         -> pool join -> finish -> close
//! ```
//!
//! A clone has no `thread_clone` of its own, and `thread_finish` consumes
//! it, so both misuse cases are ruled out by the types.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, warn};

use crate::io::hit_source::{ReadTable, TemplateTable};
use crate::io::temp_record::{RecordKey, TempRecord, TempRecordWriter};
use crate::mapping::blocker::BlockerSet;
use crate::mapping::filter_concat::{MergeSummary, filter_concat};
use crate::mapping::opts::PipelineOpts;
use crate::mapping::region::HashingRegion;
use crate::mapping::statistics::MapStatistics;
use crate::mapping::status::ReadStatusTracker;

/// Name of the statistics report written by `finish`.
pub const SUMMARY_FILE: &str = "mapping_summary.txt";

/// Whether the merge consults the blockers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Blocker-driven filtering, top-N reporting.
    Filtered,
    /// Every record is written.
    Unfiltered,
}

/// Everything the merge reads: inputs, frozen counters, and the output
/// location. Shared read-only between the processor and the workers.
#[derive(Clone, Copy)]
pub struct OutputContext<'a> {
    pub templates: &'a TemplateTable,
    pub reads: &'a ReadTable,
    pub blockers: &'a BlockerSet,
    pub tracker: &'a ReadStatusTracker,
    pub stats: &'a MapStatistics,
    pub opts: PipelineOpts,
    pub out_dir: &'a Path,
    pub cmdline: &'a str,
}

#[derive(Debug)]
struct StreamSlot {
    path: PathBuf,
    finished: bool,
    num_records: u64,
}

/// Parent output processor of one run.
pub struct OutputProcessor<'a> {
    mode: OutputMode,
    ctx: OutputContext<'a>,
    temp_dir: PathBuf,
    next_stream: AtomicUsize,
    streams: Mutex<Vec<StreamSlot>>,
    finished: AtomicBool,
}

impl<'a> OutputProcessor<'a> {
    /// Create the processor; temp streams go to `temp_dir`, which is
    /// created if missing.
    pub fn new(mode: OutputMode, ctx: OutputContext<'a>, temp_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&temp_dir)
            .with_context(|| format!("failed to create temp directory {}", temp_dir.display()))?;
        Ok(Self {
            mode,
            ctx,
            temp_dir,
            next_stream: AtomicUsize::new(0),
            streams: Mutex::new(Vec::new()),
            finished: AtomicBool::new(false),
        })
    }

    pub fn mode(&self) -> OutputMode {
        self.mode
    }

    pub fn context(&self) -> &OutputContext<'a> {
        &self.ctx
    }

    fn lock_streams(&self) -> Result<std::sync::MutexGuard<'_, Vec<StreamSlot>>> {
        self.streams
            .lock()
            .map_err(|_| anyhow!("temp stream registry poisoned"))
    }

    /// Open a new temp stream for one work item owning `region`.
    pub fn thread_clone(&self, region: HashingRegion) -> Result<RegionOutput<'_, 'a>> {
        if self.finished.load(Ordering::Acquire) {
            bail!("cannot clone an output processor after finish");
        }
        let index = self.next_stream.fetch_add(1, Ordering::Relaxed);
        let path = self.temp_dir.join(format!("region_{:05}.mmtr", index));
        let writer = TempRecordWriter::create(&path)?;
        {
            let mut streams = self.lock_streams()?;
            if streams.len() <= index {
                streams.resize_with(index + 1, || StreamSlot {
                    path: PathBuf::new(),
                    finished: false,
                    num_records: 0,
                });
            }
            streams[index] = StreamSlot {
                path,
                finished: false,
                num_records: 0,
            };
        }
        debug!("stream {} opened for region {}", index, region);
        Ok(RegionOutput {
            parent: self,
            index,
            region,
            writer,
            last_key: None,
        })
    }

    fn stream_finished(&self, index: usize, num_records: u64) -> Result<()> {
        let mut streams = self.lock_streams()?;
        let slot = streams
            .get_mut(index)
            .ok_or_else(|| anyhow!("unknown temp stream {}", index))?;
        slot.finished = true;
        slot.num_records = num_records;
        Ok(())
    }

    /// Merge all temp streams into the final outputs and write the
    /// statistics report. Fails unless every clone finished.
    pub fn finish(&mut self) -> Result<MergeSummary> {
        if self.finished.load(Ordering::Acquire) {
            bail!("output processor already finished");
        }
        let paths: Vec<PathBuf> = {
            let streams = self.lock_streams()?;
            if let Some((i, s)) = streams.iter().enumerate().find(|(_, s)| !s.finished) {
                bail!(
                    "temp stream {} ({}) was never finished; refusing to merge",
                    i,
                    s.path.display()
                );
            }
            streams.iter().map(|s| s.path.clone()).collect()
        };
        self.finished.store(true, Ordering::Release);
        let delete = !self.ctx.opts.keep_temp;
        let summary = filter_concat(&self.ctx, self.mode, &paths, delete)?;
        self.ctx
            .stats
            .write_report(&self.ctx.out_dir.join(SUMMARY_FILE))?;
        Ok(summary)
    }

    /// Number of clones handed out so far.
    pub fn num_streams(&self) -> usize {
        self.next_stream.load(Ordering::Relaxed)
    }

    /// Remove temp streams that are still on disk (all of them after an
    /// aborted run, none when they are kept) and the temp directory if it
    /// is left empty.
    pub fn close(self) -> Result<()> {
        let keep = self.ctx.opts.keep_temp && self.finished.load(Ordering::Acquire);
        let streams = self
            .streams
            .into_inner()
            .map_err(|_| anyhow!("temp stream registry poisoned"))?;
        if !keep {
            for s in &streams {
                if s.path.as_os_str().is_empty() || !s.path.exists() {
                    continue;
                }
                std::fs::remove_file(&s.path)
                    .with_context(|| format!("failed to remove {}", s.path.display()))?;
            }
        }
        if let Ok(mut entries) = std::fs::read_dir(&self.temp_dir) {
            if entries.next().is_none() {
                if let Err(e) = std::fs::remove_dir(&self.temp_dir) {
                    warn!("could not remove {}: {}", self.temp_dir.display(), e);
                }
            }
        }
        Ok(())
    }
}

/// Per-work-item clone: owns one temp stream.
pub struct RegionOutput<'p, 'a> {
    parent: &'p OutputProcessor<'a>,
    index: usize,
    region: HashingRegion,
    writer: TempRecordWriter<BufWriter<File>>,
    last_key: Option<RecordKey>,
}

impl RegionOutput<'_, '_> {
    pub fn region(&self) -> HashingRegion {
        self.region
    }

    pub fn stream_index(&self) -> usize {
        self.index
    }

    pub fn num_records(&self) -> u64 {
        self.writer.num_records()
    }

    /// Write one record. Records must lie in the owned region and arrive in
    /// non-decreasing key order.
    pub fn process(&mut self, rec: &TempRecord) -> Result<()> {
        if rec.reference_id < 0
            || !self
                .region
                .is_in_range(rec.reference_id as u32, rec.start_position)
        {
            bail!(
                "{}: record for read {} at {}:{} lies outside region {}",
                self.writer.name(),
                rec.read_id,
                rec.reference_id,
                rec.start_position,
                self.region
            );
        }
        let key = rec.sort_key();
        if let Some(last) = self.last_key {
            if key < last {
                bail!(
                    "{}: record {} out of coordinate order ({:?} after {:?})",
                    self.writer.name(),
                    self.writer.num_records(),
                    key,
                    last
                );
            }
        }
        self.last_key = Some(key);
        self.writer.write(rec)
    }

    /// Write the sentinel and close the stream.
    pub fn thread_finish(self) -> Result<()> {
        let n = self.writer.num_records();
        self.writer.finish()?;
        self.parent.stream_finished(self.index, n)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
