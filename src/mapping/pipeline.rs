//! One mapping run, end to end.
//!
//! Hits are ingested into the bounded-N store and the aligner table, the
//! retained hits are sorted and split into region work items, the pool runs
//! pass 1 over them, and once the pool joined the output processor merges
//! the temp streams (pass 2).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use indicatif::ProgressBar;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::io::hit_source::{HitLine, ReadTable, TemplateTable};
use crate::io::threads::{ThreadConfig, run_pool};
use crate::mapping::aligner::ScoreTableAligner;
use crate::mapping::blocker::BlockerSet;
use crate::mapping::filter_concat::MergeSummary;
use crate::mapping::hits::{Arm, RawHit};
use crate::mapping::match_result::MatchResult;
use crate::mapping::nstore::build_store;
use crate::mapping::opts::PipelineOpts;
use crate::mapping::processors::{OutputContext, OutputMode, OutputProcessor};
use crate::mapping::region::AlignmentWorkload;
use crate::mapping::statistics::{MapStatistics, Stat, StatsSnapshot};
use crate::mapping::status::{ReadStatusTracker, StatusFlag};
use crate::mapping::worker::RegionWorker;

/// What a run did, for logging and `map_info.json`.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub num_reads: usize,
    pub paired: bool,
    pub hits_ingested: u64,
    pub hits_retained: usize,
    pub hits_discarded: u64,
    pub num_work_items: usize,
    /// Records written to the temp streams by pass 1.
    pub candidate_records: u64,
    pub merge: MergeSummary,
    pub mapped_arms: u64,
    pub unmapped_arms: u64,
    pub blocked_arms: u64,
    pub stats: StatsSnapshot,
}

/// Inputs and settings of one run.
pub struct Pipeline<'a> {
    pub templates: &'a TemplateTable,
    pub reads: &'a ReadTable,
    pub opts: PipelineOpts,
    pub threads: ThreadConfig,
    pub out_dir: &'a Path,
    /// Where the per-region temp streams go.
    pub temp_dir: PathBuf,
    pub cmdline: &'a str,
}

impl Pipeline<'_> {
    fn check_hit(&self, hit: &RawHit) -> Result<()> {
        if hit.read_id as usize >= self.reads.num_reads() {
            bail!(
                "read id {} out of declared range (0..{})",
                hit.read_id,
                self.reads.num_reads()
            );
        }
        if hit.template_id as usize >= self.templates.len() {
            bail!("hit references unknown template {}", hit.template_id);
        }
        if hit.arm == Arm::Second && !self.reads.is_paired() {
            bail!("second-arm hit for single-end read {}", hit.read_id);
        }
        if hit.position < 0 {
            bail!("negative hit position {}", hit.position);
        }
        Ok(())
    }

    /// Run both passes over `hits`. `progress` ticks once per ingested hit.
    pub fn run<I>(&self, hits: I, progress: &ProgressBar) -> Result<RunSummary>
    where
        I: IntoIterator<Item = Result<HitLine>>,
    {
        let opts = self.opts;
        opts.validate()?;
        self.threads.validate()?;
        let num_reads = self.reads.num_reads();
        if num_reads == 0 {
            bail!("no reads declared");
        }
        let encoder = self.reads.encoder();
        let paired = self.reads.is_paired();

        let mut store = build_store(
            opts.store_policy,
            self.reads.num_encoded(),
            opts.top_n,
            opts.dedup,
        )?;
        let mut aligner = ScoreTableAligner::new(self.reads.encoded_lengths());
        let tracker = ReadStatusTracker::for_threads(num_reads, self.threads.threads);
        let stats = MapStatistics::new(paired);
        let blockers = BlockerSet::new(encoder, num_reads, opts.repeat_threshold)?;

        // -- ingestion ----------------------------------------------------
        let mut hits_ingested = 0u64;
        for line in hits {
            let HitLine { hit, cigar, md } = line?;
            self.check_hit(&hit)
                .with_context(|| format!("hit {}", hits_ingested + 1))?;
            tracker.add_status(hit.read_id, StatusFlag::matched(hit.arm))?;
            let encoded = encoder.encode(hit.read_id, hit.arm);
            // repeat counts see every hit, including those the store drops
            blockers.frequency.increment(encoded)?;
            store.process(
                encoded,
                hit.reverse,
                hit.template_id,
                hit.position,
                hit.score_indel,
            );
            aligner.insert(
                encoded,
                hit.template_id,
                hit.position,
                hit.reverse,
                hit.score_indel,
                cigar,
                md,
            );
            hits_ingested += 1;
            progress.inc(1);
        }

        let overflowed = store.overflowed_reads();
        for &encoded in &overflowed {
            tracker.add_status(
                encoder.read_id(encoded),
                StatusFlag::blocked(encoder.arm(encoded)),
            )?;
        }
        if !overflowed.is_empty() {
            info!("{} read arms exceeded the hit cap", overflowed.len());
        }

        let mut results = MatchResult::with_capacity(store.num_retained());
        store.set_all_results(&mut results);
        results.sort();
        let hits_retained = results.len();
        let hits_discarded = store.num_discarded();
        drop(store);
        info!(
            "ingested {} hits, retained {} ({} discarded)",
            hits_ingested, hits_retained, hits_discarded
        );
        if hits_ingested == 0 {
            warn!("no hits in input; every read is reported unmapped");
        }

        // -- pass 1 -------------------------------------------------------
        let ctx = OutputContext {
            templates: self.templates,
            reads: self.reads,
            blockers: &blockers,
            tracker: &tracker,
            stats: &stats,
            opts,
            out_dir: self.out_dir,
            cmdline: self.cmdline,
        };
        let mode = if opts.unfiltered {
            OutputMode::Unfiltered
        } else {
            OutputMode::Filtered
        };
        let mut processor = OutputProcessor::new(mode, ctx, self.temp_dir.clone())?;

        let workloads = AlignmentWorkload::partition(
            self.threads.num_chunks(),
            opts.padding(),
            &results,
            Some(self.templates.lengths()),
        )?;
        let num_work_items = workloads.len();
        for w in &workloads {
            debug!("work item {} hits in {}", w.len(), w.region());
        }

        let worker = RegionWorker {
            results: &results,
            aligner: &aligner,
            blockers: &blockers,
            tracker: &tracker,
            stats: &stats,
            reads: self.reads,
            opts,
        };
        let pass1 = run_pool(self.threads.threads, workloads, |wl| {
            let mut out = processor.thread_clone(wl.region())?;
            let n = worker.run(&wl, &mut out)?;
            out.thread_finish()?;
            Ok(n)
        });
        let candidate_records: u64 = match pass1 {
            Ok(counts) => counts.iter().sum(),
            Err(e) => {
                if let Err(cleanup) = processor.close() {
                    warn!("temp cleanup failed: {:#}", cleanup);
                }
                return Err(e.context("pass 1 failed"));
            }
        };
        info!(
            "pass 1 wrote {} candidate records in {} work items",
            candidate_records, num_work_items
        );

        // -- pass 2 -------------------------------------------------------
        let merge = match processor.finish() {
            Ok(m) => m,
            Err(e) => {
                if let Err(cleanup) = processor.close() {
                    warn!("temp cleanup failed: {:#}", cleanup);
                }
                return Err(e.context("merge failed"));
            }
        };
        processor.close()?;

        Ok(RunSummary {
            num_reads,
            paired,
            hits_ingested,
            hits_retained,
            hits_discarded,
            num_work_items,
            candidate_records,
            merge,
            mapped_arms: stats.total(Stat::Mated) + stats.total(Stat::Unmated),
            unmapped_arms: stats.total(Stat::Unmapped),
            blocked_arms: stats.total(Stat::Blocked),
            stats: stats.snapshot(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
