//! Region worker: turns the hits owned by one work item into candidate
//! alignment records (pass 1).
//!
//! For every owned hit the worker asks the aligner for an alignment, counts
//! it in the shared score blockers, and writes an unmated record. For paired reads
//! it then looks, inside the padded window, for hits of the other arm that
//! form a properly oriented fragment within the length limits, and writes
//! one mated record per such mate.

use anyhow::Result;

use crate::io::hit_source::ReadTable;
use crate::io::temp_record::{TempRecord, flags};
use crate::mapping::aligner::{Aligner, Alignment};
use crate::mapping::blocker::BlockerSet;
use crate::mapping::hits::{Arm, INVALID_FRAG_LEN, INVALID_MATE_POS};
use crate::mapping::match_result::MatchResult;
use crate::mapping::opts::PipelineOpts;
use crate::mapping::processors::RegionOutput;
use crate::mapping::region::{AlignmentWorkload, HashingRegion};
use crate::mapping::statistics::{MapStatistics, Stat};
use crate::mapping::status::{ReadStatusTracker, StatusFlag};

/// Shared, read-only view used by every work item of a run.
#[derive(Clone, Copy)]
pub struct RegionWorker<'a> {
    pub results: &'a MatchResult,
    pub aligner: &'a dyn Aligner,
    pub blockers: &'a BlockerSet,
    pub tracker: &'a ReadStatusTracker,
    pub stats: &'a MapStatistics,
    pub reads: &'a ReadTable,
    pub opts: PipelineOpts,
}

/// Identity of a hit site: `(template, position, encoded read, reverse)`.
type Site = (u32, i32, u32, bool);

impl RegionWorker<'_> {
    fn site(&self, i: usize) -> Site {
        let r = self.results;
        (
            r.template_id(i),
            r.position(i),
            r.encoded_read_id(i),
            r.is_reverse(i),
        )
    }

    /// Process every hit of `workload`, writing to `out`. Returns the number
    /// of records written.
    pub fn run(&self, workload: &AlignmentWorkload, out: &mut RegionOutput<'_, '_>) -> Result<u64> {
        let region = workload.region();
        let encoder = self.reads.encoder();
        let mut prev: Option<Site> = None;

        for i in workload.chunk_start()..workload.chunk_end() {
            let site = self.site(i);
            // repeated sites yield the same alignment
            if prev == Some(site) {
                continue;
            }
            prev = Some(site);
            let (template_id, position, encoded, reverse) = site;
            let read_id = encoder.read_id(encoded);
            let arm = encoder.arm(encoded);

            let Some(aln) = self.aligner.align(encoded, template_id, position, reverse) else {
                continue;
            };
            self.stats.increment(arm, Stat::AlignmentsComputed);
            if aln.score <= self.opts.max_unmated_score {
                self.tracker
                    .add_status(read_id, StatusFlag::unmated_align_score(arm))?;
                self.blockers.unmated.increment(encoded, aln.score)?;
            } else {
                self.tracker
                    .add_status(read_id, StatusFlag::unmated_compute_alignment(arm))?;
            }

            let unmated = self.record(read_id, arm, template_id, position, reverse, &aln);
            out.process(&unmated)?;

            if encoder.is_paired() {
                self.emit_mates(region, i, read_id, arm, &aln, out)?;
            }
        }
        Ok(out.num_records())
    }

    fn record(
        &self,
        read_id: u32,
        arm: Arm,
        template_id: u32,
        position: i32,
        reverse: bool,
        aln: &Alignment,
    ) -> TempRecord {
        let mut f = if reverse { flags::REVERSE } else { 0 };
        if self.reads.is_paired() {
            f |= flags::PAIRED;
            f |= if arm.is_first() {
                flags::FIRST
            } else {
                flags::SECOND
            };
        }
        TempRecord {
            read_id: read_id as i32,
            flags: f,
            reference_id: template_id as i32,
            start_position: position as i64,
            cigar: aln.cigar.clone(),
            mate_position: INVALID_MATE_POS,
            template_length: INVALID_FRAG_LEN,
            num_mismatches: aln.num_mismatches,
            alignment_score: aln.score,
            combo_score: aln.score,
            md: aln.md.clone(),
            cg: aln.cg.clone(),
        }
    }

    /// Write a mated record for every compatible mate of hit `i`.
    fn emit_mates(
        &self,
        region: HashingRegion,
        i: usize,
        read_id: u32,
        arm: Arm,
        aln: &Alignment,
        out: &mut RegionOutput<'_, '_>,
    ) -> Result<()> {
        let r = self.results;
        let encoder = self.reads.encoder();
        let (template_id, position, _, reverse) = self.site(i);
        let mate_arm = arm.mate();
        let mate_encoded = encoder.encode(read_id, mate_arm);
        let len = self.reads.length(read_id, arm) as i64;
        let mate_len = self.reads.length(read_id, mate_arm) as i64;
        let max_frag = self.opts.max_frag_len as i64;
        let min_frag = self.opts.min_frag_len as i64;
        let p = position as i64;

        let window_start = (p - max_frag).max(0).min(i32::MAX as i64) as i32;
        let window_end = p + max_frag;
        let mut prev: Option<Site> = None;
        let mut j = r.lower_bound(template_id, window_start);
        while j < r.len() && r.template_id(j) == template_id && (r.position(j) as i64) <= window_end
        {
            let site = self.site(j);
            j += 1;
            if prev == Some(site) {
                continue;
            }
            prev = Some(site);
            let (_, mate_pos, enc, mate_reverse) = site;
            if enc != mate_encoded || mate_reverse == reverse {
                continue;
            }
            let q = mate_pos as i64;
            if !region.is_in_padded_range(template_id, q) {
                continue;
            }
            // forward arm must not start after the reverse arm
            let (fwd_start, rev_start) = if reverse { (q, p) } else { (p, q) };
            if fwd_start > rev_start {
                continue;
            }
            let frag = (p + len).max(q + mate_len) - p.min(q);
            if frag < min_frag || frag > max_frag {
                continue;
            }
            let Some(mate_aln) = self
                .aligner
                .align(mate_encoded, template_id, mate_pos, mate_reverse)
            else {
                continue;
            };
            let combo = aln.score.saturating_add(mate_aln.score);
            self.tracker.add_status(read_id, StatusFlag::Mated)?;
            if combo <= self.opts.max_mated_score {
                self.tracker.add_status(read_id, StatusFlag::MatedAlignScore)?;
                // one count per pair, from the first arm's owner
                if arm.is_first() {
                    self.blockers.mated.increment(read_id, combo)?;
                }
            }

            let leftmost = p < q || (p == q && arm.is_first());
            let mut rec = self.record(read_id, arm, template_id, position, reverse, aln);
            rec.flags |= flags::PROPER_PAIR;
            if mate_reverse {
                rec.flags |= flags::MATE_REVERSE;
            }
            rec.mate_position = q;
            rec.template_length = if leftmost { frag as i32 } else { -(frag as i32) };
            rec.combo_score = combo;
            out.process(&rec)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::hit_source::TemplateTable;
    use crate::io::temp_record::read_all_records;
    use crate::mapping::aligner::ScoreTableAligner;
    use crate::mapping::processors::{OutputContext, OutputMode, OutputProcessor};

    struct Run {
        records: Vec<TempRecord>,
        tracker: ReadStatusTracker,
        blockers: BlockerSet,
    }

    /// Run one work item over all hits `(read, arm, reverse, pos, score)` on
    /// a single template with paired reads of length 50.
    fn run_paired(hits: &[(u32, Arm, bool, i32, i32)], num_reads: usize, opts: PipelineOpts) -> Run {
        let dir = tempfile::tempdir().unwrap();
        let templates = TemplateTable::from_entries(vec![("chr1".into(), 10_000)]).unwrap();
        let reads = ReadTable::paired_end(
            (0..num_reads).map(|i| (format!("r{}", i), 50, 50)).collect(),
        );
        let encoder = reads.encoder();
        let mut results = MatchResult::new();
        let mut aligner = ScoreTableAligner::new(reads.encoded_lengths());
        for &(read, arm, rev, pos, score) in hits {
            let enc = encoder.encode(read, arm);
            results.add_match(0, pos, enc, rev);
            aligner.insert(enc, 0, pos, rev, score, None, None);
        }
        results.sort();
        let blockers = BlockerSet::new(encoder, num_reads, opts.repeat_threshold).unwrap();
        let tracker = ReadStatusTracker::for_threads(num_reads, 1);
        let stats = MapStatistics::new(true);
        let ctx = OutputContext {
            templates: &templates,
            reads: &reads,
            blockers: &blockers,
            tracker: &tracker,
            stats: &stats,
            opts,
            out_dir: dir.path(),
            cmdline: "test",
        };
        let processor =
            OutputProcessor::new(OutputMode::Filtered, ctx, dir.path().join("tmp")).unwrap();
        let wl = AlignmentWorkload::new(1, opts.padding(), &results, 0, None).unwrap();
        let worker = RegionWorker {
            results: &results,
            aligner: &aligner,
            blockers: &blockers,
            tracker: &tracker,
            stats: &stats,
            reads: &reads,
            opts,
        };
        let mut out = processor.thread_clone(wl.region()).unwrap();
        worker.run(&wl, &mut out).unwrap();
        out.thread_finish().unwrap();
        let records =
            read_all_records(&dir.path().join("tmp").join("region_00000.mmtr")).unwrap();
        processor.close().unwrap();
        Run {
            records,
            tracker,
            blockers,
        }
    }

    fn opts() -> PipelineOpts {
        PipelineOpts {
            max_frag_len: 500,
            ..Default::default()
        }
    }

    #[test]
    fn test_pair_produces_mated_records_from_both_arms() {
        let run = run_paired(
            &[(0, Arm::First, false, 100, 1), (0, Arm::Second, true, 300, 2)],
            1,
            opts(),
        );
        // one unmated and one mated record per arm
        assert_eq!(run.records.len(), 4);
        let mated: Vec<_> = run.records.iter().filter(|r| r.is_mated()).collect();
        assert_eq!(mated.len(), 2);
        assert_eq!(mated[0].start_position, 100);
        assert_eq!(mated[0].mate_position, 300);
        assert_eq!(mated[0].template_length, 250);
        assert_eq!(mated[0].combo_score, 3);
        assert_eq!(mated[1].template_length, -250);
        assert!(!mated[1].has_flag(flags::MATE_REVERSE));
        assert!(mated[0].has_flag(flags::MATE_REVERSE));

        assert!(run.tracker.get_status(0, StatusFlag::Mated));
        assert!(run.tracker.get_status(0, StatusFlag::MatedAlignScore));
        // counted once per pair
        assert_eq!(run.blockers.mated.count_at(0, 3), 1);
        assert_eq!(run.blockers.unmated.count_at(0, 1), 1);
        assert_eq!(run.blockers.unmated.count_at(1, 2), 1);
    }

    #[test]
    fn test_orientation_and_fragment_limits() {
        // same strand, reverse-before-forward, and too long
        let run = run_paired(
            &[
                (0, Arm::First, false, 100, 0),
                (0, Arm::Second, false, 200, 0),
                (1, Arm::First, true, 100, 0),
                (1, Arm::Second, false, 300, 0),
                (2, Arm::First, false, 100, 0),
                (2, Arm::Second, true, 700, 0),
            ],
            3,
            opts(),
        );
        assert!(run.records.iter().all(|r| !r.is_mated()));
        assert_eq!(run.records.len(), 6);
        for read in 0..3 {
            assert!(!run.tracker.get_status(read, StatusFlag::Mated));
        }
    }

    #[test]
    fn test_poor_scores_set_compute_flags_only() {
        let o = PipelineOpts {
            max_unmated_score: 2,
            max_mated_score: 4,
            ..opts()
        };
        let run = run_paired(
            &[(0, Arm::First, false, 100, 3), (0, Arm::Second, true, 200, 3)],
            1,
            o,
        );
        let t = &run.tracker;
        assert!(t.get_status(0, StatusFlag::UnmatedComputeAlignmentFirst));
        assert!(!t.get_status(0, StatusFlag::UnmatedAlignScoreFirst));
        assert!(t.get_status(0, StatusFlag::Mated));
        assert!(!t.get_status(0, StatusFlag::MatedAlignScore));
        assert_eq!(run.blockers.frequency.count(0), 0);
        assert_eq!(run.blockers.mated.best_score(0), None);
    }

    #[test]
    fn test_records_are_in_key_order() {
        let run = run_paired(
            &[
                (0, Arm::First, false, 100, 1),
                (0, Arm::Second, true, 260, 1),
                (0, Arm::Second, true, 240, 2),
                (1, Arm::First, false, 100, 1),
                (1, Arm::Second, true, 250, 1),
            ],
            2,
            opts(),
        );
        for w in run.records.windows(2) {
            assert!(w[0].sort_key() <= w[1].sort_key());
        }
        // read 0 first arm pairs with both second-arm hits
        let n = run
            .records
            .iter()
            .filter(|r| r.read_id == 0 && r.arm() == Arm::First && r.is_mated())
            .count();
        assert_eq!(n, 2);
    }
}
