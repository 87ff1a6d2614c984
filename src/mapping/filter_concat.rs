//! Filter-concat merge (pass 2).
//!
//! All temp streams are merged with a min-heap on the record key, so the
//! output is coordinate sorted without re-sorting. Each record is checked
//! against the frozen blockers, and survivors become SAM lines with MAPQ and
//! the `NH`/`IH`/`AS`/`NM`/`MD`/`XA` tags. Afterwards every read arm that
//! produced no output is written to `unmapped.sam` with its `XC` code.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Serialize;
use smallvec::SmallVec;
use tracing::info;

use crate::io::sam::{SamRecord, SamTag, SamWriter, sam_flags};
use crate::io::temp_record::{RecordKey, TempRecord, TempRecordReader, flags};
use crate::mapping::blocker::MapQVerdict;
use crate::mapping::hits::Arm;
use crate::mapping::processors::{OutputContext, OutputMode};
use crate::mapping::statistics::Stat;
use crate::mapping::status::StatusFlag;

/// MAPQ written when no quality was computed.
const MAPQ_UNAVAILABLE: u8 = 255;

/// Counts of one merge. `records_read - filtered() == records_written`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeSummary {
    pub records_read: u64,
    pub records_written: u64,
    /// Dropped because an arm of the read was frequency blocked.
    pub filtered_blocked: u64,
    /// Dropped because a better alignment exists.
    pub filtered_worse: u64,
    /// Dropped because more than top-N alignments tie at the best score.
    pub filtered_ambiguous: u64,
    /// Unmated records dropped because a mated placement exists.
    pub filtered_superseded: u64,
    pub unmapped_written: u64,
    /// Per output file: `alignments` for single-end data, `mated` and
    /// `unmated` for paired-end data.
    pub categories: [Option<CategoryCounts>; 2],
}

impl MergeSummary {
    pub fn filtered(&self) -> u64 {
        self.filtered_blocked
            + self.filtered_worse
            + self.filtered_ambiguous
            + self.filtered_superseded
    }

    pub fn category(&self, name: &str) -> Option<&CategoryCounts> {
        self.categories.iter().flatten().find(|c| c.name == name)
    }
}

/// Records routed to one output category, and how many of them were written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CategoryCounts {
    pub name: &'static str,
    pub read: u64,
    pub written: u64,
}

impl CategoryCounts {
    pub fn describe(&self) -> String {
        format!(
            "{} SAM filter outputs {}/{} records",
            self.name, self.written, self.read
        )
    }
}

enum Verdict {
    Keep { mapq: u8, hits: Option<u8> },
    Blocked,
    Worse,
    Ambiguous,
    Superseded,
}

struct Category {
    counts: CategoryCounts,
    writer: SamWriter,
}

// per-read output bits
const PRODUCED: [u8; 2] = [0x1, 0x2];
const PRODUCED_MATED: [u8; 2] = [0x4, 0x8];

struct Merger<'c, 'a> {
    ctx: &'c OutputContext<'a>,
    mode: OutputMode,
    produced: Vec<u8>,
    summary: MergeSummary,
}

impl Merger<'_, '_> {
    fn verdict(&self, rec: &TempRecord) -> Result<Verdict> {
        if self.mode == OutputMode::Unfiltered {
            return Ok(Verdict::Keep {
                mapq: MAPQ_UNAVAILABLE,
                hits: None,
            });
        }
        let ctx = self.ctx;
        let encoder = ctx.reads.encoder();
        let read_id = rec.read_id as u32;
        let arm = rec.arm();
        let top_n = ctx.opts.top_n;

        if rec.is_mated() {
            let mut blocked = false;
            for a in Arm::BOTH {
                if ctx.blockers.frequency.is_blocked(encoder.encode(read_id, a)) {
                    ctx.tracker.add_status(read_id, StatusFlag::blocked(a))?;
                    blocked = true;
                }
            }
            if blocked {
                return Ok(Verdict::Blocked);
            }
            return Ok(from_mapq(ctx.blockers.mated.score(read_id, rec.combo_score, top_n)));
        }

        let encoded = encoder.encode(read_id, arm);
        if ctx.blockers.frequency.is_blocked(encoded) {
            ctx.tracker.add_status(read_id, StatusFlag::blocked(arm))?;
            return Ok(Verdict::Blocked);
        }
        if encoder.is_paired() && ctx.tracker.get_status(read_id, StatusFlag::MatedAlignScore) {
            return Ok(Verdict::Superseded);
        }
        Ok(from_mapq(ctx.blockers.unmated.score(
            encoded,
            rec.alignment_score,
            top_n,
        )))
    }

    fn write(&mut self, cat: &mut Category, rec: &TempRecord, mapq: u8, hits: Option<u8>) -> Result<()> {
        let ctx = self.ctx;
        let read_id = rec.read_id as u32;
        let arm = rec.arm();
        let bits = &mut self.produced[read_id as usize];
        let primary = *bits & PRODUCED[arm.index()] == 0;
        *bits |= PRODUCED[arm.index()];
        if rec.is_mated() {
            *bits |= PRODUCED_MATED[arm.index()];
        }
        if hits == Some(1) {
            ctx.tracker
                .add_status(read_id, StatusFlag::uniquely_mapped(arm))?;
        }

        let mut flag = 0u16;
        if rec.has_flag(flags::PAIRED) {
            flag |= sam_flags::PAIRED;
            flag |= if arm.is_first() {
                sam_flags::FIRST_IN_PAIR
            } else {
                sam_flags::SECOND_IN_PAIR
            };
        }
        if rec.has_flag(flags::PROPER_PAIR) {
            flag |= sam_flags::PROPER_PAIR;
        }
        if rec.is_reverse() {
            flag |= sam_flags::REVERSE;
        }
        if rec.has_flag(flags::MATE_REVERSE) {
            flag |= sam_flags::MATE_REVERSE;
        }
        if !primary {
            flag |= sam_flags::SECONDARY;
        }

        let mut tags: SmallVec<[SamTag; 8]> = SmallVec::new();
        if let Some(h) = hits {
            tags.push(SamTag::int(b"NH", h as i64));
            tags.push(SamTag::int(b"IH", h as i64));
        }
        tags.push(SamTag::int(b"AS", rec.alignment_score as i64));
        tags.push(SamTag::int(b"NM", rec.num_mismatches as i64));
        if !rec.md.is_empty() {
            tags.push(SamTag::string(b"MD", rec.md.as_str()));
        }
        if rec.is_mated() {
            tags.push(SamTag::int(b"XA", rec.combo_score as i64));
        }
        if let Some(cg) = &rec.cg {
            tags.push(SamTag::string(b"XU", cg.super_cigar.as_str()));
            tags.push(SamTag::string(b"XR", cg.read_delta.as_str()));
            tags.push(SamTag::string(b"XQ", cg.read_string.as_str()));
        }

        let (rnext, pnext) = if rec.is_mated() {
            ("=", rec.mate_position + 1)
        } else {
            ("*", 0)
        };
        let line = SamRecord {
            qname: ctx.reads.name(read_id),
            flag,
            rname: ctx.templates.name(rec.reference_id as u32),
            pos: rec.start_position + 1,
            mapq,
            cigar: &rec.cigar,
            rnext,
            pnext,
            tlen: rec.template_length as i64,
            tags,
        };
        cat.writer.write_record(&line)?;
        cat.counts.written += 1;
        self.summary.records_written += 1;
        Ok(())
    }

    fn check_record(&self, rec: &TempRecord, stream: &str, index: u64) -> Result<()> {
        let ctx = self.ctx;
        if rec.read_id < 0 || rec.read_id as usize >= ctx.reads.num_reads() {
            anyhow::bail!(
                "{}: record {} has read id {} out of declared range (0..{})",
                stream,
                index,
                rec.read_id,
                ctx.reads.num_reads()
            );
        }
        if rec.reference_id < 0 || rec.reference_id as usize >= ctx.templates.len() {
            anyhow::bail!(
                "{}: record {} references unknown template {}",
                stream,
                index,
                rec.reference_id
            );
        }
        if rec.has_flag(flags::SECOND) && !ctx.reads.is_paired() {
            anyhow::bail!("{}: record {} is a second arm of single-end data", stream, index);
        }
        Ok(())
    }
}

fn from_mapq(v: MapQVerdict) -> Verdict {
    match v {
        MapQVerdict::Accept { mapq, hits } => Verdict::Keep {
            mapq,
            hits: Some(hits),
        },
        MapQVerdict::WorseThanBest => Verdict::Worse,
        MapQVerdict::TooManyTied { .. } => Verdict::Ambiguous,
    }
}

/// Merge `streams` into the final SAM outputs of `ctx.out_dir`, then write
/// the unmapped records and fill in the per-arm statistics. Temp streams are
/// deleted afterwards when `delete_temp` is set.
pub fn filter_concat(
    ctx: &OutputContext<'_>,
    mode: OutputMode,
    streams: &[PathBuf],
    delete_temp: bool,
) -> Result<MergeSummary> {
    let paired = ctx.reads.is_paired();
    let gzip = ctx.opts.gzip;

    let mut categories: Vec<Category> = if paired {
        vec![
            open_category("mated", "mated.sam", ctx, gzip)?,
            open_category("unmated", "unmated.sam", ctx, gzip)?,
        ]
    } else {
        vec![open_category("alignments", "alignments.sam", ctx, gzip)?]
    };

    let mut readers: Vec<TempRecordReader<BufReader<File>>> = streams
        .iter()
        .map(|p| TempRecordReader::open(p))
        .collect::<Result<_>>()?;
    let mut heads: Vec<Option<TempRecord>> = Vec::with_capacity(readers.len());
    let mut heap: BinaryHeap<Reverse<(RecordKey, usize)>> = BinaryHeap::new();
    for (s, reader) in readers.iter_mut().enumerate() {
        let head = reader.next_record()?;
        if let Some(rec) = &head {
            heap.push(Reverse((rec.sort_key(), s)));
        }
        heads.push(head);
    }

    let mut merger = Merger {
        ctx,
        mode,
        produced: vec![0u8; ctx.reads.num_reads()],
        summary: MergeSummary::default(),
    };

    let mut last: Option<RecordKey> = None;
    while let Some(Reverse((key, s))) = heap.pop() {
        let Some(rec) = heads[s].take() else {
            continue;
        };
        let index = readers[s].num_records() - 1;
        if let Some(next) = readers[s].next_record()? {
            heap.push(Reverse((next.sort_key(), s)));
            heads[s] = Some(next);
        }
        if let Some(prev) = last {
            if key < prev {
                anyhow::bail!(
                    "{}: record {} out of coordinate order",
                    readers[s].name(),
                    index
                );
            }
        }
        last = Some(key);
        merger.check_record(&rec, readers[s].name(), index)?;

        merger.summary.records_read += 1;
        let cat = if paired && !rec.is_mated() { 1 } else { 0 };
        categories[cat].counts.read += 1;
        match merger.verdict(&rec)? {
            Verdict::Keep { mapq, hits } => merger.write(&mut categories[cat], &rec, mapq, hits)?,
            Verdict::Blocked => merger.summary.filtered_blocked += 1,
            Verdict::Worse => merger.summary.filtered_worse += 1,
            Verdict::Ambiguous => merger.summary.filtered_ambiguous += 1,
            Verdict::Superseded => merger.summary.filtered_superseded += 1,
        }
    }

    // every stream ended at its sentinel; outputs only get their final
    // names from here on
    drop(readers);
    let Merger {
        produced,
        mut summary,
        ..
    } = merger;
    summary.unmapped_written = write_unmapped(ctx, &produced)?;

    for (i, cat) in categories.into_iter().enumerate() {
        info!("{}", cat.counts.describe());
        cat.writer.finish()?;
        summary.categories[i] = Some(cat.counts);
    }

    if delete_temp {
        for p in streams {
            std::fs::remove_file(p)
                .with_context(|| format!("failed to remove temp stream {}", p.display()))?;
        }
    }
    Ok(summary)
}

fn open_category(
    name: &'static str,
    file: &str,
    ctx: &OutputContext<'_>,
    gzip: bool,
) -> Result<Category> {
    let mut writer = SamWriter::create(ctx.out_dir, file, gzip)?;
    writer.write_header(ctx.templates, ctx.cmdline)?;
    Ok(Category {
        counts: CategoryCounts {
            name,
            ..Default::default()
        },
        writer,
    })
}

/// Write `unmapped.sam` and the per-arm statistics.
fn write_unmapped(ctx: &OutputContext<'_>, produced: &[u8]) -> Result<u64> {
    let paired = ctx.reads.is_paired();
    let arms: &[Arm] = if paired { &Arm::BOTH } else { &[Arm::First] };
    let mut writer = SamWriter::create(ctx.out_dir, "unmapped.sam", ctx.opts.gzip)?;
    writer.write_header(ctx.templates, ctx.cmdline)?;

    for read_id in 0..ctx.reads.num_reads() as u32 {
        let bits = produced[read_id as usize];
        for &arm in arms {
            ctx.stats.increment(arm, Stat::Total);
            if bits & PRODUCED[arm.index()] != 0 {
                let stat = if bits & PRODUCED_MATED[arm.index()] != 0 {
                    Stat::Mated
                } else {
                    Stat::Unmated
                };
                ctx.stats.increment(arm, stat);
                if ctx
                    .tracker
                    .get_status(read_id, StatusFlag::uniquely_mapped(arm))
                {
                    ctx.stats.increment(arm, Stat::UniquelyMapped);
                }
                continue;
            }

            let xc = ctx.tracker.xc_attribute(read_id, arm);
            ctx.stats.increment(arm, Stat::Unmapped);
            ctx.stats.increment(arm, Stat::for_xc(xc));

            let mut flag = sam_flags::UNMAPPED;
            if paired {
                flag |= sam_flags::PAIRED;
                flag |= if arm.is_first() {
                    sam_flags::FIRST_IN_PAIR
                } else {
                    sam_flags::SECOND_IN_PAIR
                };
                if bits & PRODUCED[arm.mate().index()] == 0 {
                    flag |= sam_flags::MATE_UNMAPPED;
                }
            }
            let mut tags: SmallVec<[SamTag; 8]> = SmallVec::new();
            tags.push(SamTag::char(b"XC", xc));
            writer.write_record(&SamRecord {
                qname: ctx.reads.name(read_id),
                flag,
                rname: "*",
                pos: 0,
                mapq: 0,
                cigar: "*",
                rnext: "*",
                pnext: 0,
                tlen: 0,
                tags,
            })?;
        }
    }
    let n = writer.finish()?;
    info!("unmapped outputs {} records", n);
    Ok(n)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::hit_source::{ReadTable, TemplateTable};
    use crate::io::temp_record::{RecordBuffer, TEMP_MAGIC, TEMP_VERSION, TempRecordWriter};
    use crate::mapping::blocker::BlockerSet;
    use crate::mapping::opts::PipelineOpts;
    use crate::mapping::statistics::MapStatistics;
    use crate::mapping::status::ReadStatusTracker;
    use std::path::Path;

    struct Fixture {
        templates: TemplateTable,
        reads: ReadTable,
        blockers: BlockerSet,
        tracker: ReadStatusTracker,
        stats: MapStatistics,
        dir: tempfile::TempDir,
    }

    impl Fixture {
        fn single(num_reads: usize) -> Self {
            let reads = ReadTable::single_end(
                (0..num_reads).map(|i| (format!("r{}", i), 10)).collect(),
            );
            Self::with_reads(reads)
        }

        fn paired(num_reads: usize) -> Self {
            let reads = ReadTable::paired_end(
                (0..num_reads).map(|i| (format!("p{}", i), 10, 10)).collect(),
            );
            Self::with_reads(reads)
        }

        fn with_reads(reads: ReadTable) -> Self {
            let n = reads.num_reads();
            Self {
                templates: TemplateTable::from_entries(vec![
                    ("chr1".into(), 1000),
                    ("chr2".into(), 1000),
                ])
                .unwrap(),
                blockers: BlockerSet::new(reads.encoder(), n, 2).unwrap(),
                tracker: ReadStatusTracker::for_threads(n, 2),
                stats: MapStatistics::new(reads.is_paired()),
                reads,
                dir: tempfile::tempdir().unwrap(),
            }
        }

        fn ctx(&self) -> OutputContext<'_> {
            OutputContext {
                templates: &self.templates,
                reads: &self.reads,
                blockers: &self.blockers,
                tracker: &self.tracker,
                stats: &self.stats,
                opts: PipelineOpts::default(),
                out_dir: self.dir.path(),
                cmdline: "test",
            }
        }

        fn stream(&self, name: &str, records: &[TempRecord]) -> PathBuf {
            let p = self.dir.path().join(name);
            let mut w = TempRecordWriter::create(&p).unwrap();
            for r in records {
                w.write(r).unwrap();
            }
            w.finish().unwrap();
            p
        }

        fn sam_lines(&self, name: &str) -> Vec<String> {
            std::fs::read_to_string(self.dir.path().join(name))
                .unwrap()
                .lines()
                .filter(|l| !l.starts_with('@'))
                .map(|l| l.to_string())
                .collect()
        }
    }

    fn rec(read_id: i32, reference_id: i32, pos: i64, score: i32) -> TempRecord {
        TempRecord {
            read_id,
            reference_id,
            start_position: pos,
            cigar: "10M".into(),
            alignment_score: score,
            num_mismatches: score,
            combo_score: score,
            ..Default::default()
        }
    }

    fn pos_of(line: &str) -> (String, i64) {
        let f: Vec<&str> = line.split('\t').collect();
        (f[2].to_string(), f[3].parse().unwrap())
    }

    #[test]
    fn test_unfiltered_merge_is_coordinate_sorted() {
        let f = Fixture::single(4);
        let a = f.stream("a.mmtr", &[rec(0, 0, 5, 0), rec(1, 0, 50, 0), rec(2, 1, 7, 0)]);
        let b = f.stream("b.mmtr", &[rec(3, 0, 20, 0), rec(0, 1, 3, 0)]);
        let s = filter_concat(&f.ctx(), OutputMode::Unfiltered, &[a.clone(), b.clone()], true)
            .unwrap();
        assert_eq!(s.records_read, 5);
        assert_eq!(s.records_written, 5);
        assert_eq!(s.filtered(), 0);
        assert!(!a.exists() && !b.exists());

        let lines = f.sam_lines("alignments.sam");
        let got: Vec<_> = lines.iter().map(|l| pos_of(l)).collect();
        assert_eq!(
            got,
            vec![
                ("chr1".to_string(), 6),
                ("chr1".to_string(), 21),
                ("chr1".to_string(), 51),
                ("chr2".to_string(), 4),
                ("chr2".to_string(), 8),
            ]
        );
        // second alignment of read 0 is secondary
        assert!(lines[3].starts_with("r0\t256\tchr2\t4\t"), "{}", lines[3]);
        assert!(lines[0].contains("\t255\t10M\t"));
        assert!(!lines[0].contains("NH:i:"));
    }

    #[test]
    fn test_filtered_merge_counts_every_record() {
        let f = Fixture::single(3);
        // read 0: best score 1, runner-up 3
        f.blockers.unmated.increment(0, 1).unwrap();
        f.blockers.unmated.increment(0, 3).unwrap();
        // read 1: repeat blocked
        f.blockers.frequency.increment(1).unwrap();
        f.blockers.frequency.increment(1).unwrap();
        f.blockers.unmated.increment(1, 0).unwrap();
        // read 2: hits but nothing aligned
        f.tracker.add_status(0, StatusFlag::MatchedFirst).unwrap();
        f.tracker.add_status(1, StatusFlag::MatchedFirst).unwrap();
        f.tracker.add_status(2, StatusFlag::MatchedFirst).unwrap();

        let a = f.stream("a.mmtr", &[rec(0, 0, 10, 1), rec(1, 0, 40, 0)]);
        let b = f.stream("b.mmtr", &[rec(0, 0, 30, 3), rec(1, 1, 2, 0)]);
        let s = filter_concat(&f.ctx(), OutputMode::Filtered, &[a, b], false).unwrap();

        assert_eq!(s.records_read, 4);
        assert_eq!(s.filtered_blocked, 2);
        assert_eq!(s.filtered_worse, 1);
        assert_eq!(s.records_written, s.records_read - s.filtered());
        assert_eq!(s.records_written, 1);
        let counts = s.category("alignments").unwrap();
        assert_eq!((counts.read, counts.written), (4, 1));
        assert_eq!(counts.describe(), "alignments SAM filter outputs 1/4 records");
        assert!(s.category("mated").is_none());

        let lines = f.sam_lines("alignments.sam");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("r0\t0\tchr1\t11\t40\t10M\t*\t0\t0\t*\t*\tNH:i:1\tIH:i:1\tAS:i:1\tNM:i:1"));
        assert!(f.tracker.get_status(0, StatusFlag::UniquelyMappedFirst));
        assert!(f.tracker.get_status(1, StatusFlag::BlockedFirst));

        let unmapped = f.sam_lines("unmapped.sam");
        assert_eq!(unmapped.len(), 2);
        assert!(unmapped[0].starts_with("r1\t4\t*\t0\t0\t*"));
        assert!(unmapped[0].ends_with("XC:A:B"));
        assert!(unmapped[1].ends_with("XC:A:C"));
        assert_eq!(s.unmapped_written, 2);

        assert_eq!(f.stats.total(Stat::Total), 3);
        assert_eq!(f.stats.total(Stat::Unmated), 1);
        assert_eq!(f.stats.total(Stat::UniquelyMapped), 1);
        assert_eq!(f.stats.total(Stat::Blocked), 1);
        assert_eq!(f.stats.total(Stat::NotAligned), 1);
    }

    #[test]
    fn test_mated_supersedes_unmated() {
        let f = Fixture::paired(1);
        f.blockers.mated.increment(0, 2).unwrap();
        f.blockers.unmated.increment(0, 1).unwrap();
        f.blockers.unmated.increment(1, 1).unwrap();
        f.tracker.add_status(0, StatusFlag::MatchedFirst).unwrap();
        f.tracker.add_status(0, StatusFlag::MatchedSecond).unwrap();
        f.tracker.add_status(0, StatusFlag::Mated).unwrap();
        f.tracker.add_status(0, StatusFlag::MatedAlignScore).unwrap();

        let first = |mated: bool| {
            let mut r = rec(0, 0, 100, 1);
            r.flags = flags::PAIRED | flags::FIRST;
            if mated {
                r.flags |= flags::PROPER_PAIR | flags::MATE_REVERSE;
                r.mate_position = 200;
                r.template_length = 110;
                r.combo_score = 2;
            }
            r
        };
        let second = |mated: bool| {
            let mut r = rec(0, 0, 200, 1);
            r.flags = flags::PAIRED | flags::SECOND | flags::REVERSE;
            if mated {
                r.flags |= flags::PROPER_PAIR;
                r.mate_position = 100;
                r.template_length = -110;
                r.combo_score = 2;
            }
            r
        };
        let a = f.stream("a.mmtr", &[first(false), first(true)]);
        let b = f.stream("b.mmtr", &[second(false), second(true)]);
        let s = filter_concat(&f.ctx(), OutputMode::Filtered, &[a, b], true).unwrap();
        assert_eq!(s.records_read, 4);
        assert_eq!(s.filtered_superseded, 2);
        assert_eq!(s.records_written, 2);
        assert_eq!(
            s.categories,
            [
                Some(CategoryCounts { name: "mated", read: 2, written: 2 }),
                Some(CategoryCounts { name: "unmated", read: 2, written: 0 }),
            ]
        );
        assert_eq!(
            s.category("unmated").unwrap().describe(),
            "unmated SAM filter outputs 0/2 records"
        );

        let mated = f.sam_lines("mated.sam");
        assert_eq!(mated.len(), 2);
        assert!(mated[0].starts_with("p0\t99\tchr1\t101\t60\t10M\t=\t201\t110\t"), "{}", mated[0]);
        assert!(mated[0].contains("XA:i:2"));
        assert!(mated[1].starts_with("p0\t147\tchr1\t201\t60\t10M\t=\t101\t-110\t"), "{}", mated[1]);
        assert!(f.sam_lines("unmated.sam").is_empty());
        assert!(f.sam_lines("unmapped.sam").is_empty());
        assert_eq!(f.stats.total(Stat::Mated), 2);
    }

    #[test]
    fn test_cg_tags_are_written() {
        let f = Fixture::single(1);
        let mut r = rec(0, 0, 1, 0);
        r.md = "10".into();
        r.cg = Some(crate::io::temp_record::CgFields {
            read_string: "ACGT".into(),
            read_delta: "1N".into(),
            super_cigar: "4M".into(),
        });
        let a = f.stream("a.mmtr", &[r]);
        filter_concat(&f.ctx(), OutputMode::Unfiltered, &[a], true).unwrap();
        let lines = f.sam_lines("alignments.sam");
        assert!(lines[0].ends_with("AS:i:0\tNM:i:0\tMD:Z:10\tXU:Z:4M\tXR:Z:1N\tXQ:Z:ACGT"));
    }

    fn write_unterminated(path: &Path, records: &[TempRecord]) {
        let mut b = RecordBuffer::new();
        for r in records {
            b.write_record(r);
        }
        let mut bytes = TEMP_MAGIC.to_vec();
        bytes.push(TEMP_VERSION);
        bytes.extend_from_slice(b.as_bytes());
        std::fs::write(path, bytes).unwrap();
    }

    #[test]
    fn test_stream_without_sentinel_is_not_merged() {
        let f = Fixture::single(2);
        let good = f.stream("a.mmtr", &[rec(0, 0, 1, 0)]);
        let bad = f.dir.path().join("b.mmtr");
        write_unterminated(&bad, &[rec(1, 0, 2, 0)]);
        let err = filter_concat(&f.ctx(), OutputMode::Unfiltered, &[good.clone(), bad.clone()], true)
            .unwrap_err()
            .to_string();
        assert!(err.contains("without end-of-stream marker"), "{}", err);
        assert!(err.contains("b.mmtr"), "{}", err);
        // nothing deleted, and no partial outputs left behind
        assert!(good.exists() && bad.exists());
        let mut left: Vec<String> = std::fs::read_dir(f.dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert_eq!(left, vec!["a.mmtr".to_string(), "b.mmtr".to_string()]);
    }

    #[test]
    fn test_out_of_range_read_is_rejected() {
        let f = Fixture::single(1);
        let a = f.stream("a.mmtr", &[rec(5, 0, 1, 0)]);
        let err = filter_concat(&f.ctx(), OutputMode::Unfiltered, &[a], true)
            .unwrap_err()
            .to_string();
        assert!(err.contains("out of declared range"), "{}", err);
        assert!(!f.dir.path().join("alignments.sam").exists());
        assert!(!f.dir.path().join("alignments.sam.part").exists());
    }
}
