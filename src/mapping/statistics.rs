//! Mapping statistics.
//!
//! Counters are kept per arm and updated atomically, so region workers and
//! the merge can share one instance. The text report is a pure function of
//! the counter values.

use std::fmt::Write as _;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::mapping::hits::Arm;
use crate::mapping::status::{
    XC_BLOCKED, XC_MATED, XC_MATED_ALIGN_SCORE, XC_NO_HITS, XC_UNMATED_ALIGN_SCORE,
    XC_UNMATED_COMPUTED,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stat {
    /// Read arms in the input.
    Total,
    /// Arms written as part of a mated pair.
    Mated,
    /// Arms written with unmated alignments only.
    Unmated,
    /// Arms written with a single best alignment.
    UniquelyMapped,
    /// Arms with no alignment output.
    Unmapped,
    Blocked,
    NoHits,
    MatedFiltered,
    MatedPoor,
    UnmatedPoor,
    UnmatedFiltered,
    NotAligned,
    /// Alignments computed by the region workers.
    AlignmentsComputed,
}

const NUM_STATS: usize = 13;

impl Stat {
    pub const ALL: [Stat; NUM_STATS] = [
        Stat::Total,
        Stat::Mated,
        Stat::Unmated,
        Stat::UniquelyMapped,
        Stat::Unmapped,
        Stat::Blocked,
        Stat::NoHits,
        Stat::MatedFiltered,
        Stat::MatedPoor,
        Stat::UnmatedPoor,
        Stat::UnmatedFiltered,
        Stat::NotAligned,
        Stat::AlignmentsComputed,
    ];

    /// Key used in `map_info.json`.
    pub fn key(self) -> &'static str {
        match self {
            Stat::Total => "total",
            Stat::Mated => "mated",
            Stat::Unmated => "unmated",
            Stat::UniquelyMapped => "uniquely_mapped",
            Stat::Unmapped => "unmapped",
            Stat::Blocked => "blocked",
            Stat::NoHits => "no_hits",
            Stat::MatedFiltered => "mated_filtered",
            Stat::MatedPoor => "mated_poor_score",
            Stat::UnmatedPoor => "unmated_poor_score",
            Stat::UnmatedFiltered => "unmated_filtered",
            Stat::NotAligned => "not_aligned",
            Stat::AlignmentsComputed => "alignments_computed",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Stat::Total => "total",
            Stat::Mated => "mated",
            Stat::Unmated => "unmated",
            Stat::UniquelyMapped => "uniquely mapped",
            Stat::Unmapped => "unmapped",
            Stat::Blocked => "  blocked (B)",
            Stat::NoHits => "  no hits (A)",
            Stat::MatedFiltered => "  mated, filtered (e)",
            Stat::MatedPoor => "  mated, poor score (d)",
            Stat::UnmatedPoor => "  unmated, poor score (D)",
            Stat::UnmatedFiltered => "  unmated, filtered (E)",
            Stat::NotAligned => "  not aligned (C)",
            Stat::AlignmentsComputed => "alignments computed",
        }
    }

    /// Breakdown row for an unmapped arm with outcome code `xc`.
    pub fn for_xc(xc: char) -> Stat {
        match xc {
            XC_BLOCKED => Stat::Blocked,
            XC_NO_HITS => Stat::NoHits,
            XC_MATED_ALIGN_SCORE => Stat::MatedFiltered,
            XC_MATED => Stat::MatedPoor,
            XC_UNMATED_COMPUTED => Stat::UnmatedPoor,
            XC_UNMATED_ALIGN_SCORE => Stat::UnmatedFiltered,
            _ => Stat::NotAligned,
        }
    }

    fn from_key(key: &str) -> Option<Stat> {
        Stat::ALL.into_iter().find(|s| s.key() == key)
    }
}

/// Per-arm counter table.
#[derive(Debug)]
pub struct MapStatistics {
    paired: bool,
    counts: [[AtomicU64; NUM_STATS]; 2],
}

impl MapStatistics {
    pub fn new(paired: bool) -> Self {
        Self {
            paired,
            counts: std::array::from_fn(|_| std::array::from_fn(|_| AtomicU64::new(0))),
        }
    }

    pub fn is_paired(&self) -> bool {
        self.paired
    }

    #[inline]
    pub fn increment(&self, arm: Arm, stat: Stat) {
        self.add(arm, stat, 1);
    }

    #[inline]
    pub fn add(&self, arm: Arm, stat: Stat, n: u64) {
        self.counts[arm.index()][stat as usize].fetch_add(n, Ordering::Relaxed);
    }

    pub fn value(&self, arm: Arm, stat: Stat) -> u64 {
        self.counts[arm.index()][stat as usize].load(Ordering::Relaxed)
    }

    /// Sum over the arms in use.
    pub fn total(&self, stat: Stat) -> u64 {
        self.arms().iter().map(|&a| self.value(a, stat)).sum()
    }

    fn arms(&self) -> &'static [Arm] {
        if self.paired {
            &[Arm::First, Arm::Second]
        } else {
            &[Arm::First]
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            paired: self.paired,
            rows: Stat::ALL
                .iter()
                .map(|&s| StatRow {
                    stat: s.key().to_string(),
                    first: self.value(Arm::First, s),
                    second: self.value(Arm::Second, s),
                })
                .collect(),
        }
    }

    pub fn from_snapshot(snapshot: &StatsSnapshot) -> Result<Self> {
        let stats = Self::new(snapshot.paired);
        for row in &snapshot.rows {
            let Some(stat) = Stat::from_key(&row.stat) else {
                bail!("unknown statistic {:?}", row.stat);
            };
            stats.add(Arm::First, stat, row.first);
            stats.add(Arm::Second, stat, row.second);
        }
        Ok(stats)
    }

    /// Render the plain-text table.
    pub fn report(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "MAPPING SUMMARY");
        let _ = write!(out, "{:<28}", "");
        if self.paired {
            for col in ["left", "right", "both"] {
                let _ = write!(out, "{:>12}{:>9}", col, "%");
            }
        } else {
            let _ = write!(out, "{:>12}{:>9}", "count", "%");
        }
        out.push('\n');

        for stat in Stat::ALL {
            if stat == Stat::AlignmentsComputed || (stat == Stat::Mated && !self.paired) {
                continue;
            }
            if !self.paired && matches!(stat, Stat::MatedFiltered | Stat::MatedPoor) {
                continue;
            }
            let _ = write!(out, "{:<28}", stat.label());
            if self.paired {
                for arm in Arm::BOTH {
                    let v = self.value(arm, stat);
                    let t = self.value(arm, Stat::Total);
                    let _ = write!(out, "{:>12}{:>8.1}%", v, percent(v, t));
                }
            }
            let v = self.total(stat);
            let _ = write!(out, "{:>12}{:>8.1}%", v, percent(v, self.total(Stat::Total)));
            out.push('\n');
        }
        let _ = writeln!(
            out,
            "{:<28}{:>12}",
            Stat::AlignmentsComputed.label(),
            self.total(Stat::AlignmentsComputed)
        );
        out
    }

    pub fn write_report(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.report())
            .with_context(|| format!("failed to write {}", path.display()))
    }
}

fn percent(v: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        v as f64 / total as f64 * 100.0
    }
}

/// Serializable form of [`MapStatistics`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub paired: bool,
    pub rows: Vec<StatRow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatRow {
    pub stat: String,
    pub first: u64,
    pub second: u64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MapStatistics {
        let s = MapStatistics::new(true);
        s.add(Arm::First, Stat::Total, 4);
        s.add(Arm::Second, Stat::Total, 4);
        s.add(Arm::First, Stat::Mated, 2);
        s.add(Arm::Second, Stat::Mated, 2);
        s.add(Arm::First, Stat::Unmated, 1);
        s.add(Arm::First, Stat::Unmapped, 1);
        s.add(Arm::First, Stat::Blocked, 1);
        s.add(Arm::Second, Stat::Unmapped, 2);
        s.add(Arm::Second, Stat::NoHits, 2);
        s
    }

    #[test]
    fn test_counters_are_shared_across_threads() {
        let s = MapStatistics::new(false);
        crossbeam::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|_| {
                    for _ in 0..1000 {
                        s.increment(Arm::First, Stat::AlignmentsComputed);
                    }
                });
            }
        })
        .unwrap();
        assert_eq!(s.total(Stat::AlignmentsComputed), 4000);
    }

    #[test]
    fn test_report_is_reproducible() {
        let a = sample().report();
        let b = MapStatistics::from_snapshot(&sample().snapshot())
            .unwrap()
            .report();
        assert_eq!(a, b);
        assert!(a.starts_with("MAPPING SUMMARY\n"));
        let mated = a.lines().find(|l| l.starts_with("mated")).unwrap();
        assert!(mated.contains("50.0%"), "{}", mated);
        let total = a.lines().find(|l| l.starts_with("total")).unwrap();
        assert!(total.ends_with("8   100.0%"), "{}", total);
    }

    #[test]
    fn test_single_end_report_hides_mate_rows() {
        let s = MapStatistics::new(false);
        s.add(Arm::First, Stat::Total, 2);
        s.add(Arm::First, Stat::Unmated, 2);
        // second arm is ignored for single-end totals
        s.add(Arm::Second, Stat::Total, 9);
        let r = s.report();
        assert!(!r.contains("  mated,"));
        assert!(!r.lines().any(|l| l.starts_with("mated")));
        assert_eq!(s.total(Stat::Total), 2);
    }

    #[test]
    fn test_xc_rows() {
        assert_eq!(Stat::for_xc('B'), Stat::Blocked);
        assert_eq!(Stat::for_xc('e'), Stat::MatedFiltered);
        assert_eq!(Stat::for_xc('E'), Stat::UnmatedFiltered);
        assert!(Stat::from_key("nope").is_none());
    }
}
