//! Read blockers: concurrent per-read counters for the two-pass scoring
//! protocol.
//!
//! The frequency blocker counts every hit at ingestion, before the bounded
//! store caps the read. Region workers increment the score blockers while
//! they generate candidate alignments (pass 1). After the worker pool has
//! joined, the merge stage only reads them (pass 2). Counters are 8 bits wide and saturate at 255.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use anyhow::{Result, bail};

use crate::mapping::hits::ReadEncoder;

/// Saturation value of every blocker counter.
pub const MAX_COUNT: u8 = u8::MAX;

/// MAPQ given to a read with a single best alignment and no runner-up.
pub const MAPQ_UNIQUE: u8 = 60;

// ---------------------------------------------------------------------------
// ReadBlocker
// ---------------------------------------------------------------------------

/// Frequency blocker: counts how many hits a read arm had and blocks it once
/// the count reaches `threshold`.
#[derive(Debug)]
pub struct ReadBlocker {
    counts: Box<[AtomicU8]>,
    threshold: u8,
    title: String,
}

impl ReadBlocker {
    /// Create a blocker for `num_reads` reads. `threshold` must be in
    /// `1..=255`.
    pub fn new(num_reads: usize, threshold: u32, title: &str) -> Result<Self> {
        if threshold == 0 || threshold > MAX_COUNT as u32 {
            bail!(
                "{}: repeat threshold {} outside 1..={}",
                title,
                threshold,
                MAX_COUNT
            );
        }
        Ok(Self {
            counts: (0..num_reads).map(|_| AtomicU8::new(0)).collect(),
            threshold: threshold as u8,
            title: title.to_string(),
        })
    }

    /// Count one candidate for `read_id`, saturating at [`MAX_COUNT`].
    pub fn increment(&self, read_id: u32) -> Result<()> {
        let Some(c) = self.counts.get(read_id as usize) else {
            bail!(
                "{}: read id {} out of range (0..{})",
                self.title,
                read_id,
                self.counts.len()
            );
        };
        let _ = c.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_add(1));
        Ok(())
    }

    #[inline]
    pub fn count(&self, read_id: u32) -> u8 {
        self.counts
            .get(read_id as usize)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    #[inline]
    pub fn is_blocked(&self, read_id: u32) -> bool {
        self.count(read_id) >= self.threshold
    }

    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    pub fn num_reads(&self) -> usize {
        self.counts.len()
    }

    /// Number of reads currently at or over the threshold.
    pub fn num_blocked(&self) -> usize {
        (0..self.counts.len() as u32)
            .filter(|&r| self.is_blocked(r))
            .count()
    }

    pub fn title(&self) -> &str {
        &self.title
    }
}

// ---------------------------------------------------------------------------
// MapQScoringReadBlocker
// ---------------------------------------------------------------------------

const SCORE_BITS: u32 = 24;
const SCORE_MASK: u64 = (1 << SCORE_BITS) - 1;
const UNSET_SCORE: u32 = SCORE_MASK as u32;
/// Largest storable score; larger ones are clamped.
pub const MAX_SCORE: i32 = (SCORE_MASK - 1) as i32;

/// Unpacked per-read scoring state.
///
/// Word layout: `[63..40] second score | [39..16] best score |
/// [15..8] second count | [7..0] best count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ScoreWord {
    best: u32,
    best_count: u8,
    second: u32,
    second_count: u8,
}

impl ScoreWord {
    const EMPTY: ScoreWord = ScoreWord {
        best: UNSET_SCORE,
        best_count: 0,
        second: UNSET_SCORE,
        second_count: 0,
    };

    #[inline]
    fn unpack(w: u64) -> Self {
        Self {
            best_count: (w & 0xFF) as u8,
            second_count: ((w >> 8) & 0xFF) as u8,
            best: ((w >> 16) & SCORE_MASK) as u32,
            second: ((w >> (16 + SCORE_BITS)) & SCORE_MASK) as u32,
        }
    }

    #[inline]
    fn pack(self) -> u64 {
        (self.best_count as u64)
            | ((self.second_count as u64) << 8)
            | ((self.best as u64) << 16)
            | ((self.second as u64) << (16 + SCORE_BITS))
    }

    fn add(mut self, score: u32) -> Self {
        if score < self.best {
            self.second = self.best;
            self.second_count = self.best_count;
            self.best = score;
            self.best_count = 1;
        } else if score == self.best {
            self.best_count = self.best_count.saturating_add(1);
        } else if score < self.second {
            self.second = score;
            self.second_count = 1;
        } else if score == self.second {
            self.second_count = self.second_count.saturating_add(1);
        }
        self
    }
}

#[inline]
fn clamp_score(score: i32) -> u32 {
    score.clamp(0, MAX_SCORE) as u32
}

/// Outcome of scoring one alignment against the frozen blocker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapQVerdict {
    /// Alignment is among the best; `hits` alignments tie at its score.
    Accept { mapq: u8, hits: u8 },
    /// A better alignment exists for the read.
    WorseThanBest,
    /// More than `top_n` alignments tie at the best score.
    TooManyTied { hits: u8 },
}

/// Score blocker: tracks, per read, the best and second-best score and how
/// many candidates reached each.
#[derive(Debug)]
pub struct MapQScoringReadBlocker {
    words: Box<[AtomicU64]>,
    title: String,
}

impl MapQScoringReadBlocker {
    pub fn new(num_reads: usize, title: &str) -> Self {
        let empty = ScoreWord::EMPTY.pack();
        Self {
            words: (0..num_reads).map(|_| AtomicU64::new(empty)).collect(),
            title: title.to_string(),
        }
    }

    /// Count one candidate alignment of `read_id` with `score`.
    pub fn increment(&self, read_id: u32, score: i32) -> Result<()> {
        let Some(w) = self.words.get(read_id as usize) else {
            bail!(
                "{}: read id {} out of range (0..{})",
                self.title,
                read_id,
                self.words.len()
            );
        };
        let s = clamp_score(score);
        let _ = w.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(ScoreWord::unpack(v).add(s).pack())
        });
        Ok(())
    }

    #[inline]
    fn word(&self, read_id: u32) -> ScoreWord {
        self.words
            .get(read_id as usize)
            .map(|w| ScoreWord::unpack(w.load(Ordering::Relaxed)))
            .unwrap_or(ScoreWord::EMPTY)
    }

    /// Best score recorded for the read, if any.
    pub fn best_score(&self, read_id: u32) -> Option<i32> {
        let w = self.word(read_id);
        (w.best_count > 0).then_some(w.best as i32)
    }

    /// Number of candidates recorded at exactly `score` (only the best and
    /// second-best scores are tracked).
    pub fn count_at(&self, read_id: u32, score: i32) -> u8 {
        let w = self.word(read_id);
        let s = clamp_score(score);
        if w.best_count > 0 && s == w.best {
            w.best_count
        } else if w.second_count > 0 && s == w.second {
            w.second_count
        } else {
            0
        }
    }

    /// Decide the fate of an alignment of `read_id` scoring `score`.
    pub fn score(&self, read_id: u32, score: i32, top_n: usize) -> MapQVerdict {
        let w = self.word(read_id);
        let s = clamp_score(score);
        if w.best_count == 0 || s != w.best {
            return MapQVerdict::WorseThanBest;
        }
        let hits = w.best_count;
        if hits as usize > top_n {
            return MapQVerdict::TooManyTied { hits };
        }
        let gap = (w.second_count > 0).then(|| w.second - w.best);
        MapQVerdict::Accept {
            mapq: mapq_for(hits, gap),
            hits,
        }
    }

    pub fn num_reads(&self) -> usize {
        self.words.len()
    }

    pub fn title(&self) -> &str {
        &self.title
    }
}

/// MAPQ-equivalent from the tie count at the best score and the score gap
/// to the runner-up.
pub fn mapq_for(best_count: u8, gap: Option<u32>) -> u8 {
    match best_count {
        0 => 0,
        1 => match gap {
            None => MAPQ_UNIQUE,
            Some(g) => (20 + 10 * g.min(4)).min(MAPQ_UNIQUE as u32) as u8,
        },
        2 => 3,
        3 | 4 => 1,
        _ => 0,
    }
}

// ---------------------------------------------------------------------------
// BlockerSet
// ---------------------------------------------------------------------------

/// The blockers shared by all workers of one run.
///
/// `frequency` and `unmated` are keyed by encoded read id (one entry per
/// arm); `mated` is keyed by read id.
#[derive(Debug)]
pub struct BlockerSet {
    pub frequency: ReadBlocker,
    pub unmated: MapQScoringReadBlocker,
    pub mated: MapQScoringReadBlocker,
}

impl BlockerSet {
    pub fn new(encoder: ReadEncoder, num_reads: usize, repeat_threshold: u32) -> Result<Self> {
        let num_encoded = encoder.num_encoded(num_reads);
        Ok(Self {
            frequency: ReadBlocker::new(num_encoded, repeat_threshold, "repeat frequency")?,
            unmated: MapQScoringReadBlocker::new(num_encoded, "unmated"),
            mated: MapQScoringReadBlocker::new(
                if encoder.is_paired() { num_reads } else { 0 },
                "mated",
            ),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_validation() {
        assert!(ReadBlocker::new(4, 0, "t").is_err());
        assert!(ReadBlocker::new(4, 256, "t").is_err());
        assert!(ReadBlocker::new(4, 255, "t").is_ok());
    }

    #[test]
    fn test_blocking_by_frequency() {
        let b = ReadBlocker::new(3, 3, "freq").unwrap();
        b.increment(1).unwrap();
        b.increment(1).unwrap();
        assert!(!b.is_blocked(1));
        b.increment(1).unwrap();
        assert!(b.is_blocked(1));
        assert!(!b.is_blocked(0));
        assert_eq!(b.num_blocked(), 1);
        assert!(b.increment(3).is_err());
    }

    #[test]
    fn test_saturation_is_stable() {
        let b = ReadBlocker::new(1, 200, "sat").unwrap();
        for i in 0..1000 {
            b.increment(0).unwrap();
            if i >= 199 {
                assert!(b.is_blocked(0));
            }
        }
        assert_eq!(b.count(0), MAX_COUNT);
        assert!(b.is_blocked(0));
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let b = ReadBlocker::new(2, 255, "conc").unwrap();
        let m = MapQScoringReadBlocker::new(2, "conc");
        crossbeam::scope(|s| {
            for _ in 0..4 {
                s.spawn(|_| {
                    for _ in 0..50 {
                        b.increment(0).unwrap();
                        m.increment(1, 7).unwrap();
                    }
                });
            }
        })
        .unwrap();
        assert_eq!(b.count(0), 200);
        assert_eq!(m.count_at(1, 7), 200);
    }

    #[test]
    fn test_score_word_roundtrip() {
        let w = ScoreWord {
            best: 12,
            best_count: 3,
            second: 40,
            second_count: 255,
        };
        assert_eq!(ScoreWord::unpack(w.pack()), w);
        assert_eq!(ScoreWord::unpack(ScoreWord::EMPTY.pack()), ScoreWord::EMPTY);
    }

    #[test]
    fn test_best_and_second_tracking() {
        let m = MapQScoringReadBlocker::new(1, "mapq");
        assert_eq!(m.best_score(0), None);
        m.increment(0, 5).unwrap();
        m.increment(0, 3).unwrap();
        m.increment(0, 5).unwrap();
        m.increment(0, 9).unwrap();
        assert_eq!(m.best_score(0), Some(3));
        assert_eq!(m.count_at(0, 3), 1);
        assert_eq!(m.count_at(0, 5), 2);
        assert_eq!(m.count_at(0, 9), 0);
    }

    #[test]
    fn test_mapq_verdicts() {
        let m = MapQScoringReadBlocker::new(3, "mapq");
        m.increment(0, 2).unwrap();
        assert_eq!(
            m.score(0, 2, 5),
            MapQVerdict::Accept {
                mapq: MAPQ_UNIQUE,
                hits: 1
            }
        );

        m.increment(1, 1).unwrap();
        m.increment(1, 2).unwrap();
        assert_eq!(m.score(1, 1, 5), MapQVerdict::Accept { mapq: 30, hits: 1 });
        assert_eq!(m.score(1, 2, 5), MapQVerdict::WorseThanBest);

        for _ in 0..3 {
            m.increment(2, 0).unwrap();
        }
        assert_eq!(m.score(2, 0, 5), MapQVerdict::Accept { mapq: 1, hits: 3 });
        assert_eq!(m.score(2, 0, 2), MapQVerdict::TooManyTied { hits: 3 });
    }

    #[test]
    fn test_mapq_table() {
        assert_eq!(mapq_for(0, None), 0);
        assert_eq!(mapq_for(1, None), 60);
        assert_eq!(mapq_for(1, Some(1)), 30);
        assert_eq!(mapq_for(1, Some(100)), 60);
        assert_eq!(mapq_for(2, Some(3)), 3);
        assert_eq!(mapq_for(4, None), 1);
        assert_eq!(mapq_for(9, None), 0);
    }

    #[test]
    fn test_negative_and_huge_scores_clamp() {
        let m = MapQScoringReadBlocker::new(1, "clamp");
        m.increment(0, -4).unwrap();
        m.increment(0, i32::MAX).unwrap();
        assert_eq!(m.best_score(0), Some(0));
        assert_eq!(m.count_at(0, MAX_SCORE), 1);
    }
}
