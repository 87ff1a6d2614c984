//! Read status tracker: one additive bit register per read.
//!
//! Region workers and the merge stage record pipeline milestones per read
//! (matched, mated, blocked, ...). Bits are only ever set. The single-letter
//! outcome code written to unmapped records (`XC`) and the final statistics
//! are pure functions of the accumulated bits.
//!
//! The state logic lives once in [`ReadStatusTracker`]; only the storage of
//! the status words differs between the single-threaded and multi-threaded
//! runs (see [`StatusWords`]).

use std::sync::Mutex;
use std::sync::atomic::{AtomicU16, Ordering};

use anyhow::{Result, bail};

use crate::mapping::hits::Arm;

// ---------------------------------------------------------------------------
// StatusFlag
// ---------------------------------------------------------------------------

/// The closed set of per-read milestones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum StatusFlag {
    MatchedFirst = 0x0001,
    MatchedSecond = 0x0002,
    Mated = 0x0004,
    MatedAlignScore = 0x0008,
    BlockedFirst = 0x0010,
    BlockedSecond = 0x0020,
    UnmatedComputeAlignmentFirst = 0x0040,
    UnmatedComputeAlignmentSecond = 0x0080,
    UnmatedAlignScoreFirst = 0x0100,
    UnmatedAlignScoreSecond = 0x0200,
    UniquelyMappedFirst = 0x0400,
    UniquelyMappedSecond = 0x0800,
}

impl StatusFlag {
    pub const ALL: [StatusFlag; 12] = [
        StatusFlag::MatchedFirst,
        StatusFlag::MatchedSecond,
        StatusFlag::Mated,
        StatusFlag::MatedAlignScore,
        StatusFlag::BlockedFirst,
        StatusFlag::BlockedSecond,
        StatusFlag::UnmatedComputeAlignmentFirst,
        StatusFlag::UnmatedComputeAlignmentSecond,
        StatusFlag::UnmatedAlignScoreFirst,
        StatusFlag::UnmatedAlignScoreSecond,
        StatusFlag::UniquelyMappedFirst,
        StatusFlag::UniquelyMappedSecond,
    ];

    #[inline]
    pub fn bit(self) -> u16 {
        self as u16
    }

    pub fn matched(arm: Arm) -> Self {
        match arm {
            Arm::First => StatusFlag::MatchedFirst,
            Arm::Second => StatusFlag::MatchedSecond,
        }
    }

    pub fn blocked(arm: Arm) -> Self {
        match arm {
            Arm::First => StatusFlag::BlockedFirst,
            Arm::Second => StatusFlag::BlockedSecond,
        }
    }

    pub fn unmated_compute_alignment(arm: Arm) -> Self {
        match arm {
            Arm::First => StatusFlag::UnmatedComputeAlignmentFirst,
            Arm::Second => StatusFlag::UnmatedComputeAlignmentSecond,
        }
    }

    pub fn unmated_align_score(arm: Arm) -> Self {
        match arm {
            Arm::First => StatusFlag::UnmatedAlignScoreFirst,
            Arm::Second => StatusFlag::UnmatedAlignScoreSecond,
        }
    }

    pub fn uniquely_mapped(arm: Arm) -> Self {
        match arm {
            Arm::First => StatusFlag::UniquelyMappedFirst,
            Arm::Second => StatusFlag::UniquelyMappedSecond,
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome codes
// ---------------------------------------------------------------------------

/// Blocked on this arm (too many hits).
pub const XC_BLOCKED: char = 'B';
/// No hits on either arm.
pub const XC_NO_HITS: char = 'A';
/// Mated with an acceptable combined score, but filtered afterwards.
pub const XC_MATED_ALIGN_SCORE: char = 'e';
/// Mates found, combined score not acceptable.
pub const XC_MATED: char = 'd';
/// Unmated alignment computed for this arm, over the score limit.
pub const XC_UNMATED_COMPUTED: char = 'D';
/// Unmated alignment within the score limit, filtered afterwards.
pub const XC_UNMATED_ALIGN_SCORE: char = 'E';
/// Hits existed but no alignment was computed for this arm.
pub const XC_NOT_ALIGNED: char = 'C';

/// Derive the outcome code for one arm from a status word.
///
/// Precedence, first match wins: blocked, no hits on either arm, mated with
/// score, mated, unmated alignment computed, unmated alignment score,
/// otherwise not aligned.
pub fn xc_code(status: u16, arm: Arm) -> char {
    let has = |f: StatusFlag| status & f.bit() != 0;
    if has(StatusFlag::blocked(arm)) {
        XC_BLOCKED
    } else if !has(StatusFlag::MatchedFirst) && !has(StatusFlag::MatchedSecond) {
        XC_NO_HITS
    } else if has(StatusFlag::MatedAlignScore) {
        XC_MATED_ALIGN_SCORE
    } else if has(StatusFlag::Mated) {
        XC_MATED
    } else if has(StatusFlag::unmated_compute_alignment(arm)) {
        XC_UNMATED_COMPUTED
    } else if has(StatusFlag::unmated_align_score(arm)) {
        XC_UNMATED_ALIGN_SCORE
    } else {
        XC_NOT_ALIGNED
    }
}

// ---------------------------------------------------------------------------
// StatusWords
// ---------------------------------------------------------------------------

/// Storage strategy for the per-read status words.
pub trait StatusWords: Send + Sync {
    fn len(&self) -> usize;

    /// OR `bits` into word `i`. Must never lose a concurrent update.
    fn set_bits(&self, i: usize, bits: u16);

    fn bits(&self, i: usize) -> u16;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Single-lock storage, used when one thread does all the work.
#[derive(Debug)]
pub struct LockedStatusWords {
    words: Mutex<Vec<u16>>,
    len: usize,
}

impl LockedStatusWords {
    pub fn new(len: usize) -> Self {
        Self {
            words: Mutex::new(vec![0; len]),
            len,
        }
    }
}

impl StatusWords for LockedStatusWords {
    fn len(&self) -> usize {
        self.len
    }

    fn set_bits(&self, i: usize, bits: u16) {
        let mut w = self.words.lock().unwrap_or_else(|e| e.into_inner());
        w[i] |= bits;
    }

    fn bits(&self, i: usize) -> u16 {
        self.words.lock().unwrap_or_else(|e| e.into_inner())[i]
    }
}

/// Per-word atomic storage for concurrent writers.
#[derive(Debug)]
pub struct AtomicStatusWords {
    words: Box<[AtomicU16]>,
}

impl AtomicStatusWords {
    pub fn new(len: usize) -> Self {
        Self {
            words: (0..len).map(|_| AtomicU16::new(0)).collect(),
        }
    }
}

impl StatusWords for AtomicStatusWords {
    fn len(&self) -> usize {
        self.words.len()
    }

    #[inline]
    fn set_bits(&self, i: usize, bits: u16) {
        self.words[i].fetch_or(bits, Ordering::Relaxed);
    }

    #[inline]
    fn bits(&self, i: usize) -> u16 {
        self.words[i].load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// ReadStatusTracker
// ---------------------------------------------------------------------------

/// Per-read status register shared by all workers of a run.
pub struct ReadStatusTracker {
    words: Box<dyn StatusWords>,
}

impl std::fmt::Debug for ReadStatusTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadStatusTracker")
            .field("num_reads", &self.words.len())
            .finish()
    }
}

impl ReadStatusTracker {
    /// Tracker backed by an explicit storage strategy.
    pub fn with_words(words: Box<dyn StatusWords>) -> Self {
        Self { words }
    }

    /// Tracker whose storage suits a run with `threads` writer threads.
    pub fn for_threads(num_reads: usize, threads: usize) -> Self {
        if threads <= 1 {
            Self::with_words(Box::new(LockedStatusWords::new(num_reads)))
        } else {
            Self::with_words(Box::new(AtomicStatusWords::new(num_reads)))
        }
    }

    pub fn num_reads(&self) -> usize {
        self.words.len()
    }

    /// Set `flag` for `read_id`.
    pub fn add_status(&self, read_id: u32, flag: StatusFlag) -> Result<()> {
        let i = read_id as usize;
        if i >= self.words.len() {
            bail!(
                "status update for read id {} out of range (0..{})",
                read_id,
                self.words.len()
            );
        }
        self.words.set_bits(i, flag.bit());
        Ok(())
    }

    #[inline]
    pub fn get_status(&self, read_id: u32, flag: StatusFlag) -> bool {
        self.status_word(read_id) & flag.bit() != 0
    }

    /// The raw status word for a read (0 for out-of-range ids).
    #[inline]
    pub fn status_word(&self, read_id: u32) -> u16 {
        let i = read_id as usize;
        if i < self.words.len() {
            self.words.bits(i)
        } else {
            0
        }
    }

    /// Outcome code of one arm of a read.
    pub fn xc_attribute(&self, read_id: u32, arm: Arm) -> char {
        xc_code(self.status_word(read_id), arm)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
