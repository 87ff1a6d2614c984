//! Core hit types: arms, read-id encoding and raw hits as delivered by the
//! upstream index lookup.

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Sentinel value for an invalid fragment (template) length.
pub const INVALID_FRAG_LEN: i32 = 0;

/// Sentinel value for an invalid mate position.
pub const INVALID_MATE_POS: i64 = -1;

// ---------------------------------------------------------------------------
// Arm
// ---------------------------------------------------------------------------

/// Which end of a read pair a hit belongs to. Single-end reads are always
/// `First`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Arm {
    #[default]
    First = 0,
    Second = 1,
}

impl Arm {
    /// Both arms, in output order.
    pub const BOTH: [Arm; 2] = [Arm::First, Arm::Second];

    /// The other arm of the pair.
    #[inline]
    pub fn mate(self) -> Arm {
        match self {
            Arm::First => Arm::Second,
            Arm::Second => Arm::First,
        }
    }

    #[inline]
    pub fn is_first(self) -> bool {
        self == Arm::First
    }

    /// Column index used by per-arm tables.
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

// ---------------------------------------------------------------------------
// ReadEncoder
// ---------------------------------------------------------------------------

/// Packs a read index and arm into one encoded read id.
///
/// Single-end ids are the read index itself. Paired ids interleave the arms:
/// `read * 2 + arm`, so both arms of a read sort next to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadEncoder {
    SingleEnd,
    PairedEnd,
}

impl ReadEncoder {
    #[inline]
    pub fn is_paired(self) -> bool {
        self == ReadEncoder::PairedEnd
    }

    /// Number of encoded ids needed for `num_reads` reads.
    #[inline]
    pub fn num_encoded(self, num_reads: usize) -> usize {
        match self {
            ReadEncoder::SingleEnd => num_reads,
            ReadEncoder::PairedEnd => num_reads * 2,
        }
    }

    #[inline]
    pub fn encode(self, read_id: u32, arm: Arm) -> u32 {
        match self {
            ReadEncoder::SingleEnd => read_id,
            ReadEncoder::PairedEnd => (read_id << 1) | arm as u32,
        }
    }

    #[inline]
    pub fn read_id(self, encoded: u32) -> u32 {
        match self {
            ReadEncoder::SingleEnd => encoded,
            ReadEncoder::PairedEnd => encoded >> 1,
        }
    }

    #[inline]
    pub fn arm(self, encoded: u32) -> Arm {
        match self {
            ReadEncoder::SingleEnd => Arm::First,
            ReadEncoder::PairedEnd if encoded & 1 == 0 => Arm::First,
            ReadEncoder::PairedEnd => Arm::Second,
        }
    }
}

// ---------------------------------------------------------------------------
// RawHit
// ---------------------------------------------------------------------------

/// One candidate hit produced by the index lookup.
///
/// `score_indel` is a penalty: lower is better.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawHit {
    pub read_id: u32,
    pub arm: Arm,
    pub reverse: bool,
    pub template_id: u32,
    pub position: i32,
    pub score_indel: i32,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arm_mate() {
        assert_eq!(Arm::First.mate(), Arm::Second);
        assert_eq!(Arm::Second.mate(), Arm::First);
        assert_eq!(Arm::default(), Arm::First);
        assert_eq!(Arm::Second.index(), 1);
    }

    #[test]
    fn test_paired_encoding() {
        let enc = ReadEncoder::PairedEnd;
        let e = enc.encode(21, Arm::Second);
        assert_eq!(e, 43);
        assert_eq!(enc.read_id(e), 21);
        assert_eq!(enc.arm(e), Arm::Second);
        assert_eq!(enc.arm(enc.encode(21, Arm::First)), Arm::First);
        assert_eq!(enc.num_encoded(10), 20);
    }

    #[test]
    fn test_single_encoding_ignores_arm() {
        let enc = ReadEncoder::SingleEnd;
        assert_eq!(enc.encode(7, Arm::Second), 7);
        assert_eq!(enc.arm(7), Arm::First);
        assert_eq!(enc.num_encoded(10), 10);
    }
}
