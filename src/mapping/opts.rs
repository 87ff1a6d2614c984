//! Pipeline options.

use anyhow::{Result, bail};

use crate::mapping::blocker::MAX_COUNT;
use crate::mapping::nstore::StorePolicy;

/// Tunables of one mapping run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOpts {
    /// Maximum number of hits retained per read arm, and the largest tie
    /// count at the best score that is still reported.
    pub top_n: usize,
    pub store_policy: StorePolicy,
    /// Collapse repeated hits at the same site.
    pub dedup: bool,
    /// Reads with at least this many candidate alignments are blocked.
    pub repeat_threshold: u32,
    /// Worst unmated alignment score still counted as a candidate.
    pub max_unmated_score: i32,
    /// Worst combined mated score still counted as a candidate.
    pub max_mated_score: i32,
    pub min_frag_len: i32,
    pub max_frag_len: i32,
    /// Gzip the SAM outputs.
    pub gzip: bool,
    /// Keep the per-region temp streams after the merge.
    pub keep_temp: bool,
    /// Write every candidate record without blocker filtering.
    pub unfiltered: bool,
}

impl Default for PipelineOpts {
    fn default() -> Self {
        Self {
            top_n: 5,
            store_policy: StorePolicy::TopN,
            dedup: true,
            repeat_threshold: 65,
            max_unmated_score: 10,
            max_mated_score: 20,
            min_frag_len: 0,
            max_frag_len: 1000,
            gzip: false,
            keep_temp: false,
            unfiltered: false,
        }
    }
}

impl PipelineOpts {
    pub fn validate(&self) -> Result<()> {
        if self.top_n == 0 {
            bail!("top-n must be at least 1");
        }
        if self.top_n > MAX_COUNT as usize {
            bail!("top-n must be at most {}", MAX_COUNT);
        }
        if self.repeat_threshold == 0 || self.repeat_threshold > MAX_COUNT as u32 {
            bail!(
                "repeat frequency threshold {} out of range 1..={}",
                self.repeat_threshold,
                MAX_COUNT
            );
        }
        if self.min_frag_len < 0 {
            bail!("minimum fragment length must not be negative");
        }
        if self.min_frag_len > self.max_frag_len {
            bail!(
                "minimum fragment length {} exceeds maximum {}",
                self.min_frag_len,
                self.max_frag_len
            );
        }
        if self.max_unmated_score < 0 || self.max_mated_score < 0 {
            bail!("score limits must not be negative");
        }
        Ok(())
    }

    /// Padding of region windows: a mate can lie at most one maximum fragment
    /// length away.
    pub fn padding(&self) -> u32 {
        self.max_frag_len.max(0) as u32
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
