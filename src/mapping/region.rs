//! Region partitioning: splits a sorted [`MatchResult`] into contiguous
//! chunks that worker threads can process independently.
//!
//! A chunk boundary never falls inside a cluster of hits that are closer
//! together than `padding` on the same template, so a worker that owns a hit
//! also sees every neighbouring hit (e.g. a mate) within `padding` of it,
//! through the padded window of its region.

use std::fmt;

use anyhow::{Result, bail};

use crate::mapping::match_result::MatchResult;

// ---------------------------------------------------------------------------
// HashingRegion
// ---------------------------------------------------------------------------

/// A half-open template coordinate range `[start, end)` owned by one work
/// item, plus the padded window it may look into.
///
/// Ownership (which work item emits a record) is decided only by the owned
/// range; the padded window is for visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HashingRegion {
    start_template: i64,
    start_pos: i64,
    end_template: i64,
    end_pos: i64,
    padded_start: i64,
    padded_end: i64,
}

impl HashingRegion {
    /// The empty region, given to work items that received no hits.
    pub const NONE: HashingRegion = HashingRegion {
        start_template: -1,
        start_pos: -1,
        end_template: -1,
        end_pos: -1,
        padded_start: -1,
        padded_end: -1,
    };

    /// Owned range `[(start_template, start_pos), (end_template, end_pos))`
    /// with a window widened by `padding` on both sides. The window is
    /// clipped at position 0 and, when `template_lengths` is given, at the end
    /// of the end template.
    pub fn new(
        start_template: u32,
        start_pos: i64,
        end_template: u32,
        end_pos: i64,
        padding: u32,
        template_lengths: Option<&[u64]>,
    ) -> Self {
        let padding = padding as i64;
        let mut padded_end = end_pos + padding;
        if let Some(len) = template_lengths.and_then(|l| l.get(end_template as usize)) {
            padded_end = padded_end.min((*len as i64).max(end_pos));
        }
        Self {
            start_template: start_template as i64,
            start_pos,
            end_template: end_template as i64,
            end_pos,
            padded_start: (start_pos - padding).max(0).min(start_pos),
            padded_end,
        }
    }

    #[inline]
    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }

    /// Whether `(template, position)` lies in the owned range.
    #[inline]
    pub fn is_in_range(&self, template_id: u32, position: i64) -> bool {
        if self.is_none() {
            return false;
        }
        let p = (template_id as i64, position);
        p >= (self.start_template, self.start_pos) && p < (self.end_template, self.end_pos)
    }

    /// Whether `(template, position)` lies in the padded window.
    #[inline]
    pub fn is_in_padded_range(&self, template_id: u32, position: i64) -> bool {
        if self.is_none() {
            return false;
        }
        let p = (template_id as i64, position);
        p >= (self.start_template, self.padded_start) && p < (self.end_template, self.padded_end)
    }

    pub fn start_template(&self) -> i64 {
        self.start_template
    }

    pub fn start_pos(&self) -> i64 {
        self.start_pos
    }

    pub fn end_template(&self) -> i64 {
        self.end_template
    }

    pub fn end_pos(&self) -> i64 {
        self.end_pos
    }

    pub fn padded_start(&self) -> i64 {
        self.padded_start
    }

    pub fn padded_end(&self) -> i64 {
        self.padded_end
    }
}

impl fmt::Display for HashingRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            return write!(f, "[none]");
        }
        write!(
            f,
            "[{}:{}, {}:{}) padded [{}:{}, {}:{})",
            self.start_template,
            self.start_pos,
            self.end_template,
            self.end_pos,
            self.start_template,
            self.padded_start,
            self.end_template,
            self.padded_end
        )
    }
}

// ---------------------------------------------------------------------------
// AlignmentWorkload
// ---------------------------------------------------------------------------

/// One work item: an index range `[chunk_start, chunk_end)` into a sorted
/// `MatchResult` and the region it owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlignmentWorkload {
    chunk_start: usize,
    chunk_end: usize,
    region: HashingRegion,
}

impl AlignmentWorkload {
    /// Compute the workload of chunk `chunk_index` out of `num_chunks`.
    pub fn new(
        num_chunks: usize,
        padding: u32,
        results: &MatchResult,
        chunk_index: usize,
        template_lengths: Option<&[u64]>,
    ) -> Result<Self> {
        if num_chunks == 0 {
            bail!("number of work chunks must be at least 1");
        }
        if chunk_index >= num_chunks {
            bail!(
                "chunk index {} out of range for {} chunks",
                chunk_index,
                num_chunks
            );
        }
        if !results.is_sorted() {
            bail!("match results must be sorted before partitioning");
        }
        let chunk_start = boundary(results, num_chunks, padding, chunk_index);
        let chunk_end = boundary(results, num_chunks, padding, chunk_index + 1);

        let region = if chunk_start >= chunk_end {
            HashingRegion::NONE
        } else {
            let (end_template, end_pos) = if chunk_end < results.len() {
                (
                    results.template_id(chunk_end),
                    results.position(chunk_end) as i64,
                )
            } else {
                let last = results.len() - 1;
                (results.template_id(last), results.position(last) as i64 + 1)
            };
            HashingRegion::new(
                results.template_id(chunk_start),
                results.position(chunk_start) as i64,
                end_template,
                end_pos,
                padding,
                template_lengths,
            )
        };

        Ok(Self {
            chunk_start,
            chunk_end,
            region,
        })
    }

    /// Workloads for every chunk, in chunk order.
    pub fn partition(
        num_chunks: usize,
        padding: u32,
        results: &MatchResult,
        template_lengths: Option<&[u64]>,
    ) -> Result<Vec<Self>> {
        (0..num_chunks)
            .map(|i| Self::new(num_chunks, padding, results, i, template_lengths))
            .collect()
    }

    pub fn chunk_start(&self) -> usize {
        self.chunk_start
    }

    pub fn chunk_end(&self) -> usize {
        self.chunk_end
    }

    pub fn len(&self) -> usize {
        self.chunk_end.saturating_sub(self.chunk_start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn region(&self) -> HashingRegion {
        self.region
    }
}

/// Index where chunk `i` starts: the nominal split moved forward to the next
/// place that does not break a cluster of hits.
fn boundary(results: &MatchResult, num_chunks: usize, padding: u32, i: usize) -> usize {
    let n = results.len();
    if i == 0 {
        return 0;
    }
    if i >= num_chunks {
        return n;
    }
    let nominal = ((i as u128 * n as u128) / num_chunks as u128) as usize;
    next_cut(results, nominal, padding)
}

/// First index `j >= from` at which the sorted hits may be split.
fn next_cut(results: &MatchResult, from: usize, padding: u32) -> usize {
    let n = results.len();
    let min_gap = padding.max(1) as i64;
    let mut j = from;
    while j > 0 && j < n {
        let same_template = results.template_id(j) == results.template_id(j - 1);
        let gap = results.position(j) as i64 - results.position(j - 1) as i64;
        if !same_template || gap >= min_gap {
            break;
        }
        j += 1;
    }
    j
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
