//! Bounded-N match stores: per-read accumulation of candidate hits.
//!
//! Every store keeps a small inline slot per encoded read id and caps it at
//! `n` entries. The policies differ in what happens once the cap is reached:
//!
//! * [`TopNStore`] keeps the `n` best-scoring hits, evicting the worst.
//! * [`UptoNStore`] keeps every hit tied at the best score, and gives up on the
//!   read when more than `n` hits tie.
//! * [`DeduplicatingNStore`] wraps either and collapses repeated
//!   `(template, position, strand)` hits of a read into one slot.
//!
//! Scores are penalties: lower is better.

use anyhow::{Result, bail};
use smallvec::SmallVec;

use crate::mapping::match_result::MatchResult;

/// Inline capacity of a per-read slot before it spills to the heap.
const INLINE_SLOTS: usize = 4;

/// Score marker for reads that have not overflowed.
const NOT_OVERFLOWED: i32 = i32::MAX;

// ---------------------------------------------------------------------------
// NEntry
// ---------------------------------------------------------------------------

/// One retained hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NEntry {
    pub template_id: u32,
    pub position: i32,
    pub reverse: bool,
    pub score_indel: i32,
    /// Admission order within the store, used for tie-breaking.
    seq: u64,
}

impl NEntry {
    #[inline]
    fn same_site(&self, template_id: u32, position: i32, reverse: bool) -> bool {
        self.template_id == template_id && self.position == position && self.reverse == reverse
    }
}

type Slot = SmallVec<[NEntry; INLINE_SLOTS]>;

// ---------------------------------------------------------------------------
// NStore trait
// ---------------------------------------------------------------------------

/// Common interface of the bounded-N stores.
pub trait NStore: Send {
    /// Record one candidate hit for `encoded_read_id`.
    fn process(
        &mut self,
        encoded_read_id: u32,
        reverse: bool,
        template_id: u32,
        position: i32,
        score_indel: i32,
    );

    /// Hits currently retained for one read, in slot order.
    fn retained(&self, encoded_read_id: u32) -> &[NEntry];

    /// Remove the retained entry at `slot_index` for a read.
    fn remove(&mut self, encoded_read_id: u32, slot_index: usize);

    /// Number of encoded read ids this store was sized for.
    fn num_encoded_reads(&self) -> usize;

    /// Hits that entered the store but are no longer retained.
    fn num_discarded(&self) -> u64;

    /// Reads whose hits were dropped for exceeding the retention cap.
    fn overflowed_reads(&self) -> Vec<u32> {
        Vec::new()
    }

    /// Append every retained hit on `template_id` to `out`.
    fn set_results(&self, out: &mut MatchResult, template_id: u32) {
        for r in 0..self.num_encoded_reads() as u32 {
            for e in self.retained(r) {
                if e.template_id == template_id {
                    out.add_match(e.template_id, e.position, r, e.reverse);
                }
            }
        }
    }

    /// Append every retained hit to `out`.
    fn set_all_results(&self, out: &mut MatchResult) {
        for r in 0..self.num_encoded_reads() as u32 {
            for e in self.retained(r) {
                out.add_match(e.template_id, e.position, r, e.reverse);
            }
        }
    }

    /// Total number of retained hits.
    fn num_retained(&self) -> usize {
        (0..self.num_encoded_reads() as u32)
            .map(|r| self.retained(r).len())
            .sum()
    }
}

/// Shared slot table used by the concrete policies.
#[derive(Debug)]
struct SlotTable {
    slots: Vec<Slot>,
    n: usize,
    next_seq: u64,
    discarded: u64,
}

impl SlotTable {
    fn new(num_encoded_reads: usize, n: usize) -> Result<Self> {
        if n == 0 {
            bail!("bounded-N store capacity must be at least 1");
        }
        if num_encoded_reads == 0 {
            bail!("bounded-N store must be sized for at least one read");
        }
        Ok(Self {
            slots: vec![Slot::new(); num_encoded_reads],
            n,
            next_seq: 0,
            discarded: 0,
        })
    }

    #[inline]
    fn entry(&mut self, template_id: u32, position: i32, reverse: bool, score_indel: i32) -> NEntry {
        let seq = self.next_seq;
        self.next_seq += 1;
        NEntry {
            template_id,
            position,
            reverse,
            score_indel,
            seq,
        }
    }

    fn slot(&self, encoded_read_id: u32) -> &[NEntry] {
        self.slots
            .get(encoded_read_id as usize)
            .map(|s| s.as_slice())
            .unwrap_or(&[])
    }

    fn remove(&mut self, encoded_read_id: u32, slot_index: usize) {
        if let Some(slot) = self.slots.get_mut(encoded_read_id as usize) {
            if slot_index < slot.len() {
                slot.remove(slot_index);
                self.discarded += 1;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// TopNStore
// ---------------------------------------------------------------------------

/// Keeps the `n` best hits per read.
///
/// Once full, a new hit replaces the current worst only when strictly
/// better. Among equally-worst entries the most recently admitted is evicted,
/// so on exact ties the earliest-seen hit survives.
#[derive(Debug)]
pub struct TopNStore {
    table: SlotTable,
}

impl TopNStore {
    pub fn new(num_encoded_reads: usize, n: usize) -> Result<Self> {
        Ok(Self {
            table: SlotTable::new(num_encoded_reads, n)?,
        })
    }
}

impl NStore for TopNStore {
    fn process(
        &mut self,
        encoded_read_id: u32,
        reverse: bool,
        template_id: u32,
        position: i32,
        score_indel: i32,
    ) {
        let r = encoded_read_id as usize;
        if r >= self.table.slots.len() {
            self.table.discarded += 1;
            return;
        }
        let n = self.table.n;
        if self.table.slots[r].len() < n {
            let e = self.table.entry(template_id, position, reverse, score_indel);
            self.table.slots[r].push(e);
            return;
        }
        let worst = self.table.slots[r]
            .iter()
            .enumerate()
            .max_by_key(|(_, e)| (e.score_indel, e.seq))
            .map(|(i, e)| (i, e.score_indel));
        match worst {
            Some((wi, worst_score)) if score_indel < worst_score => {
                let e = self.table.entry(template_id, position, reverse, score_indel);
                self.table.slots[r][wi] = e;
            }
            _ => {}
        }
        self.table.discarded += 1;
    }

    fn retained(&self, encoded_read_id: u32) -> &[NEntry] {
        self.table.slot(encoded_read_id)
    }

    fn remove(&mut self, encoded_read_id: u32, slot_index: usize) {
        self.table.remove(encoded_read_id, slot_index);
    }

    fn num_encoded_reads(&self) -> usize {
        self.table.slots.len()
    }

    fn num_discarded(&self) -> u64 {
        self.table.discarded
    }
}

// ---------------------------------------------------------------------------
// UptoNStore
// ---------------------------------------------------------------------------

/// Keeps up to `n` hits tied at the best score seen for each read.
///
/// A strictly better hit discards everything retained so far. If an
/// `(n + 1)`-th hit ties at the best score the read is over-represented: its
/// hits are dropped and it is reported by [`NStore::overflowed_reads`]. Only
/// a hit strictly better than the overflowing score revives the read.
#[derive(Debug)]
pub struct UptoNStore {
    table: SlotTable,
    overflow_score: Vec<i32>,
}

impl UptoNStore {
    pub fn new(num_encoded_reads: usize, n: usize) -> Result<Self> {
        Ok(Self {
            table: SlotTable::new(num_encoded_reads, n)?,
            overflow_score: vec![NOT_OVERFLOWED; num_encoded_reads],
        })
    }

    fn replace_all(&mut self, r: usize, e: NEntry) {
        self.table.discarded += self.table.slots[r].len() as u64;
        self.table.slots[r].clear();
        self.table.slots[r].push(e);
    }
}

impl NStore for UptoNStore {
    fn process(
        &mut self,
        encoded_read_id: u32,
        reverse: bool,
        template_id: u32,
        position: i32,
        score_indel: i32,
    ) {
        let r = encoded_read_id as usize;
        if r >= self.table.slots.len() {
            self.table.discarded += 1;
            return;
        }
        if self.overflow_score[r] != NOT_OVERFLOWED {
            if score_indel < self.overflow_score[r] {
                self.overflow_score[r] = NOT_OVERFLOWED;
                let e = self.table.entry(template_id, position, reverse, score_indel);
                self.replace_all(r, e);
            } else {
                self.table.discarded += 1;
            }
            return;
        }
        let best = self.table.slots[r].first().map(|e| e.score_indel);
        match best {
            None => {
                let e = self.table.entry(template_id, position, reverse, score_indel);
                self.table.slots[r].push(e);
            }
            Some(best) if score_indel < best => {
                let e = self.table.entry(template_id, position, reverse, score_indel);
                self.replace_all(r, e);
            }
            Some(best) if score_indel == best => {
                if self.table.slots[r].len() < self.table.n {
                    let e = self.table.entry(template_id, position, reverse, score_indel);
                    self.table.slots[r].push(e);
                } else {
                    self.table.discarded += self.table.slots[r].len() as u64 + 1;
                    self.table.slots[r].clear();
                    self.overflow_score[r] = score_indel;
                }
            }
            Some(_) => self.table.discarded += 1,
        }
    }

    fn retained(&self, encoded_read_id: u32) -> &[NEntry] {
        self.table.slot(encoded_read_id)
    }

    fn remove(&mut self, encoded_read_id: u32, slot_index: usize) {
        self.table.remove(encoded_read_id, slot_index);
    }

    fn num_encoded_reads(&self) -> usize {
        self.table.slots.len()
    }

    fn num_discarded(&self) -> u64 {
        self.table.discarded
    }

    fn overflowed_reads(&self) -> Vec<u32> {
        self.overflow_score
            .iter()
            .enumerate()
            .filter(|(_, s)| **s != NOT_OVERFLOWED)
            .map(|(r, _)| r as u32)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// DeduplicatingNStore
// ---------------------------------------------------------------------------

/// Collapses repeated hits of a read on the same `(template, position,
/// strand)` before they reach the wrapped store.
///
/// A repeat with a better score replaces the retained copy (it is re-admitted
/// through the inner policy); an equal or worse repeat is dropped. A site is
/// never retained twice for the same read.
#[derive(Debug)]
pub struct DeduplicatingNStore<S: NStore> {
    inner: S,
    collapsed: u64,
}

impl<S: NStore> DeduplicatingNStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            collapsed: 0,
        }
    }

    /// Repeats that were folded into an existing entry.
    pub fn num_collapsed(&self) -> u64 {
        self.collapsed
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: NStore> NStore for DeduplicatingNStore<S> {
    fn process(
        &mut self,
        encoded_read_id: u32,
        reverse: bool,
        template_id: u32,
        position: i32,
        score_indel: i32,
    ) {
        let dup = self
            .inner
            .retained(encoded_read_id)
            .iter()
            .position(|e| e.same_site(template_id, position, reverse));
        if let Some(i) = dup {
            let retained_score = self.inner.retained(encoded_read_id)[i].score_indel;
            if score_indel >= retained_score {
                self.collapsed += 1;
                return;
            }
            // the removal is counted by the inner table
            self.inner.remove(encoded_read_id, i);
        }
        self.inner
            .process(encoded_read_id, reverse, template_id, position, score_indel);
    }

    fn retained(&self, encoded_read_id: u32) -> &[NEntry] {
        self.inner.retained(encoded_read_id)
    }

    fn remove(&mut self, encoded_read_id: u32, slot_index: usize) {
        self.inner.remove(encoded_read_id, slot_index);
    }

    fn num_encoded_reads(&self) -> usize {
        self.inner.num_encoded_reads()
    }

    fn num_discarded(&self) -> u64 {
        self.inner.num_discarded() + self.collapsed
    }

    fn overflowed_reads(&self) -> Vec<u32> {
        self.inner.overflowed_reads()
    }
}

// ---------------------------------------------------------------------------
// StorePolicy
// ---------------------------------------------------------------------------

/// Which retention policy a run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorePolicy {
    #[default]
    TopN,
    UptoN,
}

impl std::str::FromStr for StorePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "topn" | "top-n" => Ok(StorePolicy::TopN),
            "upton" | "upto-n" => Ok(StorePolicy::UptoN),
            other => bail!("unknown store policy: {}", other),
        }
    }
}

/// Build a store for `num_encoded_reads` ids under `policy`, optionally
/// deduplicating.
pub fn build_store(
    policy: StorePolicy,
    num_encoded_reads: usize,
    n: usize,
    dedup: bool,
) -> Result<Box<dyn NStore>> {
    Ok(match (policy, dedup) {
        (StorePolicy::TopN, false) => Box::new(TopNStore::new(num_encoded_reads, n)?),
        (StorePolicy::TopN, true) => Box::new(DeduplicatingNStore::new(TopNStore::new(
            num_encoded_reads,
            n,
        )?)),
        (StorePolicy::UptoN, false) => Box::new(UptoNStore::new(num_encoded_reads, n)?),
        (StorePolicy::UptoN, true) => Box::new(DeduplicatingNStore::new(UptoNStore::new(
            num_encoded_reads,
            n,
        )?)),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
