//! Columnar store of raw hits, sortable by template coordinate.
//!
//! Hits are kept as parallel arrays rather than a vector of structs: the
//! partitioner and the region workers only ever scan template/position
//! columns, and sorting permutes the columns once through an index vector.

use crate::mapping::hits::ReadEncoder;

/// Columnar collection of `(template_id, position, encoded_read_id, reverse)`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MatchResult {
    template_ids: Vec<u32>,
    positions: Vec<i32>,
    /// `encoded_read_id << 1 | reverse`
    read_words: Vec<u64>,
    sorted: bool,
}

impl MatchResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            template_ids: Vec::with_capacity(capacity),
            positions: Vec::with_capacity(capacity),
            read_words: Vec::with_capacity(capacity),
            sorted: false,
        }
    }

    /// Append one hit. Invalidates any previous sort.
    pub fn add_match(&mut self, template_id: u32, position: i32, encoded_read_id: u32, reverse: bool) {
        self.template_ids.push(template_id);
        self.positions.push(position);
        self.read_words
            .push(((encoded_read_id as u64) << 1) | reverse as u64);
        self.sorted = false;
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.template_ids.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.template_ids.is_empty()
    }

    #[inline]
    pub fn is_sorted(&self) -> bool {
        self.sorted || self.len() < 2
    }

    #[inline]
    pub fn template_id(&self, i: usize) -> u32 {
        self.template_ids[i]
    }

    #[inline]
    pub fn position(&self, i: usize) -> i32 {
        self.positions[i]
    }

    #[inline]
    pub fn encoded_read_id(&self, i: usize) -> u32 {
        (self.read_words[i] >> 1) as u32
    }

    #[inline]
    pub fn is_reverse(&self, i: usize) -> bool {
        self.read_words[i] & 1 == 1
    }

    /// Read index of hit `i` under the given encoding.
    #[inline]
    pub fn read_id(&self, i: usize, encoder: ReadEncoder) -> u32 {
        encoder.read_id(self.encoded_read_id(i))
    }

    /// Sort by `(template_id, position)`, breaking ties by encoded read id and
    /// strand so that the order is total.
    pub fn sort(&mut self) {
        if self.is_sorted() {
            self.sorted = true;
            return;
        }
        let mut order: Vec<u32> = (0..self.len() as u32).collect();
        order.sort_unstable_by_key(|&i| {
            let i = i as usize;
            (self.template_ids[i], self.positions[i], self.read_words[i])
        });
        self.template_ids = order.iter().map(|&i| self.template_ids[i as usize]).collect();
        self.positions = order.iter().map(|&i| self.positions[i as usize]).collect();
        self.read_words = order.iter().map(|&i| self.read_words[i as usize]).collect();
        self.sorted = true;
    }

    /// Index of the first hit at or after `(template_id, position)`.
    ///
    /// Only meaningful once sorted.
    pub fn lower_bound(&self, template_id: u32, position: i32) -> usize {
        debug_assert!(self.is_sorted());
        let mut lo = 0;
        let mut hi = self.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if (self.template_ids[mid], self.positions[mid]) < (template_id, position) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    pub fn clear(&mut self) {
        self.template_ids.clear();
        self.positions.clear();
        self.read_words.clear();
        self.sorted = false;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_sorted(r: &MatchResult) {
        for i in 1..r.len() {
            let a = (r.template_id(i - 1), r.position(i - 1));
            let b = (r.template_id(i), r.position(i));
            assert!(
                a.0 < b.0 || (a.0 == b.0 && a.1 <= b.1),
                "entries {} and {} out of order: {:?} > {:?}",
                i - 1,
                i,
                a,
                b
            );
        }
    }

    #[test]
    fn test_add_and_access() {
        let mut r = MatchResult::new();
        assert!(r.is_empty());
        r.add_match(3, 100, 7, true);
        assert_eq!(r.len(), 1);
        assert_eq!(r.template_id(0), 3);
        assert_eq!(r.position(0), 100);
        assert_eq!(r.encoded_read_id(0), 7);
        assert!(r.is_reverse(0));
    }

    #[test]
    fn test_sort_orders_by_template_then_position() {
        let mut r = MatchResult::new();
        let input = [(2, 5), (0, 900), (1, 3), (0, 12), (2, 1), (0, 12), (1, -4)];
        for (i, &(t, p)) in input.iter().enumerate() {
            r.add_match(t, p, i as u32, i % 2 == 0);
        }
        r.sort();
        assert_sorted(&r);
        assert_eq!(r.len(), input.len());
        assert_eq!((r.template_id(0), r.position(0)), (0, 12));
        assert_eq!((r.template_id(6), r.position(6)), (2, 5));
        // reverse flag travels with its hit
        let idx = (0..r.len()).find(|&i| r.encoded_read_id(i) == 4).unwrap();
        assert_eq!((r.template_id(idx), r.position(idx)), (2, 1));
        assert!(r.is_reverse(idx));
    }

    #[test]
    fn test_sort_ties_are_deterministic() {
        let mut a = MatchResult::new();
        let mut b = MatchResult::new();
        for id in [5u32, 1, 3] {
            a.add_match(0, 10, id, false);
        }
        for id in [3u32, 5, 1] {
            b.add_match(0, 10, id, false);
        }
        a.sort();
        b.sort();
        assert_eq!(a, b);
        assert_eq!(a.encoded_read_id(0), 1);
    }

    #[test]
    fn test_lower_bound() {
        let mut r = MatchResult::new();
        for p in [10, 20, 20, 30] {
            r.add_match(0, p, 0, false);
        }
        r.add_match(1, 0, 0, false);
        r.sort();
        assert_eq!(r.lower_bound(0, 0), 0);
        assert_eq!(r.lower_bound(0, 20), 1);
        assert_eq!(r.lower_bound(0, 21), 3);
        assert_eq!(r.lower_bound(1, -5), 4);
        assert_eq!(r.lower_bound(9, 0), 5);
    }

    #[test]
    fn test_add_after_sort_clears_flag() {
        let mut r = MatchResult::new();
        r.add_match(0, 5, 0, false);
        r.add_match(0, 1, 0, false);
        r.sort();
        assert!(r.is_sorted());
        r.add_match(0, 0, 0, false);
        assert!(!r.is_sorted());
    }
}
