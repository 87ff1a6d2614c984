//! Aligner seam.
//!
//! The pipeline schedules and merges alignments but does not compute them.
//! Region workers ask an [`Aligner`] for the alignment of a read at a
//! candidate site; [`ScoreTableAligner`] answers from the scores (and
//! optional CIGAR/MD strings) supplied with the input hits.

use ahash::AHashMap;

use crate::io::temp_record::CgFields;

/// A computed alignment of one read arm at one site. Lower `score` is better.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alignment {
    pub score: i32,
    pub num_mismatches: i32,
    pub cigar: String,
    /// Empty when unknown; no `MD` tag is written then.
    pub md: String,
    pub cg: Option<CgFields>,
}

/// Computes alignments for candidate sites. Shared read-only by all workers.
pub trait Aligner: Sync {
    /// `None` when no alignment can be computed at the site.
    fn align(
        &self,
        encoded_read_id: u32,
        template_id: u32,
        position: i32,
        reverse: bool,
    ) -> Option<Alignment>;
}

type SiteKey = (u32, u32, i32, bool);

#[derive(Debug, Clone)]
struct SiteAlignment {
    score: i32,
    cigar: Option<String>,
    md: Option<String>,
}

/// Aligner backed by a table of precomputed site scores.
#[derive(Debug, Default)]
pub struct ScoreTableAligner {
    sites: AHashMap<SiteKey, SiteAlignment>,
    /// Indexed by encoded read id.
    read_lengths: Vec<u32>,
}

impl ScoreTableAligner {
    pub fn new(read_lengths: Vec<u32>) -> Self {
        Self {
            sites: AHashMap::new(),
            read_lengths,
        }
    }

    /// Record the alignment at a site. When a site is given twice the better
    /// score is kept, and the first one on a tie.
    #[allow(clippy::too_many_arguments)]
    pub fn insert(
        &mut self,
        encoded_read_id: u32,
        template_id: u32,
        position: i32,
        reverse: bool,
        score: i32,
        cigar: Option<String>,
        md: Option<String>,
    ) {
        let key = (encoded_read_id, template_id, position, reverse);
        let site = SiteAlignment { score, cigar, md };
        self.sites
            .entry(key)
            .and_modify(|s| {
                if site.score < s.score {
                    *s = site.clone();
                }
            })
            .or_insert(site);
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}

impl Aligner for ScoreTableAligner {
    fn align(
        &self,
        encoded_read_id: u32,
        template_id: u32,
        position: i32,
        reverse: bool,
    ) -> Option<Alignment> {
        let site = self
            .sites
            .get(&(encoded_read_id, template_id, position, reverse))?;
        let read_len = self.read_lengths.get(encoded_read_id as usize).copied()?;
        let md = site.md.clone().unwrap_or_default();
        let num_mismatches = if md.is_empty() {
            site.score
        } else {
            md_mismatches(&md)
        };
        Some(Alignment {
            score: site.score,
            num_mismatches,
            cigar: site
                .cigar
                .clone()
                .unwrap_or_else(|| format!("{}M", read_len)),
            md,
            cg: None,
        })
    }
}

/// Edit operations described by an MD string: mismatched bases plus deleted
/// reference bases.
pub fn md_mismatches(md: &str) -> i32 {
    md.bytes().filter(|b| b.is_ascii_alphabetic()).count() as i32
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_cigar_from_read_length() {
        let mut a = ScoreTableAligner::new(vec![36, 50]);
        a.insert(1, 0, 100, false, 2, None, None);
        let aln = a.align(1, 0, 100, false).unwrap();
        assert_eq!(aln.cigar, "50M");
        assert_eq!(aln.score, 2);
        assert_eq!(aln.num_mismatches, 2);
        assert!(aln.md.is_empty());
        assert!(a.align(1, 0, 100, true).is_none());
        assert!(a.align(0, 0, 100, false).is_none());
    }

    #[test]
    fn test_explicit_strings() {
        let mut a = ScoreTableAligner::new(vec![20]);
        a.insert(0, 3, 7, true, 4, Some("10M1D10M".into()), Some("5A4^C10".into()));
        let aln = a.align(0, 3, 7, true).unwrap();
        assert_eq!(aln.cigar, "10M1D10M");
        assert_eq!(aln.md, "5A4^C10");
        assert_eq!(aln.num_mismatches, 2);
    }

    #[test]
    fn test_better_duplicate_wins() {
        let mut a = ScoreTableAligner::new(vec![20]);
        a.insert(0, 0, 1, false, 5, Some("first".into()), None);
        a.insert(0, 0, 1, false, 5, Some("tie".into()), None);
        a.insert(0, 0, 1, false, 3, Some("better".into()), None);
        a.insert(0, 0, 1, false, 4, Some("worse".into()), None);
        assert_eq!(a.len(), 1);
        assert_eq!(a.align(0, 0, 1, false).unwrap().cigar, "better");
    }

    #[test]
    fn test_unknown_read_length() {
        let mut a = ScoreTableAligner::new(vec![]);
        a.insert(5, 0, 1, false, 0, None, None);
        assert!(a.align(5, 0, 1, false).is_none());
    }
}
