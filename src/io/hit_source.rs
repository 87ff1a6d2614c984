//! Plain-text inputs: template table, read table, and the hit stream.
//!
//! All three are tab-separated; lines starting with `#` and blank lines are
//! skipped. Inputs may be compressed (detected by niffler).
//!
//! * templates: `name  length`
//! * reads: `name  length` (single-end) or `name  length1  length2` (paired)
//! * hits: `readId  arm  strand  templateId  position  score  [cigar  [md]]`
//!   where `arm` is `0`/`1` for paired reads and `-` for single-end, and
//!   `strand` is `+` or `-`.

use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use ahash::AHashMap;
use anyhow::{Context, Result, bail};

use crate::mapping::hits::{Arm, RawHit, ReadEncoder};

fn open_text(path: &Path) -> Result<BufReader<Box<dyn Read + Send>>> {
    let (reader, _format) = niffler::send::from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    Ok(BufReader::new(reader))
}

/// Iterate over `(line_number, fields)` of non-comment lines.
fn for_each_row<R: BufRead>(
    reader: R,
    source: &str,
    mut f: impl FnMut(usize, &[&str]) -> Result<()>,
) -> Result<()> {
    for (i, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("{}: reading line {}", source, i + 1))?;
        let line = line.trim_end();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        f(i + 1, &fields).with_context(|| format!("{}: line {}", source, i + 1))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// TemplateTable
// ---------------------------------------------------------------------------

/// Reference sequences, indexed by template id (line order).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateTable {
    names: Vec<String>,
    lengths: Vec<u64>,
}

impl TemplateTable {
    pub fn from_entries(entries: Vec<(String, u64)>) -> Result<Self> {
        let mut seen = AHashMap::with_capacity(entries.len());
        let mut table = Self::default();
        for (i, (name, len)) in entries.into_iter().enumerate() {
            if name.is_empty() {
                bail!("template {} has an empty name", i);
            }
            if let Some(prev) = seen.insert(name.clone(), i) {
                bail!("template name {} used by templates {} and {}", name, prev, i);
            }
            table.names.push(name);
            table.lengths.push(len);
        }
        Ok(table)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let reader = open_text(path)?;
        let mut entries = Vec::new();
        for_each_row(reader, &path.display().to_string(), |_, fields| {
            if fields.len() != 2 {
                bail!("expected 2 columns (name, length), found {}", fields.len());
            }
            let len: u64 = fields[1]
                .parse()
                .with_context(|| format!("invalid template length {:?}", fields[1]))?;
            entries.push((fields[0].to_string(), len));
            Ok(())
        })?;
        Self::from_entries(entries)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name(&self, template_id: u32) -> &str {
        &self.names[template_id as usize]
    }

    pub fn length(&self, template_id: u32) -> u64 {
        self.lengths[template_id as usize]
    }

    pub fn lengths(&self) -> &[u64] {
        &self.lengths
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

// ---------------------------------------------------------------------------
// ReadTable
// ---------------------------------------------------------------------------

/// Read names and per-arm lengths, indexed by read id (line order).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadTable {
    encoder: ReadEncoder,
    names: Vec<String>,
    lengths: Vec<[u32; 2]>,
}

impl ReadTable {
    pub fn single_end(entries: Vec<(String, u32)>) -> Self {
        let (names, lengths) = entries.into_iter().map(|(n, l)| (n, [l, 0])).unzip();
        Self {
            encoder: ReadEncoder::SingleEnd,
            names,
            lengths,
        }
    }

    pub fn paired_end(entries: Vec<(String, u32, u32)>) -> Self {
        let (names, lengths) = entries
            .into_iter()
            .map(|(n, l1, l2)| (n, [l1, l2]))
            .unzip();
        Self {
            encoder: ReadEncoder::PairedEnd,
            names,
            lengths,
        }
    }

    /// Load a read table; the column count of the first row decides single
    /// or paired, and every later row must agree.
    pub fn load(path: &Path) -> Result<Self> {
        let reader = open_text(path)?;
        let mut paired: Option<bool> = None;
        let mut single = Vec::new();
        let mut pairs = Vec::new();
        for_each_row(reader, &path.display().to_string(), |_, fields| {
            let is_paired = match fields.len() {
                2 => false,
                3 => true,
                n => bail!("expected 2 or 3 columns (name, length[, length]), found {}", n),
            };
            match paired {
                None => paired = Some(is_paired),
                Some(p) if p != is_paired => bail!(
                    "paired read-length mismatch: read {} has {} length column(s) but earlier reads have {}",
                    fields[0],
                    fields.len() - 1,
                    if p { 2 } else { 1 }
                ),
                Some(_) => {}
            }
            let parse = |s: &str| -> Result<u32> {
                s.parse()
                    .with_context(|| format!("invalid read length {:?}", s))
            };
            if is_paired {
                pairs.push((fields[0].to_string(), parse(fields[1])?, parse(fields[2])?));
            } else {
                single.push((fields[0].to_string(), parse(fields[1])?));
            }
            Ok(())
        })?;
        Ok(if paired == Some(true) {
            Self::paired_end(pairs)
        } else {
            Self::single_end(single)
        })
    }

    pub fn encoder(&self) -> ReadEncoder {
        self.encoder
    }

    pub fn is_paired(&self) -> bool {
        self.encoder.is_paired()
    }

    pub fn num_reads(&self) -> usize {
        self.names.len()
    }

    pub fn num_encoded(&self) -> usize {
        self.encoder.num_encoded(self.num_reads())
    }

    pub fn name(&self, read_id: u32) -> &str {
        &self.names[read_id as usize]
    }

    pub fn length(&self, read_id: u32, arm: Arm) -> u32 {
        self.lengths[read_id as usize][arm.index()]
    }

    /// Lengths indexed by encoded read id.
    pub fn encoded_lengths(&self) -> Vec<u32> {
        let mut out = Vec::with_capacity(self.num_encoded());
        for l in &self.lengths {
            out.push(l[0]);
            if self.is_paired() {
                out.push(l[1]);
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Hits
// ---------------------------------------------------------------------------

/// One parsed hit line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HitLine {
    pub hit: RawHit,
    pub cigar: Option<String>,
    pub md: Option<String>,
}

/// Streaming reader of a hit file, validating every hit against the
/// template and read tables.
pub struct HitReader<'a> {
    lines: std::io::Lines<BufReader<Box<dyn Read + Send>>>,
    source: String,
    line_no: usize,
    templates: &'a TemplateTable,
    reads: &'a ReadTable,
}

impl<'a> HitReader<'a> {
    pub fn open(path: &Path, templates: &'a TemplateTable, reads: &'a ReadTable) -> Result<Self> {
        Ok(Self {
            lines: open_text(path)?.lines(),
            source: path.display().to_string(),
            line_no: 0,
            templates,
            reads,
        })
    }

    /// Next hit, or `None` at end of input.
    pub fn next_hit(&mut self) -> Result<Option<HitLine>> {
        for line in self.lines.by_ref() {
            self.line_no += 1;
            let line =
                line.with_context(|| format!("{}: reading line {}", self.source, self.line_no))?;
            let line = line.trim_end();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            let hit = parse_hit(&fields, self.templates, self.reads)
                .with_context(|| format!("{}: line {}", self.source, self.line_no))?;
            return Ok(Some(hit));
        }
        Ok(None)
    }
}

impl Iterator for HitReader<'_> {
    type Item = Result<HitLine>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_hit().transpose()
    }
}

fn parse_hit(fields: &[&str], templates: &TemplateTable, reads: &ReadTable) -> Result<HitLine> {
    if !(6..=8).contains(&fields.len()) {
        bail!(
            "expected 6 to 8 columns (readId, arm, strand, templateId, position, score, [cigar, [md]]), found {}",
            fields.len()
        );
    }
    let read_id: u32 = fields[0]
        .parse()
        .with_context(|| format!("invalid read id {:?}", fields[0]))?;
    if read_id as usize >= reads.num_reads() {
        bail!(
            "read id {} out of declared range (0..{})",
            read_id,
            reads.num_reads()
        );
    }
    let arm = match (fields[1], reads.is_paired()) {
        ("0", true) => Arm::First,
        ("1", true) => Arm::Second,
        ("-", false) => Arm::First,
        (a, true) => bail!("paired hit needs arm 0 or 1, found {:?}", a),
        (a, false) => bail!("single-end hit needs arm '-', found {:?}", a),
    };
    let reverse = match fields[2] {
        "+" => false,
        "-" => true,
        s => bail!("invalid strand {:?}", s),
    };
    let template_id: u32 = fields[3]
        .parse()
        .with_context(|| format!("invalid template id {:?}", fields[3]))?;
    if template_id as usize >= templates.len() {
        bail!(
            "hit references unknown template {} ({} templates)",
            template_id,
            templates.len()
        );
    }
    let position: i32 = fields[4]
        .parse()
        .with_context(|| format!("invalid position {:?}", fields[4]))?;
    if position < 0 {
        bail!("negative position {}", position);
    }
    let score_indel: i32 = fields[5]
        .parse()
        .with_context(|| format!("invalid score {:?}", fields[5]))?;
    let opt = |i: usize| {
        fields
            .get(i)
            .filter(|s| !s.is_empty() && **s != "*")
            .map(|s| s.to_string())
    };
    Ok(HitLine {
        hit: RawHit {
            read_id,
            arm,
            reverse,
            template_id,
            position,
            score_indel,
        },
        cigar: opt(6),
        md: opt(7),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &tempfile::TempDir, name: &str, body: &str) -> std::path::PathBuf {
        let p = dir.path().join(name);
        std::fs::write(&p, body).unwrap();
        p
    }

    #[test]
    fn test_load_templates() {
        let dir = tempfile::tempdir().unwrap();
        let p = write(&dir, "t.tsv", "# name\tlen\nchr1\t1000\n\nchr2\t500\n");
        let t = TemplateTable::load(&p).unwrap();
        assert_eq!(t.len(), 2);
        assert_eq!(t.name(1), "chr2");
        assert_eq!(t.lengths(), &[1000, 500]);

        let dup = write(&dir, "d.tsv", "a\t1\na\t2\n");
        assert!(TemplateTable::load(&dup).is_err());
    }

    #[test]
    fn test_load_reads_single_and_paired() {
        let dir = tempfile::tempdir().unwrap();
        let s = ReadTable::load(&write(&dir, "s.tsv", "r0\t36\nr1\t40\n")).unwrap();
        assert!(!s.is_paired());
        assert_eq!(s.num_encoded(), 2);
        assert_eq!(s.encoded_lengths(), vec![36, 40]);

        let p = ReadTable::load(&write(&dir, "p.tsv", "r0\t36\t35\nr1\t40\t41\n")).unwrap();
        assert!(p.is_paired());
        assert_eq!(p.num_encoded(), 4);
        assert_eq!(p.length(1, Arm::Second), 41);
        assert_eq!(p.encoded_lengths(), vec![36, 35, 40, 41]);
    }

    #[test]
    fn test_paired_length_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let p = write(&dir, "m.tsv", "r0\t36\t35\nr1\t40\n");
        let err = format!("{:#}", ReadTable::load(&p).unwrap_err());
        assert!(err.contains("paired read-length mismatch"), "{}", err);
        assert!(err.contains("line 2"), "{}", err);
    }

    #[test]
    fn test_read_hits() {
        let dir = tempfile::tempdir().unwrap();
        let t = TemplateTable::from_entries(vec![("chr1".into(), 1000)]).unwrap();
        let r = ReadTable::paired_end(vec![("r0".into(), 30, 30)]);
        let p = write(
            &dir,
            "h.tsv",
            "# hits\n0\t0\t+\t0\t100\t2\n0\t1\t-\t0\t300\t1\t30M\t15A14\n",
        );
        let mut hr = HitReader::open(&p, &t, &r).unwrap();
        let a = hr.next_hit().unwrap().unwrap();
        assert_eq!(a.hit.arm, Arm::First);
        assert!(!a.hit.reverse);
        assert_eq!(a.cigar, None);
        let b = hr.next_hit().unwrap().unwrap();
        assert_eq!(b.hit.arm, Arm::Second);
        assert!(b.hit.reverse);
        assert_eq!(b.md.as_deref(), Some("15A14"));
        assert!(hr.next_hit().unwrap().is_none());
    }

    #[test]
    fn test_invalid_hits_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let t = TemplateTable::from_entries(vec![("chr1".into(), 1000)]).unwrap();
        let single = ReadTable::single_end(vec![("r0".into(), 30)]);
        for body in [
            "0\t-\t+\t1\t100\t2\n",  // unknown template
            "1\t-\t+\t0\t100\t2\n",  // read out of range
            "0\t0\t+\t0\t100\t2\n",  // arm on single-end data
            "0\t-\tx\t0\t100\t2\n",  // strand
            "0\t-\t+\t0\t100\n",     // columns
        ] {
            let p = write(&dir, "bad.tsv", body);
            let mut hr = HitReader::open(&p, &t, &single).unwrap();
            let err = format!("{:#}", hr.next_hit().unwrap_err());
            assert!(err.contains("line 1"), "{}", err);
        }
    }
}
