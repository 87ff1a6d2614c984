//! SAM text output.
//!
//! Only the fields this pipeline populates are modelled; sequence and
//! quality are written as `*`.

use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flate2::Compression;
use flate2::write::GzEncoder;
use smallvec::SmallVec;

use crate::io::hit_source::TemplateTable;

const GZIP_LEVEL: u32 = 6;

/// SAM flag bit masks.
pub mod sam_flags {
    pub const PAIRED: u16 = 0x1;
    pub const PROPER_PAIR: u16 = 0x2;
    pub const UNMAPPED: u16 = 0x4;
    pub const MATE_UNMAPPED: u16 = 0x8;
    pub const REVERSE: u16 = 0x10;
    pub const MATE_REVERSE: u16 = 0x20;
    pub const FIRST_IN_PAIR: u16 = 0x40;
    pub const SECOND_IN_PAIR: u16 = 0x80;
    pub const SECONDARY: u16 = 0x100;
}

/// Value of an optional field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagValue {
    Char(char),
    Int(i64),
    Str(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamTag {
    pub tag: [u8; 2],
    pub value: TagValue,
}

impl SamTag {
    pub fn int(tag: &[u8; 2], v: i64) -> Self {
        Self {
            tag: *tag,
            value: TagValue::Int(v),
        }
    }

    pub fn string(tag: &[u8; 2], v: impl Into<String>) -> Self {
        Self {
            tag: *tag,
            value: TagValue::Str(v.into()),
        }
    }

    pub fn char(tag: &[u8; 2], v: char) -> Self {
        Self {
            tag: *tag,
            value: TagValue::Char(v),
        }
    }
}

/// One SAM line. `pos` and `pnext` are 1-based; 0 means unavailable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamRecord<'a> {
    pub qname: &'a str,
    pub flag: u16,
    pub rname: &'a str,
    pub pos: i64,
    pub mapq: u8,
    pub cigar: &'a str,
    pub rnext: &'a str,
    pub pnext: i64,
    pub tlen: i64,
    pub tags: SmallVec<[SamTag; 8]>,
}

impl SamRecord<'_> {
    /// Append the tab-separated line (with newline) to `out`.
    pub fn format_into(&self, out: &mut String) {
        let _ = write!(
            out,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t*\t*",
            self.qname,
            self.flag,
            self.rname,
            self.pos,
            self.mapq,
            self.cigar,
            self.rnext,
            self.pnext,
            self.tlen
        );
        for t in &self.tags {
            let name = std::str::from_utf8(&t.tag).unwrap_or("??");
            let _ = match &t.value {
                TagValue::Char(c) => write!(out, "\t{}:A:{}", name, c),
                TagValue::Int(v) => write!(out, "\t{}:i:{}", name, v),
                TagValue::Str(s) => write!(out, "\t{}:Z:{}", name, s),
            };
        }
        out.push('\n');
    }
}

enum Sink {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl Sink {
    fn get_mut(&mut self) -> &mut dyn Write {
        match self {
            Sink::Plain(w) => w,
            Sink::Gzip(w) => w,
        }
    }
}

/// A SAM output file, gzip-compressed when requested.
///
/// Lines go to `<path>.part`; [`SamWriter::finish`] renames it to `path`.
/// A writer dropped unfinished removes its partial file, so `path` only ever
/// holds a complete output.
pub struct SamWriter {
    sink: Option<Sink>,
    path: PathBuf,
    partial: PathBuf,
    line: String,
    num_records: u64,
}

impl SamWriter {
    /// Create `dir/name` (with `.gz` appended when `gzip`).
    pub fn create(dir: &Path, name: &str, gzip: bool) -> Result<Self> {
        let path = if gzip {
            dir.join(format!("{}.gz", name))
        } else {
            dir.join(name)
        };
        let mut partial = path.clone().into_os_string();
        partial.push(".part");
        let partial = PathBuf::from(partial);
        let file = File::create(&partial)
            .with_context(|| format!("failed to create {}", partial.display()))?;
        let buffered = BufWriter::new(file);
        let sink = if gzip {
            Sink::Gzip(GzEncoder::new(buffered, Compression::new(GZIP_LEVEL)))
        } else {
            Sink::Plain(buffered)
        };
        Ok(Self {
            sink: Some(sink),
            path,
            partial,
            line: String::with_capacity(512),
            num_records: 0,
        })
    }

    fn write_line(&mut self) -> Result<()> {
        let Some(sink) = self.sink.as_mut() else {
            anyhow::bail!("{} already finished", self.path.display());
        };
        sink.get_mut()
            .write_all(self.line.as_bytes())
            .with_context(|| format!("writing {}", self.path.display()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn num_records(&self) -> u64 {
        self.num_records
    }

    /// `@HD`, one `@SQ` per template, and `@PG`.
    pub fn write_header(&mut self, templates: &TemplateTable, cmdline: &str) -> Result<()> {
        self.line.clear();
        self.line.push_str("@HD\tVN:1.4\tSO:coordinate\n");
        for (name, len) in templates.names().iter().zip(templates.lengths()) {
            let _ = writeln!(self.line, "@SQ\tSN:{}\tLN:{}", name, len);
        }
        let _ = writeln!(
            self.line,
            "@PG\tID:{}\tPN:{}\tVN:{}\tCL:{}",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_NAME"),
            crate::VERSION,
            cmdline
        );
        self.write_line().context("writing SAM header")
    }

    pub fn write_record(&mut self, rec: &SamRecord<'_>) -> Result<()> {
        self.line.clear();
        rec.format_into(&mut self.line);
        self.write_line()?;
        self.num_records += 1;
        Ok(())
    }

    /// Write the gzip trailer, flush, and move the file to its final name.
    pub fn finish(mut self) -> Result<u64> {
        let Some(sink) = self.sink.take() else {
            anyhow::bail!("{} already finished", self.path.display());
        };
        let res = finish_sink(sink).and_then(|()| {
            std::fs::rename(&self.partial, &self.path)
                .with_context(|| format!("failed to rename {}", self.partial.display()))
        });
        if res.is_err() {
            let _ = std::fs::remove_file(&self.partial);
        }
        res.with_context(|| format!("finishing {}", self.path.display()))?;
        Ok(self.num_records)
    }
}

fn finish_sink(sink: Sink) -> Result<()> {
    let buffered = match sink {
        Sink::Plain(w) => w,
        Sink::Gzip(w) => w.finish().context("writing gzip trailer")?,
    };
    buffered.into_inner().map_err(|e| e.into_error())?;
    Ok(())
}

impl Drop for SamWriter {
    fn drop(&mut self) {
        if self.sink.take().is_some() {
            let _ = std::fs::remove_file(&self.partial);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    #[test]
    fn test_format_record() {
        let rec = SamRecord {
            qname: "r1",
            flag: sam_flags::PAIRED | sam_flags::REVERSE,
            rname: "chr1",
            pos: 101,
            mapq: 60,
            cigar: "36M",
            rnext: "=",
            pnext: 301,
            tlen: -236,
            tags: smallvec![
                SamTag::int(b"AS", 2),
                SamTag::string(b"MD", "36"),
                SamTag::char(b"XC", 'B'),
            ],
        };
        let mut s = String::new();
        rec.format_into(&mut s);
        assert_eq!(
            s,
            "r1\t17\tchr1\t101\t60\t36M\t=\t301\t-236\t*\t*\tAS:i:2\tMD:Z:36\tXC:A:B\n"
        );
    }

    #[test]
    fn test_writer_plain_and_gzip() {
        let dir = tempfile::tempdir().unwrap();
        let templates = TemplateTable::from_entries(vec![("chr1".into(), 100)]).unwrap();
        for gzip in [false, true] {
            let mut w = SamWriter::create(dir.path(), "out.sam", gzip).unwrap();
            w.write_header(&templates, "test").unwrap();
            let rec = SamRecord {
                qname: "r0",
                flag: sam_flags::UNMAPPED,
                rname: "*",
                pos: 0,
                mapq: 0,
                cigar: "*",
                rnext: "*",
                pnext: 0,
                tlen: 0,
                tags: SmallVec::new(),
            };
            w.write_record(&rec).unwrap();
            let path = w.path().to_path_buf();
            assert!(!path.exists());
            assert_eq!(w.finish().unwrap(), 1);
            assert!(path.exists());

            let (mut r, _) = niffler::send::from_path(&path).unwrap();
            let mut text = String::new();
            std::io::Read::read_to_string(&mut r, &mut text).unwrap();
            assert!(text.starts_with("@HD\tVN:1.4\tSO:coordinate\n@SQ\tSN:chr1\tLN:100\n"));
            assert!(text.ends_with("r0\t4\t*\t0\t0\t*\t*\t0\t0\t*\t*\n"));
        }
    }

    #[test]
    fn test_gzip_output_has_trailer() {
        let dir = tempfile::tempdir().unwrap();
        let templates = TemplateTable::from_entries(vec![("chr1".into(), 100)]).unwrap();
        let mut w = SamWriter::create(dir.path(), "out.sam", true).unwrap();
        w.write_header(&templates, "test").unwrap();
        let path = w.path().to_path_buf();
        w.finish().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..2], &[0x1f, 0x8b]);
        // gzip trailer: ISIZE is the uncompressed length mod 2^32
        let text = "@HD\tVN:1.4\tSO:coordinate\n@SQ\tSN:chr1\tLN:100\n";
        let size = u32::from_le_bytes(bytes[bytes.len() - 4..].try_into().unwrap());
        assert!(size as usize > text.len());
        let mut d = flate2::read::GzDecoder::new(&bytes[..]);
        let mut out = String::new();
        std::io::Read::read_to_string(&mut d, &mut out).unwrap();
        assert_eq!(out.len(), size as usize);
        assert!(out.starts_with(text));
    }

    #[test]
    fn test_unfinished_writer_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let templates = TemplateTable::from_entries(vec![("chr1".into(), 100)]).unwrap();
        let mut w = SamWriter::create(dir.path(), "out.sam", false).unwrap();
        w.write_header(&templates, "test").unwrap();
        assert!(dir.path().join("out.sam.part").exists());
        drop(w);
        assert!(!dir.path().join("out.sam").exists());
        assert!(!dir.path().join("out.sam.part").exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
