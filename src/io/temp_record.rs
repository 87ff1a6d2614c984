//! Temp record binary format.
//!
//! Each region work item writes its candidate alignments to a private stream
//! that the merge later reads back. Layout (little-endian):
//!
//! ```text
//! "MMTR" u8:version
//! repeat { u8:tag=0  record }
//! u8:tag=1                                  end-of-stream sentinel
//!
//! record = i32:read_id u8:flags i32:reference_id i64:start_position
//!          u32+bytes:cigar i64:mate_position i32:template_length
//!          i32:num_mismatches i32:alignment_score i32:combo_score
//!          u32+bytes:md u8:has_cg [u32+bytes x3: read string, read delta,
//!          super cigar]
//! ```
//!
//! A stream that stops before its sentinel is rejected, so a crashed writer
//! can never be merged as if it were complete.

use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use anyhow::{Context, Result, bail};

use crate::mapping::hits::{Arm, INVALID_MATE_POS};

pub const TEMP_MAGIC: &[u8; 4] = b"MMTR";
pub const TEMP_VERSION: u8 = 1;

const TAG_RECORD: u8 = 0;
const TAG_END: u8 = 1;

/// Longest string field accepted when reading; longer lengths mean the
/// stream is corrupt.
const MAX_FIELD_LEN: usize = 1 << 24;

/// Buffered bytes before the writer flushes to its sink.
const FLUSH_THRESHOLD: usize = 1 << 16;

// ---------------------------------------------------------------------------
// Record flags
// ---------------------------------------------------------------------------

/// Compact per-record flag bits stored in the temp stream.
pub mod flags {
    pub const REVERSE: u8 = 0x01;
    pub const MATE_REVERSE: u8 = 0x02;
    pub const FIRST: u8 = 0x04;
    pub const SECOND: u8 = 0x08;
    pub const PAIRED: u8 = 0x10;
    /// Record is one arm of a mated placement.
    pub const PROPER_PAIR: u8 = 0x20;
    pub const ALL: u8 = REVERSE | MATE_REVERSE | FIRST | SECOND | PAIRED | PROPER_PAIR;
}

// ---------------------------------------------------------------------------
// TempRecord
// ---------------------------------------------------------------------------

/// Complete Genomics specific fields.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CgFields {
    pub read_string: String,
    pub read_delta: String,
    pub super_cigar: String,
}

/// One candidate alignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TempRecord {
    pub read_id: i32,
    pub flags: u8,
    pub reference_id: i32,
    pub start_position: i64,
    pub cigar: String,
    pub mate_position: i64,
    pub template_length: i32,
    pub num_mismatches: i32,
    pub alignment_score: i32,
    pub combo_score: i32,
    pub md: String,
    pub cg: Option<CgFields>,
}

impl Default for TempRecord {
    fn default() -> Self {
        Self {
            read_id: 0,
            flags: 0,
            reference_id: 0,
            start_position: 0,
            cigar: String::new(),
            mate_position: INVALID_MATE_POS,
            template_length: 0,
            num_mismatches: 0,
            alignment_score: 0,
            combo_score: 0,
            md: String::new(),
            cg: None,
        }
    }
}

/// Merge ordering key: `(reference, start, read, arm, reverse, mate position)`.
pub type RecordKey = (i32, i64, i32, u8, bool, i64);

impl TempRecord {
    #[inline]
    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    #[inline]
    pub fn is_reverse(&self) -> bool {
        self.has_flag(flags::REVERSE)
    }

    #[inline]
    pub fn is_paired(&self) -> bool {
        self.has_flag(flags::PAIRED)
    }

    /// Whether this record is part of a mated placement.
    #[inline]
    pub fn is_mated(&self) -> bool {
        self.has_flag(flags::PROPER_PAIR)
    }

    #[inline]
    pub fn arm(&self) -> Arm {
        if self.has_flag(flags::SECOND) {
            Arm::Second
        } else {
            Arm::First
        }
    }

    #[inline]
    pub fn sort_key(&self) -> RecordKey {
        (
            self.reference_id,
            self.start_position,
            self.read_id,
            self.arm() as u8,
            self.is_reverse(),
            self.mate_position,
        )
    }
}

/// One entry of a temp stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEntry {
    Record(TempRecord),
    EndOfStream,
}

// ---------------------------------------------------------------------------
// RecordBuffer
// ---------------------------------------------------------------------------

/// Byte buffer that records are encoded into before reaching the sink.
#[derive(Debug, Default)]
pub struct RecordBuffer {
    buf: Vec<u8>,
}

impl RecordBuffer {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(FLUSH_THRESHOLD),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[inline]
    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    #[inline]
    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    #[inline]
    pub fn write_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    #[inline]
    pub fn write_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// u32 length followed by the bytes.
    pub fn write_str(&mut self, s: &str) {
        self.write_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    pub fn write_record(&mut self, rec: &TempRecord) {
        self.write_u8(TAG_RECORD);
        self.write_i32(rec.read_id);
        self.write_u8(rec.flags);
        self.write_i32(rec.reference_id);
        self.write_i64(rec.start_position);
        self.write_str(&rec.cigar);
        self.write_i64(rec.mate_position);
        self.write_i32(rec.template_length);
        self.write_i32(rec.num_mismatches);
        self.write_i32(rec.alignment_score);
        self.write_i32(rec.combo_score);
        self.write_str(&rec.md);
        match &rec.cg {
            Some(cg) => {
                self.write_u8(1);
                self.write_str(&cg.read_string);
                self.write_str(&cg.read_delta);
                self.write_str(&cg.super_cigar);
            }
            None => self.write_u8(0),
        }
    }

    pub fn flush_to<W: Write>(&mut self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.buf)?;
        self.buf.clear();
        Ok(())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Writes one temp stream. Dropping without [`finish`](Self::finish) leaves
/// the stream without its sentinel.
pub struct TempRecordWriter<W: Write> {
    sink: W,
    buf: RecordBuffer,
    name: String,
    num_records: u64,
}

impl TempRecordWriter<BufWriter<File>> {
    pub fn create(path: &Path) -> Result<Self> {
        let file =
            File::create(path).with_context(|| format!("create {}", path.display()))?;
        Self::new(BufWriter::new(file), path.display().to_string())
    }
}

impl<W: Write> TempRecordWriter<W> {
    /// Wrap `sink` and write the stream header.
    pub fn new(sink: W, name: String) -> Result<Self> {
        let mut w = Self {
            sink,
            buf: RecordBuffer::new(),
            name,
            num_records: 0,
        };
        w.buf.buf.extend_from_slice(TEMP_MAGIC);
        w.buf.write_u8(TEMP_VERSION);
        Ok(w)
    }

    pub fn write(&mut self, rec: &TempRecord) -> Result<()> {
        self.buf.write_record(rec);
        self.num_records += 1;
        if self.buf.len() >= FLUSH_THRESHOLD {
            self.buf
                .flush_to(&mut self.sink)
                .with_context(|| format!("writing {}", self.name))?;
        }
        Ok(())
    }

    pub fn num_records(&self) -> u64 {
        self.num_records
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Write the sentinel, flush, and hand back the sink.
    pub fn finish(mut self) -> Result<W> {
        self.buf.write_u8(TAG_END);
        self.buf
            .flush_to(&mut self.sink)
            .with_context(|| format!("writing {}", self.name))?;
        self.sink
            .flush()
            .with_context(|| format!("flushing {}", self.name))?;
        Ok(self.sink)
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Reads one temp stream, validating framing as it goes.
pub struct TempRecordReader<R: Read> {
    inner: R,
    name: String,
    index: u64,
    done: bool,
}

impl TempRecordReader<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
        Self::new(BufReader::new(file), path.display().to_string())
    }
}

impl<R: Read> TempRecordReader<R> {
    /// Wrap `inner` and check the stream header.
    pub fn new(mut inner: R, name: String) -> Result<Self> {
        let mut magic = [0u8; 4];
        inner
            .read_exact(&mut magic)
            .with_context(|| format!("{}: reading magic", name))?;
        if &magic != TEMP_MAGIC {
            bail!("{}: bad magic {:?}, not a temp record stream", name, magic);
        }
        let mut version = [0u8; 1];
        inner
            .read_exact(&mut version)
            .with_context(|| format!("{}: reading version", name))?;
        if version[0] != TEMP_VERSION {
            bail!(
                "{}: unsupported temp stream version {} (expected {})",
                name,
                version[0],
                TEMP_VERSION
            );
        }
        Ok(Self {
            inner,
            name,
            index: 0,
            done: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Records read so far.
    pub fn num_records(&self) -> u64 {
        self.index
    }

    /// Whether the sentinel has been read.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Next entry. Once the sentinel was seen this keeps returning
    /// `EndOfStream`.
    pub fn next_entry(&mut self) -> Result<StreamEntry> {
        if self.done {
            return Ok(StreamEntry::EndOfStream);
        }
        let mut tag = [0u8; 1];
        if let Err(e) = self.inner.read_exact(&mut tag) {
            if e.kind() == ErrorKind::UnexpectedEof {
                bail!(
                    "{}: stream ended after {} records without end-of-stream marker",
                    self.name,
                    self.index
                );
            }
            return Err(e).with_context(|| format!("{}: reading record {}", self.name, self.index));
        }
        match tag[0] {
            TAG_END => {
                self.done = true;
                Ok(StreamEntry::EndOfStream)
            }
            TAG_RECORD => {
                let rec = self.read_record().with_context(|| {
                    format!("{}: malformed record {}", self.name, self.index)
                })?;
                self.index += 1;
                Ok(StreamEntry::Record(rec))
            }
            other => bail!(
                "{}: unknown tag {} at record {}",
                self.name,
                other,
                self.index
            ),
        }
    }

    /// Next record, or `None` at the sentinel.
    pub fn next_record(&mut self) -> Result<Option<TempRecord>> {
        match self.next_entry()? {
            StreamEntry::Record(r) => Ok(Some(r)),
            StreamEntry::EndOfStream => Ok(None),
        }
    }

    fn read_record(&mut self) -> Result<TempRecord> {
        let read_id = self.read_i32().context("read_id")?;
        let flags = self.read_u8().context("flags")?;
        if flags & !flags::ALL != 0 {
            bail!("unknown flag bits {:#04x}", flags);
        }
        let reference_id = self.read_i32().context("reference_id")?;
        let start_position = self.read_i64().context("start_position")?;
        let cigar = self.read_str().context("cigar")?;
        let mate_position = self.read_i64().context("mate_position")?;
        let template_length = self.read_i32().context("template_length")?;
        let num_mismatches = self.read_i32().context("num_mismatches")?;
        let alignment_score = self.read_i32().context("alignment_score")?;
        let combo_score = self.read_i32().context("combo_score")?;
        let md = self.read_str().context("md")?;
        let cg = match self.read_u8().context("has_cg")? {
            0 => None,
            1 => Some(CgFields {
                read_string: self.read_str().context("cg read string")?,
                read_delta: self.read_str().context("cg read delta")?,
                super_cigar: self.read_str().context("cg super cigar")?,
            }),
            other => bail!("invalid has_cg byte {}", other),
        };
        Ok(TempRecord {
            read_id,
            flags,
            reference_id,
            start_position,
            cigar,
            mate_position,
            template_length,
            num_mismatches,
            alignment_score,
            combo_score,
            md,
            cg,
        })
    }

    fn read_u8(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        self.inner.read_exact(&mut b)?;
        Ok(b[0])
    }

    fn read_u32(&mut self) -> Result<u32> {
        let mut b = [0u8; 4];
        self.inner.read_exact(&mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    fn read_i32(&mut self) -> Result<i32> {
        let mut b = [0u8; 4];
        self.inner.read_exact(&mut b)?;
        Ok(i32::from_le_bytes(b))
    }

    fn read_i64(&mut self) -> Result<i64> {
        let mut b = [0u8; 8];
        self.inner.read_exact(&mut b)?;
        Ok(i64::from_le_bytes(b))
    }

    fn read_str(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        if len > MAX_FIELD_LEN {
            bail!("string length {} exceeds limit {}", len, MAX_FIELD_LEN);
        }
        let mut bytes = vec![0u8; len];
        self.inner.read_exact(&mut bytes)?;
        String::from_utf8(bytes).context("string is not valid UTF-8")
    }
}

/// Read every record of a complete stream.
pub fn read_all_records(path: &Path) -> Result<Vec<TempRecord>> {
    let mut reader = TempRecordReader::open(path)?;
    let mut out = Vec::new();
    while let Some(rec) = reader.next_record()? {
        out.push(rec);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
