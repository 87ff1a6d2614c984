//! CLI command to dump a temp record stream as text.

use std::io::{BufWriter, Write};
use std::path::PathBuf;

use anyhow::Result;
use clap::Args;

use crate::io::temp_record::{StreamEntry, TempRecord, TempRecordReader};

#[derive(Args, Debug)]
#[command(about = "Print the records of a temp stream, one per line")]
pub struct InspectArgs {
    /// Temp stream (`.mmtr`) to read
    pub stream: PathBuf,
    /// Only print the record count and whether the stream is complete
    #[arg(short = 'c', long)]
    pub count_only: bool,
}

pub fn run(args: InspectArgs) -> Result<()> {
    let mut reader = TempRecordReader::open(&args.stream)?;
    let stdout = std::io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    if !args.count_only {
        writeln!(
            out,
            "#read_id\tflags\treference\tstart\tcigar\tmate\ttlen\tnm\tscore\tcombo\tmd"
        )?;
    }

    // a truncated stream is reported after the records that could be read
    let sentinel = loop {
        match reader.next_entry() {
            Ok(StreamEntry::Record(rec)) => {
                if !args.count_only {
                    write_record(&mut out, &rec)?;
                }
            }
            Ok(StreamEntry::EndOfStream) => break Ok(()),
            Err(e) => break Err(e),
        }
    };
    writeln!(out, "# records: {}", reader.num_records())?;
    writeln!(out, "# end-of-stream marker: {}", if sentinel.is_ok() { "present" } else { "missing" })?;
    out.flush()?;
    sentinel
}

fn write_record<W: Write>(out: &mut W, rec: &TempRecord) -> Result<()> {
    write!(
        out,
        "{}\t{:#04x}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
        rec.read_id,
        rec.flags,
        rec.reference_id,
        rec.start_position,
        rec.cigar,
        rec.mate_position,
        rec.template_length,
        rec.num_mismatches,
        rec.alignment_score,
        rec.combo_score,
        if rec.md.is_empty() { "*" } else { rec.md.as_str() },
    )?;
    if let Some(cg) = &rec.cg {
        write!(out, "\t{}\t{}\t{}", cg.read_string, cg.read_delta, cg.super_cigar)?;
    }
    writeln!(out)?;
    Ok(())
}
