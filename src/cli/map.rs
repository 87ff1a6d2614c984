//! CLI command for a full two-pass mapping run.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Args;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use tracing::info;

use crate::io::hit_source::{HitReader, ReadTable, TemplateTable};
use crate::io::map_info::{MAP_INFO_FILE, write_map_info};
use crate::io::threads::ThreadConfig;
use crate::mapping::nstore::StorePolicy;
use crate::mapping::opts::PipelineOpts;
use crate::mapping::pipeline::Pipeline;

#[derive(Args, Debug)]
pub struct MapArgs {
    /// Template table (name, length; tab-separated)
    #[arg(short = 'x', long)]
    pub templates: PathBuf,
    /// Read table (name, length[, mate length]; tab-separated)
    #[arg(short = 'r', long)]
    pub reads: PathBuf,
    /// Hit file (readId, arm, strand, templateId, position, score[, cigar[, md]])
    #[arg(short = 'H', long)]
    pub hits: PathBuf,
    /// Output directory
    #[arg(short = 'o', long)]
    pub output: PathBuf,
    /// Directory for the per-region temp streams [default: <output>/tmp]
    #[arg(long)]
    pub temp_dir: Option<PathBuf>,
    /// Number of worker threads
    #[arg(short = 't', long, default_value = "16")]
    pub threads: usize,
    /// Work items per thread
    #[arg(long, default_value = "4")]
    pub thread_multiplier: usize,
    /// Hits retained per read arm, and the tie count still reported
    #[arg(short = 'n', long, default_value = "5")]
    pub top_n: usize,
    /// Retention policy (topn or upton)
    #[arg(long, default_value = "topn")]
    pub store_policy: StorePolicy,
    /// Keep repeated hits at the same site
    #[arg(long)]
    pub no_dedup: bool,
    /// Read arms with this many candidate alignments are blocked
    #[arg(long, default_value = "65")]
    pub repeat_threshold: u32,
    /// Worst unmated alignment score counted as a candidate
    #[arg(long, default_value = "10")]
    pub max_unmated_score: i32,
    /// Worst combined mated score counted as a candidate
    #[arg(long, default_value = "20")]
    pub max_mated_score: i32,
    #[arg(long, default_value = "0")]
    pub min_frag_len: i32,
    #[arg(long, default_value = "1000")]
    pub max_frag_len: i32,
    /// Gzip the SAM outputs
    #[arg(short = 'z', long)]
    pub gzip: bool,
    /// Keep the temp streams after the merge
    #[arg(long)]
    pub keep_temp: bool,
    /// Write every candidate record, without blocker filtering
    #[arg(long)]
    pub unfiltered: bool,
    /// Suppress progress output
    #[arg(short = 'q', long)]
    pub quiet: bool,
}

impl MapArgs {
    fn opts(&self) -> PipelineOpts {
        PipelineOpts {
            top_n: self.top_n,
            store_policy: self.store_policy,
            dedup: !self.no_dedup,
            repeat_threshold: self.repeat_threshold,
            max_unmated_score: self.max_unmated_score,
            max_mated_score: self.max_mated_score,
            min_frag_len: self.min_frag_len,
            max_frag_len: self.max_frag_len,
            gzip: self.gzip,
            keep_temp: self.keep_temp,
            unfiltered: self.unfiltered,
        }
    }
}

pub fn run(args: MapArgs) -> Result<()> {
    let start = Instant::now();
    let cmdline = std::env::args().collect::<Vec<_>>().join(" ");

    let opts = args.opts();
    opts.validate()?;
    let threads = ThreadConfig {
        threads: args.threads,
        multiplier: args.thread_multiplier,
    };
    threads.validate()?;

    let templates = TemplateTable::load(&args.templates)?;
    let reads = ReadTable::load(&args.reads)?;
    info!(
        "Mapping {} {} reads against {} templates",
        reads.num_reads(),
        if reads.is_paired() { "paired-end" } else { "single-end" },
        templates.len()
    );

    let out_dir = args.output.clone();
    std::fs::create_dir_all(&out_dir)
        .with_context(|| format!("failed to create output directory: {}", out_dir.display()))?;
    let temp_dir = args
        .temp_dir
        .clone()
        .unwrap_or_else(|| out_dir.join("tmp"));

    let progress = make_progress_bar(args.quiet);
    let hits = HitReader::open(&args.hits, &templates, &reads)?;
    let pipeline = Pipeline {
        templates: &templates,
        reads: &reads,
        opts,
        threads,
        out_dir: &out_dir,
        temp_dir,
        cmdline: &cmdline,
    };
    let summary = pipeline.run(hits, &progress)?;
    progress.finish_and_clear();

    let elapsed = start.elapsed().as_secs_f64();
    info!(
        "Mapped {} read arms, {} unmapped ({} blocked); merge wrote {}/{} records, {:.2}s total",
        summary.mapped_arms,
        summary.unmapped_arms,
        summary.blocked_arms,
        summary.merge.records_written,
        summary.merge.records_read,
        elapsed,
    );

    write_map_info(&out_dir.join(MAP_INFO_FILE), &summary, &cmdline, elapsed)?;
    log_outputs(&out_dir, opts.gzip, reads.is_paired());

    Ok(())
}

fn log_outputs(out_dir: &Path, gzip: bool, paired: bool) {
    let names: &[&str] = if paired {
        &["mated.sam", "unmated.sam", "unmapped.sam"]
    } else {
        &["alignments.sam", "unmapped.sam"]
    };
    for n in names {
        let file = if gzip {
            format!("{}.gz", n)
        } else {
            n.to_string()
        };
        info!("wrote {}", out_dir.join(file).display());
    }
}

/// Create a spinner ticking once per ingested hit.
pub(crate) fn make_progress_bar(quiet: bool) -> ProgressBar {
    if quiet {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new_spinner();
        pb.set_draw_target(ProgressDrawTarget::stderr_with_hz(1));
        if let Ok(style) = ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] {human_pos} hits ingested ({per_sec})",
        ) {
            pb.set_style(style);
        }
        pb.enable_steady_tick(Duration::from_millis(1_000));
        pb
    }
}
