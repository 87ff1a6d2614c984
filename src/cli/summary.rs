//! CLI command to re-render the statistics report of a finished run.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;

use crate::io::map_info::{MAP_INFO_FILE, read_stats_snapshot};
use crate::mapping::statistics::MapStatistics;

#[derive(Args, Debug)]
#[command(about = "Print the mapping summary of a finished run")]
pub struct SummaryArgs {
    /// Output directory of the run, or its map_info.json
    pub run: PathBuf,
    /// Print the raw counters as JSON instead of the table
    #[arg(long)]
    pub json: bool,
}

pub fn run(args: SummaryArgs) -> Result<()> {
    let path = if args.run.is_dir() {
        args.run.join(MAP_INFO_FILE)
    } else {
        args.run
    };
    let snapshot = read_stats_snapshot(&path)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print!("{}", MapStatistics::from_snapshot(&snapshot)?.report());
    }
    Ok(())
}
