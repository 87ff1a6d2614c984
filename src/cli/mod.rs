pub mod inspect;
pub mod map;
pub mod summary;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "mapmerge-rs")]
#[command(about = "Two-pass match aggregation and sorted SAM output for short-read mapping")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Map(map::MapArgs),
    Inspect(inspect::InspectArgs),
    Summary(summary::SummaryArgs),
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Map(args) => map::run(args),
        Commands::Inspect(args) => inspect::run(args),
        Commands::Summary(args) => summary::run(args),
    }
}
