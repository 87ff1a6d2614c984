//! map_info.json writer and reader: summary of a finished run.

use std::path::Path;

use anyhow::{Context, Result};

use crate::mapping::pipeline::RunSummary;
use crate::mapping::statistics::StatsSnapshot;

pub const MAP_INFO_FILE: &str = "map_info.json";

/// Write `map_info.json` for a finished run.
pub fn write_map_info(
    path: &Path,
    summary: &RunSummary,
    cmdline: &str,
    elapsed_secs: f64,
) -> Result<()> {
    let num_arms = if summary.paired {
        summary.num_reads as u64 * 2
    } else {
        summary.num_reads as u64
    };
    let percent_mapped = if num_arms > 0 {
        (summary.mapped_arms as f64 / num_arms as f64) * 100.0
    } else {
        0.0
    };

    let info = serde_json::json!({
        "mapmerge_version": crate::VERSION,
        "num_reads": summary.num_reads,
        "paired": summary.paired,
        "num_mapped_arms": summary.mapped_arms,
        "num_unmapped_arms": summary.unmapped_arms,
        "num_blocked_arms": summary.blocked_arms,
        "percent_mapped": format!("{:.2}", percent_mapped),
        "hits_ingested": summary.hits_ingested,
        "hits_retained": summary.hits_retained,
        "records_read": summary.merge.records_read,
        "records_written": summary.merge.records_written,
        "merge": summary.merge,
        "runtime_seconds": format!("{:.2}", elapsed_secs),
        "cmdline": cmdline,
        "statistics": summary.stats,
    });

    let file = std::fs::File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    let writer = std::io::BufWriter::new(file);
    serde_json::to_writer_pretty(writer, &info)?;
    Ok(())
}

/// Read back the statistics snapshot of a `map_info.json`.
pub fn read_stats_snapshot(path: &Path) -> Result<StatsSnapshot> {
    let file =
        std::fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let info: serde_json::Value = serde_json::from_reader(std::io::BufReader::new(file))
        .with_context(|| format!("{} is not valid JSON", path.display()))?;
    let stats = info
        .get("statistics")
        .cloned()
        .with_context(|| format!("{} has no statistics section", path.display()))?;
    serde_json::from_value(stats).with_context(|| format!("malformed statistics in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::filter_concat::MergeSummary;
    use crate::mapping::hits::Arm;
    use crate::mapping::statistics::{MapStatistics, Stat};

    #[test]
    fn test_write_map_info() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(MAP_INFO_FILE);

        let stats = MapStatistics::new(true);
        stats.add(Arm::First, Stat::Total, 500);
        stats.add(Arm::Second, Stat::Total, 500);
        stats.add(Arm::First, Stat::Mated, 400);
        stats.add(Arm::Second, Stat::Mated, 400);
        let summary = RunSummary {
            num_reads: 500,
            paired: true,
            hits_ingested: 3000,
            hits_retained: 2000,
            hits_discarded: 1000,
            num_work_items: 4,
            candidate_records: 2500,
            merge: MergeSummary {
                records_read: 2500,
                records_written: 1200,
                ..Default::default()
            },
            mapped_arms: 800,
            unmapped_arms: 200,
            blocked_arms: 10,
            stats: stats.snapshot(),
        };
        write_map_info(&path, &summary, "mapmerge-rs map ...", 42.5).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let val: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(val["num_reads"], 500);
        assert_eq!(val["num_mapped_arms"], 800);
        assert_eq!(val["num_blocked_arms"], 10);
        assert_eq!(val["percent_mapped"], "80.00");
        assert_eq!(val["records_written"], 1200);

        let snap = read_stats_snapshot(&path).unwrap();
        assert_eq!(snap, stats.snapshot());
    }

    #[test]
    fn test_missing_statistics() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(MAP_INFO_FILE);
        std::fs::write(&path, "{\"num_reads\": 1}").unwrap();
        assert!(read_stats_snapshot(&path).is_err());
    }
}
