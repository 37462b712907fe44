use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The table layout a compaction workflow writes.
///
/// The coordinator passes the format opaquely to the workflow; only the path
/// builders here depend on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetFormat {
    #[default]
    Native,
    Iceberg,
    Delta,
}

fn hour_partition(ts: DateTime<Utc>) -> String {
    ts.format("year=%Y/month=%m/day=%d/hour=%H").to_string()
}

/// The canonical data file path for one compacted batch.
pub fn compacted_file_path(
    format: TargetFormat,
    ns: &str,
    window_start: DateTime<Utc>,
    batch_n: u64,
) -> String {
    let partition = hour_partition(window_start);
    let ts = window_start.timestamp_millis();
    match format {
        TargetFormat::Native => {
            format!("data/{ns}/{partition}/compacted-{ts}-{batch_n}.parquet")
        }
        TargetFormat::Iceberg => {
            format!("{ns}/data/{partition}/compacted-{ts}-{batch_n}.parquet")
        }
        TargetFormat::Delta => {
            format!("{ns}/{partition}/part-{batch_n:05}-compacted-{ts}.parquet")
        }
    }
}

/// Iceberg manifest location for one commit.
pub fn iceberg_manifest_path(ns: &str, snapshot_id: u64) -> String {
    format!("{ns}/metadata/snap-{snapshot_id}.avro")
}

/// Delta transaction log entry for one commit version.
pub fn delta_log_path(ns: &str, version: u64) -> String {
    format!("{ns}/_delta_log/{version:020}.json")
}
