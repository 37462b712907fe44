use crate::compaction::FileArrival;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The object affected by an arrival notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub key: String,
    pub size: i64,
    #[serde(rename = "eTag", default)]
    pub e_tag: Option<String>,
}

/// A small JSON message emitted by the object store on object creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectNotification {
    pub account: String,
    pub bucket: String,
    pub object: ObjectInfo,
    pub action: String,
    pub event_time: DateTime<Utc>,
}

const FORWARDED_ACTIONS: [&str; 3] = ["PutObject", "CopyObject", "CompleteMultipartUpload"];

/// Filters one notification down to a compaction-coordinator update.
///
/// Only object creations of `.parquet` files under the configured prefix are
/// forwarded; everything else is dropped. Returns the namespace parsed from
/// the key (`<prefix><ns>/pending/<file>`) along with the arrival; the writer
/// id is the shard id segment of the file name
/// (`<unix-ms>-<shardId>-<batchN>.parquet`).
pub fn file_arrival_from_notification(
    notification: &ObjectNotification,
    prefix: &str,
) -> Option<(String, FileArrival)> {
    if !FORWARDED_ACTIONS.contains(&notification.action.as_str()) {
        return None;
    }
    let key = &notification.object.key;
    let rest = key.strip_prefix(prefix)?;
    let file_name = rest.strip_suffix(".parquet")?;
    let mut segments = file_name.split('/');
    let ns = segments.next()?;
    if ns.is_empty() || segments.next()? != "pending" {
        return None;
    }
    let file_name = segments.next()?;
    if segments.next().is_some() {
        return None;
    }
    let (_unix_ms, rest) = file_name.split_once('-')?;
    let (writer_id, _batch_n) = rest.rsplit_once('-')?;
    Some((
        ns.to_owned(),
        FileArrival {
            writer_id: writer_id.to_owned(),
            file: key.clone(),
            timestamp: notification.event_time,
            size: notification.object.size,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn notification(key: &str, action: &str) -> ObjectNotification {
        ObjectNotification {
            account: "acct".into(),
            bucket: "bucket".into(),
            object: ObjectInfo {
                key: key.into(),
                size: 1024,
                e_tag: Some("etag".into()),
            },
            action: action.into(),
            event_time: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_forwarded() {
        let n = notification("data/posts/pending/1714564800000-shard-0-3.parquet", "PutObject");
        let (ns, arrival) = file_arrival_from_notification(&n, "data/").unwrap();
        assert_eq!(ns, "posts");
        assert_eq!(arrival.writer_id, "shard-0");
        assert_eq!(arrival.size, 1024);
    }

    #[test]
    fn test_dropped() {
        for (key, action) in [
            ("data/posts/pending/1-s-0.parquet", "DeleteObject"),
            ("data/posts/pending/1-s-0.csv", "PutObject"),
            ("other/posts/pending/1-s-0.parquet", "PutObject"),
            ("data/posts/1-s-0.parquet", "PutObject"),
        ] {
            assert!(file_arrival_from_notification(&notification(key, action), "data/").is_none());
        }
    }
}
