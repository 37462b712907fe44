use crate::paths::TargetFormat;
use anyhow::Context;
use chrono::{DateTime, Utc};
use parquedb_types::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeSet;
use tracing::{debug, info};

/// A writer is active if it was observed within this much of now.
pub const WRITER_INACTIVE_THRESHOLD_MS: i64 = 30 * 60 * 1000;
/// A window stuck in processing beyond this is reset to pending.
pub const PROCESSING_TIMEOUT_MS: i64 = 5 * 60 * 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionConfig {
    pub window_size_ms: i64,
    pub max_wait_time_ms: i64,
    pub min_files_to_compact: usize,
    pub target_format: TargetFormat,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            window_size_ms: 60_000,
            max_wait_time_ms: 30_000,
            min_files_to_compact: 2,
            target_format: TargetFormat::Native,
        }
    }
}

/// One file-arrival notification, filtered upstream to valid Parquet object
/// creations under the namespace prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileArrival {
    pub writer_id: String,
    pub file: String,
    pub timestamp: DateTime<Utc>,
    pub size: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowFile {
    pub path: String,
    pub size: i64,
    pub writer_id: String,
}

/// A window newly transitioned to processing, handed to the caller for
/// workflow dispatch. Files are sorted for a deterministic merge-sort.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowReadyEntry {
    pub window_key: String,
    pub ns: String,
    pub window_start_ms: i64,
    pub window_end_ms: i64,
    pub files: Vec<WindowFile>,
    pub total_size: i64,
    pub writers: Vec<String>,
    pub target_format: TargetFormat,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowStatusEntry {
    pub window_key: String,
    pub status: String,
    pub file_count: i64,
    pub writer_count: i64,
    pub total_size: i64,
    pub last_activity_at_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionStatus {
    pub ns: String,
    pub active_windows: usize,
    pub windows: Vec<WindowStatusEntry>,
}

/// Result of `workflow_complete`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowCompleteResult {
    pub success: bool,
    pub already_deleted: bool,
}

/// Per-namespace state machine aggregating writer outputs into time windows
/// and deciding when a window is worth one compaction job.
///
/// All state lives in the coordinator's embedded SQL, so an instance is
/// stateless between calls and idempotent under HTTP retry. Time-dependent
/// entry points take `now` from the caller.
pub struct CompactionCoordinator {
    pool: SqlitePool,
    ns: String,
}

impl CompactionCoordinator {
    pub fn new(pool: SqlitePool, ns: impl Into<String>) -> Self {
        Self {
            pool,
            ns: ns.into(),
        }
    }

    pub fn ns(&self) -> &str {
        &self.ns
    }

    fn window_key(&self, window_start: i64) -> String {
        format!("{}:{window_start}", self.ns)
    }

    fn parse_window_key(&self, window_key: &str) -> CoreResult<i64> {
        let Some((ns, start)) = window_key.rsplit_once(':') else {
            return Err(CoreError::validation(format!(
                "malformed window key {window_key}"
            )));
        };
        if ns != self.ns {
            return Err(CoreError::validation(format!(
                "window key {window_key} does not belong to {}",
                self.ns
            )));
        }
        start
            .parse()
            .map_err(|_| CoreError::validation(format!("malformed window key {window_key}")))
    }

    /// Folds arrivals into windows, recovers stuck processing windows, and
    /// returns the windows newly transitioned to processing.
    pub async fn update(
        &self,
        updates: &[FileArrival],
        config: &CompactionConfig,
        now: DateTime<Utc>,
    ) -> CoreResult<Vec<WindowReadyEntry>> {
        if config.window_size_ms <= 0 || config.max_wait_time_ms < 0 {
            return Err(CoreError::validation("window bounds must be positive"));
        }
        let now_ms = now.timestamp_millis();
        for arrival in updates {
            self.record_arrival(arrival, config).await?;
        }
        self.recover_stuck_windows(now_ms).await?;
        self.collect_ready_windows(config, now_ms).await
    }

    async fn record_arrival(
        &self,
        arrival: &FileArrival,
        config: &CompactionConfig,
    ) -> CoreResult<()> {
        let ts_ms = arrival.timestamp.timestamp_millis();
        let window_start = ts_ms.div_euclid(config.window_size_ms) * config.window_size_ms;
        let window_end = window_start + config.window_size_ms;

        sqlx::query(
            "INSERT INTO writer_activity(ns, writer_id, last_seen) VALUES($1, $2, $3)
             ON CONFLICT(ns, writer_id) DO UPDATE SET last_seen = MAX(last_seen, $3);",
        )
        .bind(&self.ns)
        .bind(&arrival.writer_id)
        .bind(ts_ms)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::storage(e))?;

        sqlx::query(
            "INSERT INTO compaction_windows(ns, window_start, window_end, last_activity_at, total_size, status)
             VALUES($1, $2, $3, $4, 0, 'pending')
             ON CONFLICT(ns, window_start) DO UPDATE SET last_activity_at = MAX(last_activity_at, $4);",
        )
        .bind(&self.ns)
        .bind(window_start)
        .bind(window_end)
        .bind(ts_ms)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::storage(e))?;

        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO compaction_files(ns, window_start, writer_id, file_path, file_size, observed_at)
             VALUES($1, $2, $3, $4, $5, $6);",
        )
        .bind(&self.ns)
        .bind(window_start)
        .bind(&arrival.writer_id)
        .bind(&arrival.file)
        .bind(arrival.size)
        .bind(ts_ms)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::storage(e))?;
        if inserted.rows_affected() > 0 {
            sqlx::query(
                "UPDATE compaction_windows SET total_size = total_size + $3
                 WHERE ns = $1 AND window_start = $2;",
            )
            .bind(&self.ns)
            .bind(window_start)
            .bind(arrival.size)
            .execute(&self.pool)
            .await
            .map_err(|e| CoreError::storage(e))?;
        } else {
            debug!("duplicate arrival of {} ignored", arrival.file);
        }
        Ok(())
    }

    async fn recover_stuck_windows(&self, now_ms: i64) -> CoreResult<()> {
        let reset = sqlx::query(
            "UPDATE compaction_windows
             SET status = 'pending', started_at = NULL
             WHERE ns = $1 AND status = 'processing' AND started_at < $2;",
        )
        .bind(&self.ns)
        .bind(now_ms - PROCESSING_TIMEOUT_MS)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::storage(e))?;
        if reset.rows_affected() > 0 {
            info!(
                "reset {} stuck processing window(s) for {}",
                reset.rows_affected(),
                self.ns
            );
        }
        Ok(())
    }

    async fn collect_ready_windows(
        &self,
        config: &CompactionConfig,
        now_ms: i64,
    ) -> CoreResult<Vec<WindowReadyEntry>> {
        let active_writers: BTreeSet<String> = sqlx::query(
            "SELECT writer_id FROM writer_activity
             WHERE ns = $1 AND last_seen >= $2;",
        )
        .bind(&self.ns)
        .bind(now_ms - WRITER_INACTIVE_THRESHOLD_MS)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoreError::storage(e))?
        .iter()
        .map(|row| row.try_get("writer_id"))
        .collect::<Result<_, _>>()
        .map_err(|e| CoreError::storage(e))?;

        // the namespace is quiescent when no writer has shown any activity
        // within the wait bound
        let ns_last_activity: Option<i64> = sqlx::query(
            "SELECT MAX(last_seen) AS last_seen FROM writer_activity WHERE ns = $1;",
        )
        .bind(&self.ns)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| CoreError::storage(e))?
        .try_get("last_seen")
        .unwrap_or(None);
        let quiesced = ns_last_activity
            .map(|last| now_ms - last > config.max_wait_time_ms)
            .unwrap_or(true);

        let pending = sqlx::query(
            "SELECT window_start, window_end, last_activity_at, total_size
             FROM compaction_windows
             WHERE ns = $1 AND status = 'pending'
             ORDER BY window_start;",
        )
        .bind(&self.ns)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoreError::storage(e))?;

        let mut ready = vec![];
        for window in pending {
            let window_start: i64 = window.try_get("window_start").map_err(|e| CoreError::storage(e))?;
            let window_end: i64 = window.try_get("window_end").map_err(|e| CoreError::storage(e))?;
            let total_size: i64 = window.try_get("total_size").map_err(|e| CoreError::storage(e))?;
            if now_ms < window_end + config.max_wait_time_ms {
                continue;
            }
            let files = self.window_files(window_start).await?;
            if files.len() < config.min_files_to_compact {
                continue;
            }
            let contributors: BTreeSet<&str> =
                files.iter().map(|f| f.writer_id.as_str()).collect();
            let all_contributed = active_writers
                .iter()
                .all(|writer| contributors.contains(writer.as_str()));
            if !(all_contributed || quiesced) {
                continue;
            }
            sqlx::query(
                "UPDATE compaction_windows
                 SET status = 'processing', started_at = $3
                 WHERE ns = $1 AND window_start = $2 AND status = 'pending';",
            )
            .bind(&self.ns)
            .bind(window_start)
            .bind(now_ms)
            .execute(&self.pool)
            .await
            .map_err(|e| CoreError::storage(e))?;
            let writers = contributors.iter().map(|w| (*w).to_owned()).collect();
            ready.push(WindowReadyEntry {
                window_key: self.window_key(window_start),
                ns: self.ns.clone(),
                window_start_ms: window_start,
                window_end_ms: window_end,
                files,
                total_size,
                writers,
                target_format: config.target_format,
            });
        }
        Ok(ready)
    }

    async fn window_files(&self, window_start: i64) -> CoreResult<Vec<WindowFile>> {
        let rows = sqlx::query(
            "SELECT file_path, file_size, writer_id
             FROM compaction_files
             WHERE ns = $1 AND window_start = $2
             ORDER BY file_path;",
        )
        .bind(&self.ns)
        .bind(window_start)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoreError::storage(e))?;
        rows.iter()
            .map(|row| {
                Ok(WindowFile {
                    path: row.try_get("file_path").map_err(|e| CoreError::storage(e))?,
                    size: row.try_get("file_size").map_err(|e| CoreError::storage(e))?,
                    writer_id: row.try_get("writer_id").map_err(|e| CoreError::storage(e))?,
                })
            })
            .collect()
    }

    /// `processing → dispatched` after the caller created the workflow.
    pub async fn confirm_dispatch(
        &self,
        window_key: &str,
        workflow_id: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<()> {
        let window_start = self.parse_window_key(window_key)?;
        let updated = sqlx::query(
            "UPDATE compaction_windows
             SET status = 'dispatched', workflow_id = $3, dispatched_at = $4
             WHERE ns = $1 AND window_start = $2 AND status = 'processing';",
        )
        .bind(&self.ns)
        .bind(window_start)
        .bind(workflow_id)
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::storage(e))?;
        if updated.rows_affected() == 0 {
            return Err(CoreError::conflict(format!(
                "window {window_key} is not in processing"
            )));
        }
        Ok(())
    }

    /// `processing → pending` after a failed workflow creation.
    pub async fn rollback_processing(&self, window_key: &str) -> CoreResult<()> {
        let window_start = self.parse_window_key(window_key)?;
        let updated = sqlx::query(
            "UPDATE compaction_windows
             SET status = 'pending', started_at = NULL
             WHERE ns = $1 AND window_start = $2 AND status = 'processing';",
        )
        .bind(&self.ns)
        .bind(window_start)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::storage(e))?;
        if updated.rows_affected() == 0 {
            return Err(CoreError::conflict(format!(
                "window {window_key} is not in processing"
            )));
        }
        Ok(())
    }

    /// Deletes the window on success, resets it for retry on failure.
    pub async fn workflow_complete(
        &self,
        window_key: &str,
        workflow_id: &str,
        success: bool,
    ) -> CoreResult<WorkflowCompleteResult> {
        let window_start = self.parse_window_key(window_key)?;
        let row = sqlx::query(
            "SELECT status, workflow_id
             FROM compaction_windows
             WHERE ns = $1 AND window_start = $2;",
        )
        .bind(&self.ns)
        .bind(window_start)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoreError::storage(e))?;
        let Some(row) = row else {
            return Ok(WorkflowCompleteResult {
                success: true,
                already_deleted: true,
            });
        };
        let status: String = row.try_get("status").map_err(|e| CoreError::storage(e))?;
        let known_workflow: Option<String> =
            row.try_get("workflow_id").map_err(|e| CoreError::storage(e))?;
        if status != "dispatched" {
            return Err(CoreError::conflict(format!(
                "window {window_key} is not dispatched"
            )));
        }
        if known_workflow.as_deref() != Some(workflow_id) {
            return Err(CoreError::conflict(format!(
                "workflow id mismatch for window {window_key}"
            )));
        }
        if success {
            let mut tr = self
                .pool
                .begin()
                .await
                .map_err(|e| CoreError::storage(e))?;
            sqlx::query("DELETE FROM compaction_files WHERE ns = $1 AND window_start = $2;")
                .bind(&self.ns)
                .bind(window_start)
                .execute(&mut *tr)
                .await
                .map_err(|e| CoreError::storage(e))?;
            sqlx::query("DELETE FROM compaction_windows WHERE ns = $1 AND window_start = $2;")
                .bind(&self.ns)
                .bind(window_start)
                .execute(&mut *tr)
                .await
                .map_err(|e| CoreError::storage(e))?;
            tr.commit().await.map_err(|e| CoreError::storage(e))?;
            info!("window {window_key} compacted by workflow {workflow_id}");
        } else {
            sqlx::query(
                "UPDATE compaction_windows
                 SET status = 'pending', started_at = NULL, workflow_id = NULL, dispatched_at = NULL
                 WHERE ns = $1 AND window_start = $2;",
            )
            .bind(&self.ns)
            .bind(window_start)
            .execute(&self.pool)
            .await
            .map_err(|e| CoreError::storage(e))?;
            info!("window {window_key} reset to pending after failed workflow {workflow_id}");
        }
        Ok(WorkflowCompleteResult {
            success: true,
            already_deleted: false,
        })
    }

    pub async fn status(&self) -> CoreResult<CompactionStatus> {
        let rows = sqlx::query(
            "SELECT w.window_start, w.status, w.total_size, w.last_activity_at,
                    (SELECT COUNT(*) FROM compaction_files f
                     WHERE f.ns = w.ns AND f.window_start = w.window_start) AS file_count,
                    (SELECT COUNT(DISTINCT writer_id) FROM compaction_files f
                     WHERE f.ns = w.ns AND f.window_start = w.window_start) AS writer_count
             FROM compaction_windows w
             WHERE w.ns = $1
             ORDER BY w.window_start;",
        )
        .bind(&self.ns)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoreError::storage(e))?;
        let windows: Vec<WindowStatusEntry> = rows
            .iter()
            .map(|row| {
                anyhow::Ok(WindowStatusEntry {
                    window_key: self.window_key(row.try_get("window_start")?),
                    status: row.try_get("status")?,
                    file_count: row.try_get("file_count")?,
                    writer_count: row.try_get("writer_count")?,
                    total_size: row.try_get("total_size")?,
                    last_activity_at_ms: row.try_get("last_activity_at")?,
                })
            })
            .collect::<anyhow::Result<_>>()
            .context("reading window status")
            .map_err(CoreError::Internal)?;
        Ok(CompactionStatus {
            ns: self.ns.clone(),
            active_windows: windows.len(),
            windows,
        })
    }
}
