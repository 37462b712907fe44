use crate::compaction::WorkflowCompleteResult;
use anyhow::Context;
use chrono::{DateTime, Utc};
use parquedb_types::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

/// How a registered materialized view is kept fresh. Only streaming views
/// react to change notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshMode {
    Streaming,
    Scheduled,
    Manual,
}

impl RefreshMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Streaming => "streaming",
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MvRegistration {
    pub name: String,
    pub source: String,
    pub refresh_mode: RefreshMode,
}

/// A view whose pending changes satisfy the debounce or max-wait bound.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyMv {
    pub name: String,
    pub changed_files: Vec<String>,
    pub first_change_at_ms: i64,
    pub last_change_at_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MvStatusEntry {
    pub name: String,
    pub status: String,
    pub changed_file_count: usize,
    pub workflow_id: Option<String>,
}

/// Per-deployment coordinator tracking refresh needs of registered views.
///
/// Change notifications accumulate into at most one pending entry per view;
/// readiness follows quiescence (`debounce_ms`) or the max-wait bound. State
/// lives in the coordinator's embedded SQL; time-dependent entry points take
/// `now` from the caller.
pub struct MvRefreshCoordinator {
    pool: SqlitePool,
}

impl MvRefreshCoordinator {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn register_mv(&self, registration: &MvRegistration) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO mv_registry(name, source, refresh_mode) VALUES($1, $2, $3)
             ON CONFLICT(name) DO UPDATE SET source = $2, refresh_mode = $3;",
        )
        .bind(&registration.name)
        .bind(&registration.source)
        .bind(registration.refresh_mode.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::storage(e))?;
        info!(
            "registered mv {} on {} ({})",
            registration.name,
            registration.source,
            registration.refresh_mode.as_str()
        );
        Ok(())
    }

    /// Records changed source files for every streaming view of `namespace`.
    pub async fn notify_change(
        &self,
        namespace: &str,
        files: &[String],
        timestamp: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> CoreResult<()> {
        let views: Vec<String> = sqlx::query(
            "SELECT name FROM mv_registry
             WHERE source = $1 AND refresh_mode = 'streaming';",
        )
        .bind(namespace)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoreError::storage(e))?
        .iter()
        .map(|row| row.try_get("name"))
        .collect::<Result<_, _>>()
        .map_err(|e| CoreError::storage(e))?;

        for name in views {
            self.merge_into_pending(
                &name,
                files,
                timestamp.timestamp_millis(),
                now.timestamp_millis(),
            )
            .await?;
        }
        Ok(())
    }

    /// Appends files into the view's single pending entry, creating it when
    /// only dispatched (or no) entries exist.
    async fn merge_into_pending(
        &self,
        name: &str,
        files: &[String],
        first_change_at: i64,
        last_change_at: i64,
    ) -> CoreResult<()> {
        let pending = sqlx::query(
            "SELECT changed_files FROM mv_refresh_state
             WHERE name = $1 AND status = 'pending';",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoreError::storage(e))?;
        match pending {
            Some(row) => {
                let mut changed: Vec<String> = decode_files(&row)?;
                for file in files {
                    if !changed.contains(file) {
                        changed.push(file.clone());
                    }
                }
                sqlx::query(
                    "UPDATE mv_refresh_state
                     SET changed_files = $2, last_change_at = $3
                     WHERE name = $1 AND status = 'pending';",
                )
                .bind(name)
                .bind(encode_files(&changed)?)
                .bind(last_change_at)
                .execute(&self.pool)
                .await
                .map_err(|e| CoreError::storage(e))?;
            }
            None => {
                sqlx::query(
                    "INSERT INTO mv_refresh_state(name, status, changed_files, first_change_at, last_change_at)
                     VALUES($1, 'pending', $2, $3, $4);",
                )
                .bind(name)
                .bind(encode_files(files)?)
                .bind(first_change_at)
                .bind(last_change_at)
                .execute(&self.pool)
                .await
                .map_err(|e| CoreError::storage(e))?;
                debug!("new pending refresh entry for {name}");
            }
        }
        Ok(())
    }

    /// Returns the views whose pending entry is quiescent (`debounce_ms`) or
    /// has waited past `max_wait_ms`, transitioning each to processing. A
    /// view with a refresh already in flight is skipped until it completes.
    pub async fn get_ready_mvs(
        &self,
        debounce_ms: i64,
        max_wait_ms: i64,
        now: DateTime<Utc>,
    ) -> CoreResult<Vec<ReadyMv>> {
        let now_ms = now.timestamp_millis();
        let rows = sqlx::query(
            "SELECT name, changed_files, first_change_at, last_change_at
             FROM mv_refresh_state p
             WHERE status = 'pending'
             AND NOT EXISTS (SELECT 1 FROM mv_refresh_state q
                             WHERE q.name = p.name AND q.status != 'pending')
             ORDER BY name;",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoreError::storage(e))?;

        let mut ready = vec![];
        for row in rows {
            let name: String = row.try_get("name").map_err(|e| CoreError::storage(e))?;
            let first_change_at: i64 = row
                .try_get("first_change_at")
                .map_err(|e| CoreError::storage(e))?;
            let last_change_at: i64 = row
                .try_get("last_change_at")
                .map_err(|e| CoreError::storage(e))?;
            let quiescent = now_ms - last_change_at >= debounce_ms;
            let waited_out = now_ms - first_change_at >= max_wait_ms;
            if !(quiescent || waited_out) {
                continue;
            }
            sqlx::query(
                "UPDATE mv_refresh_state
                 SET status = 'processing', started_at = $2
                 WHERE name = $1 AND status = 'pending';",
            )
            .bind(&name)
            .bind(now_ms)
            .execute(&self.pool)
            .await
            .map_err(|e| CoreError::storage(e))?;
            ready.push(ReadyMv {
                changed_files: decode_files(&row)?,
                name,
                first_change_at_ms: first_change_at,
                last_change_at_ms: last_change_at,
            });
        }
        Ok(ready)
    }

    /// `processing → dispatched` after the caller created the workflow.
    pub async fn confirm_dispatch(
        &self,
        mv_name: &str,
        workflow_id: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<()> {
        let updated = sqlx::query(
            "UPDATE mv_refresh_state
             SET status = 'dispatched', workflow_id = $2, dispatched_at = $3
             WHERE name = $1 AND status = 'processing';",
        )
        .bind(mv_name)
        .bind(workflow_id)
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::storage(e))?;
        if updated.rows_affected() == 0 {
            return Err(CoreError::conflict(format!(
                "mv {mv_name} is not in processing"
            )));
        }
        Ok(())
    }

    /// `processing → pending` after a failed workflow creation. Changes that
    /// arrived meanwhile are folded back into one pending entry.
    pub async fn rollback_processing(&self, mv_name: &str) -> CoreResult<()> {
        let row = sqlx::query(
            "SELECT changed_files, first_change_at, last_change_at
             FROM mv_refresh_state
             WHERE name = $1 AND status = 'processing';",
        )
        .bind(mv_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoreError::storage(e))?;
        let Some(row) = row else {
            return Err(CoreError::conflict(format!(
                "mv {mv_name} is not in processing"
            )));
        };
        self.fold_back(mv_name, "processing", &row).await
    }

    /// Deletes the dispatched entry on success, resets it to pending on
    /// failure; an unknown view is reported as already deleted.
    pub async fn workflow_complete(
        &self,
        mv_name: &str,
        workflow_id: &str,
        success: bool,
    ) -> CoreResult<WorkflowCompleteResult> {
        let row = sqlx::query(
            "SELECT changed_files, first_change_at, last_change_at, workflow_id
             FROM mv_refresh_state
             WHERE name = $1 AND status = 'dispatched';",
        )
        .bind(mv_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoreError::storage(e))?;
        let Some(row) = row else {
            return Ok(WorkflowCompleteResult {
                success: true,
                already_deleted: true,
            });
        };
        let known_workflow: Option<String> = row
            .try_get("workflow_id")
            .map_err(|e| CoreError::storage(e))?;
        if known_workflow.as_deref() != Some(workflow_id) {
            return Err(CoreError::conflict(format!(
                "workflow id mismatch for mv {mv_name}"
            )));
        }
        if success {
            sqlx::query(
                "DELETE FROM mv_refresh_state WHERE name = $1 AND status = 'dispatched';",
            )
            .bind(mv_name)
            .execute(&self.pool)
            .await
            .map_err(|e| CoreError::storage(e))?;
            info!("mv {mv_name} refreshed by workflow {workflow_id}");
            Ok(WorkflowCompleteResult {
                success: true,
                already_deleted: false,
            })
        } else {
            self.fold_back(mv_name, "dispatched", &row).await?;
            info!("mv {mv_name} reset to pending after failed workflow {workflow_id}");
            Ok(WorkflowCompleteResult {
                success: true,
                already_deleted: false,
            })
        }
    }

    /// Moves an in-flight entry back to pending, merging with any pending
    /// entry created while it was in flight.
    async fn fold_back(
        &self,
        mv_name: &str,
        from_status: &str,
        row: &sqlx::sqlite::SqliteRow,
    ) -> CoreResult<()> {
        let files = decode_files(row)?;
        let first_change_at: i64 = row
            .try_get("first_change_at")
            .map_err(|e| CoreError::storage(e))?;
        let last_change_at: i64 = row
            .try_get("last_change_at")
            .map_err(|e| CoreError::storage(e))?;
        let mut tr = self.pool.begin().await.map_err(|e| CoreError::storage(e))?;
        sqlx::query("DELETE FROM mv_refresh_state WHERE name = $1 AND status = $2;")
            .bind(mv_name)
            .bind(from_status)
            .execute(&mut *tr)
            .await
            .map_err(|e| CoreError::storage(e))?;
        let pending = sqlx::query(
            "SELECT changed_files, first_change_at FROM mv_refresh_state
             WHERE name = $1 AND status = 'pending';",
        )
        .bind(mv_name)
        .fetch_optional(&mut *tr)
        .await
        .map_err(|e| CoreError::storage(e))?;
        match pending {
            Some(pending_row) => {
                let mut merged = files;
                for file in decode_files(&pending_row)? {
                    if !merged.contains(&file) {
                        merged.push(file);
                    }
                }
                let pending_first: i64 = pending_row
                    .try_get("first_change_at")
                    .map_err(|e| CoreError::storage(e))?;
                sqlx::query(
                    "UPDATE mv_refresh_state
                     SET changed_files = $2, first_change_at = $3
                     WHERE name = $1 AND status = 'pending';",
                )
                .bind(mv_name)
                .bind(encode_files(&merged)?)
                .bind(first_change_at.min(pending_first))
                .execute(&mut *tr)
                .await
                .map_err(|e| CoreError::storage(e))?;
            }
            None => {
                sqlx::query(
                    "INSERT INTO mv_refresh_state(name, status, changed_files, first_change_at, last_change_at)
                     VALUES($1, 'pending', $2, $3, $4);",
                )
                .bind(mv_name)
                .bind(encode_files(&files)?)
                .bind(first_change_at)
                .bind(last_change_at)
                .execute(&mut *tr)
                .await
                .map_err(|e| CoreError::storage(e))?;
            }
        }
        tr.commit().await.map_err(|e| CoreError::storage(e))?;
        Ok(())
    }

    pub async fn status(&self) -> CoreResult<Vec<MvStatusEntry>> {
        let rows = sqlx::query(
            "SELECT name, status, changed_files, workflow_id
             FROM mv_refresh_state
             ORDER BY name, status;",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoreError::storage(e))?;
        rows.iter()
            .map(|row| {
                Ok(MvStatusEntry {
                    name: row.try_get("name").map_err(|e| CoreError::storage(e))?,
                    status: row.try_get("status").map_err(|e| CoreError::storage(e))?,
                    changed_file_count: decode_files(row)?.len(),
                    workflow_id: row
                        .try_get("workflow_id")
                        .map_err(|e| CoreError::storage(e))?,
                })
            })
            .collect()
    }
}

fn encode_files(files: &[String]) -> CoreResult<String> {
    serde_json::to_string(files)
        .context("encoding changed files")
        .map_err(CoreError::Internal)
}

fn decode_files(row: &sqlx::sqlite::SqliteRow) -> CoreResult<Vec<String>> {
    let raw: String = row
        .try_get("changed_files")
        .map_err(|e| CoreError::storage(e))?;
    serde_json::from_str(&raw)
        .context("decoding changed files")
        .map_err(CoreError::Internal)
}
