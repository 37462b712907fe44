use anyhow::{Result, bail};
use async_trait::async_trait;
use parquedb_types::event::Event;
use parquedb_types::sink::EventSink;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::warn;

/// A materialized view handler: receives batched events for its source
/// namespaces.
#[async_trait]
pub trait MvProcessor: Send + Sync {
    async fn process(&self, events: &[Event]) -> Result<()>;
}

/// Registration of one view with the streaming engine.
pub struct MvRegistration {
    pub name: String,
    pub source_namespaces: Vec<String>,
    pub processor: Arc<dyn MvProcessor>,
    /// Overrides the engine-wide batch size for this view.
    pub batch_size: Option<usize>,
    /// Overrides the engine-wide batch timeout for this view.
    pub batch_timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct StreamingMvConfig {
    pub batch_size: usize,
    pub batch_timeout: Duration,
    /// Above this many queued events per view, deliveries count as
    /// backpressure. Nothing is ever dropped; oldest events stay first.
    pub max_queued_events: usize,
    /// A failed batch is not retried before this much time has passed.
    pub failed_batch_backoff: Duration,
}

impl Default for StreamingMvConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_timeout: Duration::from_millis(50),
            max_queued_events: 10_000,
            failed_batch_backoff: Duration::from_millis(1000),
        }
    }
}

/// Statistics snapshot reported by `/status`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MvEngineStats {
    pub events_received: u64,
    pub events_processed: u64,
    pub batches_processed: u64,
    pub failed_batches: u64,
    pub backpressure_events: u64,
    pub avg_batch_processing_ms: f64,
    pub events_by_op: BTreeMap<String, u64>,
    pub events_by_namespace: BTreeMap<String, u64>,
}

#[derive(Debug, Default)]
struct StatsInner {
    events_received: u64,
    events_processed: u64,
    batches_processed: u64,
    failed_batches: u64,
    backpressure_events: u64,
    total_processing: Duration,
    events_by_op: BTreeMap<String, u64>,
    events_by_namespace: BTreeMap<String, u64>,
}

struct ViewState {
    name: String,
    source_namespaces: Vec<String>,
    processor: Arc<dyn MvProcessor>,
    batch_size: usize,
    batch_timeout: Duration,
    batch: Vec<Event>,
    first_queued_at: Option<Instant>,
    next_attempt_at: Option<Instant>,
}

struct EngineInner {
    views: Vec<ViewState>,
    stats: StatsInner,
}

/// In-process event router.
///
/// Runs in the same cooperative context as the shard engine: `process_event`
/// queues the event for every matching view and drains whichever batches are
/// due, so a handler only ever runs while the caller awaits.
pub struct StreamingMvEngine {
    config: StreamingMvConfig,
    state: Mutex<EngineInner>,
}

impl StreamingMvEngine {
    pub fn new(config: StreamingMvConfig) -> Self {
        Self {
            config,
            state: Mutex::new(EngineInner {
                views: vec![],
                stats: StatsInner::default(),
            }),
        }
    }

    pub async fn register_mv(&self, registration: MvRegistration) -> Result<()> {
        let mut inner = self.state.lock().await;
        if inner.views.iter().any(|v| v.name == registration.name) {
            bail!("view {} is already registered", registration.name);
        }
        inner.views.push(ViewState {
            name: registration.name,
            source_namespaces: registration.source_namespaces,
            processor: registration.processor,
            batch_size: registration.batch_size.unwrap_or(self.config.batch_size),
            batch_timeout: registration
                .batch_timeout
                .unwrap_or(self.config.batch_timeout),
            batch: vec![],
            first_queued_at: None,
            next_attempt_at: None,
        });
        Ok(())
    }

    /// Routes one event into every view whose sources contain its namespace,
    /// then invokes whichever handlers have a full or timed-out batch.
    pub async fn process_event(&self, event: &Event) -> Result<()> {
        let mut guard = self.state.lock().await;
        let inner = &mut *guard;
        inner.stats.events_received += 1;
        *inner
            .stats
            .events_by_op
            .entry(event.op.as_str().to_owned())
            .or_default() += 1;
        *inner
            .stats
            .events_by_namespace
            .entry(event.target.ns.clone())
            .or_default() += 1;
        let now = Instant::now();
        for view in &mut inner.views {
            if !view.source_namespaces.contains(&event.target.ns) {
                continue;
            }
            if view.batch.len() >= self.config.max_queued_events {
                inner.stats.backpressure_events += 1;
            }
            if view.batch.is_empty() {
                view.first_queued_at = Some(now);
            }
            view.batch.push(event.clone());
        }
        self.drain_due(inner, false).await;
        Ok(())
    }

    /// Forces immediate invocation of all non-empty batches.
    pub async fn flush(&self) {
        let mut guard = self.state.lock().await;
        self.drain_due(&mut guard, true).await;
    }

    /// Invokes handlers whose batch timeout has elapsed even when no new
    /// event arrives. Meant to be called at a regular interval.
    pub async fn tick(&self) {
        let mut guard = self.state.lock().await;
        self.drain_due(&mut guard, false).await;
    }

    pub async fn stats(&self) -> MvEngineStats {
        let inner = self.state.lock().await;
        let stats = &inner.stats;
        let avg_batch_processing_ms = if stats.batches_processed > 0 {
            stats.total_processing.as_secs_f64() * 1000.0 / stats.batches_processed as f64
        } else {
            0.0
        };
        MvEngineStats {
            events_received: stats.events_received,
            events_processed: stats.events_processed,
            batches_processed: stats.batches_processed,
            failed_batches: stats.failed_batches,
            backpressure_events: stats.backpressure_events,
            avg_batch_processing_ms,
            events_by_op: stats.events_by_op.clone(),
            events_by_namespace: stats.events_by_namespace.clone(),
        }
    }

    async fn drain_due(&self, inner: &mut EngineInner, force: bool) {
        let now = Instant::now();
        for index in 0..inner.views.len() {
            let due = {
                let view = &inner.views[index];
                if view.batch.is_empty() {
                    false
                } else if force {
                    true
                } else if view.next_attempt_at.is_some_and(|at| now < at) {
                    false
                } else {
                    view.batch.len() >= view.batch_size
                        || view
                            .first_queued_at
                            .is_some_and(|at| now.duration_since(at) >= view.batch_timeout)
                }
            };
            if !due {
                continue;
            }
            let batch = std::mem::take(&mut inner.views[index].batch);
            inner.views[index].first_queued_at = None;
            let processor = inner.views[index].processor.clone();
            let started = Instant::now();
            match processor.process(&batch).await {
                Ok(()) => {
                    inner.stats.events_processed += batch.len() as u64;
                    inner.stats.batches_processed += 1;
                    inner.stats.total_processing += started.elapsed();
                    inner.views[index].next_attempt_at = None;
                }
                Err(e) => {
                    inner.stats.failed_batches += 1;
                    let view = &mut inner.views[index];
                    warn!("handler {} failed on a {}-event batch: {e:#}", view.name, batch.len());
                    // retain the batch, oldest first, and back off rather
                    // than re-entering it in a tight loop
                    let mut restored = batch;
                    restored.append(&mut view.batch);
                    view.batch = restored;
                    view.first_queued_at.get_or_insert(started);
                    view.next_attempt_at = Some(Instant::now() + self.config.failed_batch_backoff);
                }
            }
        }
    }
}

#[async_trait]
impl EventSink for StreamingMvEngine {
    async fn publish(&self, event: &Event) -> Result<()> {
        self.process_event(event).await
    }
}
