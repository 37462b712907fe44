use crate::event_buffer::EventBuffer;
use crate::pending::{self, BulkRow, PendingRowGroup};
use crate::projection;
use crate::relationships::{self, Direction, Relationship};
use crate::sequence;
use crate::shard_connection::ShardConnection;
use crate::wal::{self, WalBatch};
use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use parquedb_types::blob_storage::MultipartSession;
use parquedb_types::entity::{Entity, EntityId};
use parquedb_types::error::{CoreError, CoreResult};
use parquedb_types::event::{Event, EventOp};
use parquedb_types::mutation::{Mutation, MutationOp};
use parquedb_types::short_id::{decode_short_id, encode_short_id};
use parquedb_types::sink::EventSink;
use parquedb_variant::{Object, Value, json};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Replay source for events already compacted into canonical files.
///
/// Compacted reads are out of core scope; the engine only folds whatever the
/// reader yields underneath the WAL and pending sources.
#[async_trait]
pub trait CompactedEventReader: Send + Sync {
    async fn events_for_target(&self, ns: &str, short_id: &str) -> anyhow::Result<Vec<Event>>;
}

#[derive(Debug, Clone)]
pub struct ShardConfig {
    pub shard_id: String,
    /// `createMany` calls at or above this size bypass the WAL.
    pub bulk_threshold: usize,
    /// Buffered events per namespace before an automatic flush.
    pub buffer_flush_threshold: usize,
    /// Bulk files at or above this size upload via multipart.
    pub multipart_threshold_bytes: usize,
    /// Multipart uploads older than this are aborted opportunistically.
    pub multipart_ttl: Duration,
    pub projection_cache_capacity: u64,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            shard_id: String::from("shard-0"),
            bulk_threshold: 5,
            buffer_flush_threshold: 100,
            multipart_threshold_bytes: 8 * 1024 * 1024,
            multipart_ttl: Duration::from_secs(30 * 60),
            projection_cache_capacity: 10_000,
        }
    }
}

/// Options common to the write operations.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    pub actor: Option<String>,
    /// Optimistic concurrency check for update/delete.
    pub expected_version: Option<i64>,
    /// Operation deadline; expiry aborts not-yet-committed work.
    pub deadline: Option<Duration>,
}

/// Raw event fields for `append_event_with_seq`.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub op: EventOp,
    pub target: EntityId,
    pub before: Option<Value>,
    pub after: Option<Value>,
    pub actor: Option<String>,
    pub ts: Option<DateTime<Utc>>,
}

struct StagedRowGroup {
    ns: String,
    path: String,
    row_count: i64,
    first_seq: i64,
    last_seq: i64,
    created_at: DateTime<Utc>,
}

struct TxnState {
    id: String,
    buffer_snapshot: EventBuffer,
    counter_snapshots: HashMap<String, i64>,
    staged: Vec<StagedRowGroup>,
}

struct EngineState {
    buffer: EventBuffer,
    bulk_batch_counter: u64,
    txn: Option<TxnState>,
    multipart_sessions: Vec<MultipartSession>,
}

struct CreateBody {
    entity_type: String,
    name: Option<String>,
    attributes: Object,
    inline_links: Vec<(String, Vec<String>)>,
}

/// The per-shard engine: accepts writes, orders them through namespace
/// sequence counters, buffers events for the WAL, bypasses bulk writes to
/// pending Parquet files and reconstructs entities by event replay.
///
/// All operations are serial per shard: a single lock spans each call, which
/// is what makes them linearizable.
pub struct ShardEngine {
    config: ShardConfig,
    connection: ShardConnection,
    state: Mutex<EngineState>,
    projections: Cache<String, Arc<Entity>>,
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
    compacted_reader: RwLock<Option<Arc<dyn CompactedEventReader>>>,
}

impl ShardEngine {
    pub fn new(connection: ShardConnection, config: ShardConfig) -> Self {
        let projections = Cache::new(config.projection_cache_capacity);
        Self {
            config,
            connection,
            state: Mutex::new(EngineState {
                buffer: EventBuffer::new(),
                bulk_batch_counter: 0,
                txn: None,
                multipart_sessions: vec![],
            }),
            projections,
            sinks: RwLock::new(vec![]),
            compacted_reader: RwLock::new(None),
        }
    }

    pub fn shard_id(&self) -> &str {
        &self.config.shard_id
    }

    pub fn connection(&self) -> &ShardConnection {
        &self.connection
    }

    /// Registers an in-process consumer; every accepted event is published to
    /// it before the producing call returns.
    pub fn register_sink(&self, sink: Arc<dyn EventSink>) {
        self.sinks.write().expect("sinks lock").push(sink);
    }

    pub fn set_compacted_reader(&self, reader: Arc<dyn CompactedEventReader>) {
        *self.compacted_reader.write().expect("reader lock") = Some(reader);
    }

    // ---- write path ----

    pub async fn create(
        &self,
        ns: &str,
        body: &serde_json::Value,
        opts: &WriteOptions,
    ) -> CoreResult<Entity> {
        with_deadline(opts.deadline, "create", async {
            let parsed = parse_body(body)?;
            let mut state = self.state.lock().await;
            self.create_parsed(&mut state, ns, parsed, opts).await
        })
        .await
    }

    pub async fn create_many(
        &self,
        ns: &str,
        bodies: &[serde_json::Value],
        opts: &WriteOptions,
    ) -> CoreResult<Vec<Entity>> {
        with_deadline(opts.deadline, "createMany", async {
            if bodies.is_empty() {
                return Ok(vec![]);
            }
            // validate every body up front so there is no partial commit
            let parsed: Vec<CreateBody> =
                bodies.iter().map(parse_body).collect::<CoreResult<_>>()?;
            let mut state = self.state.lock().await;
            if parsed.len() < self.config.bulk_threshold {
                let mut entities = vec![];
                for body in parsed {
                    entities.push(self.create_parsed(&mut state, ns, body, opts).await?);
                }
                Ok(entities)
            } else {
                self.create_bulk(&mut state, ns, parsed, opts).await
            }
        })
        .await
    }

    async fn create_parsed(
        &self,
        state: &mut EngineState,
        ns: &str,
        body: CreateBody,
        opts: &WriteOptions,
    ) -> CoreResult<Entity> {
        // resolve link endpoints before any state change
        let mut resolved_links = vec![];
        for (predicate, targets) in &body.inline_links {
            for target in targets {
                let to = self.resolve_link_target(state, target).await?;
                resolved_links.push((predicate.clone(), to));
            }
        }

        let (seq, _) = self.allocate(state, ns, 1).await?;
        let short_id = encode_short_id(seq as u64);
        let target = EntityId::new(ns, short_id);
        let now = Utc::now();
        let payload =
            projection::build_create_payload(&body.entity_type, body.name.as_deref(), &body.attributes);
        let event = Event {
            id: target.short_id.clone(),
            seq,
            ts: now,
            op: EventOp::Create,
            target: target.clone(),
            before: None,
            after: Some(payload),
            actor: opts.actor.clone(),
        };
        let entity = projection::fold_events(std::slice::from_ref(&event))
            .map_err(CoreError::Internal)?
            .context("CREATE event folded to nothing")
            .map_err(CoreError::Internal)?;

        self.buffer_event(state, ns, event.clone()).await?;
        for (predicate, to) in &resolved_links {
            relationships::upsert_link(&self.connection.db_pool, &entity, predicate, to, None)
                .await
                .map_err(CoreError::Storage)?;
        }
        self.projections.invalidate(&target.target()).await;
        self.publish(&event).await;
        Ok(entity)
    }

    async fn create_bulk(
        &self,
        state: &mut EngineState,
        ns: &str,
        bodies: Vec<CreateBody>,
        opts: &WriteOptions,
    ) -> CoreResult<Vec<Entity>> {
        let now = Utc::now();
        self.gc_stale_multiparts(state, now).await;

        let mut resolved_links: Vec<(usize, String, Entity)> = vec![];
        for (index, body) in bodies.iter().enumerate() {
            for (predicate, targets) in &body.inline_links {
                for target in targets {
                    let to = self.resolve_link_target(state, target).await?;
                    resolved_links.push((index, predicate.clone(), to));
                }
            }
        }

        let count = bodies.len() as i64;
        let (first_seq, last_seq) = self.allocate(state, ns, count).await?;

        let mut rows = Vec::with_capacity(bodies.len());
        let mut events = Vec::with_capacity(bodies.len());
        for (offset, body) in bodies.iter().enumerate() {
            let seq = first_seq + offset as i64;
            let short_id = encode_short_id(seq as u64);
            rows.push(BulkRow {
                seq,
                short_id,
                entity_type: body.entity_type.clone(),
                name: body.name.clone(),
                created_at: now,
                created_by: opts.actor.clone(),
                attributes: body.attributes.clone(),
            });
        }
        events.extend(pending::events_from_bulk_rows(ns, &rows));

        let batch_n = state.bulk_batch_counter;
        state.bulk_batch_counter += 1;
        let path = pending::pending_file_path(ns, &self.config.shard_id, batch_n, now);
        let bytes = pending::encode_bulk_parquet(&rows).map_err(CoreError::Internal)?;
        self.upload_bulk_object(state, &path, bytes)
            .await
            .map_err(CoreError::Storage)?;

        if let Some(txn) = state.txn.as_mut() {
            txn.staged.push(StagedRowGroup {
                ns: ns.to_owned(),
                path,
                row_count: count,
                first_seq,
                last_seq,
                created_at: now,
            });
        } else if let Err(e) = pending::insert_pending_row_group(
            &self.connection.db_pool,
            ns,
            &path,
            count,
            first_seq,
            last_seq,
            now,
        )
        .await
        {
            // no partial state: drop the uploaded object along with the error
            if let Err(delete_err) = self.connection.blob_storage.delete(&path).await {
                warn!("could not remove orphaned bulk file {path}: {delete_err:#}");
            }
            return Err(CoreError::Storage(e));
        }

        let mut entities = Vec::with_capacity(events.len());
        for event in &events {
            let entity = projection::fold_events(std::slice::from_ref(event))
                .map_err(CoreError::Internal)?
                .context("bulk CREATE event folded to nothing")
                .map_err(CoreError::Internal)?;
            entities.push(entity);
        }
        for (index, predicate, to) in &resolved_links {
            relationships::upsert_link(
                &self.connection.db_pool,
                &entities[*index],
                predicate,
                to,
                None,
            )
            .await
            .map_err(CoreError::Storage)?;
        }
        for event in &events {
            self.projections.invalidate(&event.target.target()).await;
            self.publish(event).await;
        }
        debug!(
            "bulk created {count} entities in {ns} seq=[{first_seq}, {last_seq}]"
        );
        Ok(entities)
    }

    pub async fn update(
        &self,
        ns: &str,
        short_id: &str,
        mutation: &Mutation,
        opts: &WriteOptions,
    ) -> CoreResult<Entity> {
        with_deadline(opts.deadline, "update", async {
            let mut state = self.state.lock().await;
            let current = self
                .get_inner(&mut state, ns, short_id, false)
                .await?
                .ok_or_else(|| CoreError::not_found(format!("{ns}/{short_id}")))?;
            if let Some(expected) = opts.expected_version {
                if expected != current.version {
                    return Err(CoreError::VersionMismatch {
                        expected,
                        current: current.version,
                    });
                }
            }

            // apply on a snapshot first: a mutation that cannot apply must
            // fail before any event is appended
            let mut next = current.clone();
            projection::apply_mutation(&mut next, mutation)
                .map_err(|e| CoreError::Validation(e.to_string()))?;

            let mut resolved_links = vec![];
            let mut unlinks = vec![];
            for op in &mutation.ops {
                match op {
                    MutationOp::Link(edges) => {
                        for (predicate, targets) in edges {
                            for target in targets {
                                let to = self.resolve_link_target(&mut state, target).await?;
                                resolved_links.push((predicate.clone(), to));
                            }
                        }
                    }
                    MutationOp::Unlink(edges) => {
                        for (predicate, targets) in edges {
                            for target in targets {
                                let to = EntityId::parse(target)
                                    .map_err(|e| CoreError::Validation(e.to_string()))?;
                                unlinks.push((predicate.clone(), to));
                            }
                        }
                    }
                    _ => {}
                }
            }

            let (seq, _) = self.allocate(&mut state, ns, 1).await?;
            let now = Utc::now();
            let target = EntityId::new(ns, short_id);
            let event = Event {
                id: encode_short_id(seq as u64),
                seq,
                ts: now,
                op: EventOp::Update,
                target: target.clone(),
                before: None,
                after: Some(mutation.to_payload()),
                actor: opts.actor.clone(),
            };
            next.version += 1;
            next.updated_at = now;
            next.updated_by = opts.actor.clone();

            self.buffer_event(&mut state, ns, event.clone()).await?;
            for (predicate, to) in &resolved_links {
                relationships::upsert_link(&self.connection.db_pool, &next, predicate, to, None)
                    .await
                    .map_err(CoreError::Storage)?;
            }
            for (predicate, to) in &unlinks {
                relationships::soft_unlink(&self.connection.db_pool, &target, predicate, to)
                    .await
                    .map_err(CoreError::Storage)?;
            }
            self.projections.invalidate(&target.target()).await;
            self.publish(&event).await;
            Ok(next)
        })
        .await
    }

    pub async fn delete(
        &self,
        ns: &str,
        short_id: &str,
        opts: &WriteOptions,
    ) -> CoreResult<bool> {
        with_deadline(opts.deadline, "delete", async {
            let mut state = self.state.lock().await;
            let Some(current) = self.get_inner(&mut state, ns, short_id, false).await? else {
                return Ok(false);
            };
            if let Some(expected) = opts.expected_version {
                if expected != current.version {
                    return Err(CoreError::VersionMismatch {
                        expected,
                        current: current.version,
                    });
                }
            }
            let (seq, _) = self.allocate(&mut state, ns, 1).await?;
            let target = EntityId::new(ns, short_id);
            let event = Event {
                id: encode_short_id(seq as u64),
                seq,
                ts: Utc::now(),
                op: EventOp::Delete,
                target: target.clone(),
                before: None,
                after: None,
                actor: opts.actor.clone(),
            };
            self.buffer_event(&mut state, ns, event.clone()).await?;
            self.projections.invalidate(&target.target()).await;
            self.publish(&event).await;
            Ok(true)
        })
        .await
    }

    /// Appends a raw event, allocating its seq and id. Serves downstream
    /// replication and replay feeds.
    pub async fn append_event_with_seq(&self, ns: &str, raw: RawEvent) -> CoreResult<String> {
        let mut state = self.state.lock().await;
        let (seq, _) = self.allocate(&mut state, ns, 1).await?;
        let id = encode_short_id(seq as u64);
        let event = Event {
            id: id.clone(),
            seq,
            ts: raw.ts.unwrap_or_else(Utc::now),
            op: raw.op,
            target: raw.target,
            before: raw.before,
            after: raw.after,
            actor: raw.actor,
        };
        let target_key = event.target.target();
        self.buffer_event(&mut state, ns, event.clone()).await?;
        self.projections.invalidate(&target_key).await;
        self.publish(&event).await;
        Ok(id)
    }

    // ---- read path ----

    pub async fn get(
        &self,
        ns: &str,
        short_id: &str,
        include_deleted: bool,
    ) -> CoreResult<Option<Entity>> {
        let mut state = self.state.lock().await;
        self.get_inner(&mut state, ns, short_id, include_deleted).await
    }

    async fn get_inner(
        &self,
        state: &mut EngineState,
        ns: &str,
        short_id: &str,
        include_deleted: bool,
    ) -> CoreResult<Option<Entity>> {
        let target_key = format!("{ns}:{short_id}");
        let entity = match self.projections.get(&target_key).await {
            Some(cached) => Some((*cached).clone()),
            None => {
                let events = self.collect_events_for_target(state, ns, short_id).await?;
                let folded = projection::fold_events(&events).map_err(CoreError::Internal)?;
                if let Some(entity) = &folded {
                    self.projections
                        .insert(target_key, Arc::new(entity.clone()))
                        .await;
                }
                folded
            }
        };
        Ok(entity.filter(|e| include_deleted || !e.is_deleted()))
    }

    /// Concatenates, in seq order, all events targeting one entity from the
    /// compacted files, the WAL, the pending row groups and the in-memory
    /// buffer.
    async fn collect_events_for_target(
        &self,
        state: &mut EngineState,
        ns: &str,
        short_id: &str,
    ) -> CoreResult<Vec<Event>> {
        let pool = &self.connection.db_pool;
        let mut events = vec![];

        let reader = self.compacted_reader.read().expect("reader lock").clone();
        if let Some(reader) = reader {
            events.extend(
                reader
                    .events_for_target(ns, short_id)
                    .await
                    .map_err(CoreError::Storage)?,
            );
        }

        events.extend(
            wal::read_wal_events(pool, ns)
                .await
                .map_err(CoreError::Storage)?
                .into_iter()
                .filter(|e| e.target.short_id == short_id),
        );

        // the entity's seq is its short id decoded, which prunes the pending
        // files worth reading
        if let Ok(target_seq) = decode_short_id(short_id) {
            let target_seq = target_seq as i64;
            for group in pending::list_pending_row_groups(pool, ns)
                .await
                .map_err(CoreError::Storage)?
            {
                if group.first_seq <= target_seq && target_seq <= group.last_seq {
                    let rows = pending::read_pending_rows(&self.connection.blob_storage, &group)
                        .await
                        .map_err(CoreError::Storage)?;
                    events.extend(
                        pending::events_from_bulk_rows(ns, &rows)
                            .into_iter()
                            .filter(|e| e.target.short_id == short_id),
                    );
                }
            }
            if let Some(txn) = &state.txn {
                for staged in &txn.staged {
                    if staged.ns == ns
                        && staged.first_seq <= target_seq
                        && target_seq <= staged.last_seq
                    {
                        let group = PendingRowGroup {
                            id: 0,
                            ns: staged.ns.clone(),
                            path: staged.path.clone(),
                            row_count: staged.row_count,
                            first_seq: staged.first_seq,
                            last_seq: staged.last_seq,
                            created_at: staged.created_at,
                            committed_at: None,
                        };
                        let rows =
                            pending::read_pending_rows(&self.connection.blob_storage, &group)
                                .await
                                .map_err(CoreError::Storage)?;
                        events.extend(
                            pending::events_from_bulk_rows(ns, &rows)
                                .into_iter()
                                .filter(|e| e.target.short_id == short_id),
                        );
                    }
                }
            }
        }

        events.extend(state.buffer.events_for_target(ns, short_id));
        events.sort_by_key(|e| e.seq);
        Ok(events)
    }

    /// Replays events for a namespace after `after_seq`, across the WAL,
    /// pending row groups and the buffer.
    pub async fn get_events(
        &self,
        ns: &str,
        after_seq: i64,
        limit: usize,
    ) -> CoreResult<Vec<Event>> {
        let state = self.state.lock().await;
        let pool = &self.connection.db_pool;
        let mut events: Vec<Event> = wal::read_wal_events(pool, ns)
            .await
            .map_err(CoreError::Storage)?
            .into_iter()
            .filter(|e| e.seq > after_seq)
            .collect();
        for group in pending::list_pending_row_groups(pool, ns)
            .await
            .map_err(CoreError::Storage)?
        {
            if group.last_seq > after_seq {
                let rows = pending::read_pending_rows(&self.connection.blob_storage, &group)
                    .await
                    .map_err(CoreError::Storage)?;
                events.extend(
                    pending::events_from_bulk_rows(ns, &rows)
                        .into_iter()
                        .filter(|e| e.seq > after_seq),
                );
            }
        }
        events.extend(state.buffer.events_after(ns, after_seq));
        events.sort_by_key(|e| e.seq);
        events.truncate(limit);
        Ok(events)
    }

    // ---- relationships ----

    pub async fn link(
        &self,
        from_id: &str,
        predicate: &str,
        to_id: &str,
        _opts: &WriteOptions,
    ) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        let from = self.resolve_link_target(&mut state, from_id).await?;
        let to = self.resolve_link_target(&mut state, to_id).await?;
        relationships::upsert_link(&self.connection.db_pool, &from, predicate, &to, None)
            .await
            .map_err(CoreError::Storage)?;
        Ok(())
    }

    pub async fn unlink(
        &self,
        from_id: &str,
        predicate: &str,
        to_id: &str,
        _opts: &WriteOptions,
    ) -> CoreResult<()> {
        let from =
            EntityId::parse(from_id).map_err(|e| CoreError::Validation(e.to_string()))?;
        let to = EntityId::parse(to_id).map_err(|e| CoreError::Validation(e.to_string()))?;
        relationships::soft_unlink(&self.connection.db_pool, &from, predicate, &to)
            .await
            .map_err(CoreError::Storage)?;
        Ok(())
    }

    pub async fn get_relationships(
        &self,
        ns: &str,
        short_id: &str,
        predicate: Option<&str>,
        direction: Direction,
    ) -> CoreResult<Vec<Relationship>> {
        let id = EntityId::new(ns, short_id);
        relationships::list_relationships(&self.connection.db_pool, &id, predicate, direction, false)
            .await
            .map_err(CoreError::Storage)
    }

    // ---- WAL and pending maintenance ----

    pub async fn flush_ns_event_batch(&self, ns: &str) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        if state.txn.is_some() {
            return Err(CoreError::conflict("cannot flush inside a transaction"));
        }
        self.flush_ns_inner(&mut state, ns).await
    }

    pub async fn flush_all_ns_event_batches(&self) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        if state.txn.is_some() {
            return Err(CoreError::conflict("cannot flush inside a transaction"));
        }
        for ns in state.buffer.namespaces() {
            self.flush_ns_inner(&mut state, &ns).await?;
        }
        Ok(())
    }

    async fn flush_ns_inner(&self, state: &mut EngineState, ns: &str) -> CoreResult<()> {
        if let Some(buffer) = state.buffer.take(ns) {
            if let Err(e) = wal::insert_wal_batch(&self.connection.db_pool, ns, &buffer).await {
                // keep the buffer consistent with what is persisted
                for event in buffer.events {
                    state.buffer.append(ns, event);
                }
                return Err(CoreError::Storage(e));
            }
        }
        Ok(())
    }

    pub async fn get_wal_batches(&self, ns: &str) -> CoreResult<Vec<WalBatch>> {
        wal::list_wal_batches(&self.connection.db_pool, ns)
            .await
            .map_err(CoreError::Storage)
    }

    pub async fn delete_wal_batches(&self, ns: &str, up_to_seq: i64) -> CoreResult<u64> {
        let _state = self.state.lock().await;
        wal::delete_wal_batches(&self.connection.db_pool, ns, up_to_seq)
            .await
            .map_err(CoreError::Storage)
    }

    pub async fn get_pending_row_groups(&self, ns: &str) -> CoreResult<Vec<PendingRowGroup>> {
        pending::list_pending_row_groups(&self.connection.db_pool, ns)
            .await
            .map_err(CoreError::Storage)
    }

    pub async fn flush_pending_to_committed(&self, ns: &str) -> CoreResult<u64> {
        let _state = self.state.lock().await;
        pending::flush_pending_to_committed(&self.connection.db_pool, ns)
            .await
            .map_err(CoreError::Storage)
    }

    pub async fn delete_pending_row_groups(&self, ns: &str, up_to_seq: i64) -> CoreResult<u64> {
        let _state = self.state.lock().await;
        pending::delete_pending_row_groups(
            &self.connection.db_pool,
            &self.connection.blob_storage,
            ns,
            up_to_seq,
        )
        .await
        .map_err(CoreError::Storage)
    }

    // ---- transactions ----

    /// Opens the shard transaction. Writes performed until commit become
    /// durable together; only one transaction is open at a time.
    pub async fn begin_transaction(&self) -> CoreResult<String> {
        let mut state = self.state.lock().await;
        if state.txn.is_some() {
            return Err(CoreError::conflict("a transaction is already open"));
        }
        let id = uuid::Uuid::new_v4().to_string();
        state.txn = Some(TxnState {
            id: id.clone(),
            buffer_snapshot: state.buffer.clone(),
            counter_snapshots: HashMap::new(),
            staged: vec![],
        });
        Ok(id)
    }

    pub async fn commit_transaction(&self) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        let Some(txn) = state.txn.take() else {
            return Err(CoreError::conflict("no open transaction"));
        };
        let mut tr = self
            .connection
            .db_pool
            .begin()
            .await
            .map_err(|e| CoreError::storage(e))?;
        for staged in &txn.staged {
            sqlx::query(
                "INSERT INTO pending_row_groups(ns, path, row_count, first_seq, last_seq, created_at)
                 VALUES($1, $2, $3, $4, $5, $6);",
            )
            .bind(&staged.ns)
            .bind(&staged.path)
            .bind(staged.row_count)
            .bind(staged.first_seq)
            .bind(staged.last_seq)
            .bind(staged.created_at)
            .execute(&mut *tr)
            .await
            .map_err(|e| CoreError::storage(e))?;
        }
        tr.commit().await.map_err(|e| CoreError::storage(e))?;
        debug!("committed transaction {}", txn.id);
        Ok(())
    }

    /// Discards buffer growth, rewinds counters, and removes any pending
    /// objects uploaded inside the transaction.
    pub async fn rollback_transaction(&self) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        let Some(txn) = state.txn.take() else {
            return Err(CoreError::conflict("no open transaction"));
        };
        state.buffer = txn.buffer_snapshot;
        for (ns, value) in &txn.counter_snapshots {
            sequence::restore_seq(&self.connection.db_pool, ns, *value)
                .await
                .map_err(CoreError::Storage)?;
        }
        let paths: Vec<String> = txn.staged.iter().map(|s| s.path.clone()).collect();
        if !paths.is_empty() {
            self.connection
                .blob_storage
                .delete_batch(&paths)
                .await
                .map_err(CoreError::Storage)?;
        }
        self.projections.invalidate_all();
        debug!("rolled back transaction {}", txn.id);
        Ok(())
    }

    // ---- internals ----

    async fn allocate(
        &self,
        state: &mut EngineState,
        ns: &str,
        count: i64,
    ) -> CoreResult<(i64, i64)> {
        let needs_snapshot = state
            .txn
            .as_ref()
            .is_some_and(|txn| !txn.counter_snapshots.contains_key(ns));
        if needs_snapshot {
            let current = sequence::current_seq(&self.connection.db_pool, ns)
                .await
                .map_err(CoreError::Storage)?;
            if let Some(txn) = state.txn.as_mut() {
                txn.counter_snapshots.insert(ns.to_owned(), current);
            }
        }
        sequence::allocate_seq_range(&self.connection.db_pool, ns, count)
            .await
            .map_err(CoreError::Storage)
    }

    async fn buffer_event(
        &self,
        state: &mut EngineState,
        ns: &str,
        event: Event,
    ) -> CoreResult<()> {
        let buffered = state.buffer.append(ns, event);
        if state.txn.is_none() && buffered >= self.config.buffer_flush_threshold {
            self.flush_ns_inner(state, ns).await?;
        }
        Ok(())
    }

    async fn resolve_link_target(
        &self,
        state: &mut EngineState,
        id: &str,
    ) -> CoreResult<Entity> {
        let id = EntityId::parse(id).map_err(|e| CoreError::Validation(e.to_string()))?;
        self.get_inner(state, &id.ns, &id.short_id, false)
            .await?
            .ok_or_else(|| CoreError::not_found(id.to_string()))
    }

    async fn publish(&self, event: &Event) {
        let sinks: Vec<Arc<dyn EventSink>> = self.sinks.read().expect("sinks lock").clone();
        for sink in sinks {
            if let Err(e) = sink.publish(event).await {
                warn!("event sink failed for {}: {e:#}", event.target);
            }
        }
    }

    async fn upload_bulk_object(
        &self,
        state: &mut EngineState,
        path: &str,
        bytes: Bytes,
    ) -> anyhow::Result<()> {
        let blob_storage = &self.connection.blob_storage;
        if bytes.len() < self.config.multipart_threshold_bytes {
            return pending::upload_pending_file(blob_storage, path, bytes).await;
        }
        if blob_storage.head(path).await?.is_some() {
            debug!("bulk file {path} already present, keeping prior upload");
            return Ok(());
        }
        let mut session = blob_storage.create_multipart(path).await?;
        let part_size = self.config.multipart_threshold_bytes;
        let mut offset = 0;
        while offset < bytes.len() {
            let end = bytes.len().min(offset + part_size);
            if let Err(e) = session.put_part(bytes.slice(offset..end)).await {
                // keep the session so the next bulk write can abort it
                state.multipart_sessions.push(session);
                return Err(e);
            }
            offset = end;
        }
        session.complete().await?;
        Ok(())
    }

    async fn gc_stale_multiparts(&self, state: &mut EngineState, now: DateTime<Utc>) {
        let ttl = chrono::Duration::from_std(self.config.multipart_ttl)
            .unwrap_or_else(|_| chrono::Duration::minutes(30));
        let sessions = std::mem::take(&mut state.multipart_sessions);
        for session in sessions {
            if now - session.started_at() > ttl {
                warn!("aborting stale multipart upload of {}", session.path());
                if let Err(e) = session.abort().await {
                    warn!("multipart abort failed: {e:#}");
                }
            } else {
                state.multipart_sessions.push(session);
            }
        }
    }
}

async fn with_deadline<T>(
    deadline: Option<Duration>,
    what: &str,
    fut: impl Future<Output = CoreResult<T>>,
) -> CoreResult<T> {
    match deadline {
        None => fut.await,
        Some(deadline) => tokio::time::timeout(deadline, fut)
            .await
            .map_err(|_| CoreError::Timeout(format!("{what} deadline exceeded")))?,
    }
}

fn parse_body(body: &serde_json::Value) -> CoreResult<CreateBody> {
    let serde_json::Value::Object(map) = body else {
        return Err(CoreError::validation("entity body must be an object"));
    };
    let entity_type = map
        .get("$type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| CoreError::validation("missing required attribute $type"))?
        .to_owned();
    let mut name = None;
    let mut attributes = Object::new();
    let mut inline_links = vec![];
    for (key, value) in map {
        match key.as_str() {
            "$type" => {}
            "name" => name = value.as_str().map(str::to_owned),
            key_name if key_name.starts_with('$') => {
                // system attributes are derived, not writable
            }
            _ => {
                if let Some(targets) = inline_link_targets(value) {
                    inline_links.push((key.clone(), targets));
                } else {
                    attributes.set(key, json::value_from_json(value));
                }
            }
        }
    }
    Ok(CreateBody {
        entity_type,
        name,
        attributes,
        inline_links,
    })
}

/// A mapping-shaped body field whose values are all `$id`s is an inline
/// relationship declaration, equivalent to `$link` side effects.
fn inline_link_targets(value: &serde_json::Value) -> Option<Vec<String>> {
    let serde_json::Value::Object(map) = value else {
        return None;
    };
    if map.is_empty() {
        return None;
    }
    let mut targets = vec![];
    for member in map.values() {
        let id = member.as_str()?;
        EntityId::parse(id).ok()?;
        targets.push(id.to_owned());
    }
    Some(targets)
}
