use crate::engine::{ShardEngine, WriteOptions};
use crate::pending::PendingRowGroup;
use crate::relationships::{Direction, Relationship};
use parquedb_types::entity::Entity;
use parquedb_types::error::CoreResult;
use parquedb_types::event::Event;
use parquedb_types::mutation::Mutation;
use std::sync::Arc;

/// A typed handle onto one namespace of a shard.
///
/// Callers that work against a single collection hold one of these instead
/// of threading the namespace name through every call.
#[derive(Clone)]
pub struct NamespaceHandle {
    engine: Arc<ShardEngine>,
    ns: String,
}

impl ShardEngine {
    pub fn namespace(self: &Arc<Self>, ns: impl Into<String>) -> NamespaceHandle {
        NamespaceHandle {
            engine: self.clone(),
            ns: ns.into(),
        }
    }
}

impl NamespaceHandle {
    pub fn ns(&self) -> &str {
        &self.ns
    }

    pub async fn create(
        &self,
        body: &serde_json::Value,
        opts: &WriteOptions,
    ) -> CoreResult<Entity> {
        self.engine.create(&self.ns, body, opts).await
    }

    pub async fn create_many(
        &self,
        bodies: &[serde_json::Value],
        opts: &WriteOptions,
    ) -> CoreResult<Vec<Entity>> {
        self.engine.create_many(&self.ns, bodies, opts).await
    }

    pub async fn get(&self, short_id: &str, include_deleted: bool) -> CoreResult<Option<Entity>> {
        self.engine.get(&self.ns, short_id, include_deleted).await
    }

    pub async fn update(
        &self,
        short_id: &str,
        mutation: &Mutation,
        opts: &WriteOptions,
    ) -> CoreResult<Entity> {
        self.engine.update(&self.ns, short_id, mutation, opts).await
    }

    pub async fn delete(&self, short_id: &str, opts: &WriteOptions) -> CoreResult<bool> {
        self.engine.delete(&self.ns, short_id, opts).await
    }

    pub async fn get_relationships(
        &self,
        short_id: &str,
        predicate: Option<&str>,
        direction: Direction,
    ) -> CoreResult<Vec<Relationship>> {
        self.engine
            .get_relationships(&self.ns, short_id, predicate, direction)
            .await
    }

    pub async fn get_events(&self, after_seq: i64, limit: usize) -> CoreResult<Vec<Event>> {
        self.engine.get_events(&self.ns, after_seq, limit).await
    }

    pub async fn get_pending_row_groups(&self) -> CoreResult<Vec<PendingRowGroup>> {
        self.engine.get_pending_row_groups(&self.ns).await
    }

    pub async fn flush(&self) -> CoreResult<()> {
        self.engine.flush_ns_event_batch(&self.ns).await
    }
}
