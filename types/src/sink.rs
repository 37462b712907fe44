use crate::event::Event;
use anyhow::Result;
use async_trait::async_trait;

/// In-process consumer of accepted events.
///
/// The shard engine publishes every accepted event to its sinks before the
/// operation that produced it returns to the caller.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: &Event) -> Result<()>;
}
