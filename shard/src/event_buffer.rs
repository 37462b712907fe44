use parquedb_types::event::Event;
use std::collections::HashMap;

/// A contiguous run of buffered events for one namespace.
#[derive(Debug, Clone)]
pub struct NsBuffer {
    pub first_seq: i64,
    pub last_seq: i64,
    pub size_bytes: i64,
    pub events: Vec<Event>,
}

impl NsBuffer {
    pub fn event_count(&self) -> i64 {
        self.events.len() as i64
    }
}

/// Per-namespace in-memory buffers of accepted events, pending flush.
///
/// Buffered events MUST be merged into any read; flushing a namespace turns
/// its buffer into exactly one WAL row and clears it.
#[derive(Debug, Clone, Default)]
pub struct EventBuffer {
    buffers: HashMap<String, NsBuffer>,
}

impl EventBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an event, returning the buffered count for its namespace.
    pub fn append(&mut self, ns: &str, event: Event) -> usize {
        let size = event.size_hint() as i64;
        match self.buffers.get_mut(ns) {
            Some(buffer) => {
                buffer.last_seq = event.seq;
                buffer.size_bytes += size;
                buffer.events.push(event);
                buffer.events.len()
            }
            None => {
                self.buffers.insert(
                    ns.to_owned(),
                    NsBuffer {
                        first_seq: event.seq,
                        last_seq: event.seq,
                        size_bytes: size,
                        events: vec![event],
                    },
                );
                1
            }
        }
    }

    /// Removes and returns the buffer for `ns`, if any events are queued.
    pub fn take(&mut self, ns: &str) -> Option<NsBuffer> {
        self.buffers.remove(ns)
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.buffers.keys().cloned().collect()
    }

    pub fn len(&self, ns: &str) -> usize {
        self.buffers.get(ns).map_or(0, |b| b.events.len())
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Buffered events targeting one entity, in seq order.
    pub fn events_for_target(&self, ns: &str, short_id: &str) -> Vec<Event> {
        self.buffers.get(ns).map_or_else(Vec::new, |buffer| {
            buffer
                .events
                .iter()
                .filter(|e| e.target.short_id == short_id)
                .cloned()
                .collect()
        })
    }

    /// All buffered events for `ns` after `after_seq`, in seq order.
    pub fn events_after(&self, ns: &str, after_seq: i64) -> Vec<Event> {
        self.buffers.get(ns).map_or_else(Vec::new, |buffer| {
            buffer
                .events
                .iter()
                .filter(|e| e.seq > after_seq)
                .cloned()
                .collect()
        })
    }
}
