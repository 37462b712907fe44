use crate::entity::EntityId;
use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use parquedb_variant::codec::{decode_value, encode_value};
use parquedb_variant::{Object, Value};
use std::sync::Arc;

/// The unit of durable change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventOp {
    Create,
    Update,
    Delete,
}

impl EventOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }

    pub fn parse(op: &str) -> Result<Self> {
        match op {
            "CREATE" => Ok(Self::Create),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            other => bail!("unknown event op {other:?}"),
        }
    }
}

/// One event in the per-namespace log.
///
/// `seq` is the counter value that produced `id`; it is strictly monotonic
/// within `(shard, ns)` and orders the event against WAL batches and pending
/// row groups alike.
#[derive(Debug, Clone)]
pub struct Event {
    pub id: String,
    pub seq: i64,
    pub ts: DateTime<Utc>,
    pub op: EventOp,
    pub target: EntityId,
    pub before: Option<Value>,
    pub after: Option<Value>,
    pub actor: Option<String>,
}

impl Event {
    /// Encoded size estimate used for buffer accounting.
    pub fn size_hint(&self) -> usize {
        let payload = |v: &Option<Value>| match v {
            Some(value) => {
                let mut buffer = vec![];
                encode_value(&mut buffer, value);
                buffer.len()
            }
            None => 1,
        };
        self.id.len()
            + self.target.ns.len()
            + self.target.short_id.len()
            + self.actor.as_ref().map_or(0, |actor| actor.len())
            + payload(&self.before)
            + payload(&self.after)
            + 32
    }
}

fn option_value(value: &Option<Value>) -> Value {
    value.clone().unwrap_or(Value::Null)
}

fn value_option(value: Value) -> Option<Value> {
    if value.is_null() { None } else { Some(value) }
}

/// Encodes one event as a variant object.
pub fn encode_event(buffer: &mut Vec<u8>, event: &Event) {
    let mut obj = Object::new();
    obj.set("id", Value::from_str(&event.id));
    obj.set("seq", Value::I64(event.seq));
    obj.set("ts", Value::Date(event.ts));
    obj.set("op", Value::from_str(event.op.as_str()));
    obj.set("target", Value::from_str(&event.target.target()));
    obj.set("before", option_value(&event.before));
    obj.set("after", option_value(&event.after));
    obj.set(
        "actor",
        event
            .actor
            .as_ref()
            .map_or(Value::Null, |a| Value::from_str(a)),
    );
    encode_value(buffer, &obj.into());
}

/// Decodes one event from the front of the window, advancing it.
pub fn decode_event(window: &mut &[u8]) -> Result<Event> {
    let value = decode_value(window).with_context(|| "decoding event object")?;
    let Value::Object(obj) = value else {
        bail!("event payload is not an object");
    };
    let op = EventOp::parse(&obj.get::<Arc<String>>("op")?)?;
    let target = EntityId::parse_target(&obj.get::<Arc<String>>("target")?)?;
    let actor = match obj.get_ref("actor") {
        Some(Value::String(s)) => Some((**s).clone()),
        _ => None,
    };
    Ok(Event {
        id: (*obj.get::<Arc<String>>("id")?).clone(),
        seq: obj.get::<i64>("seq")?,
        ts: obj.get::<DateTime<Utc>>("ts")?,
        op,
        target,
        before: obj.get_ref("before").cloned().and_then(value_option),
        after: obj.get_ref("after").cloned().and_then(value_option),
        actor,
    })
}

/// Encodes a contiguous run of events as a count-prefixed payload.
///
/// The result is what a WAL batch row stores, after compression.
pub fn encode_event_batch(events: &[Event]) -> Vec<u8> {
    let mut buffer = vec![];
    buffer.extend_from_slice(&(events.len() as u32).to_le_bytes());
    for event in events {
        encode_event(&mut buffer, event);
    }
    buffer
}

/// Decodes a count-prefixed run of events.
pub fn decode_event_batch(buffer: &[u8]) -> Result<Vec<Event>> {
    let mut window = buffer;
    if window.len() < 4 {
        bail!("event batch shorter than its count prefix");
    }
    let (count_bytes, rest) = window.split_at(4);
    window = rest;
    let count = u32::from_le_bytes(count_bytes.try_into().expect("4 bytes")) as usize;
    let mut events = Vec::with_capacity(count.min(4096));
    for index in 0..count {
        events.push(
            decode_event(&mut window).with_context(|| format!("decoding event {index}"))?,
        );
    }
    if !window.is_empty() {
        bail!("{} trailing bytes after event batch", window.len());
    }
    Ok(events)
}
