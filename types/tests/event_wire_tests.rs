use chrono::{TimeZone, Utc};
use parquedb_types::entity::EntityId;
use parquedb_types::event::{Event, EventOp, decode_event_batch, encode_event_batch};
use parquedb_types::mutation::{Mutation, MutationOp};
use parquedb_variant::{Object, Value};

fn make_event(seq: i64, op: EventOp) -> Event {
    let mut body = Object::new();
    body.set("title", Value::from_str("hello"));
    Event {
        id: parquedb_types::short_id::encode_short_id(seq as u64),
        seq,
        ts: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        op,
        target: EntityId::new("posts", "1"),
        before: None,
        after: match op {
            EventOp::Delete => None,
            _ => Some(body.into()),
        },
        actor: Some("tester".into()),
    }
}

#[test]
fn test_event_batch_round_trip() {
    let events = vec![
        make_event(1, EventOp::Create),
        make_event(2, EventOp::Update),
        make_event(3, EventOp::Delete),
    ];
    let payload = encode_event_batch(&events);
    let decoded = decode_event_batch(&payload).unwrap();
    assert_eq!(decoded.len(), 3);
    assert_eq!(decoded[0].op, EventOp::Create);
    assert_eq!(decoded[1].seq, 2);
    assert_eq!(decoded[2].op, EventOp::Delete);
    assert!(decoded[2].after.is_none());
    assert_eq!(decoded[0].target.target(), "posts:1");
    assert_eq!(decoded[0].actor.as_deref(), Some("tester"));
}

#[test]
fn test_delete_omits_images() {
    let payload = encode_event_batch(&[make_event(9, EventOp::Delete)]);
    let decoded = decode_event_batch(&payload).unwrap();
    assert!(decoded[0].before.is_none());
    assert!(decoded[0].after.is_none());
}

#[test]
fn test_mutation_parsing_and_payload() {
    let body = serde_json::json!({
        "$set": {"title": "X"},
        "$inc": {"views": 3},
        "$push": {"tags": ["a", "b"]},
        "$link": {"author": "users/7"}
    });
    let mutation = Mutation::from_json(&body).unwrap();
    assert_eq!(mutation.ops.len(), 4);
    assert!(matches!(mutation.ops[0], MutationOp::Set(_)));
    assert!(mutation.has_links());

    let payload = mutation.to_payload();
    let rebuilt = Mutation::from_payload(&payload).unwrap();
    assert_eq!(rebuilt.ops.len(), 4);
    assert!(matches!(&rebuilt.ops[3], MutationOp::Link(edges)
        if edges[0].0 == "author" && edges[0].1 == vec!["users/7".to_owned()]));
}

#[test]
fn test_unknown_operator_rejected() {
    let body = serde_json::json!({"$rename": {"a": "b"}});
    let err = Mutation::from_json(&body).unwrap_err();
    assert_eq!(err.status_code(), 400);
}

#[test]
fn test_non_numeric_inc_rejected() {
    let body = serde_json::json!({"$inc": {"views": "three"}});
    assert!(Mutation::from_json(&body).is_err());
}
