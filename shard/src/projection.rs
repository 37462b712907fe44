use anyhow::{Context, Result, bail};
use parquedb_types::entity::Entity;
use parquedb_types::event::{Event, EventOp};
use parquedb_types::mutation::{Mutation, MutationOp};
use parquedb_variant::{Object, Value};
use std::sync::Arc;

/// Builds the full-body payload a CREATE event carries: `$type`, `name` and
/// the user attributes, in that order.
pub fn build_create_payload(
    entity_type: &str,
    name: Option<&str>,
    attributes: &Object,
) -> Value {
    let mut payload = Object::new();
    payload.set("$type", Value::from_str(entity_type));
    if let Some(name) = name {
        payload.set("name", Value::from_str(name));
    }
    for (member, value) in &attributes.members {
        payload.set(member, value.clone());
    }
    payload.into()
}

fn split_create_payload(payload: &Value) -> Result<(String, Option<String>, Object)> {
    let Some(obj) = payload.as_object() else {
        bail!("create payload is not an object");
    };
    let entity_type = (*obj.get::<Arc<String>>("$type")?).clone();
    let mut name = None;
    let mut attributes = Object::new();
    for (member, value) in &obj.members {
        match member.as_str() {
            "$type" => {}
            "name" => {
                name = value.as_str().map(str::to_owned);
            }
            _ => attributes.set(member, value.clone()),
        }
    }
    Ok((entity_type, name, attributes))
}

/// Applies one mutation to a projection, in operator order, without touching
/// `version` or timestamps. Link operators are relationship side effects and
/// do not alter entity state.
pub fn apply_mutation(entity: &mut Entity, mutation: &Mutation) -> Result<()> {
    for op in &mutation.ops {
        match op {
            MutationOp::Set(fields) => {
                for (field, value) in fields {
                    if field == "name" {
                        entity.name = value.as_str().map(str::to_owned);
                    } else {
                        entity.attributes.set(field, value.clone());
                    }
                }
            }
            MutationOp::Inc(fields) => {
                for (field, delta) in fields {
                    let current = entity
                        .attributes
                        .get_ref(field)
                        .cloned()
                        .unwrap_or(Value::Null);
                    let next = match (&current, delta) {
                        (Value::Null, Value::I64(d)) => Value::I64(*d),
                        (Value::Null, Value::F64(d)) => Value::F64(*d),
                        (Value::I64(c), Value::I64(d)) => Value::I64(c + d),
                        (Value::I64(c), Value::F64(d)) => Value::F64(*c as f64 + d),
                        (Value::F64(c), Value::I64(d)) => Value::F64(c + *d as f64),
                        (Value::F64(c), Value::F64(d)) => Value::F64(c + d),
                        _ => bail!("$inc target {field} is not numeric"),
                    };
                    entity.attributes.set(field, next);
                }
            }
            MutationOp::Push(fields) => {
                for (field, items) in fields {
                    let current = entity.attributes.remove(field).unwrap_or(Value::Null);
                    let list = match current {
                        Value::Null => items.clone(),
                        Value::Array(mut existing) => {
                            existing.extend(items.iter().cloned());
                            existing
                        }
                        _ => bail!("$push target {field} is not a list"),
                    };
                    entity.attributes.set(field, Value::Array(list));
                }
            }
            MutationOp::Link(_) | MutationOp::Unlink(_) => {}
        }
    }
    Ok(())
}

/// The left fold: reconstructs an entity from all events targeting it, in
/// seq order. Returns None when no CREATE event was seen.
pub fn fold_events(events: &[Event]) -> Result<Option<Entity>> {
    let mut entity: Option<Entity> = None;
    for event in events {
        match event.op {
            EventOp::Create => {
                let payload = event
                    .after
                    .as_ref()
                    .with_context(|| "CREATE event without a body")?;
                let (entity_type, name, attributes) = split_create_payload(payload)?;
                entity = Some(Entity {
                    id: event.target.clone(),
                    entity_type,
                    name,
                    created_at: event.ts,
                    updated_at: event.ts,
                    created_by: event.actor.clone(),
                    updated_by: event.actor.clone(),
                    version: 1,
                    deleted_at: None,
                    deleted_by: None,
                    attributes,
                });
            }
            EventOp::Update => {
                let Some(current) = entity.as_mut() else {
                    bail!("UPDATE event for {} before CREATE", event.target);
                };
                if let Some(payload) = &event.after {
                    let mutation = Mutation::from_payload(payload)
                        .with_context(|| "decoding update operators")?;
                    apply_mutation(current, &mutation)?;
                }
                current.version += 1;
                current.updated_at = event.ts;
                current.updated_by = event.actor.clone();
            }
            EventOp::Delete => {
                let Some(current) = entity.as_mut() else {
                    bail!("DELETE event for {} before CREATE", event.target);
                };
                current.version += 1;
                current.updated_at = event.ts;
                current.updated_by = event.actor.clone();
                current.deleted_at = Some(event.ts);
                current.deleted_by = event.actor.clone();
            }
        }
    }
    Ok(entity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use parquedb_types::entity::EntityId;

    fn event(seq: i64, op: EventOp, after: Option<Value>) -> Event {
        Event {
            id: parquedb_types::short_id::encode_short_id(seq as u64),
            seq,
            ts: Utc::now(),
            op,
            target: EntityId::new("posts", "1"),
            before: None,
            after,
            actor: None,
        }
    }

    #[test]
    fn test_fold_create_update_delete() {
        let mut body = Object::new();
        body.set("views", Value::I64(0));
        let create = event(1, EventOp::Create, Some(build_create_payload("Post", None, &body)));

        let inc = Mutation::from_json(&serde_json::json!({"$inc": {"views": 6}})).unwrap();
        let update = event(2, EventOp::Update, Some(inc.to_payload()));
        let delete = event(3, EventOp::Delete, None);

        let entity = fold_events(&[create, update, delete]).unwrap().unwrap();
        assert_eq!(entity.version, 3);
        assert_eq!(entity.attributes.get::<i64>("views").unwrap(), 6);
        assert!(entity.is_deleted());
    }

    #[test]
    fn test_inc_missing_field_treated_as_zero() {
        let body = Object::new();
        let create = event(1, EventOp::Create, Some(build_create_payload("Post", None, &body)));
        let inc = Mutation::from_json(&serde_json::json!({"$inc": {"clicks": 2}})).unwrap();
        let update = event(2, EventOp::Update, Some(inc.to_payload()));
        let entity = fold_events(&[create, update]).unwrap().unwrap();
        assert_eq!(entity.attributes.get::<i64>("clicks").unwrap(), 2);
    }

    #[test]
    fn test_push_creates_list() {
        let body = Object::new();
        let create = event(1, EventOp::Create, Some(build_create_payload("Post", None, &body)));
        let push = Mutation::from_json(&serde_json::json!({"$push": {"tags": ["a", "b"]}})).unwrap();
        let update = event(2, EventOp::Update, Some(push.to_payload()));
        let entity = fold_events(&[create, update]).unwrap().unwrap();
        let Value::Array(tags) = entity.attributes.get_ref("tags").unwrap() else {
            panic!("tags is not a list");
        };
        assert_eq!(tags.len(), 2);
    }
}
