use crate::error::{CoreError, CoreResult};
use anyhow::{Result, bail};
use parquedb_variant::{Object, Value, json};

/// One update operator with its operands, in declared order.
#[derive(Debug, Clone)]
pub enum MutationOp {
    /// `$set {field: value}` — overwrite each field.
    Set(Vec<(String, Value)>),
    /// `$inc {field: n}` — numeric addition, missing fields treated as 0.
    Inc(Vec<(String, Value)>),
    /// `$push {field: v | [v...]}` — append to a list, creating it if absent.
    Push(Vec<(String, Vec<Value>)>),
    /// `$link {predicate: toId | [toId...]}` — relationship side effects.
    Link(Vec<(String, Vec<String>)>),
    /// `$unlink {predicate: toId | [toId...]}`.
    Unlink(Vec<(String, Vec<String>)>),
}

impl MutationOp {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Set(_) => "$set",
            Self::Inc(_) => "$inc",
            Self::Push(_) => "$push",
            Self::Link(_) => "$link",
            Self::Unlink(_) => "$unlink",
        }
    }
}

/// A mutation: operators applied in declared order on a single snapshot,
/// producing exactly one event.
#[derive(Debug, Clone, Default)]
pub struct Mutation {
    pub ops: Vec<MutationOp>,
}

impl Mutation {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// True when the mutation carries relationship side effects.
    pub fn has_links(&self) -> bool {
        self.ops
            .iter()
            .any(|op| matches!(op, MutationOp::Link(_) | MutationOp::Unlink(_)))
    }

    /// Parses the JSON mapping form, failing fast on unknown operators.
    pub fn from_json(body: &serde_json::Value) -> CoreResult<Self> {
        let serde_json::Value::Object(map) = body else {
            return Err(CoreError::validation("mutation must be an object"));
        };
        let mut ops = vec![];
        for (operator, operand) in map {
            let op = match operator.as_str() {
                "$set" => MutationOp::Set(field_values(operand, operator)?),
                "$inc" => {
                    let fields = field_values(operand, operator)?;
                    for (field, value) in &fields {
                        if !matches!(value, Value::I64(_) | Value::F64(_)) {
                            return Err(CoreError::validation(format!(
                                "$inc operand for {field} is not numeric"
                            )));
                        }
                    }
                    MutationOp::Inc(fields)
                }
                "$push" => {
                    let fields = field_values(operand, operator)?;
                    MutationOp::Push(
                        fields
                            .into_iter()
                            .map(|(field, value)| match value {
                                Value::Array(items) => (field, items),
                                single => (field, vec![single]),
                            })
                            .collect(),
                    )
                }
                "$link" => MutationOp::Link(predicate_targets(operand, operator)?),
                "$unlink" => MutationOp::Unlink(predicate_targets(operand, operator)?),
                unknown => {
                    return Err(CoreError::validation(format!(
                        "unknown mutation operator {unknown}"
                    )));
                }
            };
            ops.push(op);
        }
        Ok(Self { ops })
    }

    /// The operator payload stored in an UPDATE event's `after` image.
    pub fn to_payload(&self) -> Value {
        let mut payload = Object::new();
        for op in &self.ops {
            let mut operand = Object::new();
            match op {
                MutationOp::Set(fields) | MutationOp::Inc(fields) => {
                    for (field, value) in fields {
                        operand.set(field, value.clone());
                    }
                }
                MutationOp::Push(fields) => {
                    for (field, items) in fields {
                        operand.set(field, Value::Array(items.clone()));
                    }
                }
                MutationOp::Link(edges) | MutationOp::Unlink(edges) => {
                    for (predicate, targets) in edges {
                        operand.set(
                            predicate,
                            Value::Array(targets.iter().map(|t| Value::from_str(t)).collect()),
                        );
                    }
                }
            }
            payload.set(op.name(), operand.into());
        }
        payload.into()
    }

    /// Rebuilds a mutation from a stored operator payload during replay.
    pub fn from_payload(payload: &Value) -> Result<Self> {
        let Value::Object(obj) = payload else {
            bail!("mutation payload is not an object");
        };
        let mut ops = vec![];
        for (operator, operand) in &obj.members {
            let Value::Object(operand) = operand else {
                bail!("operand of {operator} is not an object");
            };
            let fields = || -> Vec<(String, Value)> {
                operand
                    .members
                    .iter()
                    .map(|(name, value)| ((**name).clone(), value.clone()))
                    .collect()
            };
            let op = match operator.as_str() {
                "$set" => MutationOp::Set(fields()),
                "$inc" => MutationOp::Inc(fields()),
                "$push" => MutationOp::Push(
                    operand
                        .members
                        .iter()
                        .map(|(name, value)| {
                            let items = match value {
                                Value::Array(items) => items.clone(),
                                single => vec![single.clone()],
                            };
                            ((**name).clone(), items)
                        })
                        .collect(),
                ),
                "$link" => MutationOp::Link(payload_edges(operand)?),
                "$unlink" => MutationOp::Unlink(payload_edges(operand)?),
                unknown => bail!("unknown mutation operator {unknown} in payload"),
            };
            ops.push(op);
        }
        Ok(Self { ops })
    }
}

fn field_values(operand: &serde_json::Value, operator: &str) -> CoreResult<Vec<(String, Value)>> {
    let serde_json::Value::Object(map) = operand else {
        return Err(CoreError::validation(format!(
            "{operator} operand must be an object"
        )));
    };
    Ok(map
        .iter()
        .map(|(field, value)| (field.clone(), json::value_from_json(value)))
        .collect())
}

fn predicate_targets(
    operand: &serde_json::Value,
    operator: &str,
) -> CoreResult<Vec<(String, Vec<String>)>> {
    let serde_json::Value::Object(map) = operand else {
        return Err(CoreError::validation(format!(
            "{operator} operand must be an object"
        )));
    };
    let mut edges = vec![];
    for (predicate, targets) in map {
        let targets = match targets {
            serde_json::Value::String(id) => vec![id.clone()],
            serde_json::Value::Array(ids) => {
                let mut out = vec![];
                for id in ids {
                    let serde_json::Value::String(id) = id else {
                        return Err(CoreError::validation(format!(
                            "{operator} target for {predicate} is not a string id"
                        )));
                    };
                    out.push(id.clone());
                }
                out
            }
            _ => {
                return Err(CoreError::validation(format!(
                    "{operator} target for {predicate} is not a string id"
                )));
            }
        };
        edges.push((predicate.clone(), targets));
    }
    Ok(edges)
}

fn payload_edges(operand: &Object) -> Result<Vec<(String, Vec<String>)>> {
    let mut edges = vec![];
    for (predicate, value) in &operand.members {
        let Value::Array(items) = value else {
            bail!("link payload for {predicate} is not an array");
        };
        let mut targets = vec![];
        for item in items {
            let Value::String(id) = item else {
                bail!("link target for {predicate} is not a string");
            };
            targets.push((**id).clone());
        }
        edges.push(((**predicate).clone(), targets));
    }
    Ok(edges)
}
