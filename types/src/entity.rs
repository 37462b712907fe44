use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use parquedb_variant::{Object, json};
use std::fmt;

/// The logical identity of an entity: `ns/shortId`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityId {
    pub ns: String,
    pub short_id: String,
}

impl EntityId {
    pub fn new(ns: impl Into<String>, short_id: impl Into<String>) -> Self {
        Self {
            ns: ns.into(),
            short_id: short_id.into(),
        }
    }

    /// Parses the `$id` form `ns/shortId`.
    pub fn parse(id: &str) -> Result<Self> {
        match id.split_once('/') {
            Some((ns, short_id)) if !ns.is_empty() && !short_id.is_empty() => {
                Ok(Self::new(ns, short_id))
            }
            _ => bail!("malformed entity id {id:?}"),
        }
    }

    /// Parses the event target form `ns:shortId`.
    pub fn parse_target(target: &str) -> Result<Self> {
        match target.split_once(':') {
            Some((ns, short_id)) if !ns.is_empty() && !short_id.is_empty() => {
                Ok(Self::new(ns, short_id))
            }
            _ => bail!("malformed event target {target:?}"),
        }
    }

    /// The event target form `ns:shortId`.
    pub fn target(&self) -> String {
        format!("{}:{}", self.ns, self.short_id)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ns, self.short_id)
    }
}

/// A reconstructed entity projection.
///
/// Entities are derived state: this is the left fold of all events targeting
/// `id`, never an authoritative row.
#[derive(Debug, Clone)]
pub struct Entity {
    pub id: EntityId,
    pub entity_type: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: Option<String>,
    pub updated_by: Option<String>,
    pub version: i64,
    pub deleted_at: Option<DateTime<Utc>>,
    pub deleted_by: Option<String>,
    pub attributes: Object,
}

impl Entity {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Renders the projection for the HTTP boundary: system attributes under
    /// `$`-prefixed keys, user attributes at the top level.
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        map.insert("$id".into(), self.id.to_string().into());
        map.insert("$type".into(), self.entity_type.clone().into());
        if let Some(name) = &self.name {
            map.insert("name".into(), name.clone().into());
        }
        map.insert("createdAt".into(), self.created_at.to_rfc3339().into());
        map.insert("updatedAt".into(), self.updated_at.to_rfc3339().into());
        if let Some(created_by) = &self.created_by {
            map.insert("createdBy".into(), created_by.clone().into());
        }
        if let Some(updated_by) = &self.updated_by {
            map.insert("updatedBy".into(), updated_by.clone().into());
        }
        map.insert("version".into(), self.version.into());
        if let Some(deleted_at) = &self.deleted_at {
            map.insert("deletedAt".into(), deleted_at.to_rfc3339().into());
        }
        if let Some(deleted_by) = &self.deleted_by {
            map.insert("deletedBy".into(), deleted_by.clone().into());
        }
        for (name, value) in &self.attributes.members {
            map.insert((**name).clone(), json::json_from_value(value));
        }
        serde_json::Value::Object(map)
    }
}
