use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use parquedb_types::entity::{Entity, EntityId};
use parquedb_variant::{Value, codec};
use sqlx::{Row, SqlitePool};

/// A directed edge of the relationship graph, denormalized with the endpoint
/// types and names captured at link time.
#[derive(Debug, Clone)]
pub struct Relationship {
    pub from: EntityId,
    pub predicate: String,
    pub to: EntityId,
    pub from_type: Option<String>,
    pub from_name: Option<String>,
    pub to_type: Option<String>,
    pub to_name: Option<String>,
    pub match_mode: Option<String>,
    pub similarity: Option<f64>,
    pub data: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub version: i64,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Relationship {
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        map.insert("from".into(), self.from.to_string().into());
        map.insert("predicate".into(), self.predicate.clone().into());
        map.insert("to".into(), self.to.to_string().into());
        if let Some(from_type) = &self.from_type {
            map.insert("fromType".into(), from_type.clone().into());
        }
        if let Some(from_name) = &self.from_name {
            map.insert("fromName".into(), from_name.clone().into());
        }
        if let Some(to_type) = &self.to_type {
            map.insert("toType".into(), to_type.clone().into());
        }
        if let Some(to_name) = &self.to_name {
            map.insert("toName".into(), to_name.clone().into());
        }
        if let Some(data) = &self.data {
            map.insert("data".into(), parquedb_variant::json::json_from_value(data));
        }
        map.insert("createdAt".into(), self.created_at.to_rfc3339().into());
        map.insert("version".into(), self.version.into());
        if let Some(deleted_at) = &self.deleted_at {
            map.insert("deletedAt".into(), deleted_at.to_rfc3339().into());
        }
        serde_json::Value::Object(map)
    }
}

/// Traversal direction relative to the queried entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Outbound,
    Inbound,
    Any,
}

impl Direction {
    pub fn parse(direction: &str) -> Result<Self> {
        match direction {
            "outbound" => Ok(Self::Outbound),
            "inbound" => Ok(Self::Inbound),
            "any" => Ok(Self::Any),
            other => bail!("unknown direction {other:?}"),
        }
    }
}

/// Inserts an edge, or revives a soft-deleted one. The denormalized endpoint
/// fields are refreshed from the current projections either way.
pub async fn upsert_link(
    pool: &SqlitePool,
    from: &Entity,
    predicate: &str,
    to: &Entity,
    data: Option<&Value>,
) -> Result<()> {
    let encoded_data = data.map(codec::encode);
    sqlx::query(
        "INSERT INTO relationships(from_ns, from_id, predicate, to_ns, to_id,
                  from_type, from_name, to_type, to_name,
                  match_mode, similarity, data, created_at, version, deleted_at)
         VALUES($1, $2, $3, $4, $5, $6, $7, $8, $9, NULL, NULL, $10, $11, 1, NULL)
         ON CONFLICT(from_ns, from_id, predicate, to_ns, to_id)
         DO UPDATE SET deleted_at = NULL,
                       version = version + 1,
                       from_type = $6,
                       from_name = $7,
                       to_type = $8,
                       to_name = $9;",
    )
    .bind(&from.id.ns)
    .bind(&from.id.short_id)
    .bind(predicate)
    .bind(&to.id.ns)
    .bind(&to.id.short_id)
    .bind(&from.entity_type)
    .bind(&from.name)
    .bind(&to.entity_type)
    .bind(&to.name)
    .bind(encoded_data)
    .bind(Utc::now())
    .execute(pool)
    .await
    .with_context(|| "upserting relationship")?;
    Ok(())
}

/// Soft-deletes an edge. Returns whether a live edge was present.
pub async fn soft_unlink(
    pool: &SqlitePool,
    from: &EntityId,
    predicate: &str,
    to: &EntityId,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE relationships
         SET deleted_at = $6, version = version + 1
         WHERE from_ns = $1 AND from_id = $2 AND predicate = $3
         AND to_ns = $4 AND to_id = $5
         AND deleted_at IS NULL;",
    )
    .bind(&from.ns)
    .bind(&from.short_id)
    .bind(predicate)
    .bind(&to.ns)
    .bind(&to.short_id)
    .bind(Utc::now())
    .execute(pool)
    .await
    .with_context(|| "unlinking relationship")?;
    Ok(result.rows_affected() > 0)
}

fn relationship_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Relationship> {
    let data: Option<Vec<u8>> = row.try_get("data")?;
    let data = match data {
        Some(bytes) => Some(codec::decode(&bytes).with_context(|| "decoding edge data")?),
        None => None,
    };
    Ok(Relationship {
        from: EntityId::new(
            row.try_get::<String, _>("from_ns")?,
            row.try_get::<String, _>("from_id")?,
        ),
        predicate: row.try_get("predicate")?,
        to: EntityId::new(
            row.try_get::<String, _>("to_ns")?,
            row.try_get::<String, _>("to_id")?,
        ),
        from_type: row.try_get("from_type")?,
        from_name: row.try_get("from_name")?,
        to_type: row.try_get("to_type")?,
        to_name: row.try_get("to_name")?,
        match_mode: row.try_get("match_mode")?,
        similarity: row.try_get("similarity")?,
        data,
        created_at: row.try_get("created_at")?,
        version: row.try_get("version")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

/// Lists edges touching one entity, non-deleted by default.
pub async fn list_relationships(
    pool: &SqlitePool,
    id: &EntityId,
    predicate: Option<&str>,
    direction: Direction,
    include_deleted: bool,
) -> Result<Vec<Relationship>> {
    let rows = sqlx::query(
        "SELECT from_ns, from_id, predicate, to_ns, to_id,
                from_type, from_name, to_type, to_name,
                match_mode, similarity, data, created_at, version, deleted_at
         FROM relationships
         WHERE (($3 AND from_ns = $1 AND from_id = $2)
             OR ($4 AND to_ns = $1 AND to_id = $2))
         AND ($5 IS NULL OR predicate = $5)
         AND ($6 OR deleted_at IS NULL)
         ORDER BY created_at;",
    )
    .bind(&id.ns)
    .bind(&id.short_id)
    .bind(matches!(direction, Direction::Outbound | Direction::Any))
    .bind(matches!(direction, Direction::Inbound | Direction::Any))
    .bind(predicate)
    .bind(include_deleted)
    .fetch_all(pool)
    .await
    .with_context(|| "listing relationships")?;
    rows.iter().map(relationship_from_row).collect()
}
