use anyhow::{Context, Result, bail};
use arrow::array::{Array, BinaryArray, Int64Array, StringArray, TimestampMillisecondArray};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use bytes::{BufMut, Bytes};
use chrono::{DateTime, Utc};
use futures::stream::StreamExt;
use parquet::arrow::ArrowWriter;
use parquet::arrow::ParquetRecordBatchStreamBuilder;
use parquet::arrow::async_reader::ParquetObjectReader;
use parquet::basic::Compression;
use parquet::file::properties::{WriterProperties, WriterVersion};
use parquedb_types::blob_storage::BlobStorage;
use parquedb_types::entity::EntityId;
use parquedb_types::event::{Event, EventOp};
use parquedb_variant::{Object, codec};
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use tracing::debug;

/// Metadata of one bulk-bypass Parquet file awaiting compaction.
#[derive(Debug, Clone)]
pub struct PendingRowGroup {
    pub id: i64,
    pub ns: String,
    pub path: String,
    pub row_count: i64,
    pub first_seq: i64,
    pub last_seq: i64,
    pub created_at: DateTime<Utc>,
    pub committed_at: Option<DateTime<Utc>>,
}

/// One entity row inside a bulk file.
#[derive(Debug, Clone)]
pub struct BulkRow {
    pub seq: i64,
    pub short_id: String,
    pub entity_type: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub created_by: Option<String>,
    pub attributes: Object,
}

/// The pending file path: `data/<ns>/pending/<unix-ms>-<shardId>-<batchN>.parquet`.
///
/// Deterministic per `(shard, batch counter)` so a retried upload can detect
/// the object it already wrote.
pub fn pending_file_path(ns: &str, shard_id: &str, batch_n: u64, now: DateTime<Utc>) -> String {
    format!(
        "data/{ns}/pending/{}-{shard_id}-{batch_n}.parquet",
        now.timestamp_millis()
    )
}

pub fn bulk_file_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("seq", DataType::Int64, false),
        Field::new("id", DataType::Utf8, false),
        Field::new("entity_type", DataType::Utf8, false),
        Field::new("name", DataType::Utf8, true),
        Field::new(
            "created_at",
            DataType::Timestamp(TimeUnit::Millisecond, Some("UTC".into())),
            false,
        ),
        Field::new("created_by", DataType::Utf8, true),
        Field::new("attributes", DataType::Binary, false),
    ]))
}

/// Encodes the whole bulk file in memory.
///
/// Bulk batches are bounded by a single `createMany` call, so buffering the
/// file before the upload keeps the writer simple and the put conditional.
pub fn encode_bulk_parquet(rows: &[BulkRow]) -> Result<Bytes> {
    let schema = bulk_file_schema();
    let seq = Int64Array::from(rows.iter().map(|r| r.seq).collect::<Vec<_>>());
    let id = StringArray::from(rows.iter().map(|r| r.short_id.clone()).collect::<Vec<_>>());
    let entity_type = StringArray::from(
        rows.iter()
            .map(|r| r.entity_type.clone())
            .collect::<Vec<_>>(),
    );
    let name = StringArray::from(rows.iter().map(|r| r.name.clone()).collect::<Vec<_>>());
    let created_at = TimestampMillisecondArray::from(
        rows.iter()
            .map(|r| r.created_at.timestamp_millis())
            .collect::<Vec<_>>(),
    )
    .with_timezone("UTC");
    let created_by = StringArray::from(rows.iter().map(|r| r.created_by.clone()).collect::<Vec<_>>());
    let attributes = BinaryArray::from_iter_values(
        rows.iter()
            .map(|r| codec::encode(&r.attributes.clone().into())),
    );
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(seq),
            Arc::new(id),
            Arc::new(entity_type),
            Arc::new(name),
            Arc::new(created_at),
            Arc::new(created_by),
            Arc::new(attributes),
        ],
    )
    .with_context(|| "building bulk record batch")?;

    let mut buffer_writer = bytes::BytesMut::new().writer();
    let props = WriterProperties::builder()
        .set_writer_version(WriterVersion::PARQUET_2_0)
        .set_compression(Compression::LZ4_RAW)
        .build();
    let mut arrow_writer = ArrowWriter::try_new(&mut buffer_writer, schema, Some(props))?;
    arrow_writer
        .write(&batch)
        .with_context(|| "arrow_writer.write")?;
    arrow_writer.close().with_context(|| "arrow_writer.close")?;
    Ok(buffer_writer.into_inner().freeze())
}

/// Uploads a bulk file without overwriting: an object already at the path is
/// taken as the surviving result of an earlier attempt.
pub async fn upload_pending_file(
    blob_storage: &BlobStorage,
    path: &str,
    bytes: Bytes,
) -> Result<()> {
    let created = blob_storage.put_if_absent(path, bytes).await?;
    if !created {
        debug!("pending file {path} already present, keeping prior upload");
    }
    Ok(())
}

pub async fn insert_pending_row_group(
    pool: &SqlitePool,
    ns: &str,
    path: &str,
    row_count: i64,
    first_seq: i64,
    last_seq: i64,
    created_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO pending_row_groups(ns, path, row_count, first_seq, last_seq, created_at)
         VALUES($1, $2, $3, $4, $5, $6);",
    )
    .bind(ns)
    .bind(path)
    .bind(row_count)
    .bind(first_seq)
    .bind(last_seq)
    .bind(created_at)
    .execute(pool)
    .await
    .with_context(|| "inserting into pending_row_groups")?;
    Ok(())
}

fn group_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<PendingRowGroup> {
    Ok(PendingRowGroup {
        id: row.try_get("id")?,
        ns: row.try_get("ns")?,
        path: row.try_get("path")?,
        row_count: row.try_get("row_count")?,
        first_seq: row.try_get("first_seq")?,
        last_seq: row.try_get("last_seq")?,
        created_at: row.try_get("created_at")?,
        committed_at: row.try_get("committed_at")?,
    })
}

pub async fn list_pending_row_groups(pool: &SqlitePool, ns: &str) -> Result<Vec<PendingRowGroup>> {
    let rows = sqlx::query(
        "SELECT id, ns, path, row_count, first_seq, last_seq, created_at, committed_at
         FROM pending_row_groups
         WHERE ns = $1
         ORDER BY first_seq;",
    )
    .bind(ns)
    .fetch_all(pool)
    .await
    .with_context(|| "listing pending row groups")?;
    rows.iter().map(group_from_row).collect()
}

/// Promotes uncommitted pending groups: stamps `committed_at`, making them
/// eligible for compaction. Returns the promoted count.
pub async fn flush_pending_to_committed(pool: &SqlitePool, ns: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE pending_row_groups
         SET committed_at = $2
         WHERE ns = $1
         AND committed_at IS NULL;",
    )
    .bind(ns)
    .bind(Utc::now())
    .execute(pool)
    .await
    .with_context(|| "promoting pending row groups")?;
    Ok(result.rows_affected())
}

/// Deletes pending groups wholly covered by `up_to_seq` along with their
/// objects. Used once compaction has folded them into canonical files.
pub async fn delete_pending_row_groups(
    pool: &SqlitePool,
    blob_storage: &BlobStorage,
    ns: &str,
    up_to_seq: i64,
) -> Result<u64> {
    let rows = sqlx::query(
        "SELECT path
         FROM pending_row_groups
         WHERE ns = $1
         AND last_seq <= $2;",
    )
    .bind(ns)
    .bind(up_to_seq)
    .fetch_all(pool)
    .await
    .with_context(|| "listing pending row groups to delete")?;
    let paths: Vec<String> = rows
        .iter()
        .map(|row| row.try_get("path"))
        .collect::<Result<_, _>>()?;
    let result = sqlx::query(
        "DELETE FROM pending_row_groups
         WHERE ns = $1
         AND last_seq <= $2;",
    )
    .bind(ns)
    .bind(up_to_seq)
    .execute(pool)
    .await
    .with_context(|| "deleting pending row groups")?;
    blob_storage
        .delete_batch(&paths)
        .await
        .with_context(|| "deleting pending objects")?;
    Ok(result.rows_affected())
}

/// Reads one bulk file back into rows.
pub async fn read_pending_rows(
    blob_storage: &BlobStorage,
    group: &PendingRowGroup,
) -> Result<Vec<BulkRow>> {
    let reader = ParquetObjectReader::new(blob_storage.inner(), blob_storage.full_path(&group.path));
    let builder = ParquetRecordBatchStreamBuilder::new(reader)
        .await
        .with_context(|| "ParquetRecordBatchStreamBuilder::new")?;
    let mut rb_stream = builder.build().with_context(|| "builder.build()")?;
    let mut rows = vec![];
    while let Some(rb_res) = rb_stream.next().await {
        let record_batch = rb_res?;
        rows.extend(rows_from_record_batch(&record_batch)?);
    }
    Ok(rows)
}

fn rows_from_record_batch(batch: &RecordBatch) -> Result<Vec<BulkRow>> {
    fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
        batch
            .column_by_name(name)
            .with_context(|| format!("missing column {name}"))?
            .as_any()
            .downcast_ref::<T>()
            .with_context(|| format!("unexpected type for column {name}"))
    }

    let seq = column::<Int64Array>(batch, "seq")?;
    let id = column::<StringArray>(batch, "id")?;
    let entity_type = column::<StringArray>(batch, "entity_type")?;
    let name = column::<StringArray>(batch, "name")?;
    let created_at = column::<TimestampMillisecondArray>(batch, "created_at")?;
    let created_by = column::<StringArray>(batch, "created_by")?;
    let attributes = column::<BinaryArray>(batch, "attributes")?;

    let mut rows = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        let decoded = codec::decode(attributes.value(i))
            .with_context(|| "decoding bulk attributes")?;
        let Some(obj) = decoded.as_object() else {
            bail!("bulk attributes are not an object");
        };
        rows.push(BulkRow {
            seq: seq.value(i),
            short_id: id.value(i).to_owned(),
            entity_type: entity_type.value(i).to_owned(),
            name: (!name.is_null(i)).then(|| name.value(i).to_owned()),
            created_at: DateTime::<Utc>::from_timestamp_millis(created_at.value(i))
                .with_context(|| "decoding created_at")?,
            created_by: (!created_by.is_null(i)).then(|| created_by.value(i).to_owned()),
            attributes: obj.clone(),
        });
    }
    Ok(rows)
}

/// Synthesizes the CREATE events a bulk file stands for, so replay sees one
/// ordered log across the buffer, the WAL and pending files.
pub fn events_from_bulk_rows(ns: &str, rows: &[BulkRow]) -> Vec<Event> {
    rows.iter()
        .map(|row| {
            let mut payload = Object::new();
            payload.set("$type", parquedb_variant::Value::from_str(&row.entity_type));
            if let Some(name) = &row.name {
                payload.set("name", parquedb_variant::Value::from_str(name));
            }
            for (member, value) in &row.attributes.members {
                payload.set(member, value.clone());
            }
            Event {
                id: row.short_id.clone(),
                seq: row.seq,
                ts: row.created_at,
                op: EventOp::Create,
                target: EntityId::new(ns, row.short_id.clone()),
                before: None,
                after: Some(payload.into()),
                actor: row.created_by.clone(),
            }
        })
        .collect()
}
