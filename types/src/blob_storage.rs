use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream;
use futures::{StreamExt, TryStreamExt};
use object_store::{MultipartUpload, ObjectStore, PutMode, path::Path};
use std::sync::Arc;
use std::time::Duration;
use tokio_retry2::strategy::ExponentialBackoff;
use tokio_retry2::{Retry, RetryError};

fn transient_retry() -> impl Iterator<Item = Duration> {
    ExponentialBackoff::from_millis(50)
        .max_delay(Duration::from_secs(2))
        .take(3)
}

/// Metadata of one stored object.
#[derive(Debug, Clone)]
pub struct BlobMeta {
    pub path: String,
    pub size: u64,
    pub e_tag: Option<String>,
    pub last_modified: DateTime<Utc>,
}

/// One page of a delimited listing.
#[derive(Debug, Default)]
pub struct ListPage {
    pub files: Vec<BlobMeta>,
    pub prefixes: Vec<String>,
}

/// Narrow wrapper over the object store: the only surface the engine and the
/// coordinators depend on.
#[derive(Debug)]
pub struct BlobStorage {
    blob_store: Arc<dyn ObjectStore>,
    blob_store_root: Path,
}

impl BlobStorage {
    pub fn new(blob_store: Arc<dyn ObjectStore>, blob_store_root: Path) -> Self {
        Self {
            blob_store,
            blob_store_root,
        }
    }

    pub fn connect(object_store_url: &str) -> Result<Self> {
        let (blob_store, blob_store_root) =
            object_store::parse_url(&url::Url::parse(object_store_url)?)?;
        Ok(Self {
            blob_store: blob_store.into(),
            blob_store_root,
        })
    }

    /// An in-memory store, used by tests and local experimentation.
    pub fn in_memory() -> Self {
        Self {
            blob_store: Arc::new(object_store::memory::InMemory::new()),
            blob_store_root: Path::default(),
        }
    }

    pub fn inner(&self) -> Arc<dyn ObjectStore> {
        self.blob_store.clone()
    }

    pub fn full_path(&self, obj_path: &str) -> Path {
        if self.blob_store_root.as_ref().is_empty() {
            Path::from(obj_path)
        } else {
            Path::from(format!("{}/{obj_path}", self.blob_store_root))
        }
    }

    /// Unconditional write, retried with backoff on transient failures.
    pub async fn put(&self, obj_path: &str, buffer: Bytes) -> Result<()> {
        let full_path = self.full_path(obj_path);
        Retry::spawn(transient_retry(), || async {
            self.blob_store
                .put(&full_path, buffer.clone().into())
                .await
                .map_err(RetryError::transient)
        })
        .await
        .with_context(|| format!("writing {obj_path}"))?;
        Ok(())
    }

    /// Conditional write: fails over to `Ok(false)` when the object already
    /// exists instead of overwriting it.
    pub async fn put_if_absent(&self, obj_path: &str, buffer: Bytes) -> Result<bool> {
        match self
            .blob_store
            .put_opts(&self.full_path(obj_path), buffer.into(), PutMode::Create.into())
            .await
        {
            Ok(_) => Ok(true),
            Err(object_store::Error::AlreadyExists { .. })
            | Err(object_store::Error::Precondition { .. }) => Ok(false),
            Err(e) => Err(e).with_context(|| format!("writing {obj_path}")),
        }
    }

    pub async fn read_blob(&self, obj_path: &str) -> Result<Bytes> {
        let get_result = self
            .blob_store
            .get(&self.full_path(obj_path))
            .await
            .with_context(|| format!("reading {obj_path}"))?;
        Ok(get_result.bytes().await?)
    }

    /// Range read, clamped: reading past the end of the object yields an
    /// empty (or shortened) buffer rather than an error.
    pub async fn read_range(&self, obj_path: &str, offset: u64, length: u64) -> Result<Bytes> {
        let Some(meta) = self.head(obj_path).await? else {
            anyhow::bail!("object {obj_path} not found");
        };
        if offset >= meta.size || length == 0 {
            return Ok(Bytes::new());
        }
        let end = meta.size.min(offset + length);
        let bytes = self
            .blob_store
            .get_range(&self.full_path(obj_path), offset..end)
            .await
            .with_context(|| format!("range-reading {obj_path}"))?;
        Ok(bytes)
    }

    pub async fn head(&self, obj_path: &str) -> Result<Option<BlobMeta>> {
        match self.blob_store.head(&self.full_path(obj_path)).await {
            Ok(meta) => Ok(Some(BlobMeta {
                path: obj_path.to_owned(),
                size: meta.size,
                e_tag: meta.e_tag,
                last_modified: meta.last_modified,
            })),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e).with_context(|| format!("heading {obj_path}")),
        }
    }

    pub async fn delete(&self, obj_path: &str) -> Result<()> {
        self.blob_store
            .delete(&self.full_path(obj_path))
            .await
            .with_context(|| format!("deleting {obj_path}"))?;
        Ok(())
    }

    /// Deletes a batch of objects, tolerating ones that are already gone.
    pub async fn delete_batch(&self, objects: &[String]) -> Result<()> {
        let path_stream = stream::iter(
            objects
                .iter()
                .map(|obj_path| self.full_path(obj_path))
                .map(Ok),
        );
        self.blob_store
            .delete_stream(Box::pin(path_stream))
            .map(|res| {
                if let Err(e) = res {
                    match e {
                        object_store::Error::NotFound { path: _, source: _ } => Ok(()),
                        ref _other_error => Err(e),
                    }
                } else {
                    Ok(())
                }
            })
            .try_collect::<Vec<_>>()
            .await?;
        Ok(())
    }

    /// Flat listing under a prefix.
    pub async fn list(&self, prefix: &str) -> Result<Vec<BlobMeta>> {
        let full_prefix = self.full_path(prefix);
        let root = self.blob_store_root.as_ref();
        let metas: Vec<object_store::ObjectMeta> = self
            .blob_store
            .list(Some(&full_prefix))
            .try_collect()
            .await
            .with_context(|| format!("listing {prefix}"))?;
        Ok(metas
            .into_iter()
            .map(|meta| BlobMeta {
                path: strip_root(root, meta.location.as_ref()),
                size: meta.size,
                e_tag: meta.e_tag,
                last_modified: meta.last_modified,
            })
            .collect())
    }

    /// Delimited listing: files directly under the prefix plus common
    /// sub-prefixes.
    pub async fn list_dir(&self, prefix: &str) -> Result<ListPage> {
        let full_prefix = self.full_path(prefix);
        let root = self.blob_store_root.as_ref();
        let listing = self
            .blob_store
            .list_with_delimiter(Some(&full_prefix))
            .await
            .with_context(|| format!("listing {prefix}"))?;
        Ok(ListPage {
            files: listing
                .objects
                .into_iter()
                .map(|meta| BlobMeta {
                    path: strip_root(root, meta.location.as_ref()),
                    size: meta.size,
                    e_tag: meta.e_tag,
                    last_modified: meta.last_modified,
                })
                .collect(),
            prefixes: listing
                .common_prefixes
                .into_iter()
                .map(|p| strip_root(root, p.as_ref()))
                .collect(),
        })
    }

    /// Starts a multipart upload session.
    pub async fn create_multipart(&self, obj_path: &str) -> Result<MultipartSession> {
        let upload = self
            .blob_store
            .put_multipart(&self.full_path(obj_path))
            .await
            .with_context(|| format!("starting multipart upload of {obj_path}"))?;
        Ok(MultipartSession {
            path: obj_path.to_owned(),
            started_at: Utc::now(),
            upload,
        })
    }
}

fn strip_root(root: &str, location: &str) -> String {
    if root.is_empty() {
        location.to_owned()
    } else {
        location
            .strip_prefix(root)
            .map(|rest| rest.trim_start_matches('/').to_owned())
            .unwrap_or_else(|| location.to_owned())
    }
}

/// An in-flight multipart upload.
///
/// Sessions are tracked by the engine so uploads abandoned past the TTL can
/// be aborted before the next bulk write.
pub struct MultipartSession {
    path: String,
    started_at: DateTime<Utc>,
    upload: Box<dyn MultipartUpload>,
}

impl MultipartSession {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub async fn put_part(&mut self, data: Bytes) -> Result<()> {
        self.upload
            .put_part(data.into())
            .await
            .with_context(|| format!("uploading part of {}", self.path))?;
        Ok(())
    }

    pub async fn complete(mut self) -> Result<()> {
        self.upload
            .complete()
            .await
            .with_context(|| format!("completing multipart upload of {}", self.path))?;
        Ok(())
    }

    pub async fn abort(mut self) -> Result<()> {
        self.upload
            .abort()
            .await
            .with_context(|| format!("aborting multipart upload of {}", self.path))?;
        Ok(())
    }
}
