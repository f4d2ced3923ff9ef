//! src/storage/local.rs
//!
//! LocalStorage: the on-disk [`ObjectBackend`]. Metadata (objects, multipart
//! sessions, parts) lives in SQLite; payloads are sharded beneath
//! `base_path/{shard}/{shard}/{key}` and parts are staged under
//! `base_path/.multipart/{upload_id}/` until completion.

use super::{
    BackendError, BackendResult, CompletedPart, DEFAULT_LIST_PAGE, ListPage, MIN_PART_SIZE,
    ObjectBackend, ObjectBody, ObjectSummary, PutOptions, StoredObject, ensure_key_safe, multipart_etag,
    validate_completion,
};
use crate::models::{
    multipart::{MultipartPart, MultipartUpload},
    object::ObjectRecord,
};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt, TryStreamExt, pin_mut, stream};
use md5::Context;
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::{
    collections::HashMap,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

const STAGING_DIR: &str = ".multipart";

#[derive(Clone)]
pub struct LocalStorage {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,

    min_part_size: u64,
    page_size: usize,
}

impl LocalStorage {
    /// Create a LocalStorage backed by the provided SQLite pool and using
    /// `base_path` as the root directory for payloads.
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
            min_part_size: MIN_PART_SIZE,
            page_size: DEFAULT_LIST_PAGE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.clamp(1, DEFAULT_LIST_PAGE);
        self
    }

    /// Two-level shard identifiers for a key: the first two bytes of
    /// MD5(key) as lowercase hex. Keeps directory fan-out bounded.
    fn object_shards(key: &str) -> (String, String) {
        let digest = md5::compute(key);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(key);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    fn staging_root(&self, upload_id: &str) -> PathBuf {
        self.base_path.join(STAGING_DIR).join(upload_id)
    }

    fn part_path(&self, upload_id: &str, part_number: u32) -> PathBuf {
        self.staging_root(upload_id)
            .join(format!("{:05}", part_number))
    }

    /// Stream bytes into `dest` through a temp file in the same directory.
    ///
    /// Computes size and MD5 while writing, fsyncs, then renames into place.
    /// The temp file is removed on any error.
    async fn write_atomic<S>(&self, dest: &Path, stream: S) -> BackendResult<(u64, String)>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let parent = dest.parent().map(Path::to_path_buf).ok_or_else(|| {
            BackendError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size_bytes: u64 = 0;
        let mut digest = Context::new();
        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(BackendError::Io(err));
                }
            };
            size_bytes += chunk.len() as u64;
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(BackendError::Io(err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(BackendError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(BackendError::Io(err));
        }

        if let Err(err) = fs::rename(&tmp_path, dest).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(dest).await?;
                fs::rename(&tmp_path, dest).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(BackendError::Io(err));
            }
        }

        Ok((size_bytes, format!("{:x}", digest.compute())))
    }

    /// Insert or overwrite the metadata row for `key`.
    async fn upsert_object(
        &self,
        key: &str,
        size: u64,
        etag: &str,
        opts: &PutOptions,
    ) -> BackendResult<()> {
        sqlx::query(
            r#"
            INSERT INTO objects (id, key, content_type, cache_control, size_bytes, etag, last_modified)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                content_type = excluded.content_type,
                cache_control = excluded.cache_control,
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                last_modified = excluded.last_modified
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(key)
        .bind(opts.content_type.as_deref())
        .bind(opts.cache_control.as_deref())
        .bind(size as i64)
        .bind(etag)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    /// Fetch an object's metadata row, or NotFound.
    async fn fetch_object(&self, key: &str) -> BackendResult<ObjectRecord> {
        sqlx::query_as::<_, ObjectRecord>(
            "SELECT id, key, content_type, cache_control, size_bytes, etag, last_modified
             FROM objects WHERE key = ?",
        )
        .bind(key)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| BackendError::NotFound(key.to_string()))
    }

    async fn fetch_upload(&self, key: &str, upload_id: &str) -> BackendResult<MultipartUpload> {
        sqlx::query_as::<_, MultipartUpload>(
            "SELECT upload_id, key, content_type, cache_control, initiated_at
             FROM multipart_uploads WHERE upload_id = ? AND key = ?",
        )
        .bind(upload_id)
        .bind(key)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| BackendError::NoSuchUpload(upload_id.to_string()))
    }

    /// Drop the session rows and its staging directory.
    async fn discard_upload(&self, upload_id: &str) -> BackendResult<()> {
        sqlx::query("DELETE FROM multipart_parts WHERE upload_id = ?")
            .bind(upload_id)
            .execute(&*self.db)
            .await?;
        sqlx::query("DELETE FROM multipart_uploads WHERE upload_id = ?")
            .bind(upload_id)
            .execute(&*self.db)
            .await?;

        let staging = self.staging_root(upload_id);
        if let Err(err) = fs::remove_dir_all(&staging).await {
            if err.kind() != ErrorKind::NotFound {
                debug!(
                    "failed to remove staging directory {}: {}",
                    staging.display(),
                    err
                );
            }
        }
        Ok(())
    }

    /// Recursively remove empty directories up to `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ObjectBackend for LocalStorage {
    async fn list(
        &self,
        prefix: &str,
        continuation_token: Option<String>,
    ) -> BackendResult<ListPage> {
        let fetch_limit = self.page_size + 1;

        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT key, size_bytes FROM objects WHERE substr(key, 1, ",
        );
        builder.push_bind(prefix.chars().count() as i64);
        builder.push(") = ");
        builder.push_bind(prefix.to_string());

        if let Some(token) = continuation_token.as_deref().map(decode_continuation_token) {
            builder.push(" AND key > ");
            builder.push_bind(token);
        }

        builder.push(" ORDER BY key ASC LIMIT ");
        builder.push_bind(fetch_limit as i64);

        let mut rows: Vec<(String, i64)> = builder.build_query_as().fetch_all(&*self.db).await?;

        let mut next_continuation_token = None;
        if rows.len() == fetch_limit {
            rows.pop();
            next_continuation_token = rows.last().map(|(key, _)| encode_continuation_token(key));
        }

        Ok(ListPage {
            objects: rows
                .into_iter()
                .map(|(key, size)| ObjectSummary {
                    key,
                    size: size.max(0) as u64,
                })
                .collect(),
            next_continuation_token,
        })
    }

    async fn get(&self, key: &str) -> BackendResult<ObjectBody> {
        ensure_key_safe(key)?;
        let record = self.fetch_object(key).await?;

        match fs::read(self.object_path(key)).await {
            Ok(bytes) => Ok(ObjectBody {
                body: Bytes::from(bytes),
                etag: record.etag,
                content_type: record.content_type,
                cache_control: record.cache_control,
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(BackendError::NotFound(key.to_string()))
            }
            Err(err) => Err(BackendError::Io(err)),
        }
    }

    async fn put(&self, key: &str, body: Bytes, opts: &PutOptions) -> BackendResult<StoredObject> {
        ensure_key_safe(key)?;
        let file_path = self.object_path(key);
        let (size, etag) = self
            .write_atomic(&file_path, stream::iter([Ok::<_, io::Error>(body)]))
            .await?;

        if let Err(err) = self.upsert_object(key, size, &etag, opts).await {
            let _ = fs::remove_file(&file_path).await;
            return Err(err);
        }

        Ok(StoredObject {
            key: key.to_string(),
            size,
            etag,
        })
    }

    async fn delete(&self, key: &str) -> BackendResult<()> {
        ensure_key_safe(key)?;
        sqlx::query("DELETE FROM objects WHERE key = ?")
            .bind(key)
            .execute(&*self.db)
            .await?;

        let file_path = self.object_path(key);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(BackendError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent, &self.base_path).await;
        }
        Ok(())
    }

    async fn create_multipart(&self, key: &str, opts: &PutOptions) -> BackendResult<String> {
        ensure_key_safe(key)?;
        let upload_id = Uuid::new_v4().simple().to_string();
        fs::create_dir_all(self.staging_root(&upload_id)).await?;

        sqlx::query(
            "INSERT INTO multipart_uploads (upload_id, key, content_type, cache_control, initiated_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&upload_id)
        .bind(key)
        .bind(opts.content_type.as_deref())
        .bind(opts.cache_control.as_deref())
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;

        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> BackendResult<CompletedPart> {
        if part_number == 0 {
            return Err(BackendError::InvalidPart(part_number));
        }
        self.fetch_upload(key, upload_id).await?;

        let (size, etag) = self
            .write_atomic(
                &self.part_path(upload_id, part_number),
                stream::iter([Ok::<_, io::Error>(body)]),
            )
            .await?;

        sqlx::query(
            "INSERT INTO multipart_parts (upload_id, part_number, size_bytes, etag, uploaded_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(upload_id, part_number) DO UPDATE SET
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                uploaded_at = excluded.uploaded_at",
        )
        .bind(upload_id)
        .bind(part_number as i64)
        .bind(size as i64)
        .bind(&etag)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;

        Ok(CompletedPart { part_number, etag })
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> BackendResult<StoredObject> {
        let upload = self.fetch_upload(key, upload_id).await?;
        let stored: HashMap<u32, MultipartPart> = sqlx::query_as::<_, MultipartPart>(
            "SELECT upload_id, part_number, size_bytes, etag, uploaded_at
             FROM multipart_parts WHERE upload_id = ?",
        )
        .bind(upload_id)
        .fetch_all(&*self.db)
        .await?
        .into_iter()
        .map(|part| (part.part_number as u32, part))
        .collect();

        validate_completion(parts, self.min_part_size, |n| {
            stored
                .get(&n)
                .map(|p| (p.etag.clone(), p.size_bytes.max(0) as u64))
        })?;

        let paths: Vec<PathBuf> = parts
            .iter()
            .map(|p| self.part_path(upload_id, p.part_number))
            .collect();
        let body = stream::iter(paths)
            .then(File::open)
            .map_ok(ReaderStream::new)
            .try_flatten();

        let file_path = self.object_path(key);
        let (size, _) = self.write_atomic(&file_path, body).await?;
        let etag = multipart_etag(parts);
        let opts = PutOptions {
            content_type: upload.content_type,
            cache_control: upload.cache_control,
        };
        if let Err(err) = self.upsert_object(key, size, &etag, &opts).await {
            let _ = fs::remove_file(&file_path).await;
            return Err(err);
        }

        self.discard_upload(upload_id).await?;
        debug!(key, upload_id, parts = parts.len(), size, "completed multipart upload");

        Ok(StoredObject {
            key: key.to_string(),
            size,
            etag,
        })
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> BackendResult<()> {
        self.fetch_upload(key, upload_id).await?;
        self.discard_upload(upload_id).await
    }
}

fn encode_continuation_token(key: &str) -> String {
    general_purpose::STANDARD.encode(key)
}

fn decode_continuation_token(token: &str) -> String {
    general_purpose::STANDARD
        .decode(token)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, storage::list_all};
    use tempfile::TempDir;

    async fn storage() -> (LocalStorage, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = db::connect("sqlite::memory:").await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        (LocalStorage::new(Arc::new(pool), dir.path()), dir)
    }

    #[tokio::test]
    async fn put_get_overwrite_and_delete() {
        let (storage, _dir) = storage().await;
        let opts = PutOptions {
            content_type: Some("text/plain".into()),
            cache_control: None,
        };

        let first = storage.put("a/b.txt", Bytes::from_static(b"one"), &opts).await.unwrap();
        assert_eq!(first.etag, format!("{:x}", md5::compute(b"one")));
        storage.put("a/b.txt", Bytes::from_static(b"two!"), &opts).await.unwrap();
        let fetched = storage.get("a/b.txt").await.unwrap();
        assert_eq!(fetched.body, Bytes::from_static(b"two!"));
        assert_eq!(fetched.content_type.as_deref(), Some("text/plain"));
        assert_eq!(list_all(&storage, "a/").await.unwrap().len(), 1);

        storage.delete("a/b.txt").await.unwrap();
        storage.delete("a/b.txt").await.unwrap();
        assert!(matches!(storage.get("a/b.txt").await, Err(BackendError::NotFound(_))));
    }

    #[tokio::test]
    async fn list_pages_through_prefix_only() {
        let (storage, _dir) = storage().await;
        let storage = storage.with_page_size(2);
        for key in ["s/3", "s/1", "t/1", "s/2", "s_x"] {
            storage
                .put(key, Bytes::from_static(b"x"), &PutOptions::default())
                .await
                .unwrap();
        }

        let page = storage.list("s/", None).await.unwrap();
        assert_eq!(page.objects.len(), 2);
        assert!(page.next_continuation_token.is_some());

        let keys: Vec<_> = list_all(&storage, "s/")
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.key)
            .collect();
        assert_eq!(keys, ["s/1", "s/2", "s/3"]);
    }

    #[tokio::test]
    async fn multipart_enforces_minimum_and_stitches_parts() {
        let (storage, _dir) = storage().await;
        let opts = PutOptions {
            content_type: Some("video/mp4".into()),
            cache_control: Some("max-age=60".into()),
        };
        let id = storage.create_multipart("asset", &opts).await.unwrap();

        let small = storage
            .upload_part("asset", &id, 1, Bytes::from_static(b"tiny"))
            .await
            .unwrap();
        let tail = storage
            .upload_part("asset", &id, 2, Bytes::from_static(b"tail"))
            .await
            .unwrap();
        let err = storage
            .complete_multipart("asset", &id, &[small, tail.clone()])
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::EntityTooSmall { part_number: 1, .. }));

        let big = Bytes::from(vec![7u8; MIN_PART_SIZE as usize]);
        let first = storage.upload_part("asset", &id, 1, big.clone()).await.unwrap();
        let done = storage
            .complete_multipart("asset", &id, &[first, tail])
            .await
            .unwrap();
        assert_eq!(done.size, MIN_PART_SIZE + 4);

        let fetched = storage.get("asset").await.unwrap();
        assert_eq!(fetched.cache_control.as_deref(), Some("max-age=60"));
        let body = fetched.body;
        assert_eq!(&body[..big.len()], &big[..]);
        assert_eq!(&body[big.len()..], b"tail");
        assert!(!storage.staging_root(&id).exists());
        assert!(matches!(
            storage.abort_multipart("asset", &id).await,
            Err(BackendError::NoSuchUpload(_))
        ));
    }
}
