//! Pluggable object backend.
//!
//! Everything above this module (chunk store, assembly, façade) talks to
//! storage only through [`ObjectBackend`], whose surface mirrors the S3
//! object and multipart vocabulary.

pub mod local;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use std::{io, sync::Arc};
use thiserror::Error;

pub use local::LocalStorage;
pub use memory::MemoryStorage;

/// S3's minimum size for every multipart part except the last.
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Page size used when a caller does not ask for one.
pub const DEFAULT_LIST_PAGE: usize = 1000;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("multipart upload `{0}` not found")]
    NoSuchUpload(String),
    #[error("part {part_number} is {size} bytes, below the {min} byte minimum")]
    EntityTooSmall {
        part_number: u32,
        size: u64,
        min: u64,
    },
    #[error("part {0} was not uploaded or its etag does not match")]
    InvalidPart(u32),
    #[error("parts must be listed in strictly ascending order")]
    InvalidPartOrder,
    #[error("invalid object key")]
    InvalidKey,
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Summary of one listed object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
}

/// One page of a prefix listing.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub objects: Vec<ObjectSummary>,
    pub next_continuation_token: Option<String>,
}

/// A fetched object with the headers it was stored with.
#[derive(Debug, Clone)]
pub struct ObjectBody {
    pub body: Bytes,
    pub etag: String,
    pub content_type: Option<String>,
    pub cache_control: Option<String>,
}

/// Headers stored with an object or a multipart upload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutOptions {
    pub content_type: Option<String>,
    pub cache_control: Option<String>,
}

/// A part accepted by the backend, as echoed back on completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Result of a finished write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub key: String,
    pub size: u64,
    pub etag: String,
}

#[async_trait]
pub trait ObjectBackend: Send + Sync {
    /// List keys starting with `prefix` in lexicographic order.
    async fn list(
        &self,
        prefix: &str,
        continuation_token: Option<String>,
    ) -> BackendResult<ListPage>;

    async fn get(&self, key: &str) -> BackendResult<ObjectBody>;

    /// Create or overwrite `key`.
    async fn put(&self, key: &str, body: Bytes, opts: &PutOptions) -> BackendResult<StoredObject>;

    /// Remove `key`. Missing keys are not an error.
    async fn delete(&self, key: &str) -> BackendResult<()>;

    /// Start a multipart upload and return its upload id.
    async fn create_multipart(&self, key: &str, opts: &PutOptions) -> BackendResult<String>;

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> BackendResult<CompletedPart>;

    /// Stitch `parts` (ascending by number) into `key`. Every part but the
    /// last must be at least [`MIN_PART_SIZE`].
    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> BackendResult<StoredObject>;

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> BackendResult<()>;
}

pub type DynBackend = Arc<dyn ObjectBackend>;

/// Walk every page under `prefix`.
pub async fn list_all(backend: &dyn ObjectBackend, prefix: &str) -> BackendResult<Vec<ObjectSummary>> {
    let mut objects = Vec::new();
    let mut token = None;
    loop {
        let page = backend.list(prefix, token).await?;
        objects.extend(page.objects);
        match page.next_continuation_token {
            Some(next) => token = Some(next),
            None => return Ok(objects),
        }
    }
}

/// Reject keys that could escape the storage root.
pub(crate) fn ensure_key_safe(key: &str) -> BackendResult<()> {
    const MAX_OBJECT_KEY_LEN: usize = 1024;

    if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
        return Err(BackendError::InvalidKey);
    }
    if key.starts_with('/') || key.contains("..") {
        return Err(BackendError::InvalidKey);
    }
    if key
        .bytes()
        .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
    {
        return Err(BackendError::InvalidKey);
    }
    Ok(())
}

/// Shared completion checks: ascending numbers, known etags, minimum sizes.
/// `lookup` returns the stored `(etag, size)` of a part.
pub(crate) fn validate_completion<F>(
    parts: &[CompletedPart],
    min_part_size: u64,
    mut lookup: F,
) -> BackendResult<()>
where
    F: FnMut(u32) -> Option<(String, u64)>,
{
    if parts.is_empty() {
        return Err(BackendError::InvalidPartOrder);
    }
    let mut previous = 0u32;
    for (position, part) in parts.iter().enumerate() {
        if part.part_number <= previous {
            return Err(BackendError::InvalidPartOrder);
        }
        previous = part.part_number;

        let (etag, size) = lookup(part.part_number).ok_or(BackendError::InvalidPart(part.part_number))?;
        if normalize_etag(&etag) != normalize_etag(&part.etag) {
            return Err(BackendError::InvalidPart(part.part_number));
        }
        let is_last = position + 1 == parts.len();
        if !is_last && size < min_part_size {
            return Err(BackendError::EntityTooSmall {
                part_number: part.part_number,
                size,
                min: min_part_size,
            });
        }
    }
    Ok(())
}

fn normalize_etag(etag: &str) -> &str {
    etag.trim_matches('"')
}

/// ETag of a multipart object: md5 over the concatenated part digests,
/// suffixed with the part count.
pub(crate) fn multipart_etag(parts: &[CompletedPart]) -> String {
    let mut ctx = md5::Context::new();
    for part in parts {
        match hex::decode(normalize_etag(&part.etag)) {
            Ok(raw) => ctx.consume(raw),
            Err(_) => ctx.consume(part.etag.as_bytes()),
        }
    }
    format!("{:x}-{}", ctx.compute(), parts.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(n: u32, etag: &str) -> CompletedPart {
        CompletedPart {
            part_number: n,
            etag: etag.into(),
        }
    }

    #[test]
    fn completion_rejects_small_non_final_parts() {
        let parts = [part(1, "a"), part(2, "b")];
        let err = validate_completion(&parts, 10, |n| Some((if n == 1 { "a" } else { "b" }.into(), 4)))
            .unwrap_err();
        assert!(matches!(err, BackendError::EntityTooSmall { part_number: 1, .. }));

        validate_completion(&parts[..1], 10, |_| Some(("a".into(), 4))).unwrap();
    }

    #[test]
    fn completion_rejects_out_of_order_and_unknown_parts() {
        let swapped = [part(2, "b"), part(1, "a")];
        assert!(matches!(
            validate_completion(&swapped, 0, |n| {
                Some((if n == 1 { "a" } else { "b" }.into(), 1))
            }),
            Err(BackendError::InvalidPartOrder)
        ));

        let unknown = [part(1, "\"zz\"")];
        assert!(matches!(
            validate_completion(&unknown, 0, |_| Some(("a".into(), 1))),
            Err(BackendError::InvalidPart(1))
        ));

        let quoted = [part(1, "\"a\"")];
        validate_completion(&quoted, 0, |_| Some(("a".into(), 1))).unwrap();
    }

    #[test]
    fn keys_cannot_escape_the_root() {
        assert!(ensure_key_safe("chunks/abc/000001-ff").is_ok());
        assert!(ensure_key_safe("/etc/passwd").is_err());
        assert!(ensure_key_safe("a/../b").is_err());
        assert!(ensure_key_safe("").is_err());
    }
}
