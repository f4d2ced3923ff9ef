//! Server-side receiver for proxy-chunked uploads.
//!
//! A chunk lands at `chunks/{upload_id}/{index:06}-{chunk_id}`. The chunk id
//! is derived from `(upload_id, index)`, so a retried upload of the same
//! chunk overwrites the earlier object instead of adding a second one.

use crate::{
    errors::{UploadError, UploadResult},
    models::chunk::ChunkRef,
    storage::{DynBackend, PutOptions},
};
use bytes::Bytes;
use tracing::debug;

const CHUNK_ROOT: &str = "chunks";
const INTERMEDIATE_ROOT: &str = "intermediate";
const MAX_UPLOAD_ID_LEN: usize = 128;

/// Key prefix shared by every chunk of a session.
pub fn session_prefix(upload_id: &str) -> String {
    format!("{}/{}/", CHUNK_ROOT, upload_id)
}

/// Staging prefix swept together with the session prefix on cleanup.
pub fn intermediate_prefix(upload_id: &str) -> String {
    format!("{}/{}/", INTERMEDIATE_ROOT, upload_id)
}

pub fn chunk_id(upload_id: &str, index: u32) -> String {
    let digest = md5::compute(format!("{}/{}", upload_id, index));
    format!("{:x}", digest)[..16].to_string()
}

pub fn chunk_key(upload_id: &str, index: u32) -> String {
    format!(
        "{}{:06}-{}",
        session_prefix(upload_id),
        index,
        chunk_id(upload_id, index)
    )
}

/// Numeric index embedded in a chunk key under `prefix`.
///
/// Indices past 999999 widen the zero-padded field, so lexicographic listing
/// order is not numeric order; callers sort on this value instead.
pub fn parse_chunk_index(key: &str, prefix: &str) -> Option<u32> {
    let name = key.strip_prefix(prefix)?;
    let (index, _chunk_id) = name.split_once('-')?;
    if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    index.parse().ok()
}

/// Upload ids are client-generated; keep them to a key-safe alphabet.
pub fn validate_upload_id(upload_id: &str) -> UploadResult<()> {
    let well_formed = !upload_id.is_empty()
        && upload_id.len() <= MAX_UPLOAD_ID_LEN
        && upload_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if well_formed {
        Ok(())
    } else {
        Err(UploadError::InvalidChunk("malformed upload id".into()))
    }
}

#[derive(Clone)]
pub struct ChunkStore {
    backend: DynBackend,
}

impl ChunkStore {
    pub fn new(backend: DynBackend) -> Self {
        Self { backend }
    }

    /// Persist one chunk. No ordering or completeness checks happen here.
    pub async fn store_chunk(
        &self,
        upload_id: &str,
        index: i64,
        bytes: Bytes,
    ) -> UploadResult<ChunkRef> {
        validate_upload_id(upload_id)?;
        let index = u32::try_from(index)
            .map_err(|_| UploadError::InvalidChunk(format!("chunk index {} out of range", index)))?;
        if bytes.is_empty() {
            return Err(UploadError::InvalidChunk("chunk payload is empty".into()));
        }

        let key = chunk_key(upload_id, index);
        let stored = self
            .backend
            .put(
                &key,
                bytes,
                &PutOptions {
                    content_type: Some("application/octet-stream".into()),
                    cache_control: None,
                },
            )
            .await?;
        debug!(upload_id, index, size = stored.size, "stored chunk");

        Ok(ChunkRef {
            chunk_id: chunk_id(upload_id, index),
            index,
            size: stored.size,
        })
    }
}
