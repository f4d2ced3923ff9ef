//! Metadata row for an object held by the local backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// One stored object. The payload itself lives on disk.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct ObjectRecord {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Object key (path-like identifier).
    pub key: String,

    /// Content type (MIME type).
    pub content_type: Option<String>,

    /// `Cache-Control` header to serve the object with.
    pub cache_control: Option<String>,

    /// Size in bytes.
    pub size_bytes: i64,

    /// MD5 hex digest, or `{digest}-{parts}` for multipart objects.
    pub etag: String,

    pub last_modified: DateTime<Utc>,
}
