//! Multipart upload sessions and their parts, as tracked by the local backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A multipart upload session, initiated before uploading large files in parts.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct MultipartUpload {
    /// Unique upload ID (returned to client).
    pub upload_id: String,

    /// Object key being uploaded.
    pub key: String,

    pub content_type: Option<String>,

    pub cache_control: Option<String>,

    /// Timestamp when upload was initiated.
    pub initiated_at: DateTime<Utc>,
}

/// Represents a single uploaded part in a multipart upload session.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct MultipartPart {
    /// Parent upload session.
    pub upload_id: String,

    /// Part number (1-based).
    pub part_number: i64,

    /// Size in bytes.
    pub size_bytes: i64,

    /// MD5 hex digest of the part payload.
    pub etag: String,

    /// Timestamp when this part was uploaded.
    pub uploaded_at: DateTime<Utc>,
}
