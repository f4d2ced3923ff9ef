//! Temporary chunk references handed back to uploading clients.

use serde::{Deserialize, Serialize};

/// Receipt for a stored chunk.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRef {
    /// Dedup token embedded in the storage key.
    pub chunk_id: String,

    /// Position of the chunk in the file.
    pub index: u32,

    /// Payload size in bytes.
    pub size: u64,
}
