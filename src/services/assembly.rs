//! Assembly of a proxy-chunked upload into one durable object.
//!
//! The engine runs `Listing → Verifying → MergingParts → Completing → Done`.
//! Any error moves it to `Failed`, which aborts the backend multipart upload
//! and sweeps the session's temporary chunks before the error is returned.
//!
//! Chunks are sized for the request-body ceiling, not for the backend's part
//! minimum, so consecutive chunks are merged `merge_batch_size` at a time
//! into each part.

use crate::{
    codec::MERGE_BATCH_SIZE,
    errors::{UploadError, UploadResult},
    models::asset::{Asset, asset_key},
    retry::RetryPolicy,
    services::{
        chunk_store::{parse_chunk_index, session_prefix, validate_upload_id},
        cleanup::SessionCleanup,
    },
    storage::{CompletedPart, DynBackend, MIN_PART_SIZE, ObjectSummary, PutOptions, list_all},
};
use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashSet},
    fmt,
    sync::{Arc, Mutex},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Cache header stamped on assembled objects; they never change.
pub const IMMUTABLE_CACHE_CONTROL: &str = "public, max-age=31536000, immutable";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyState {
    Listing,
    Verifying,
    MergingParts,
    Completing,
    Done,
    Failed,
}

impl fmt::Display for AssemblyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Listing => "listing chunks",
            Self::Verifying => "verifying chunks",
            Self::MergingParts => "merging parts",
            Self::Completing => "completing upload",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// The combine call of a proxy-chunked upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssemblyRequest {
    pub upload_id: String,
    pub file_name: String,
    pub content_type: String,
    pub total_chunks: u64,
    pub chunk_size: u64,
}

#[derive(Debug, Clone)]
pub struct AssemblyConfig {
    pub merge_batch_size: usize,
    pub min_part_size: u64,
    pub verify_policy: RetryPolicy,
    pub cache_control: String,
    /// Base URL the assembled asset is served from.
    pub public_url: String,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            merge_batch_size: MERGE_BATCH_SIZE,
            min_part_size: MIN_PART_SIZE,
            verify_policy: RetryPolicy::listing_consistency(),
            cache_control: IMMUTABLE_CACHE_CONTROL.to_string(),
            public_url: "http://127.0.0.1:3000".to_string(),
        }
    }
}

/// A listed chunk with its parsed index.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ListedChunk {
    index: u32,
    key: String,
    size: u64,
}

/// Upload ids with an assembly running in this process. Shared by every
/// clone of the engine.
#[derive(Clone, Default)]
struct SessionClaims {
    active: Arc<Mutex<HashSet<String>>>,
}

impl SessionClaims {
    /// `None` while another assembly holds `upload_id`.
    fn try_claim(&self, upload_id: &str) -> Option<SessionClaim> {
        let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        if !active.insert(upload_id.to_string()) {
            return None;
        }
        Some(SessionClaim {
            active: Arc::clone(&self.active),
            upload_id: upload_id.to_string(),
        })
    }
}

/// RAII guard that releases the upload id on drop.
struct SessionClaim {
    active: Arc<Mutex<HashSet<String>>>,
    upload_id: String,
}

impl Drop for SessionClaim {
    fn drop(&mut self) {
        let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        active.remove(&self.upload_id);
    }
}

#[derive(Clone)]
pub struct AssemblyEngine {
    backend: DynBackend,
    cleanup: SessionCleanup,
    config: AssemblyConfig,
    claims: SessionClaims,
}

impl AssemblyEngine {
    pub fn new(backend: DynBackend, config: AssemblyConfig) -> Self {
        Self {
            cleanup: SessionCleanup::new(backend.clone()),
            backend,
            config,
            claims: SessionClaims::default(),
        }
    }

    pub fn config(&self) -> &AssemblyConfig {
        &self.config
    }

    /// Assemble the chunks of `req.upload_id` into a fresh asset.
    ///
    /// Never returns an asset for an incomplete object. On failure the
    /// session's chunks are gone; the client has to upload again.
    ///
    /// A session is assembled at most once at a time: a concurrent call for
    /// the same upload id gets [`UploadError::AssemblyInProgress`] and leaves
    /// the running assembly and its chunks alone.
    pub async fn assemble(&self, req: &AssemblyRequest) -> UploadResult<Asset> {
        self.validate(req)?;
        let upload_id = req.upload_id.as_str();
        let Some(_claim) = self.claims.try_claim(upload_id) else {
            warn!(upload_id, "assembly already running for this session");
            return Err(UploadError::AssemblyInProgress(upload_id.to_string()));
        };
        info!(
            upload_id,
            total_chunks = req.total_chunks,
            chunk_size = req.chunk_size,
            "assembling upload"
        );

        let chunks = match self.collect_chunks(req).await {
            Ok(chunks) => chunks,
            Err(err) => return Err(self.fail(upload_id, None, err).await),
        };

        let asset_id = Uuid::new_v4();
        let key = asset_key(asset_id);
        let multipart_id = match self.begin_multipart(req, &key).await {
            Ok(id) => id,
            Err(err) => return Err(self.fail(upload_id, None, err).await),
        };

        let asset = match self.merge_and_complete(req, &key, &multipart_id, &chunks).await {
            Ok(size) => {
                let asset = Asset::new(asset_id, &self.config.public_url, &req.file_name, &req.content_type);
                info!(upload_id, asset_id = %asset_id, size, state = %AssemblyState::Done, "assembled upload");
                asset
            }
            Err(err) => {
                return Err(self.fail(upload_id, Some((&key, &multipart_id)), err).await);
            }
        };

        // Stray objects (e.g. indices past total_chunks) go with the session.
        self.cleanup.abort_quietly(upload_id).await;
        Ok(asset)
    }

    fn validate(&self, req: &AssemblyRequest) -> UploadResult<()> {
        validate_upload_id(&req.upload_id)
            .map_err(|_| UploadError::InvalidRequest("malformed upload id".into()))?;
        if req.file_name.trim().is_empty() {
            return Err(UploadError::InvalidRequest("file name is required".into()));
        }
        if req.total_chunks == 0 || req.total_chunks > u64::from(u32::MAX) {
            return Err(UploadError::InvalidRequest("total chunks out of range".into()));
        }
        if req.chunk_size == 0 {
            return Err(UploadError::InvalidRequest("chunk size must be positive".into()));
        }
        let batch = self.config.merge_batch_size.max(1) as u64;
        if req.total_chunks > batch && req.chunk_size.saturating_mul(batch) < self.config.min_part_size {
            return Err(UploadError::InvalidRequest(format!(
                "chunk size must be at least {} bytes",
                self.config.min_part_size.div_ceil(batch)
            )));
        }
        Ok(())
    }

    /// Listing + Verifying: list until the expected chunk count shows up or
    /// the policy runs out of attempts, then check per-chunk sizes.
    async fn collect_chunks(&self, req: &AssemblyRequest) -> UploadResult<Vec<ListedChunk>> {
        let upload_id = req.upload_id.as_str();
        let prefix = session_prefix(upload_id);
        let policy = &self.config.verify_policy;
        let mut attempts = 0u32;

        let chunks = loop {
            debug!(upload_id, attempt = attempts, state = %AssemblyState::Listing);
            let listed = list_all(self.backend.as_ref(), &prefix).await.map_err(|err| {
                error!(upload_id, error = %err, "listing chunks failed");
                UploadError::Assembly {
                    stage: AssemblyState::Listing,
                    reason: "could not list uploaded chunks".into(),
                }
            })?;
            attempts += 1;

            let chunks = index_chunks(listed, &prefix, req.total_chunks);
            let found = chunks.len() as u64;
            if found == req.total_chunks {
                break chunks;
            }
            if !policy.allows_retry(attempts) {
                warn!(upload_id, expected = req.total_chunks, found, attempts, "chunk count never matched");
                return Err(UploadError::ChunkCountMismatch {
                    expected: req.total_chunks,
                    found,
                });
            }
            debug!(
                upload_id,
                expected = req.total_chunks,
                found,
                state = %AssemblyState::Verifying,
                "chunk listing behind, retrying"
            );
            policy.wait(attempts - 1).await;
        };

        verify_sizes(&chunks, req.chunk_size)?;
        Ok(chunks)
    }

    async fn begin_multipart(&self, req: &AssemblyRequest, key: &str) -> UploadResult<String> {
        let opts = PutOptions {
            content_type: Some(req.content_type.clone()),
            cache_control: Some(self.config.cache_control.clone()),
        };
        self.backend.create_multipart(key, &opts).await.map_err(|err| {
            error!(upload_id = %req.upload_id, error = %err, "create multipart failed");
            UploadError::Assembly {
                stage: AssemblyState::MergingParts,
                reason: "could not start the multipart upload".into(),
            }
        })
    }

    /// MergingParts + Completing. Returns the final object size.
    async fn merge_and_complete(
        &self,
        req: &AssemblyRequest,
        key: &str,
        multipart_id: &str,
        chunks: &[ListedChunk],
    ) -> UploadResult<u64> {
        let upload_id = req.upload_id.as_str();
        let batch_size = self.config.merge_batch_size.max(1);
        let mut parts = Vec::with_capacity(chunks.len().div_ceil(batch_size));

        for (batch_no, batch) in chunks.chunks(batch_size).enumerate() {
            let part_number = batch_no as u32 + 1;
            let mut payload = BytesMut::with_capacity(batch.iter().map(|c| c.size as usize).sum());
            for chunk in batch {
                let object = self.backend.get(&chunk.key).await.map_err(|err| {
                    error!(upload_id, index = chunk.index, error = %err, "chunk download failed");
                    UploadError::Assembly {
                        stage: AssemblyState::MergingParts,
                        reason: format!("could not read chunk {}", chunk.index),
                    }
                })?;
                payload.extend_from_slice(&object.body);
            }

            let size = payload.len();
            let part = self
                .backend
                .upload_part(key, multipart_id, part_number, payload.freeze())
                .await
                .map_err(|err| {
                    error!(upload_id, part_number, error = %err, "part upload failed");
                    UploadError::Assembly {
                        stage: AssemblyState::MergingParts,
                        reason: format!("could not upload part {}", part_number),
                    }
                })?;
            debug!(upload_id, part_number, size, chunks = batch.len(), "uploaded part");
            parts.push(part);

            for chunk in batch {
                if let Err(err) = self.backend.delete(&chunk.key).await {
                    warn!(upload_id, index = chunk.index, error = %err, "failed to delete merged chunk");
                }
            }
        }

        debug!(upload_id, parts = parts.len(), state = %AssemblyState::Completing);
        parts.sort_by_key(|p: &CompletedPart| p.part_number);
        let stored = self
            .backend
            .complete_multipart(key, multipart_id, &parts)
            .await
            .map_err(|err| {
                error!(upload_id, error = %err, "complete multipart failed");
                UploadError::Assembly {
                    stage: AssemblyState::Completing,
                    reason: "could not finalize the upload".into(),
                }
            })?;

        let expected: u64 = chunks.iter().map(|c| c.size).sum();
        if stored.size != expected {
            error!(upload_id, expected, actual = stored.size, "assembled size mismatch");
            if let Err(err) = self.backend.delete(key).await {
                warn!(upload_id, error = %err, "failed to remove mis-sized object");
            }
            return Err(UploadError::Assembly {
                stage: AssemblyState::Completing,
                reason: "assembled object has the wrong size".into(),
            });
        }
        Ok(stored.size)
    }

    /// Enter `Failed`: abort the multipart upload if one was started, sweep
    /// the session, and hand back the original error.
    async fn fail(
        &self,
        upload_id: &str,
        multipart: Option<(&str, &str)>,
        err: UploadError,
    ) -> UploadError {
        error!(upload_id, error = %err, state = %AssemblyState::Failed, "assembly failed");
        if let Some((key, multipart_id)) = multipart {
            if let Err(abort_err) = self.cleanup.abort_multipart(key, multipart_id).await {
                warn!(upload_id, error = %abort_err, "failed to abort multipart upload");
            }
        }
        self.cleanup.abort_quietly(upload_id).await;
        err
    }
}

/// Parse, dedupe and numerically sort listed chunk keys, ignoring anything
/// that is not a chunk of this session or lies past `total_chunks`.
fn index_chunks(listed: Vec<ObjectSummary>, prefix: &str, total_chunks: u64) -> Vec<ListedChunk> {
    let mut by_index = BTreeMap::new();
    for object in listed {
        let Some(index) = parse_chunk_index(&object.key, prefix) else {
            continue;
        };
        if u64::from(index) >= total_chunks {
            continue;
        }
        by_index.insert(
            index,
            ListedChunk {
                index,
                key: object.key,
                size: object.size,
            },
        );
    }
    by_index.into_values().collect()
}

/// Every chunk but the last is exactly `chunk_size`; the last is non-empty
/// and no larger.
fn verify_sizes(chunks: &[ListedChunk], chunk_size: u64) -> UploadResult<()> {
    let Some((last, init)) = chunks.split_last() else {
        return Ok(());
    };
    if let Some(bad) = init.iter().find(|c| c.size != chunk_size) {
        return Err(UploadError::Assembly {
            stage: AssemblyState::Verifying,
            reason: format!("chunk {} has {} bytes, expected {}", bad.index, bad.size, chunk_size),
        });
    }
    if last.size == 0 || last.size > chunk_size {
        return Err(UploadError::Assembly {
            stage: AssemblyState::Verifying,
            reason: format!("final chunk {} has {} bytes", last.index, last.size),
        });
    }
    Ok(())
}
