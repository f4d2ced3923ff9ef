//! UploadService: the façade feature code talks to.
//!
//! Three strategies end in the same [`Asset`] descriptor:
//! - direct presigned PUT (`presign` + `accept_presigned_put`)
//! - client-driven multipart (`initiate_multipart` … `complete_multipart`)
//! - proxy-chunked (`store_chunk` … `combine`), backed by the assembly engine

use crate::{
    errors::{UploadError, UploadResult},
    models::{
        asset::{Asset, AssetType, asset_key, asset_url},
        chunk::ChunkRef,
    },
    services::{
        assembly::{AssemblyConfig, AssemblyEngine, AssemblyRequest},
        chunk_store::ChunkStore,
        cleanup::{CleanupReport, SessionCleanup},
        signing::{PRESIGN_TTL_SECS, PutGrant, UrlSigner},
    },
    storage::{CompletedPart, DynBackend, ObjectBody, PutOptions, StoredObject},
};
use bytes::Bytes;
use chrono::Utc;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignRequest {
    pub file_name: String,
    pub content_type: String,
    pub file_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PresignedUpload {
    pub upload_url: String,
    pub asset_id: Uuid,
    pub asset_url: String,
    pub asset_type: AssetType,
}

/// Query string carried by a presigned URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignedQuery {
    pub content_type: String,
    pub size: u64,
    pub expires: i64,
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateMultipartRequest {
    pub file_name: String,
    pub content_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MultipartSession {
    pub file_id: Uuid,
    pub upload_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PartReceipt {
    pub part_number: u32,
    #[serde(rename = "eTag")]
    pub e_tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteMultipartRequest {
    pub file_id: Uuid,
    pub upload_id: String,
    pub file_name: String,
    pub content_type: String,
    pub parts: Vec<PartReceipt>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortMultipartRequest {
    pub file_id: Uuid,
    pub upload_id: String,
}

/// Knobs of the façade that are not assembly settings.
#[derive(Debug, Clone)]
pub struct UploadSettings {
    /// Largest object accepted through a presigned PUT or a single part.
    pub max_direct_upload: u64,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            max_direct_upload: 100 * 1024 * 1024,
        }
    }
}

#[derive(Clone)]
pub struct UploadService {
    backend: DynBackend,
    chunks: ChunkStore,
    engine: AssemblyEngine,
    cleanup: SessionCleanup,
    signer: Arc<UrlSigner>,
    settings: UploadSettings,
}

impl UploadService {
    pub fn new(
        backend: DynBackend,
        assembly: AssemblyConfig,
        signer: UrlSigner,
        settings: UploadSettings,
    ) -> Self {
        Self {
            chunks: ChunkStore::new(backend.clone()),
            engine: AssemblyEngine::new(backend.clone(), assembly),
            cleanup: SessionCleanup::new(backend.clone()),
            backend,
            signer: Arc::new(signer),
            settings,
        }
    }

    pub fn backend(&self) -> &DynBackend {
        &self.backend
    }

    fn public_url(&self) -> &str {
        &self.engine.config().public_url
    }

    // --- proxy-chunked ---

    pub async fn store_chunk(&self, upload_id: &str, index: i64, bytes: Bytes) -> UploadResult<ChunkRef> {
        self.chunks.store_chunk(upload_id, index, bytes).await
    }

    pub async fn combine(&self, req: &AssemblyRequest) -> UploadResult<Asset> {
        self.engine.assemble(req).await
    }

    pub async fn abort_session(&self, upload_id: &str) -> UploadResult<CleanupReport> {
        let report = self.cleanup.abort(upload_id).await?;
        info!(upload_id, deleted = report.deleted, "aborted chunked upload");
        Ok(report)
    }

    // --- direct presigned PUT ---

    pub fn presign(&self, req: &PresignRequest) -> UploadResult<PresignedUpload> {
        require_name(&req.file_name)?;
        if req.file_size == 0 || req.file_size > self.settings.max_direct_upload {
            return Err(UploadError::InvalidRequest(format!(
                "file size must be between 1 and {} bytes",
                self.settings.max_direct_upload
            )));
        }

        let asset_id = Uuid::new_v4();
        let key = asset_key(asset_id);
        let expires = Utc::now().timestamp() + PRESIGN_TTL_SECS;
        let signature = self.signer.sign(&PutGrant {
            key: &key,
            content_type: &req.content_type,
            size: req.file_size,
            expires,
        });

        let base = format!("{}/storage/{}", self.public_url().trim_end_matches('/'), asset_id);
        let upload_url = Url::parse_with_params(
            &base,
            [
                ("contentType", req.content_type.clone()),
                ("size", req.file_size.to_string()),
                ("expires", expires.to_string()),
                ("signature", signature),
            ],
        )
        .map_err(|_| UploadError::InvalidRequest("public url is not a valid base url".into()))?;

        Ok(PresignedUpload {
            upload_url: upload_url.to_string(),
            asset_id,
            asset_url: asset_url(self.public_url(), asset_id),
            asset_type: AssetType::from_content_type(&req.content_type),
        })
    }

    /// Target of a presigned URL: verify the grant, then store the body.
    pub async fn accept_presigned_put(
        &self,
        asset_id: Uuid,
        query: &PresignedQuery,
        body: Bytes,
    ) -> UploadResult<StoredObject> {
        let key = asset_key(asset_id);
        let grant = PutGrant {
            key: &key,
            content_type: &query.content_type,
            size: query.size,
            expires: query.expires,
        };
        if !self.signer.verify(&grant, &query.signature) {
            return Err(UploadError::InvalidSignature);
        }
        if Utc::now().timestamp() > query.expires {
            return Err(UploadError::UrlExpired);
        }
        if body.len() as u64 != query.size {
            return Err(UploadError::InvalidRequest(format!(
                "body is {} bytes, url was signed for {}",
                body.len(),
                query.size
            )));
        }

        let stored = self.backend.put(&key, body, &self.immutable(&query.content_type)).await?;
        info!(asset_id = %asset_id, size = stored.size, "stored presigned upload");
        Ok(stored)
    }

    // --- client-driven multipart ---

    pub async fn initiate_multipart(&self, req: &InitiateMultipartRequest) -> UploadResult<MultipartSession> {
        require_name(&req.file_name)?;
        let file_id = Uuid::new_v4();
        let upload_id = self
            .backend
            .create_multipart(&asset_key(file_id), &self.immutable(&req.content_type))
            .await?;
        info!(file_id = %file_id, upload_id, "initiated multipart upload");
        Ok(MultipartSession { file_id, upload_id })
    }

    pub async fn upload_part(
        &self,
        file_id: Uuid,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> UploadResult<PartReceipt> {
        if part_number == 0 || part_number > 10_000 {
            return Err(UploadError::InvalidRequest("part number must be in 1..=10000".into()));
        }
        if body.is_empty() {
            return Err(UploadError::InvalidRequest("part payload is empty".into()));
        }
        let part = self
            .backend
            .upload_part(&asset_key(file_id), upload_id, part_number, body)
            .await?;
        Ok(PartReceipt {
            part_number: part.part_number,
            e_tag: part.etag,
        })
    }

    pub async fn complete_multipart(&self, req: &CompleteMultipartRequest) -> UploadResult<Asset> {
        require_name(&req.file_name)?;
        let mut parts: Vec<CompletedPart> = req
            .parts
            .iter()
            .map(|p| CompletedPart {
                part_number: p.part_number,
                etag: p.e_tag.clone(),
            })
            .collect();
        parts.sort_by_key(|p| p.part_number);

        let stored = self
            .backend
            .complete_multipart(&asset_key(req.file_id), &req.upload_id, &parts)
            .await?;
        info!(file_id = %req.file_id, size = stored.size, parts = parts.len(), "completed multipart upload");
        Ok(Asset::new(req.file_id, self.public_url(), &req.file_name, &req.content_type))
    }

    pub async fn abort_multipart(&self, req: &AbortMultipartRequest) -> UploadResult<()> {
        self.cleanup
            .abort_multipart(&asset_key(req.file_id), &req.upload_id)
            .await
    }

    // --- serving ---

    pub async fn fetch_asset(&self, asset_id: Uuid) -> UploadResult<ObjectBody> {
        Ok(self.backend.get(&asset_key(asset_id)).await?)
    }

    fn immutable(&self, content_type: &str) -> PutOptions {
        PutOptions {
            content_type: Some(content_type.to_string()),
            cache_control: Some(self.engine.config().cache_control.clone()),
        }
    }
}

fn require_name(file_name: &str) -> UploadResult<()> {
    if file_name.trim().is_empty() {
        return Err(UploadError::InvalidRequest("file name is required".into()));
    }
    Ok(())
}
