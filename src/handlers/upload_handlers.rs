//! HTTP handlers for the three upload strategies and for serving assets.
//! Request/response bodies are camelCase JSON; storage concerns stay in
//! `UploadService`.

use crate::{
    errors::AppError,
    models::{asset::Asset, chunk::ChunkRef},
    services::{
        assembly::AssemblyRequest,
        upload_service::{
            AbortMultipartRequest, CompleteMultipartRequest, InitiateMultipartRequest,
            MultipartSession, PartReceipt, PresignRequest, PresignedQuery, PresignedUpload,
            UploadService,
        },
    },
};
use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use uuid::Uuid;

/// Query params of `PUT /uploads/multipart/part`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartQuery {
    pub file_id: Uuid,
    pub upload_id: String,
    pub part_number: u32,
}

/// `POST /uploads/chunks`: multipart form with `uploadId`, `chunkIndex`, `chunk`.
pub async fn upload_chunk(
    State(service): State<UploadService>,
    mut form: Multipart,
) -> Result<Json<ChunkRef>, AppError> {
    let mut upload_id = None;
    let mut chunk_index = None;
    let mut payload = None;

    while let Some(field) = form
        .next_field()
        .await
        .map_err(|err| AppError::new(err.status(), err.body_text()))?
    {
        let name = field.name().map(str::to_string);
        let read_err = |err: axum::extract::multipart::MultipartError| {
            AppError::new(err.status(), err.body_text())
        };
        match name.as_deref() {
            Some("uploadId") => upload_id = Some(field.text().await.map_err(read_err)?),
            Some("chunkIndex") => {
                let raw = field.text().await.map_err(read_err)?;
                let index = raw
                    .trim()
                    .parse::<i64>()
                    .map_err(|_| AppError::bad_request("invalid chunk: chunkIndex is not an integer"))?;
                chunk_index = Some(index);
            }
            Some("chunk") => payload = Some(field.bytes().await.map_err(read_err)?),
            _ => {}
        }
    }

    let upload_id = upload_id.ok_or_else(|| AppError::bad_request("invalid chunk: missing uploadId"))?;
    let chunk_index = chunk_index.ok_or_else(|| AppError::bad_request("invalid chunk: missing chunkIndex"))?;
    let payload = payload.ok_or_else(|| AppError::bad_request("invalid chunk: missing chunk"))?;

    let chunk = service.store_chunk(&upload_id, chunk_index, payload).await?;
    Ok(Json(chunk))
}

/// `POST /uploads/chunks/combine`
pub async fn combine_chunks(
    State(service): State<UploadService>,
    Json(req): Json<AssemblyRequest>,
) -> Result<Json<Asset>, AppError> {
    Ok(Json(service.combine(&req).await?))
}

/// `DELETE /uploads/chunks/{upload_id}`
pub async fn abort_chunks(
    State(service): State<UploadService>,
    Path(upload_id): Path<String>,
) -> Result<StatusCode, AppError> {
    service.abort_session(&upload_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /uploads/presign`
pub async fn presign(
    State(service): State<UploadService>,
    Json(req): Json<PresignRequest>,
) -> Result<Json<PresignedUpload>, AppError> {
    Ok(Json(service.presign(&req)?))
}

/// `PUT /storage/{asset_id}`: target of a presigned URL. The signature in
/// the query string is the only credential.
pub async fn presigned_put(
    State(service): State<UploadService>,
    Path(asset_id): Path<Uuid>,
    Query(query): Query<PresignedQuery>,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let stored = service.accept_presigned_put(asset_id, &query, body).await?;

    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", stored.etag)) {
        headers.insert(header::ETAG, value);
    }
    Ok((StatusCode::OK, headers))
}

/// `POST /uploads/multipart/initiate`
pub async fn initiate_multipart(
    State(service): State<UploadService>,
    Json(req): Json<InitiateMultipartRequest>,
) -> Result<Json<MultipartSession>, AppError> {
    Ok(Json(service.initiate_multipart(&req).await?))
}

/// `PUT /uploads/multipart/part?fileId=&uploadId=&partNumber=`
pub async fn upload_part(
    State(service): State<UploadService>,
    Query(q): Query<PartQuery>,
    body: Bytes,
) -> Result<Json<PartReceipt>, AppError> {
    let receipt = service
        .upload_part(q.file_id, &q.upload_id, q.part_number, body)
        .await?;
    Ok(Json(receipt))
}

/// `POST /uploads/multipart/complete`
pub async fn complete_multipart(
    State(service): State<UploadService>,
    Json(req): Json<CompleteMultipartRequest>,
) -> Result<Json<Asset>, AppError> {
    Ok(Json(service.complete_multipart(&req).await?))
}

/// `POST /uploads/multipart/abort`
pub async fn abort_multipart(
    State(service): State<UploadService>,
    Json(req): Json<AbortMultipartRequest>,
) -> Result<StatusCode, AppError> {
    service.abort_multipart(&req).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /files/{asset_id}`: the `src` of an asset.
pub async fn get_file(
    State(service): State<UploadService>,
    Path(asset_id): Path<Uuid>,
) -> Result<Response, AppError> {
    let object = service.fetch_asset(asset_id).await?;

    let length = object.body.len();
    let mut response = Response::new(Body::from(object.body));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();

    let content_type = object
        .content_type
        .unwrap_or_else(|| "application/octet-stream".into());
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", object.etag)) {
        headers.insert(header::ETAG, value);
    }
    if let Some(cache) = object.cache_control.as_deref() {
        if let Ok(value) = HeaderValue::from_str(cache) {
            headers.insert(header::CACHE_CONTROL, value);
        }
    }

    Ok(response)
}
