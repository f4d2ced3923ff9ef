//! Routes of the upload API.
//!
//! ## Structure
//! - **Proxy-chunked** (bearer)
//!   - `POST   /uploads/chunks`: store one chunk (multipart form)
//!   - `POST   /uploads/chunks/combine`: assemble a session into an asset
//!   - `DELETE /uploads/chunks/{upload_id}`: abort a session
//!
//! - **Direct presigned PUT**
//!   - `POST   /uploads/presign`: issue a signed URL (bearer)
//!   - `PUT    /storage/{asset_id}`: the signed URL itself (signature only)
//!
//! - **Client-driven multipart** (bearer)
//!   - `POST   /uploads/multipart/initiate`
//!   - `PUT    /uploads/multipart/part`
//!   - `POST   /uploads/multipart/complete`
//!   - `POST   /uploads/multipart/abort`
//!
//! - **Public**
//!   - `GET    /files/{asset_id}`: asset bytes
//!   - `GET    /healthz`, `GET /readyz`

use crate::{
    handlers::{
        auth::{ApiToken, require_bearer},
        health_handlers::{healthz, readyz},
        upload_handlers::{
            abort_chunks, abort_multipart, combine_chunks, complete_multipart, get_file,
            initiate_multipart, presign, presigned_put, upload_chunk, upload_part,
        },
    },
    services::upload_service::UploadService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware,
    routing::{delete, get, post, put},
};

/// Build the router. Body limits are per route: `max_chunk_body` for the
/// chunk form, `max_direct_upload` for raw object and part bodies.
pub fn routes(
    api_token: ApiToken,
    max_chunk_body: usize,
    max_direct_upload: usize,
) -> Router<UploadService> {
    let protected = Router::new()
        .route(
            "/uploads/chunks",
            post(upload_chunk).layer(DefaultBodyLimit::max(max_chunk_body)),
        )
        .route("/uploads/chunks/combine", post(combine_chunks))
        .route("/uploads/chunks/{upload_id}", delete(abort_chunks))
        .route("/uploads/presign", post(presign))
        .route("/uploads/multipart/initiate", post(initiate_multipart))
        .route(
            "/uploads/multipart/part",
            put(upload_part).layer(DefaultBodyLimit::max(max_direct_upload)),
        )
        .route("/uploads/multipart/complete", post(complete_multipart))
        .route("/uploads/multipart/abort", post(abort_multipart))
        .route_layer(middleware::from_fn_with_state(api_token, require_bearer));

    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route(
            "/storage/{asset_id}",
            put(presigned_put).layer(DefaultBodyLimit::max(max_direct_upload)),
        )
        .route("/files/{asset_id}", get(get_file))
        .merge(protected)
}
