//! Health & readiness handlers.
//!
//! - GET /healthz  -> liveness ("ok")
//! - GET /readyz   -> readiness; round-trips a probe object through the backend

use crate::{services::upload_service::UploadService, storage::PutOptions};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

const PROBE_BODY: &[u8] = b"readyz";

/// `GET /healthz`
///
/// Never performs I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Writes, reads back and deletes `.readyz/{uuid}` through the configured
/// backend. HTTP 200 when the round trip succeeds, 503 otherwise.
pub async fn readyz(State(service): State<UploadService>) -> impl IntoResponse {
    let storage_check = probe_storage(&service).await;
    let ok = storage_check.ok;

    let mut checks = HashMap::new();
    checks.insert("storage", storage_check);

    let body = ReadyResponse {
        status: if ok { "ok".into() } else { "error".into() },
        checks,
    };
    let status = if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

async fn probe_storage(service: &UploadService) -> CheckStatus {
    let backend = service.backend();
    let key = format!(".readyz/{}", Uuid::new_v4());

    if let Err(e) = backend
        .put(&key, Bytes::from_static(PROBE_BODY), &PutOptions::default())
        .await
    {
        return CheckStatus::failed(format!("could not write probe: {e}"));
    }

    let read = backend.get(&key).await;
    // best-effort; a leftover probe is harmless
    let removed = backend.delete(&key).await;

    match read {
        Ok(object) if object.body.as_ref() == PROBE_BODY => match removed {
            Ok(()) => CheckStatus {
                ok: true,
                error: None,
            },
            Err(e) => CheckStatus {
                ok: true,
                error: Some(format!("could not remove probe: {e}")),
            },
        },
        Ok(_) => CheckStatus::failed("probe content mismatch".into()),
        Err(e) => CheckStatus::failed(format!("could not read probe: {e}")),
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn failed(error: String) -> Self {
        Self {
            ok: false,
            error: Some(error),
        }
    }
}
