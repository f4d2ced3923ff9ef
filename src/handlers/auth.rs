//! Bearer-token gate in front of the upload API.
//!
//! Fails closed: with no token configured every request is rejected.

use crate::errors::AppError;
use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::warn;

#[derive(Clone, Default)]
pub struct ApiToken(Option<Arc<str>>);

impl ApiToken {
    pub fn new(token: Option<String>) -> Self {
        Self(token.filter(|t| !t.is_empty()).map(Arc::from))
    }
}

pub async fn require_bearer(
    State(token): State<ApiToken>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let Some(expected) = token.0.as_deref() else {
        warn!("no API token configured; rejecting {}", req.uri().path());
        return Err(AppError::unauthorized());
    };

    let presented = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match presented {
        Some(candidate) if bool::from(candidate.as_bytes().ct_eq(expected.as_bytes())) => {
            Ok(next.run(req).await)
        }
        _ => Err(AppError::unauthorized()),
    }
}
