//! `reqwest` implementation of [`ChunkSender`] against the upload API.

use super::{ChunkSender, TransportError};
use crate::{
    models::{asset::Asset, chunk::ChunkRef},
    services::{
        assembly::AssemblyRequest,
        upload_service::{PresignRequest, PresignedUpload},
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{
    Client, RequestBuilder, Response,
    header::{CONTENT_TYPE, ETAG},
    multipart::{Form, Part},
};
use serde::{Deserialize, de::DeserializeOwned};
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Builder for an [`HttpUploadClient`].
#[derive(Debug)]
pub struct HttpUploadClientBuilder {
    base_url: String,
    timeout: Duration,
    token: Option<String>,
}

impl HttpUploadClientBuilder {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout: DEFAULT_TIMEOUT,
            token: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn build(self) -> Result<HttpUploadClient, TransportError> {
        let client = Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| TransportError::Configuration(e.to_string()))?;
        Ok(HttpUploadClient {
            client,
            base_url: self.base_url,
            token: self.token,
        })
    }
}

/// HTTP client for the chunk, combine, abort and presign endpoints.
#[derive(Debug, Clone)]
pub struct HttpUploadClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

impl HttpUploadClient {
    pub fn builder(base_url: impl Into<String>) -> HttpUploadClientBuilder {
        HttpUploadClientBuilder::new(base_url)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn add_auth(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Ask for a presigned PUT URL.
    pub async fn presign(&self, req: &PresignRequest) -> Result<PresignedUpload, TransportError> {
        let response = self
            .add_auth(self.client.post(self.url("/uploads/presign")))
            .json(req)
            .send()
            .await?;
        read_json(response).await
    }

    /// PUT `body` to a presigned URL and return the stored ETag. The URL is
    /// its own credential, so no bearer token is sent.
    pub async fn put_presigned(
        &self,
        presigned: &PresignedUpload,
        content_type: &str,
        body: Bytes,
    ) -> Result<String, TransportError> {
        let response = self
            .client
            .put(&presigned.upload_url)
            .header(CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await?;
        let response = ensure_success(response).await?;
        Ok(response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_matches('"').to_string())
            .unwrap_or_default())
    }
}

#[async_trait]
impl ChunkSender for HttpUploadClient {
    async fn send_chunk(
        &self,
        upload_id: &str,
        index: u32,
        bytes: Bytes,
    ) -> Result<ChunkRef, TransportError> {
        let form = Form::new()
            .text("uploadId", upload_id.to_string())
            .text("chunkIndex", index.to_string())
            .part(
                "chunk",
                Part::stream(bytes)
                    .file_name(format!("chunk-{index}"))
                    .mime_str("application/octet-stream")?,
            );
        let response = self
            .add_auth(self.client.post(self.url("/uploads/chunks")))
            .multipart(form)
            .send()
            .await?;
        read_json(response).await
    }

    async fn combine(&self, req: &AssemblyRequest) -> Result<Asset, TransportError> {
        let response = self
            .add_auth(self.client.post(self.url("/uploads/chunks/combine")))
            .json(req)
            .send()
            .await?;
        read_json(response).await
    }

    async fn abort(&self, upload_id: &str) -> Result<(), TransportError> {
        let response = self
            .add_auth(
                self.client
                    .delete(self.url(&format!("/uploads/chunks/{upload_id}"))),
            )
            .send()
            .await?;
        ensure_success(response).await.map(|_| ())
    }
}

async fn ensure_success(response: Response) -> Result<Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .map(|b| b.error)
        .unwrap_or(text);
    Err(TransportError::Server {
        status: status.as_u16(),
        message,
    })
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, TransportError> {
    let response = ensure_success(response).await?;
    response
        .json::<T>()
        .await
        .map_err(|e| TransportError::Deserialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_trims_trailing_slash() {
        let client = HttpUploadClient::builder("http://localhost:3000/")
            .token("t")
            .build()
            .unwrap();
        assert_eq!(client.base_url(), "http://localhost:3000");
        assert_eq!(
            client.url("/uploads/chunks"),
            "http://localhost:3000/uploads/chunks"
        );
    }
}
