//! Client side of the proxy-chunked pipeline.
//!
//! [`upload_file`] plans the chunks, pushes them one at a time through a
//! [`ChunkUploader`], then asks the server to combine them. Any failure after
//! planning triggers a best-effort abort of the session.

mod error;
pub mod http;
mod transport;

pub use error::TransportError;
pub use http::{HttpUploadClient, HttpUploadClientBuilder};
pub use transport::ChunkUploader;

use crate::{
    codec::{ChunkPlan, MERGE_BATCH_SIZE},
    models::{asset::Asset, chunk::ChunkRef},
    retry::RetryPolicy,
    services::assembly::AssemblyRequest,
};
use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{info, warn};
use uuid::Uuid;

/// Bytes acknowledged by the server so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadProgress {
    pub loaded: u64,
    pub total: u64,
}

impl UploadProgress {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.loaded as f64 * 100.0 / self.total as f64
    }
}

/// The three server calls the pipeline needs.
#[async_trait]
pub trait ChunkSender: Send + Sync {
    async fn send_chunk(
        &self,
        upload_id: &str,
        index: u32,
        bytes: bytes::Bytes,
    ) -> Result<ChunkRef, TransportError>;

    async fn combine(&self, req: &AssemblyRequest) -> Result<Asset, TransportError>;

    async fn abort(&self, upload_id: &str) -> Result<(), TransportError>;
}

/// What is being uploaded.
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub file_name: String,
    pub content_type: String,
    pub file_size: u64,
    pub chunk_size: u64,
    /// Part minimum of the server's backend; chunk sizes that cannot merge
    /// into parts this large are refused before anything is sent.
    pub min_part_size: u64,
}

/// Upload `reader` (exactly `file.file_size` bytes) chunk by chunk and return
/// the assembled asset. `on_progress` fires after every stored chunk.
pub async fn upload_file<S, R, F>(
    sender: &S,
    policy: RetryPolicy,
    reader: &mut R,
    file: &FileUpload,
    mut on_progress: F,
) -> Result<Asset, TransportError>
where
    S: ChunkSender + ?Sized,
    R: AsyncRead + Unpin + Send,
    F: FnMut(UploadProgress) + Send,
{
    let plan = ChunkPlan::new(file.file_size, file.chunk_size)?;
    if !plan.conforms_to(file.min_part_size) {
        return Err(TransportError::Configuration(format!(
            "chunk size {} is too small: {} chunks must reach the {} byte part minimum",
            plan.chunk_size, MERGE_BATCH_SIZE, file.min_part_size
        )));
    }
    let upload_id = Uuid::now_v7().to_string();
    let uploader = ChunkUploader::new(sender, policy);

    info!(
        upload_id = %upload_id,
        file_name = %file.file_name,
        total_chunks = plan.total_chunks,
        "starting chunked upload"
    );

    let result = push_and_combine(&uploader, &upload_id, &plan, reader, file, &mut on_progress).await;
    match result {
        Ok(asset) => {
            info!(upload_id = %upload_id, asset_id = %asset.id, "chunked upload complete");
            Ok(asset)
        }
        Err(err) => {
            if let Err(abort_err) = sender.abort(&upload_id).await {
                warn!(upload_id = %upload_id, error = %abort_err, "abort after failed upload also failed");
            }
            Err(err)
        }
    }
}

async fn push_and_combine<S, R, F>(
    uploader: &ChunkUploader<'_, S>,
    upload_id: &str,
    plan: &ChunkPlan,
    reader: &mut R,
    file: &FileUpload,
    on_progress: &mut F,
) -> Result<Asset, TransportError>
where
    S: ChunkSender + ?Sized,
    R: AsyncRead + Unpin + Send,
    F: FnMut(UploadProgress) + Send,
{
    let mut loaded = 0u64;
    for (index, range) in plan.ranges() {
        let len = (range.end - range.start) as usize;
        let mut buf = BytesMut::zeroed(len);
        reader.read_exact(&mut buf).await?;

        let index = u32::try_from(index).map_err(|_| {
            TransportError::Configuration(format!("chunk index {index} out of range"))
        })?;
        uploader.upload_chunk(upload_id, index, buf.freeze()).await?;

        loaded += len as u64;
        on_progress(UploadProgress {
            loaded,
            total: plan.file_size,
        });
    }

    uploader
        .sender()
        .combine(&AssemblyRequest {
            upload_id: upload_id.to_string(),
            file_name: file.file_name.clone(),
            content_type: file.content_type.clone(),
            total_chunks: plan.total_chunks,
            chunk_size: plan.chunk_size,
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::asset::AssetType;
    use std::{
        collections::HashMap,
        sync::{
            Mutex,
            atomic::{AtomicU32, Ordering},
        },
    };

    /// Drops the first `flaky` attempts of every chunk; `reject_index` always gets a 503.
    #[derive(Default)]
    struct FlakySender {
        flaky: u32,
        reject_index: Option<u32>,
        attempts: Mutex<HashMap<u32, u32>>,
        stored: Mutex<Vec<(u32, usize)>>,
        aborts: AtomicU32,
        combines: AtomicU32,
    }

    #[async_trait]
    impl ChunkSender for FlakySender {
        async fn send_chunk(
            &self,
            _upload_id: &str,
            index: u32,
            bytes: bytes::Bytes,
        ) -> Result<ChunkRef, TransportError> {
            let seen = {
                let mut attempts = self.attempts.lock().unwrap();
                let n = attempts.entry(index).or_default();
                *n += 1;
                *n
            };
            if self.reject_index == Some(index) {
                return Err(TransportError::Server {
                    status: 503,
                    message: "unavailable".into(),
                });
            }
            if seen <= self.flaky {
                return Err(TransportError::Connection("reset".into()));
            }
            self.stored.lock().unwrap().push((index, bytes.len()));
            Ok(ChunkRef {
                chunk_id: format!("c{index}"),
                index,
                size: bytes.len() as u64,
            })
        }

        async fn combine(&self, req: &AssemblyRequest) -> Result<Asset, TransportError> {
            self.combines.fetch_add(1, Ordering::SeqCst);
            Ok(Asset::new(
                Uuid::new_v4(),
                "http://cdn.test",
                req.file_name.clone(),
                &req.content_type,
            ))
        }

        async fn abort(&self, _upload_id: &str) -> Result<(), TransportError> {
            self.aborts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn file(size: u64, chunk: u64) -> FileUpload {
        FileUpload {
            file_name: "clip.mp4".into(),
            content_type: "video/mp4".into(),
            file_size: size,
            chunk_size: chunk,
            min_part_size: 8,
        }
    }

    #[tokio::test]
    async fn retries_then_succeeds_within_budget() {
        let sender = FlakySender {
            flaky: 2,
            ..Default::default()
        };
        let uploader = ChunkUploader::new(&sender, RetryPolicy::immediate(3));
        let chunk = uploader
            .upload_chunk("u1", 0, bytes::Bytes::from_static(b"abc"))
            .await
            .unwrap();
        assert_eq!(chunk.size, 3);
        assert_eq!(sender.attempts.lock().unwrap()[&0], 3);
    }

    #[tokio::test]
    async fn exhaustion_reports_index_and_attempts() {
        let sender = FlakySender {
            flaky: 5,
            ..Default::default()
        };
        let uploader = ChunkUploader::new(&sender, RetryPolicy::immediate(3));
        let err = uploader
            .upload_chunk("u1", 4, bytes::Bytes::from_static(b"abc"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::ChunkUploadFailed {
                index: 4,
                attempts: 3,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn progress_is_reported_per_stored_chunk() {
        let sender = FlakySender {
            flaky: 1,
            ..Default::default()
        };
        let data = vec![7u8; 10];
        let mut seen = Vec::new();

        let asset = upload_file(
            &sender,
            RetryPolicy::immediate(3),
            &mut data.as_slice(),
            &file(10, 4),
            |p| seen.push(p.loaded),
        )
        .await
        .unwrap();

        assert_eq!(asset.asset_type, AssetType::Video);
        assert_eq!(seen, vec![4, 8, 10]);
        assert_eq!(*sender.stored.lock().unwrap(), vec![(0, 4), (1, 4), (2, 2)]);
        assert_eq!(sender.combines.load(Ordering::SeqCst), 1);
        assert_eq!(sender.aborts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_chunk_aborts_the_session() {
        let sender = FlakySender {
            reject_index: Some(1),
            ..Default::default()
        };
        let data = vec![1u8; 10];
        let mut seen = Vec::new();

        let err = upload_file(
            &sender,
            RetryPolicy::immediate(2),
            &mut data.as_slice(),
            &file(10, 4),
            |p| seen.push(p.loaded),
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            TransportError::ChunkUploadFailed {
                index: 1,
                attempts: 2,
                ..
            }
        ));
        assert_eq!(seen, vec![4]);
        assert_eq!(sender.aborts.load(Ordering::SeqCst), 1);
        assert_eq!(sender.combines.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_file_is_rejected_before_any_request() {
        let sender = FlakySender::default();
        let err = upload_file(
            &sender,
            RetryPolicy::immediate(1),
            &mut &b""[..],
            &file(0, 4),
            |_| {},
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TransportError::Codec(_)));
        assert!(sender.attempts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn undersized_chunks_are_refused_before_any_request() {
        let sender = FlakySender::default();
        let data = vec![1u8; 10];
        let err = upload_file(
            &sender,
            RetryPolicy::immediate(1),
            &mut data.as_slice(),
            &file(10, 3),
            |_| {},
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TransportError::Configuration(_)));
        assert!(sender.attempts.lock().unwrap().is_empty());
        assert_eq!(sender.aborts.load(Ordering::SeqCst), 0);

        // A file that fits in one part needs no minimum.
        let asset = upload_file(
            &sender,
            RetryPolicy::immediate(1),
            &mut &data[..5],
            &file(5, 3),
            |_| {},
        )
        .await;
        assert!(asset.is_ok());
    }

    #[test]
    fn percent_of_empty_total_is_complete() {
        let p = UploadProgress { loaded: 0, total: 0 };
        assert_eq!(p.percent(), 100.0);
        let p = UploadProgress { loaded: 1, total: 4 };
        assert_eq!(p.percent(), 25.0);
    }
}
