//! One chunk, bounded retries.

use super::{ChunkSender, TransportError};
use crate::{models::chunk::ChunkRef, retry::RetryPolicy};
use bytes::Bytes;
use tracing::{debug, warn};

/// Wraps a [`ChunkSender`] with a retry policy. Each attempt is independent;
/// the first non-retryable error stops the loop.
pub struct ChunkUploader<'a, S: ?Sized> {
    sender: &'a S,
    policy: RetryPolicy,
}

impl<'a, S> ChunkUploader<'a, S>
where
    S: ChunkSender + ?Sized,
{
    pub fn new(sender: &'a S, policy: RetryPolicy) -> Self {
        Self { sender, policy }
    }

    pub fn sender(&self) -> &'a S {
        self.sender
    }

    pub async fn upload_chunk(
        &self,
        upload_id: &str,
        index: u32,
        bytes: Bytes,
    ) -> Result<ChunkRef, TransportError> {
        let mut attempt = 0u32;
        loop {
            match self.sender.send_chunk(upload_id, index, bytes.clone()).await {
                Ok(chunk) => {
                    debug!(upload_id, index, attempt, size = chunk.size, "chunk stored");
                    return Ok(chunk);
                }
                Err(err) => {
                    let attempts = attempt + 1;
                    if !err.is_retryable() || !self.policy.allows_retry(attempts) {
                        return Err(TransportError::ChunkUploadFailed {
                            index,
                            attempts,
                            source: Box::new(err),
                        });
                    }
                    warn!(upload_id, index, attempts, error = %err, "chunk upload failed, retrying");
                    self.policy.wait(attempt).await;
                    attempt = attempts;
                }
            }
        }
    }
}
