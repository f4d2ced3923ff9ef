//! Removal of a session's temporary objects.

use crate::{
    errors::UploadResult,
    services::chunk_store::{intermediate_prefix, session_prefix, validate_upload_id},
    storage::{BackendError, DynBackend, list_all},
};
use tracing::{debug, warn};

/// What one cleanup pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub deleted: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct SessionCleanup {
    backend: DynBackend,
}

impl SessionCleanup {
    pub fn new(backend: DynBackend) -> Self {
        Self { backend }
    }

    /// Delete every chunk and staging object of `upload_id`.
    ///
    /// Repeatable: an already-empty session yields an empty report. Individual
    /// delete failures are logged and counted, not raised.
    pub async fn abort(&self, upload_id: &str) -> UploadResult<CleanupReport> {
        validate_upload_id(upload_id)?;
        let mut report = CleanupReport::default();
        for prefix in [session_prefix(upload_id), intermediate_prefix(upload_id)] {
            let listed = list_all(self.backend.as_ref(), &prefix).await?;
            for object in listed {
                match self.backend.delete(&object.key).await {
                    Ok(()) => report.deleted += 1,
                    Err(err) => {
                        warn!(upload_id, error = %err, "failed to delete temporary object");
                        report.failed += 1;
                    }
                }
            }
        }
        debug!(upload_id, deleted = report.deleted, failed = report.failed, "session cleanup");
        Ok(report)
    }

    /// Like [`abort`](Self::abort) but never fails; for error paths where the
    /// original failure must win.
    pub async fn abort_quietly(&self, upload_id: &str) -> CleanupReport {
        match self.abort(upload_id).await {
            Ok(report) => report,
            Err(err) => {
                warn!(upload_id, error = %err, "session cleanup failed");
                CleanupReport::default()
            }
        }
    }

    /// Abort a backend multipart upload, treating an unknown upload as done.
    pub async fn abort_multipart(&self, key: &str, multipart_id: &str) -> UploadResult<()> {
        match self.backend.abort_multipart(key, multipart_id).await {
            Ok(()) | Err(BackendError::NoSuchUpload(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
