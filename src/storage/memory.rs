//! In-process backend with the same multipart rules as [`super::LocalStorage`].

use super::{
    BackendError, BackendResult, CompletedPart, DEFAULT_LIST_PAGE, ListPage, MIN_PART_SIZE,
    ObjectBackend, ObjectBody, ObjectSummary, PutOptions, StoredObject, ensure_key_safe, multipart_etag,
    validate_completion,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard},
};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct MemoryObject {
    pub body: Bytes,
    pub etag: String,
    pub opts: PutOptions,
}

#[derive(Debug, Default)]
struct PendingUpload {
    key: String,
    opts: PutOptions,
    parts: BTreeMap<u32, (String, Bytes)>,
}

#[derive(Debug, Default)]
struct Inner {
    objects: BTreeMap<String, MemoryObject>,
    uploads: HashMap<String, PendingUpload>,
}

#[derive(Clone, Debug)]
pub struct MemoryStorage {
    inner: Arc<Mutex<Inner>>,
    min_part_size: u64,
    page_size: usize,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            inner: Arc::default(),
            min_part_size: MIN_PART_SIZE,
            page_size: DEFAULT_LIST_PAGE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Lower the part minimum so multipart rules can be exercised with small
    /// payloads.
    pub fn with_min_part_size(mut self, min_part_size: u64) -> Self {
        self.min_part_size = min_part_size;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A poisoned map is still structurally valid.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Snapshot of a stored object, for inspection.
    pub fn object(&self, key: &str) -> Option<MemoryObject> {
        self.lock().objects.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().objects.keys().cloned().collect()
    }

    pub fn pending_uploads(&self) -> usize {
        self.lock().uploads.len()
    }
}

#[async_trait]
impl ObjectBackend for MemoryStorage {
    async fn list(
        &self,
        prefix: &str,
        continuation_token: Option<String>,
    ) -> BackendResult<ListPage> {
        let inner = self.lock();
        let mut objects: Vec<ObjectSummary> = inner
            .objects
            .range(prefix.to_string()..)
            .skip_while(|(key, _)| continuation_token.as_deref().is_some_and(|t| key.as_str() <= t))
            .take_while(|(key, _)| key.starts_with(prefix))
            .take(self.page_size + 1)
            .map(|(key, obj)| ObjectSummary {
                key: key.clone(),
                size: obj.body.len() as u64,
            })
            .collect();

        let mut next_continuation_token = None;
        if objects.len() > self.page_size {
            objects.truncate(self.page_size);
            next_continuation_token = objects.last().map(|o| o.key.clone());
        }
        Ok(ListPage {
            objects,
            next_continuation_token,
        })
    }

    async fn get(&self, key: &str) -> BackendResult<ObjectBody> {
        self.lock()
            .objects
            .get(key)
            .map(|obj| ObjectBody {
                body: obj.body.clone(),
                etag: obj.etag.clone(),
                content_type: obj.opts.content_type.clone(),
                cache_control: obj.opts.cache_control.clone(),
            })
            .ok_or_else(|| BackendError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, body: Bytes, opts: &PutOptions) -> BackendResult<StoredObject> {
        ensure_key_safe(key)?;
        let etag = format!("{:x}", md5::compute(&body));
        let size = body.len() as u64;
        self.lock().objects.insert(
            key.to_string(),
            MemoryObject {
                body,
                etag: etag.clone(),
                opts: opts.clone(),
            },
        );
        Ok(StoredObject {
            key: key.to_string(),
            size,
            etag,
        })
    }

    async fn delete(&self, key: &str) -> BackendResult<()> {
        self.lock().objects.remove(key);
        Ok(())
    }

    async fn create_multipart(&self, key: &str, opts: &PutOptions) -> BackendResult<String> {
        ensure_key_safe(key)?;
        let upload_id = Uuid::new_v4().simple().to_string();
        self.lock().uploads.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                opts: opts.clone(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> BackendResult<CompletedPart> {
        let mut inner = self.lock();
        let upload = inner
            .uploads
            .get_mut(upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| BackendError::NoSuchUpload(upload_id.to_string()))?;
        if part_number == 0 {
            return Err(BackendError::InvalidPart(part_number));
        }
        let etag = format!("{:x}", md5::compute(&body));
        upload.parts.insert(part_number, (etag.clone(), body));
        Ok(CompletedPart { part_number, etag })
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> BackendResult<StoredObject> {
        let mut inner = self.lock();
        let upload = inner
            .uploads
            .get(upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| BackendError::NoSuchUpload(upload_id.to_string()))?;

        validate_completion(parts, self.min_part_size, |n| {
            upload
                .parts
                .get(&n)
                .map(|(etag, body)| (etag.clone(), body.len() as u64))
        })?;

        let mut body = BytesMut::new();
        for part in parts {
            if let Some((_, bytes)) = upload.parts.get(&part.part_number) {
                body.extend_from_slice(bytes);
            }
        }
        let opts = upload.opts.clone();
        inner.uploads.remove(upload_id);

        let etag = multipart_etag(parts);
        let size = body.len() as u64;
        inner.objects.insert(
            key.to_string(),
            MemoryObject {
                body: body.freeze(),
                etag: etag.clone(),
                opts,
            },
        );
        Ok(StoredObject {
            key: key.to_string(),
            size,
            etag,
        })
    }

    async fn abort_multipart(&self, _key: &str, upload_id: &str) -> BackendResult<()> {
        self.lock()
            .uploads
            .remove(upload_id)
            .map(|_| ())
            .ok_or_else(|| BackendError::NoSuchUpload(upload_id.to_string()))
    }
}
