use asset_uploader::{
    codec::{ChunkPlan, DEFAULT_CHUNK_SIZE},
    errors::UploadError,
    models::asset::AssetType,
    retry::RetryPolicy,
    services::{
        assembly::{
            AssemblyConfig, AssemblyEngine, AssemblyRequest, AssemblyState, IMMUTABLE_CACHE_CONTROL,
        },
        chunk_store::{ChunkStore, chunk_key},
    },
    storage::{
        BackendError, BackendResult, CompletedPart, DynBackend, ListPage, MIN_PART_SIZE,
        MemoryStorage, ObjectBackend, ObjectBody, PutOptions, StoredObject,
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU32, Ordering},
};

/// MemoryStorage with knobs: chunk listings can lag behind writes, part
/// sizes are recorded, and one part number can be made to fail. Every call
/// suspends once before touching the store, as a networked backend would.
#[derive(Clone)]
struct Instrumented {
    inner: MemoryStorage,
    chunk_listings: Arc<AtomicU32>,
    /// Chunk listings that hide the last chunk; `u32::MAX` never catches up.
    lagging_listings: u32,
    part_sizes: Arc<Mutex<Vec<(u32, usize)>>>,
    fail_part: Option<u32>,
}

impl Instrumented {
    fn new(inner: MemoryStorage) -> Self {
        Self {
            inner,
            chunk_listings: Arc::default(),
            lagging_listings: 0,
            part_sizes: Arc::default(),
            fail_part: None,
        }
    }

    fn lagging(mut self, listings: u32) -> Self {
        self.lagging_listings = listings;
        self
    }

    fn failing_part(mut self, part_number: u32) -> Self {
        self.fail_part = Some(part_number);
        self
    }
}

#[async_trait]
impl ObjectBackend for Instrumented {
    async fn list(&self, prefix: &str, token: Option<String>) -> BackendResult<ListPage> {
        tokio::task::yield_now().await;
        let mut page = self.inner.list(prefix, token.clone()).await?;
        if prefix.starts_with("chunks/") && token.is_none() {
            let n = self.chunk_listings.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.lagging_listings {
                page.objects.pop();
            }
        }
        Ok(page)
    }

    async fn get(&self, key: &str) -> BackendResult<ObjectBody> {
        tokio::task::yield_now().await;
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, body: Bytes, opts: &PutOptions) -> BackendResult<StoredObject> {
        tokio::task::yield_now().await;
        self.inner.put(key, body, opts).await
    }

    async fn delete(&self, key: &str) -> BackendResult<()> {
        tokio::task::yield_now().await;
        self.inner.delete(key).await
    }

    async fn create_multipart(&self, key: &str, opts: &PutOptions) -> BackendResult<String> {
        tokio::task::yield_now().await;
        self.inner.create_multipart(key, opts).await
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> BackendResult<CompletedPart> {
        tokio::task::yield_now().await;
        if self.fail_part == Some(part_number) {
            return Err(BackendError::Io(std::io::Error::other("connection reset")));
        }
        self.part_sizes.lock().unwrap().push((part_number, body.len()));
        self.inner.upload_part(key, upload_id, part_number, body).await
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> BackendResult<StoredObject> {
        tokio::task::yield_now().await;
        self.inner.complete_multipart(key, upload_id, parts).await
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> BackendResult<()> {
        tokio::task::yield_now().await;
        self.inner.abort_multipart(key, upload_id).await
    }
}

const SMALL_MIN_PART: u64 = 8;
const SMALL_CHUNK: u64 = SMALL_MIN_PART / 2;

fn engine(backend: DynBackend, min_part_size: u64, verify_attempts: u32) -> AssemblyEngine {
    AssemblyEngine::new(
        backend,
        AssemblyConfig {
            min_part_size,
            verify_policy: RetryPolicy::immediate(verify_attempts),
            public_url: "http://cdn.test".into(),
            ..AssemblyConfig::default()
        },
    )
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// Store `data` as chunks of `chunk_size`, last chunk first.
async fn push_chunks(store: &ChunkStore, upload_id: &str, data: &[u8], chunk_size: u64) -> u64 {
    let plan = ChunkPlan::new(data.len() as u64, chunk_size).unwrap();
    let mut ranges: Vec<_> = plan.ranges().collect();
    ranges.reverse();
    for (index, range) in ranges {
        let bytes = Bytes::copy_from_slice(&data[range.start as usize..range.end as usize]);
        store.store_chunk(upload_id, index as i64, bytes).await.unwrap();
    }
    plan.total_chunks
}

fn request(upload_id: &str, content_type: &str, total_chunks: u64, chunk_size: u64) -> AssemblyRequest {
    AssemblyRequest {
        upload_id: upload_id.into(),
        file_name: "upload.bin".into(),
        content_type: content_type.into(),
        total_chunks,
        chunk_size,
    }
}

#[tokio::test]
async fn assembled_object_is_byte_identical_for_any_chunk_count() {
    for n in 1..=5u64 {
        for tail in [1, SMALL_CHUNK] {
            let storage = MemoryStorage::new().with_min_part_size(SMALL_MIN_PART);
            let backend: DynBackend = Arc::new(storage.clone());
            let store = ChunkStore::new(backend.clone());
            let upload_id = format!("session-{n}-{tail}");

            let data = pattern(((n - 1) * SMALL_CHUNK + tail) as usize);
            let total = push_chunks(&store, &upload_id, &data, SMALL_CHUNK).await;
            assert_eq!(total, n);

            let asset = engine(backend, SMALL_MIN_PART, 3)
                .assemble(&request(&upload_id, "application/octet-stream", total, SMALL_CHUNK))
                .await
                .unwrap();

            let stored = storage.object(&asset.id.to_string()).unwrap();
            assert_eq!(stored.body.as_ref(), data.as_slice(), "n={n} tail={tail}");
            assert_eq!(storage.keys(), vec![asset.id.to_string()], "chunks left behind");
            assert_eq!(storage.pending_uploads(), 0);
        }
    }
}

#[tokio::test]
async fn every_part_but_the_last_meets_the_minimum() {
    let storage = MemoryStorage::new().with_min_part_size(SMALL_MIN_PART);
    let backend = Instrumented::new(storage.clone());
    let sizes = backend.part_sizes.clone();
    let backend: DynBackend = Arc::new(backend);
    let store = ChunkStore::new(backend.clone());

    // five chunks of min/2, the last one short
    let data = pattern((4 * SMALL_CHUNK + 3) as usize);
    let total = push_chunks(&store, "odd", &data, SMALL_CHUNK).await;

    engine(backend, SMALL_MIN_PART, 3)
        .assemble(&request("odd", "application/octet-stream", total, SMALL_CHUNK))
        .await
        .unwrap();

    assert_eq!(*sizes.lock().unwrap(), vec![(1, 8), (2, 8), (3, 3)]);
}

#[tokio::test]
async fn lagging_listing_is_waited_out() {
    let storage = MemoryStorage::new().with_min_part_size(SMALL_MIN_PART);
    let backend = Instrumented::new(storage.clone()).lagging(3);
    let listings = backend.chunk_listings.clone();
    let backend: DynBackend = Arc::new(backend);
    let store = ChunkStore::new(backend.clone());

    let data = pattern(10);
    let total = push_chunks(&store, "laggy", &data, SMALL_CHUNK).await;

    let asset = engine(backend, SMALL_MIN_PART, 4)
        .assemble(&request("laggy", "image/png", total, SMALL_CHUNK))
        .await
        .unwrap();

    assert_eq!(asset.asset_type, AssetType::Image);
    assert_eq!(storage.object(&asset.id.to_string()).unwrap().body.as_ref(), data.as_slice());
    // three lagging listings, one complete, then the post-success sweep
    assert_eq!(listings.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn listing_that_never_catches_up_fails_after_the_attempt_budget() {
    let storage = MemoryStorage::new().with_min_part_size(SMALL_MIN_PART);
    let backend = Instrumented::new(storage.clone()).lagging(u32::MAX);
    let listings = backend.chunk_listings.clone();
    let backend: DynBackend = Arc::new(backend);
    let store = ChunkStore::new(backend.clone());

    let total = push_chunks(&store, "stuck", &pattern(10), SMALL_CHUNK).await;

    let err = engine(backend, SMALL_MIN_PART, 4)
        .assemble(&request("stuck", "image/png", total, SMALL_CHUNK))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        UploadError::ChunkCountMismatch {
            expected: 3,
            found: 2
        }
    ));
    // four verification listings plus the cleanup sweep
    assert_eq!(listings.load(Ordering::SeqCst), 5);
    assert_eq!(storage.pending_uploads(), 0);
}

#[tokio::test]
async fn missing_chunk_is_never_tolerated() {
    let storage = MemoryStorage::new().with_min_part_size(SMALL_MIN_PART);
    let backend: DynBackend = Arc::new(storage.clone());
    let store = ChunkStore::new(backend.clone());

    let data = pattern(12);
    for index in [0u32, 2] {
        let start = index as usize * SMALL_CHUNK as usize;
        let bytes = Bytes::copy_from_slice(&data[start..start + SMALL_CHUNK as usize]);
        store.store_chunk("gap", i64::from(index), bytes).await.unwrap();
    }

    let err = engine(backend, SMALL_MIN_PART, 2)
        .assemble(&request("gap", "application/pdf", 3, SMALL_CHUNK))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        UploadError::ChunkCountMismatch {
            expected: 3,
            found: 2
        }
    ));
    assert!(storage.keys().is_empty(), "session not swept: {:?}", storage.keys());
}

#[tokio::test]
async fn failed_part_upload_aborts_and_sweeps_the_session() {
    let storage = MemoryStorage::new().with_min_part_size(SMALL_MIN_PART);
    let backend: DynBackend = Arc::new(Instrumented::new(storage.clone()).failing_part(2));
    let store = ChunkStore::new(backend.clone());

    let total = push_chunks(&store, "doomed", &pattern(19), SMALL_CHUNK).await;
    backend
        .put(
            "intermediate/doomed/staging",
            Bytes::from_static(b"tmp"),
            &PutOptions::default(),
        )
        .await
        .unwrap();

    let err = engine(backend, SMALL_MIN_PART, 3)
        .assemble(&request("doomed", "video/mp4", total, SMALL_CHUNK))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        UploadError::Assembly {
            stage: AssemblyState::MergingParts,
            ..
        }
    ));
    assert!(!err.to_string().contains("chunks/"), "storage key leaked: {err}");
    assert!(storage.keys().is_empty(), "left behind: {:?}", storage.keys());
    assert_eq!(storage.pending_uploads(), 0);
}

#[tokio::test]
async fn six_mib_video_becomes_two_parts() {
    let storage = MemoryStorage::new();
    let backend = Instrumented::new(storage.clone());
    let sizes = backend.part_sizes.clone();
    let backend: DynBackend = Arc::new(backend);
    let store = ChunkStore::new(backend.clone());

    let data = pattern(6 * 1024 * 1024);
    let total = push_chunks(&store, "movie", &data, DEFAULT_CHUNK_SIZE).await;
    assert_eq!(total, 3);

    let mut req = request("movie", "video/mp4", total, DEFAULT_CHUNK_SIZE);
    req.file_name = "clip.mp4".into();
    let asset = engine(backend, MIN_PART_SIZE, 3).assemble(&req).await.unwrap();

    assert_eq!(
        *sizes.lock().unwrap(),
        vec![(1, 5 * 1024 * 1024), (2, 1024 * 1024)]
    );
    assert_eq!(asset.asset_type, AssetType::Video);
    assert_eq!(asset.file_name, "clip.mp4");
    assert_eq!(asset.src, format!("http://cdn.test/files/{}", asset.id));

    let stored = storage.object(&asset.id.to_string()).unwrap();
    assert_eq!(stored.body.len(), data.len());
    assert_eq!(stored.opts.content_type.as_deref(), Some("video/mp4"));
    assert_eq!(stored.opts.cache_control.as_deref(), Some(IMMUTABLE_CACHE_CONTROL));
}

#[tokio::test]
async fn single_small_chunk_is_accepted_as_the_last_part() {
    let storage = MemoryStorage::new();
    let backend = Instrumented::new(storage.clone());
    let sizes = backend.part_sizes.clone();
    let backend: DynBackend = Arc::new(backend);
    let store = ChunkStore::new(backend.clone());

    let data = pattern(100);
    let total = push_chunks(&store, "tiny", &data, DEFAULT_CHUNK_SIZE).await;
    assert_eq!(total, 1);

    let asset = engine(backend, MIN_PART_SIZE, 3)
        .assemble(&request("tiny", "audio/mpeg", total, DEFAULT_CHUNK_SIZE))
        .await
        .unwrap();

    assert_eq!(*sizes.lock().unwrap(), vec![(1, 100)]);
    assert_eq!(asset.asset_type, AssetType::Audio);
    assert_eq!(storage.object(&asset.id.to_string()).unwrap().body.as_ref(), data.as_slice());
}

#[tokio::test]
async fn retried_chunk_overwrites_instead_of_duplicating() {
    let storage = MemoryStorage::new();
    let store = ChunkStore::new(Arc::new(storage.clone()));

    let first = store
        .store_chunk("retry", 0, Bytes::from_static(b"first"))
        .await
        .unwrap();
    let second = store
        .store_chunk("retry", 0, Bytes::from_static(b"again"))
        .await
        .unwrap();

    assert_eq!(first.chunk_id, second.chunk_id);
    assert_eq!(storage.keys(), vec![chunk_key("retry", 0)]);
    assert_eq!(storage.object(&chunk_key("retry", 0)).unwrap().body.as_ref(), b"again");
}

#[tokio::test]
async fn concurrent_combines_produce_one_asset() {
    let storage = MemoryStorage::new().with_min_part_size(SMALL_MIN_PART);
    let backend: DynBackend = Arc::new(Instrumented::new(storage.clone()));
    let store = ChunkStore::new(backend.clone());
    let data = pattern((SMALL_CHUNK + 2) as usize);
    let total = push_chunks(&store, "dup", &data, SMALL_CHUNK).await;

    let engine = engine(backend, SMALL_MIN_PART, 3);
    let twin = engine.clone();
    let req = request("dup", "application/octet-stream", total, SMALL_CHUNK);
    let (first, second) = tokio::join!(engine.assemble(&req), twin.assemble(&req));

    let (asset, refused) = match (first, second) {
        (Ok(asset), Err(err)) | (Err(err), Ok(asset)) => (asset, err),
        (first, second) => panic!("expected exactly one asset, got {first:?} and {second:?}"),
    };
    assert!(matches!(refused, UploadError::AssemblyInProgress(ref id) if id == "dup"));
    assert_eq!(storage.keys(), vec![asset.id.to_string()]);
    assert_eq!(storage.object(&asset.id.to_string()).unwrap().body.as_ref(), data.as_slice());
    assert_eq!(storage.pending_uploads(), 0);

    // The claim is released once the winner finishes; the spent session
    // has nothing left to assemble.
    assert!(matches!(
        engine.assemble(&req).await,
        Err(UploadError::ChunkCountMismatch { expected: 2, found: 0 })
    ));
}
