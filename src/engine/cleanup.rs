use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::model::{Id, MutationOutcome};

/// Faults of the image subsystem. Business-level "already gone" is not an
/// error; it surfaces as `RecordDidNotExist` from
/// [`ImageService::delete_image`].
#[derive(Debug, thiserror::Error)]
pub enum ImageServiceError {
    #[error("image storage unavailable: {0}")]
    Unavailable(String),
    #[error("stored file {0} is corrupt")]
    Corrupt(Id),
    #[error("image rejected: {0}")]
    Rejected(String),
}

/// Limits applied when storing an image.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageConstraints {
    pub max_bytes: Option<usize>,
}

/// Descriptor of a stored image file. The id is what entity rows reference
/// (`logo_image_id`, `map_image_id` etc.).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub id: Id,
    pub byte_len: usize,
}

/// Context threaded into cascaded image deletions so the image log can link
/// the removal back to the operation that orphaned the file.
#[derive(Debug, Clone, Default)]
pub struct CascadeContext {
    pub root_log_id: Option<Id>,
    pub parent_kind: Option<String>,
}

/// The opaque image-processing collaborator. Callers store images through
/// it before invoking a mutation, so the resulting stored-file id can be
/// carried in the entity's image fields; the engine itself only ever asks it
/// to delete stored files that a committed mutation orphaned. Deletion is
/// idempotent (a second delete of the same id reports `RecordDidNotExist`).
#[async_trait::async_trait]
pub trait ImageService: Send + Sync {
    async fn store_image(
        &self,
        bytes: Vec<u8>,
        constraints: &ImageConstraints,
        ctx: &CascadeContext,
    ) -> Result<StoredFile, ImageServiceError>;

    async fn delete_image(
        &self,
        stored_file_id: &Id,
        ctx: &CascadeContext,
    ) -> Result<MutationOutcome, ImageServiceError>;
}

/// Derived caches keyed by mutated entities, e.g. the timezone lookup cache
/// keyed by building id. Invalidation is fire-and-forget but awaited before
/// the mutation returns.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    BuildingTimezone(Id),
}

#[async_trait::async_trait]
pub trait CacheInvalidator: Send + Sync {
    async fn invalidate(&self, key: CacheKey);
}

/// In-memory image service for tests and embedded deployments. Tracks which
/// ids exist so repeated deletions exercise the idempotency contract.
#[derive(Debug, Default)]
pub struct MemoryImageService {
    stored: Mutex<HashSet<Id>>,
    deletions: Mutex<Vec<Id>>,
}

impl MemoryImageService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, id: impl Into<Id>) {
        self.stored.lock().insert(id.into());
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.stored.lock().contains(id)
    }

    /// Every id a deletion was requested for, in request order.
    pub fn deletion_log(&self) -> Vec<Id> {
        self.deletions.lock().clone()
    }
}

#[async_trait::async_trait]
impl ImageService for MemoryImageService {
    async fn store_image(
        &self,
        bytes: Vec<u8>,
        constraints: &ImageConstraints,
        _ctx: &CascadeContext,
    ) -> Result<StoredFile, ImageServiceError> {
        if let Some(max) = constraints.max_bytes {
            if bytes.len() > max {
                return Err(ImageServiceError::Rejected(format!(
                    "{} bytes exceeds the {} byte limit",
                    bytes.len(),
                    max
                )));
            }
        }
        let file = StoredFile {
            id: crate::model::generate_id(),
            byte_len: bytes.len(),
        };
        self.stored.lock().insert(file.id.clone());
        Ok(file)
    }

    async fn delete_image(
        &self,
        stored_file_id: &Id,
        _ctx: &CascadeContext,
    ) -> Result<MutationOutcome, ImageServiceError> {
        self.deletions.lock().push(stored_file_id.clone());
        if self.stored.lock().remove(stored_file_id) {
            Ok(MutationOutcome::Ok)
        } else {
            Ok(MutationOutcome::RecordDidNotExist)
        }
    }
}

/// In-memory cache invalidator recording the keys it was asked to drop.
#[derive(Debug, Default)]
pub struct MemoryCacheInvalidator {
    invalidated: Mutex<Vec<CacheKey>>,
}

impl MemoryCacheInvalidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invalidated(&self) -> Vec<CacheKey> {
        self.invalidated.lock().clone()
    }
}

#[async_trait::async_trait]
impl CacheInvalidator for MemoryCacheInvalidator {
    async fn invalidate(&self, key: CacheKey) {
        self.invalidated.lock().push(key);
    }
}

/// Side effects a committed mutation owes the outside world. Collected
/// inside the transaction, run after commit, joined before the caller gets
/// its response. Individual failures are logged and swallowed; the
/// committed mutation stands regardless.
#[derive(Debug, Default)]
pub struct PostCommit {
    pub orphaned_images: Vec<Id>,
    pub cache_keys: Vec<CacheKey>,
    pub cascade: CascadeContext,
}

impl PostCommit {
    pub fn is_empty(&self) -> bool {
        self.orphaned_images.is_empty() && self.cache_keys.is_empty()
    }

    pub async fn run(self, images: Arc<dyn ImageService>, caches: Arc<dyn CacheInvalidator>) {
        if self.is_empty() {
            return;
        }
        let mut tasks = Vec::new();
        let ctx = Arc::new(self.cascade);
        for image_id in self.orphaned_images {
            let images = Arc::clone(&images);
            let ctx = Arc::clone(&ctx);
            tasks.push(tokio::spawn(async move {
                match images.delete_image(&image_id, &ctx).await {
                    Ok(MutationOutcome::Ok) => {}
                    Ok(outcome) => {
                        log::debug!("image {} cleanup reported {:?}", image_id, outcome)
                    }
                    Err(err) => log::warn!("image {} cleanup failed: {}", image_id, err),
                }
            }));
        }
        for key in self.cache_keys {
            let caches = Arc::clone(&caches);
            tasks.push(tokio::spawn(async move {
                caches.invalidate(key).await;
            }));
        }
        for task in tasks {
            if let Err(err) = task.await {
                log::warn!("post-commit cleanup task panicked: {}", err);
            }
        }
    }
}
