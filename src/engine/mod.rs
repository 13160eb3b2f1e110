pub mod cleanup;
pub mod clock;
pub mod descriptor;
pub mod lock_key;
pub mod orchestrator;

pub use cleanup::{
    CacheInvalidator, CacheKey, CascadeContext, ImageConstraints, ImageService, ImageServiceError,
    MemoryCacheInvalidator, MemoryImageService, PostCommit, StoredFile,
};
pub use clock::{end_of_time, Clock, ManualClock, Quantizer, SystemClock};
pub use descriptor::{
    BuildingEntity, EntityDescriptor, FunctionEntity, OrganizationEntity, RegionEntity,
};
pub use lock_key::build_lock_key;
pub use orchestrator::{EntityOps, MutationEngine};
