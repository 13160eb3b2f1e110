pub mod config;
pub mod engine;
pub mod model;
pub mod store;

// Export all model types
pub use model::*;

// Export engine types
pub use engine::{
    BuildingEntity, CacheInvalidator, CacheKey, Clock, EntityDescriptor, EntityOps, FunctionEntity,
    ImageConstraints, ImageService, ImageServiceError, ManualClock, MemoryCacheInvalidator,
    MemoryImageService, MutationEngine, OrganizationEntity, Quantizer, RegionEntity, StoredFile,
    SystemClock,
};

// Export store types
pub use store::{EngineStore, EngineTxn, MemoryStore, PostgresStore};

/// Initialize logging for binaries and integration tests. Safe to call
/// more than once.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}

/// Quantizer sized from the configured history granularity.
pub fn quantizer_from(config: &config::AppConfig) -> Quantizer {
    Quantizer::new(chrono::Duration::seconds(config.granularity_secs()))
}

/// Connect to PostgreSQL using environment-driven configuration and run
/// pending migrations.
pub async fn connect() -> anyhow::Result<PostgresStore> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    let config = config::AppConfig::load()?;
    let database_url = config.database_url()?;
    let store = PostgresStore::new(&database_url).await?;
    store.migrate().await?;

    Ok(store)
}
