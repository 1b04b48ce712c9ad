use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

use super::memory::MemoryProfileStore;
use super::sqlite::SqliteProfileStore;
use crate::config::settings::StorageConfig;
use crate::models::profile::BehavioralProfile;

/// Persistent per-user behavioral baselines.
///
/// Read on the decision path by anomaly detection and the embedding stage,
/// written only by adaptive learning.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn load(&self, user_id: &str) -> Result<Option<BehavioralProfile>>;

    async fn save(&self, profile: &BehavioralProfile) -> Result<()>;

    async fn count(&self) -> Result<usize>;
}

/// Build the profile store selected by `storage.backend`.
pub fn open_profile_store(config: &StorageConfig) -> Result<Arc<dyn ProfileStore>> {
    match config.backend.as_str() {
        "sqlite" => {
            let store = SqliteProfileStore::open(&config.sqlite_path)
                .with_context(|| format!("Failed to open profile database {}", config.sqlite_path))?;
            info!(path = %config.sqlite_path, "Using SQLite profile store");
            Ok(Arc::new(store))
        }
        _ => {
            info!("Using in-memory profile store");
            Ok(Arc::new(MemoryProfileStore::new()))
        }
    }
}
