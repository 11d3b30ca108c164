use std::sync::Arc;

use crate::config::{HubConfig, StorageBackend};
use crate::storage::external::ExternalStore;
use crate::storage::memory::MemoryStore;
use crate::storage::Storage;

/// Owns the storage adapter and configuration the rest of the hub is built
/// from. Replaces the teacher's module-level `Db`/`EventBus` singletons with
/// one explicit value, injected into Rocket as managed state and passed to
/// the sweeper and webhook dispatcher background tasks (spec §9 design
/// note on singletons).
pub struct Hub {
    pub storage: Arc<dyn Storage>,
    pub config: HubConfig,
}

impl Hub {
    pub fn new(config: HubConfig) -> Self {
        let storage: Arc<dyn Storage> = match config.storage_backend {
            StorageBackend::Memory => Arc::new(MemoryStore::new(":memory:")),
            StorageBackend::External => {
                let url = config
                    .external_store_url
                    .clone()
                    .expect("EXTERNAL_STORE_URL must be set when STORAGE_BACKEND=external");
                Arc::new(ExternalStore::new(
                    url,
                    config.external_store_app_id.clone(),
                    config.external_store_api_key.clone(),
                ))
            }
        };
        Hub { storage, config }
    }

    #[cfg(test)]
    pub fn new_for_test() -> Self {
        Hub {
            storage: Arc::new(MemoryStore::new(":memory:")),
            config: HubConfig::default(),
        }
    }
}
