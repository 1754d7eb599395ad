//! Resource storage backends for the Vital server

use serde::{Deserialize, Serialize};

pub mod memory;

pub use memory::{MemoryResourceStore, MemoryStoreConfig, MemoryTransaction};

/// Configuration for the resource store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PersistenceConfig {
    /// In-memory storage (default, non-persistent)
    Memory(MemoryStoreConfig),
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        PersistenceConfig::Memory(MemoryStoreConfig::default())
    }
}

impl PersistenceConfig {
    pub fn create_store(&self) -> MemoryResourceStore {
        match self {
            PersistenceConfig::Memory(config) => MemoryResourceStore::new(config.clone()),
        }
    }
}
