//! # Vital Server Redis
//!
//! Distributed resource locking for Vital servers that share one data store. A lock on a
//! keyset is granted by a majority of independent Redis replicas (Redlock) for a short lease,
//! and the guarded body is told through its cancellation token when the lease runs out.
//!
//! ## Example
//!
//! ```rust,no_run
//! use vital_server_redis::{RedlockConfig, RedlockLocker};
//! use vital_shared::{Locker, ResourceKey};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RedlockConfig::default().with_namespace("tenant-a:");
//!     let locker = RedlockLocker::from_config(config)?;
//!
//!     let keys = [ResourceKey::from("Patient?identifier=http://example.com|123")];
//!     locker.lock(&keys, |_token| async { Ok(()) }).await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod coordination;
pub mod error;
pub mod replica;

pub use client::RedisReplica;
pub use config::RedlockConfig;
pub use coordination::{Lease, RedlockLocker};
pub use error::{RedlockError, RedlockResult};
pub use replica::{LockReplica, MemoryReplica};
