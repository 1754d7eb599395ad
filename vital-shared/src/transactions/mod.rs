// Bundle transaction module organization
//
// - locks: locker contract, in-process and no-op lockers
// - plan: lock keyset computation and bundle pre-checks
// - executor: ordered entry execution with batch isolation or transaction rollback

pub mod executor;
pub mod locks;
pub mod plan;

pub use executor::{BundleExecutor, BundleState, ExecutorConfig};
pub use locks::{normalize_keys, InMemoryLocker, LockHandle, Locker, LockerConfig, NopLocker};
pub use plan::{entry_lock_key, lock_keys, validate_bundle};
