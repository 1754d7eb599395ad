//! # Vital Shared
//!
//! Transactional write core of the Vital clinical data server: bundles of
//! create/read/update/delete operations executed in batch or transaction mode,
//! serialized across processes by resource lockers.

pub mod bundle;
pub mod config_utils;
pub mod context;
pub mod exception;
pub mod reference;
pub mod store;
pub mod transactions;

pub use bundle::{
    Bundle, BundleEntry, BundleMode, BundleResponse, EntryOperation, EntryOutcome, EntryTarget,
};
pub use config_utils::ConfigDefaults;
pub use context::{AccessMode, AuthenticatedIdentity, RequestContext};
pub use exception::*;
pub use reference::ReferenceResolver;
pub use store::{ResourceKey, ResourceStore, ResourceValidator, SearchCriteria, StructuralValidator};
pub use transactions::{
    BundleExecutor, ExecutorConfig, InMemoryLocker, LockHandle, Locker, LockerConfig, NopLocker,
};
