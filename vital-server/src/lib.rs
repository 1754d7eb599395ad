pub mod config;
pub mod locker;
pub mod persistence;
pub mod server;

pub use config::*;
pub use locker::ServerLocker;
pub use server::*;
