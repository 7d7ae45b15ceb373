pub mod config;
pub mod pool;

pub use config::{AlterStrategy, LockMode, StoreConfig};
pub use pool::{ConnectionPool, PoolGuard, PoolStats};
