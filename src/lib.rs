pub mod config;
pub mod core;
pub mod errors;
pub mod idempotency;
pub mod network;
pub mod utils;

// Re-exports
pub use crate::core::{CreateRequest, CreationManager, InstanceHandle, TaskExecutor};
pub use errors::{ProvisionError, ProvisionResult};
pub use idempotency::{IdempotencyGuard, ReservationKey};
pub use network::{MemoryPersistence, NetworkAllocator, Persistence};
pub type AsyncMutex<T> = tokio::sync::Mutex<T>;
