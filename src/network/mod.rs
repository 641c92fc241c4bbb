pub mod allocator;
pub mod association;
pub mod mac;
pub mod persistence;

pub use allocator::{AddressPool, NetworkAllocator};
pub use association::{Association, AssociationEntry};
pub use mac::{is_valid_mac, MacAllocator};
pub use persistence::{MemoryPersistence, Persistence};
