pub mod lock;
pub mod write;

pub use lock::{BoardLocks, LockPolicy};
pub use write::{AppliedBatch, WriteCoordinator};
