pub mod manager;
pub mod models;
pub mod store;

pub use manager::{size_for, RiskManager};
pub use models::*;
pub use store::{MemoryStateStore, PersistedState, SqlStateStore, StateStore, StorageError};
