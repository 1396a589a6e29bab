//! Store implementations.

mod index;
mod memory;
mod snapshot;

pub use memory::InMemoryTaskStore;
pub use snapshot::{StateFile, StateLock, StoreSnapshot};
