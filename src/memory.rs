//! Memory: channel message history, topic-keyed memory cells, persistence.

pub mod persist;
pub mod store;
pub mod types;

pub use persist::{JsonFileStore, Persistence};
pub use store::MemoryStore;
pub use types::{MemoryCell, MemorySnapshot, StoredMessage, PLACEHOLDER_MESSAGE_ID};
