//! Queue store: durable, ordered record of queue entries and their lifecycle.
//!
//! The [`QueueStore`] trait is the only seam other components use. Two
//! backends satisfy the same claim/transition contract: an in-memory store
//! for tests and embedding, and a SQLite store for the daemon.

pub mod memory;
pub mod sqlite;
pub mod store;
pub mod types;

pub use memory::InMemoryQueueStore;
pub use sqlite::SqliteQueueStore;
pub use store::{QueueError, QueueStore};
pub use types::{
    DeadLetterFilter, DeadLetterRecord, Message, MessageCategory, MessageError, MessagePriority,
    ParseEnumError, QueueEntry, QueueFilter, QueueStatus,
};
