pub mod journal;

pub use journal::{load_events, JournalEvent, JournalKind, QueueJournal};
