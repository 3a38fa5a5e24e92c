//! Chat store implementations for weft.
//!
//! Every backend implements `weft_core::ChatStore`. Conversations are stored
//! whole; a partial update reads, patches, and writes back under the
//! backend's own serialisation.

pub mod file_backend;
pub mod in_memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use file_backend::FileStore;
pub use in_memory::InMemoryStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;
