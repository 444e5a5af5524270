//! Identity-scoped content-addressed storage (spec.md §4.2-§4.4).

mod conversation;
mod facade;
mod vector_store;

pub use conversation::ConversationStore;
pub use facade::{FsStorageFacade, StorageFacade, StorageMetadata};
pub use vector_store::VectorStore;
