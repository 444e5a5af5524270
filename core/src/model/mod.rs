//! Wire and storage data types shared across every component.

mod checkpoint;
mod discovery;
mod host;
mod ids;
mod message;
mod session;
mod vector;

pub use checkpoint::CheckpointRecord;
pub use discovery::{DiscoveryObservation, DiscoverySourceKind};
pub use host::Host;
pub use ids::{ChunkId, DocumentId, HostId, SessionId};
pub use message::{Message, MessageRole};
pub use session::{Session, SessionConfig, SessionState};
pub use vector::VectorChunk;
