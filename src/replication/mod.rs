//! Replication Module
//!
//! Ships copies of written chunks to peer instances with per-destination
//! flow control.

pub mod manager;
pub mod placement;
pub mod protocol;
pub mod transport;

pub use manager::{ReplicationItem, ReplicationManager};
pub use placement::Placement;
pub use protocol::ReplicaMessage;
pub use transport::{ConnectionStatus, MemoryTransport, QueueClass, SendError, Transport};
