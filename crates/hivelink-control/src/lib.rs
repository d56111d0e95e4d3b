//! Downstream control plane: the minion join protocol.
//!
//! [`Gateway`] accepts raw minion connections and runs the CONNECT
//! handshake, [`MinionHub`] makes the auth decision against the
//! [`NodeDirectory`] and owns each joined session's serve loop, and
//! [`SessionRegistry`] is the concurrent map that enforces at most one live
//! session per node id.

pub mod directory;
pub mod gateway;
pub mod hub;
pub mod record;
pub mod registry;

pub use directory::{
    DirectoryError, MemoryDirectory, NodeDirectory, NodeRecord, NodeStatus,
};
pub use gateway::Gateway;
pub use hub::{Grant, HubError, MinionHub};
pub use record::{caller, ConnectionRecord};
pub use registry::SessionRegistry;
