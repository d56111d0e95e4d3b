//! Persisted node state: the directory the auth decision runs against.
//!
//! The broker core only speaks this trait; the production backend (an ORM
//! over the manager's database) lives outside the crate. [`MemoryDirectory`]
//! is the in-process reference implementation the tests run against.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hivelink_proto::MinionIdent;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::RwLock;
use thiserror::Error;

/// Persisted lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Known but not yet activated by an operator.
    Inactive,
    /// Activated, currently disconnected.
    Offline,
    /// Activated, a session is (or was last known to be) live.
    Online,
    /// Tombstoned; joins are refused permanently.
    Removed,
}

/// One persisted node row.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub id: i64,
    pub inet: Ipv4Addr,
    pub name: String,
    pub status: NodeStatus,
    pub joined_at: Option<DateTime<Utc>>,
    pub pinged_at: Option<DateTime<Utc>>,
}

/// Directory errors
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory backend failure: {0}")]
    Backend(String),
}

/// The persistence contract the join protocol needs.
#[async_trait]
pub trait NodeDirectory: Send + Sync {
    /// Node keyed by its outbound IP, if one exists.
    async fn find_by_inet(&self, inet: Ipv4Addr) -> Result<Option<NodeRecord>, DirectoryError>;

    /// First contact: record the node in the inactive/pending state so an
    /// operator can activate it.
    async fn create_pending(&self, ident: &MinionIdent) -> Result<(), DirectoryError>;

    /// Persist a successful join: status online, join/ping timestamps, and
    /// the freshest machine facts.
    async fn mark_online(&self, id: i64, ident: &MinionIdent) -> Result<(), DirectoryError>;

    /// Demote to offline only while still online. The predicate is the
    /// guard against demoting a newer session that already re-registered
    /// this id.
    async fn mark_offline_if_online(&self, id: i64) -> Result<(), DirectoryError>;

    /// Sweep every node this broker left online back to offline; run at
    /// startup before accepting joins. Returns how many rows changed.
    async fn reset_online(&self) -> Result<u64, DirectoryError>;
}

/// In-memory reference implementation.
pub struct MemoryDirectory {
    nodes: RwLock<HashMap<Ipv4Addr, NodeRecord>>,
    next_id: AtomicI64,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    /// Seed a node row, returning its id.
    pub fn seed(&self, inet: Ipv4Addr, status: NodeStatus) -> i64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.nodes.write().unwrap().insert(
            inet,
            NodeRecord {
                id,
                inet,
                name: inet.to_string(),
                status,
                joined_at: None,
                pinged_at: None,
            },
        );
        id
    }

    pub fn status_of(&self, inet: Ipv4Addr) -> Option<NodeStatus> {
        self.nodes
            .read()
            .unwrap()
            .get(&inet)
            .map(|node| node.status)
    }
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeDirectory for MemoryDirectory {
    async fn find_by_inet(&self, inet: Ipv4Addr) -> Result<Option<NodeRecord>, DirectoryError> {
        Ok(self.nodes.read().unwrap().get(&inet).cloned())
    }

    async fn create_pending(&self, ident: &MinionIdent) -> Result<(), DirectoryError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.nodes.write().unwrap().insert(
            ident.inet,
            NodeRecord {
                id,
                inet: ident.inet,
                name: ident.inet.to_string(),
                status: NodeStatus::Inactive,
                joined_at: None,
                pinged_at: None,
            },
        );
        Ok(())
    }

    async fn mark_online(&self, id: i64, _ident: &MinionIdent) -> Result<(), DirectoryError> {
        let mut nodes = self.nodes.write().unwrap();
        let node = nodes
            .values_mut()
            .find(|node| node.id == id)
            .ok_or_else(|| DirectoryError::Backend(format!("unknown node id {id}")))?;

        let now = Utc::now();
        node.status = NodeStatus::Online;
        node.joined_at = Some(now);
        node.pinged_at = Some(now);
        Ok(())
    }

    async fn mark_offline_if_online(&self, id: i64) -> Result<(), DirectoryError> {
        let mut nodes = self.nodes.write().unwrap();
        if let Some(node) = nodes.values_mut().find(|node| node.id == id) {
            if node.status == NodeStatus::Online {
                node.status = NodeStatus::Offline;
            }
        }
        Ok(())
    }

    async fn reset_online(&self) -> Result<u64, DirectoryError> {
        let mut nodes = self.nodes.write().unwrap();
        let mut changed = 0;
        for node in nodes.values_mut() {
            if node.status == NodeStatus::Online {
                node.status = NodeStatus::Offline;
                changed += 1;
            }
        }
        Ok(changed)
    }
}
