//! Handshake identity and credential payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::Duration;

/// Facts a minion presents when it joins the broker.
///
/// Built fresh for every handshake attempt, so the timestamp and pid may
/// differ across reconnects of the same node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinionIdent {
    /// Node software version.
    pub semver: String,
    /// Outbound IP of the interface the node dialed from.
    pub inet: Ipv4Addr,
    /// MAC of that interface, empty when it could not be determined.
    pub mac: String,
    pub os: String,
    pub arch: String,
    pub cpu: usize,
    pub pid: u32,
    pub workdir: String,
    pub executable: String,
    pub username: String,
    pub hostname: String,
    pub time_at: DateTime<Utc>,
}

/// Facts the broker presents when it joins the manager.
///
/// The same machine facts as [`MinionIdent`] plus the long-lived pre-shared
/// node id and secret the manager provisioned for this broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerIdent {
    pub id: i64,
    pub secret: String,
    pub semver: String,
    pub inet: Ipv4Addr,
    pub mac: String,
    pub os: String,
    pub arch: String,
    pub cpu: usize,
    pub pid: u32,
    pub workdir: String,
    pub executable: String,
    pub username: String,
    pub hostname: String,
    pub time_at: DateTime<Utc>,
}

/// Credential the broker issues to a minion that passed auth.
///
/// `passwd` keys the session's multiplexed transport and is 32-64 random
/// bytes, never reused across sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinionIssue {
    pub id: i64,
    pub passwd: Vec<u8>,
}

/// Credential the manager issues to a broker that passed auth.
///
/// Besides the session key this carries broker-visible configuration the
/// core passes through untouched: where to listen, how to log, where the
/// node directory lives.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrokerIssue {
    /// Name the manager assigned to this broker node.
    pub name: String,
    pub passwd: Vec<u8>,
    #[serde(default)]
    pub listen: Listen,
    #[serde(default)]
    pub logger: LoggerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

/// Listen configuration handed down by the manager. Opaque to the core.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Listen {
    pub addr: String,
    #[serde(default)]
    pub cert: Vec<u8>,
    #[serde(default)]
    pub pkey: Vec<u8>,
}

/// Logger configuration handed down by the manager. Opaque to the core.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggerConfig {
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub console: bool,
    #[serde(default)]
    pub directory: String,
    #[serde(default)]
    pub max_size: usize,
    #[serde(default)]
    pub max_age: usize,
    #[serde(default)]
    pub max_backups: usize,
    #[serde(default)]
    pub compress: bool,
}

/// Node directory backend configuration handed down by the manager.
/// Opaque to the core.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub dsn: String,
    #[serde(default)]
    pub max_open_conns: usize,
    #[serde(default)]
    pub max_idle_conns: usize,
    #[serde(default)]
    pub max_life_time: Option<Duration>,
    #[serde(default)]
    pub max_idle_time: Option<Duration>,
}
