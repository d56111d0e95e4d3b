//! Upstream client - the broker's single resilient session to the manager.
//!
//! [`ManagerClient`] owns the whole session lifecycle: iterating candidate
//! manager endpoints, the CONNECT consult handshake, building the session
//! multiplexer, elapsed-time-tiered backoff between attempts, and explicit
//! reconnects. The manager pushes logical streams back through [`listen`],
//! and [`fetch`]/[`oneway`] issue broker-originated requests over fresh
//! logical streams.
//!
//! [`listen`]: ManagerClient::listen
//! [`fetch`]: ManagerClient::fetch
//! [`oneway`]: ManagerClient::oneway

pub mod addr;
pub mod backoff;
pub mod client;
pub mod dialer;

pub use addr::{Address, AddressList};
pub use backoff::BackoffClock;
pub use client::{BrokerConfig, ManagerClient, MuxListener};
pub use dialer::IterDialer;

use hivelink_connection::MuxError;
use hivelink_proto::{CipherError, HandshakeError, RejectError};
use thiserror::Error;

/// Upstream client errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("manager address list is empty")]
    EmptyAddress,

    #[error("dial loop cancelled")]
    Cancelled,

    #[error("no live manager session")]
    NotConnected,

    #[error("invalid TLS server name: {0}")]
    BadServerName(String),

    #[error(transparent)]
    Rejected(#[from] RejectError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Cipher(#[from] CipherError),

    #[error(transparent)]
    Mux(#[from] MuxError),

    #[error("request build failed: {0}")]
    Request(#[from] http::Error),

    #[error("manager request failed: {0}")]
    Transport(#[from] hyper::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
