//! Hivelink Protocol Definitions
//!
//! This crate defines the handshake payload types exchanged between minions,
//! the broker and the manager, the pre-shared-key payload cipher, and the
//! raw-socket HTTP CONNECT framing used before a session is upgraded to a
//! multiplexed transport.

pub mod cipher;
pub mod handshake;
pub mod ident;

pub use cipher::{decrypt_json, encrypt_json, Cipher, CipherError, PresharedCipher};
pub use handshake::{HandshakeError, JoinRequest, RejectError};
pub use ident::{
    BrokerIdent, BrokerIssue, DatabaseConfig, Listen, LoggerConfig, MinionIdent, MinionIssue,
};

/// Join path a minion CONNECTs to on the broker.
pub const MINION_JOIN_PATH: &str = "/api/v1/minion";

/// Join path the broker CONNECTs to on the manager.
pub const BROKER_JOIN_PATH: &str = "/api/v1/broker";

/// Upper bound on an encrypted identity payload read during a join.
pub const MAX_IDENT_SIZE: usize = 100 * 1024;

/// Upper bound on an encrypted credential payload in a 202 response.
pub const MAX_CREDENTIAL_SIZE: usize = 40 * 1024;
