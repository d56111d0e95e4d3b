//! Multiplexed session transport.
//!
//! A joined connection carries many independent logical byte streams over one
//! physical socket. The [`Muxer`] trait is the capability the broker core
//! consumes: open an outbound logical stream, accept peer-opened streams,
//! tear the session down. [`FrameMuxer`] is the concrete transport both sides
//! of a hivelink hop use, keyed by the session credential issued at join.

pub mod frame;
pub mod mux;

pub use frame::{Frame, FrameKind, MAX_FRAME_SIZE};
pub use mux::{FrameMuxer, LogicalStream};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Byte-stream capability required from a physical or logical connection.
pub trait SessionStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> SessionStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

impl std::fmt::Debug for dyn SessionStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionStream")
    }
}

/// One logical byte stream within a multiplexed session.
pub type MuxStream = Box<dyn SessionStream>;

/// Session transport errors
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("session is closed")]
    Closed,

    #[error("frame of {0} bytes exceeds the frame cap")]
    FrameTooLarge(usize),

    #[error("invalid frame kind: {0}")]
    InvalidKind(u8),

    #[error("frame rejected by the session cipher")]
    Cipher,

    #[error("session io failure: {0}")]
    Io(#[from] std::io::Error),
}

/// A multiplexed session over one physical connection.
///
/// `dial` may be called from any task concurrently with the owning task's
/// `accept` loop; that property is what the routing fabric relies on.
#[async_trait]
pub trait Muxer: Send + Sync {
    /// Open a new outbound logical stream.
    async fn dial(&self) -> Result<MuxStream, MuxError>;

    /// Wait for the peer to open a logical stream. Returns
    /// [`MuxError::Closed`] once the physical connection is gone.
    async fn accept(&self) -> Result<MuxStream, MuxError>;

    /// Tear down the session and every logical stream on it.
    async fn close(&self);
}
