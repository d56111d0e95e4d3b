//! Frame codec for the session transport.
//!
//! Wire layout per frame: stream id (u32), kind (u8), payload length (u32),
//! payload. Payloads are sealed with AES-256-GCM under a key derived from the
//! session credential, a random 96-bit nonce prepended to each sealed
//! payload.

use crate::MuxError;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use bytes::{BufMut, Bytes, BytesMut};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frame header size: stream id (4) + kind (1) + length (4).
pub const HEADER_SIZE: usize = 9;

/// Maximum sealed payload size accepted on the wire (16MB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

const NONCE_LEN: usize = 12;

/// Frame kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Open = 0,
    Data = 1,
    Close = 2,
}

impl TryFrom<u8> for FrameKind {
    type Error = MuxError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameKind::Open),
            1 => Ok(FrameKind::Data),
            2 => Ok(FrameKind::Close),
            _ => Err(MuxError::InvalidKind(value)),
        }
    }
}

/// One session frame, payload still in the clear.
#[derive(Debug, Clone)]
pub struct Frame {
    pub stream_id: u32,
    pub kind: FrameKind,
    pub payload: Bytes,
}

impl Frame {
    pub fn open(stream_id: u32) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Open,
            payload: Bytes::new(),
        }
    }

    pub fn data(stream_id: u32, payload: Bytes) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Data,
            payload,
        }
    }

    pub fn close(stream_id: u32) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Close,
            payload: Bytes::new(),
        }
    }
}

/// Per-session frame cipher keyed by the issued credential.
///
/// The credential is 32-64 bytes; it is hashed onto the AEAD's fixed key
/// size, keeping the issued bytes the only secret.
pub struct FrameCipher {
    aead: Aes256Gcm,
}

impl FrameCipher {
    pub fn new(session_key: &[u8]) -> Self {
        let digest = Sha256::digest(session_key);
        let key = Key::<Aes256Gcm>::from_slice(&digest);
        Self {
            aead: Aes256Gcm::new(key),
        }
    }

    fn seal(&self, payload: &[u8]) -> Result<Bytes, MuxError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let sealed = self
            .aead
            .encrypt(nonce, payload)
            .map_err(|_| MuxError::Cipher)?;

        let mut out = BytesMut::with_capacity(NONCE_LEN + sealed.len());
        out.put_slice(&nonce_bytes);
        out.put_slice(&sealed);
        Ok(out.freeze())
    }

    fn open(&self, sealed: &[u8]) -> Result<Bytes, MuxError> {
        if sealed.len() < NONCE_LEN {
            return Err(MuxError::Cipher);
        }
        let (nonce_bytes, body) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let payload = self.aead.decrypt(nonce, body).map_err(|_| MuxError::Cipher)?;
        Ok(Bytes::from(payload))
    }
}

/// Read one frame. `Ok(None)` means the physical connection closed at a
/// frame boundary (or mid-frame, which is treated the same way).
pub(crate) async fn read_frame<R>(
    io: &mut R,
    cipher: &FrameCipher,
) -> Result<Option<Frame>, MuxError>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; HEADER_SIZE];
    match io.read_exact(&mut head).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }

    let stream_id = u32::from_be_bytes([head[0], head[1], head[2], head[3]]);
    let kind = FrameKind::try_from(head[4])?;
    let len = u32::from_be_bytes([head[5], head[6], head[7], head[8]]);
    if len > MAX_FRAME_SIZE {
        return Err(MuxError::FrameTooLarge(len as usize));
    }

    let mut sealed = vec![0u8; len as usize];
    match io.read_exact(&mut sealed).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }

    let payload = cipher.open(&sealed)?;
    Ok(Some(Frame {
        stream_id,
        kind,
        payload,
    }))
}

pub(crate) async fn write_frame<W>(
    io: &mut W,
    cipher: &FrameCipher,
    frame: &Frame,
) -> Result<(), MuxError>
where
    W: AsyncWrite + Unpin,
{
    let sealed = cipher.seal(&frame.payload)?;

    let mut head = [0u8; HEADER_SIZE];
    head[..4].copy_from_slice(&frame.stream_id.to_be_bytes());
    head[4] = frame.kind as u8;
    head[5..].copy_from_slice(&(sealed.len() as u32).to_be_bytes());

    io.write_all(&head).await?;
    io.write_all(&sealed).await?;
    io.flush().await?;
    Ok(())
}
