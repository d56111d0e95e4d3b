//! The concrete session multiplexer.
//!
//! One writer task serializes frames onto the physical connection, one reader
//! task routes inbound frames to per-stream channels and queues peer-opened
//! streams for `accept`. Stream ids are split by role so the two ends never
//! collide: the dialing side allocates odd ids, the accepting side even ones.

use crate::frame::{read_frame, write_frame, Frame, FrameCipher, FrameKind};
use crate::{MuxError, MuxStream, Muxer};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, PollSender};
use tracing::{debug, trace};

/// Data frames are chunked so one stream cannot monopolize the connection.
const MAX_DATA_CHUNK: usize = 64 * 1024;

/// Per-stream inbound buffer, in frames.
const STREAM_BUFFER: usize = 32;

type StreamTable = Arc<Mutex<HashMap<u32, mpsc::Sender<Bytes>>>>;

/// Frame-multiplexed session over any byte stream, keyed by the session
/// credential issued at join.
pub struct FrameMuxer {
    outbound: mpsc::Sender<Frame>,
    accepted: tokio::sync::Mutex<mpsc::Receiver<LogicalStream>>,
    streams: StreamTable,
    next_stream_id: AtomicU32,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for FrameMuxer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameMuxer")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl FrameMuxer {
    /// Session end that initiated the join (allocates odd stream ids).
    pub fn client<S>(io: S, session_key: &[u8]) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::start(io, session_key, 1)
    }

    /// Session end that accepted the join (allocates even stream ids).
    pub fn server<S>(io: S, session_key: &[u8]) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::start(io, session_key, 2)
    }

    fn start<S>(io: S, session_key: &[u8], first_stream_id: u32) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let cipher = Arc::new(FrameCipher::new(session_key));
        let (read_half, write_half) = tokio::io::split(io);
        let (outbound_tx, outbound_rx) = mpsc::channel::<Frame>(64);
        let (accept_tx, accept_rx) = mpsc::channel::<LogicalStream>(16);
        let streams: StreamTable = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = CancellationToken::new();

        let writer = tokio::spawn(write_loop(
            write_half,
            outbound_rx,
            cipher.clone(),
            shutdown.clone(),
        ));
        let reader = tokio::spawn(read_loop(
            read_half,
            cipher,
            streams.clone(),
            accept_tx,
            outbound_tx.clone(),
            shutdown.clone(),
        ));

        Arc::new(Self {
            outbound: outbound_tx,
            accepted: tokio::sync::Mutex::new(accept_rx),
            streams,
            next_stream_id: AtomicU32::new(first_stream_id),
            shutdown,
            tasks: Mutex::new(vec![writer, reader]),
        })
    }

    /// Whether the physical connection is still alive.
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

#[async_trait]
impl Muxer for FrameMuxer {
    async fn dial(&self) -> Result<MuxStream, MuxError> {
        if self.shutdown.is_cancelled() {
            return Err(MuxError::Closed);
        }

        let id = self.next_stream_id.fetch_add(2, Ordering::Relaxed);
        let (data_tx, data_rx) = mpsc::channel(STREAM_BUFFER);
        self.streams.lock().unwrap().insert(id, data_tx);

        if self.outbound.send(Frame::open(id)).await.is_err() {
            self.streams.lock().unwrap().remove(&id);
            return Err(MuxError::Closed);
        }

        trace!(stream_id = id, "opened outbound logical stream");
        Ok(Box::new(LogicalStream::new(id, data_rx, self.outbound.clone())))
    }

    async fn accept(&self) -> Result<MuxStream, MuxError> {
        let mut accepted = self.accepted.lock().await;
        match accepted.recv().await {
            Some(stream) => Ok(Box::new(stream)),
            None => Err(MuxError::Closed),
        }
    }

    async fn close(&self) {
        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            task.abort();
        }
        self.streams.lock().unwrap().clear();
    }
}

async fn write_loop<W>(
    io: W,
    mut outbound: mpsc::Receiver<Frame>,
    cipher: Arc<FrameCipher>,
    shutdown: CancellationToken,
) where
    W: AsyncWrite + Send + Unpin,
{
    let mut io = tokio::io::BufWriter::new(io);
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        if let Err(err) = write_frame(&mut io, &cipher, &frame).await {
            debug!("session write loop ended: {err}");
            break;
        }
    }
    shutdown.cancel();
    let _ = io.shutdown().await;
}

async fn read_loop<R>(
    mut io: R,
    cipher: Arc<FrameCipher>,
    streams: StreamTable,
    accept_tx: mpsc::Sender<LogicalStream>,
    outbound: mpsc::Sender<Frame>,
    shutdown: CancellationToken,
) where
    R: AsyncRead + Send + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = read_frame(&mut io, &cipher) => match frame {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(err) => {
                    debug!("session read loop ended: {err}");
                    break;
                }
            },
        };

        match frame.kind {
            FrameKind::Open => {
                let (data_tx, data_rx) = mpsc::channel(STREAM_BUFFER);
                streams.lock().unwrap().insert(frame.stream_id, data_tx);
                let stream = LogicalStream::new(frame.stream_id, data_rx, outbound.clone());
                if accept_tx.send(stream).await.is_err() {
                    streams.lock().unwrap().remove(&frame.stream_id);
                    let _ = outbound.send(Frame::close(frame.stream_id)).await;
                }
            }
            FrameKind::Data => {
                let sender = streams.lock().unwrap().get(&frame.stream_id).cloned();
                match sender {
                    Some(tx) => {
                        if tx.send(frame.payload).await.is_err() {
                            // local reader is gone, stop the peer
                            streams.lock().unwrap().remove(&frame.stream_id);
                            let _ = outbound.send(Frame::close(frame.stream_id)).await;
                        }
                    }
                    None => trace!(stream_id = frame.stream_id, "data frame for unknown stream"),
                }
            }
            FrameKind::Close => {
                streams.lock().unwrap().remove(&frame.stream_id);
            }
        }
    }

    shutdown.cancel();
    // dropping the senders ends every open stream and pending accept
    streams.lock().unwrap().clear();
}

/// One logical byte stream, usable wherever a socket is.
pub struct LogicalStream {
    id: u32,
    incoming: mpsc::Receiver<Bytes>,
    readbuf: Bytes,
    read_closed: bool,
    outbound: PollSender<Frame>,
    // kept for the drop path, which cannot poll
    control: mpsc::Sender<Frame>,
    close_sent: bool,
}

impl LogicalStream {
    fn new(id: u32, incoming: mpsc::Receiver<Bytes>, outbound: mpsc::Sender<Frame>) -> Self {
        Self {
            id,
            incoming,
            readbuf: Bytes::new(),
            read_closed: false,
            outbound: PollSender::new(outbound.clone()),
            control: outbound,
            close_sent: false,
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.id
    }
}

impl AsyncRead for LogicalStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.readbuf.is_empty() {
                let n = this.readbuf.len().min(buf.remaining());
                buf.put_slice(&this.readbuf.split_to(n));
                return Poll::Ready(Ok(()));
            }
            if this.read_closed {
                return Poll::Ready(Ok(()));
            }
            match this.incoming.poll_recv(cx) {
                Poll::Ready(Some(bytes)) => this.readbuf = bytes,
                Poll::Ready(None) => {
                    this.read_closed = true;
                    return Poll::Ready(Ok(()));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for LogicalStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.close_sent {
            return Poll::Ready(Err(broken_pipe()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        match this.outbound.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let n = buf.len().min(MAX_DATA_CHUNK);
                let frame = Frame::data(this.id, Bytes::copy_from_slice(&buf[..n]));
                if this.outbound.send_item(frame).is_err() {
                    return Poll::Ready(Err(broken_pipe()));
                }
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(broken_pipe())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // frames are handed to the writer task as they are produced
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.close_sent {
            return Poll::Ready(Ok(()));
        }
        match this.outbound.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let _ = this.outbound.send_item(Frame::close(this.id));
                this.close_sent = true;
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(_)) => {
                this.close_sent = true;
                Poll::Ready(Ok(()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for LogicalStream {
    fn drop(&mut self) {
        if !self.close_sent {
            let _ = self.control.try_send(Frame::close(self.id));
        }
    }
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "logical stream closed")
}
