//! Session-id resolution and relay primitives.

use hivelink_connection::{MuxError, MuxStream, Muxer};
use hivelink_control::SessionRegistry;
use http::{HeaderMap, Request, Response};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use thiserror::Error;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

/// Routing errors
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("minion {0} is offline")]
    Offline(String),

    #[error(transparent)]
    Mux(#[from] MuxError),

    #[error("request relay failed: {0}")]
    Relay(#[from] hyper::Error),

    #[error("stream handshake failed: {0}")]
    Stream(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Resolves minion session ids to logical streams and relays traffic over
/// them.
///
/// This is the dialer seam: the "address" of an outbound hop is a session
/// id looked up in the registry, never a hostname handed to the network
/// stack. A miss fails before anything is dialed.
pub struct RoutingFabric {
    registry: Arc<SessionRegistry>,
}

impl RoutingFabric {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Open a fresh logical stream on the target minion's session.
    pub async fn open(&self, minion_id: &str) -> Result<MuxStream, RouteError> {
        let record = self
            .registry
            .get(minion_id)
            .ok_or_else(|| RouteError::Offline(minion_id.to_string()))?;
        Ok(record.muxer().dial().await?)
    }

    /// Relay one request/response exchange verbatim over a fresh logical
    /// stream on the target session.
    pub async fn forward<B>(
        &self,
        minion_id: &str,
        req: Request<B>,
    ) -> Result<Response<Incoming>, RouteError>
    where
        B: hyper::body::Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let stream = self.open(minion_id).await?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                debug!("relay connection ended: {err}");
            }
        });

        Ok(sender.send_request(req).await?)
    }

    /// Perform a WebSocket client handshake over a fresh logical stream on
    /// the target session. `target` is the path (and query) on the minion,
    /// starting with `/`.
    pub async fn stream(
        &self,
        minion_id: &str,
        target: &str,
        headers: HeaderMap,
    ) -> Result<WebSocketStream<MuxStream>, RouteError> {
        let stream = self.open(minion_id).await?;

        // the authority is the session id: it names the hop, not a host
        let mut request = format!("ws://{minion_id}{target}").into_client_request()?;
        for (name, value) in headers.iter() {
            request.headers_mut().insert(name.clone(), value.clone());
        }

        let (ws, _response) = tokio_tungstenite::client_async(request, stream).await?;
        debug!(minion_id, target, "stream tunnel established");
        Ok(ws)
    }
}
