//! Raw TCP gateway for minion joins.
//!
//! The gateway owns the listener socket: the CONNECT exchange is framed by
//! hand on the accepted connection, and on success the same socket is handed
//! to the hub as the session transport. Owning the socket outright is what
//! lets the 202 carry a body and the connection leave HTTP behind.

use crate::hub::MinionHub;
use hivelink_proto::{decrypt_json, encrypt_json, handshake, Cipher, MinionIdent, MINION_JOIN_PATH};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Accept loop for minion connections.
pub struct Gateway {
    hub: Arc<MinionHub>,
    cipher: Arc<dyn Cipher>,
}

impl Gateway {
    pub fn new(hub: Arc<MinionHub>, cipher: Arc<dyn Cipher>) -> Self {
        Self { hub, cipher }
    }

    /// Accept and serve minion connections until `shutdown` fires. Shutdown
    /// only stops the accept loop: sessions already joined run on until
    /// their peers disconnect.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) {
        info!(addr = ?listener.local_addr().ok(), "minion gateway listening");
        loop {
            let conn = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((conn, peer)) => {
                        debug!(%peer, "minion connection accepted");
                        conn
                    }
                    Err(err) => {
                        warn!("gateway accept failed: {err}");
                        continue;
                    }
                },
            };

            let hub = self.hub.clone();
            let cipher = self.cipher.clone();
            tokio::spawn(handle(hub, cipher, conn));
        }
        info!("minion gateway stopped accepting connections");
    }
}

/// One connection's join protocol, Accepted through Closed.
async fn handle(hub: Arc<MinionHub>, cipher: Arc<dyn Cipher>, mut conn: TcpStream) {
    let req = match handshake::read_connect_request(&mut conn).await {
        Ok(req) => req,
        Err(err) => {
            debug!("unreadable join request: {err}");
            let _ = handshake::write_reject_response(&mut conn, 400, "malformed join request").await;
            return;
        }
    };

    if !req.is_connect() {
        let message = format!("unsupported method: {}", req.method);
        let _ = handshake::write_reject_response(&mut conn, 400, &message).await;
        return;
    }

    if req.path != MINION_JOIN_PATH {
        let message = format!("unsupported join path: {}", req.path);
        let _ = handshake::write_reject_response(&mut conn, 400, &message).await;
        return;
    }

    let ident: MinionIdent = match decrypt_json(cipher.as_ref(), &req.body) {
        Ok(ident) => ident,
        Err(_) => {
            let _ =
                handshake::write_reject_response(&mut conn, 400, "invalid identity payload").await;
            return;
        }
    };

    let grant = match hub.authorize(&ident).await {
        Ok(grant) => grant,
        Err(err) => {
            let status = if err.is_permanent() { 406 } else { 400 };
            debug!(inet = %ident.inet, "join refused ({status}): {err}");
            let message = format!("authentication failed: {err}");
            let _ = handshake::write_reject_response(&mut conn, status, &message).await;
            return;
        }
    };

    let sealed = match encrypt_json(cipher.as_ref(), &grant.issue) {
        Ok(sealed) => sealed,
        Err(err) => {
            warn!("credential sealing failed: {err}");
            let _ = handshake::write_reject_response(&mut conn, 500, "internal error").await;
            return;
        }
    };

    if let Err(err) = handshake::write_accept_response(&mut conn, &grant.headers, &sealed).await {
        debug!(inet = %ident.inet, "join response write failed: {err}");
        return;
    }

    // the socket now belongs to the session
    if let Err(err) = hub.join(Box::new(conn), ident, grant.issue).await {
        warn!("join ended with error: {err}");
    }
}
