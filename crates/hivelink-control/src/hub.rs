//! Join authorization and session lifecycle.

use crate::directory::{DirectoryError, NodeDirectory, NodeStatus};
use crate::record::ConnectionRecord;
use crate::registry::SessionRegistry;
use axum::Router;
use hivelink_connection::{FrameMuxer, MuxStream, Muxer};
use hivelink_proto::{MinionIdent, MinionIssue};
use http::HeaderMap;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use rand::rngs::SmallRng;
use rand::{Rng, RngCore, SeedableRng};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tower::ServiceExt;
use tracing::{debug, info, warn};

/// Hub errors
///
/// The permanent variants are the ones a peer must not retry; everything
/// else is transient from its point of view.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("minion address must be a routable IPv4 address")]
    BadInet,

    #[error("node is registering")]
    Registering,

    #[error("node is not activated")]
    Inactive,

    #[error("node has been removed")]
    Removed,

    #[error("node is already online")]
    AlreadyOnline,

    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

impl HubError {
    /// Permanent rejections answer 406 and stop a well-behaved peer's
    /// retry loop.
    pub fn is_permanent(&self) -> bool {
        matches!(self, HubError::Removed | HubError::AlreadyOnline)
    }
}

/// A successful auth decision: the credential to issue and any extra
/// response headers to carry on the 202.
#[derive(Debug)]
pub struct Grant {
    pub issue: MinionIssue,
    pub headers: HeaderMap,
}

/// Owns the auth decision and every joined session's serve loop.
pub struct MinionHub {
    directory: Arc<dyn NodeDirectory>,
    registry: Arc<SessionRegistry>,
    handler: Router,
    random: Mutex<SmallRng>,
}

impl MinionHub {
    /// `handler` serves every request a joined minion sends over its
    /// session; the calling session's [`ConnectionRecord`] rides along as a
    /// request extension.
    pub fn new(
        directory: Arc<dyn NodeDirectory>,
        registry: Arc<SessionRegistry>,
        handler: Router,
    ) -> Self {
        Self {
            directory,
            registry,
            handler,
            random: Mutex::new(SmallRng::from_entropy()),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// The auth decision: pure function of the presented identity and the
    /// persisted node state.
    pub async fn authorize(&self, ident: &MinionIdent) -> Result<Grant, HubError> {
        let inet = ident.inet;
        if inet.is_loopback() || inet.is_unspecified() {
            return Err(HubError::BadInet);
        }

        let node = match self.directory.find_by_inet(inet).await? {
            Some(node) => node,
            None => {
                // first contact: park it for an operator and have the
                // minion retry later
                self.directory.create_pending(ident).await?;
                return Err(HubError::Registering);
            }
        };

        match node.status {
            NodeStatus::Inactive => Err(HubError::Inactive),
            NodeStatus::Removed => Err(HubError::Removed),
            NodeStatus::Online => Err(HubError::AlreadyOnline),
            NodeStatus::Offline => Ok(Grant {
                issue: MinionIssue {
                    id: node.id,
                    passwd: self.issue_key(),
                },
                headers: HeaderMap::new(),
            }),
        }
    }

    /// Run a joined session to completion: upgrade the raw connection to a
    /// server-side multiplexer, claim the session id, persist the join, and
    /// serve logical streams until the connection dies.
    ///
    /// The registry insert is the authoritative uniqueness point - the
    /// directory's "already online" answer is only a fast-path hint. The
    /// closing demotion is guarded by the status predicate alone; it is not
    /// transactional with the registry removal, so an old session's offline
    /// write racing a brand-new session's online write remains possible and
    /// accepted.
    pub async fn join(
        &self,
        conn: MuxStream,
        ident: MinionIdent,
        issue: MinionIssue,
    ) -> Result<(), HubError> {
        let mux = FrameMuxer::server(conn, &issue.passwd);
        let record = Arc::new(ConnectionRecord::new(ident, issue, mux.clone()));
        let key = record.session_key();

        if !self.registry.insert(key.clone(), record.clone()) {
            mux.close().await;
            return Err(HubError::AlreadyOnline);
        }

        if let Err(err) = self
            .directory
            .mark_online(record.session_id(), record.ident())
            .await
        {
            self.registry.remove(&key);
            mux.close().await;
            return Err(err.into());
        }

        let inet = record.inet();
        info!(%inet, session = record.session_id(), "minion joined");

        self.serve(&mux, &record).await;

        self.registry.remove(&key);
        if let Err(err) = self
            .directory
            .mark_offline_if_online(record.session_id())
            .await
        {
            warn!(%inet, "offline demotion failed: {err}");
        }
        info!(%inet, session = record.session_id(), "minion left");
        Ok(())
    }

    /// Sweep stale online rows; run once at startup before accepting joins.
    pub async fn reset_online(&self) -> Result<u64, HubError> {
        Ok(self.directory.reset_online().await?)
    }

    /// Serve logical streams until the physical connection dies. Each
    /// stream carries one HTTP exchange, handled by the hub's router with
    /// the session record attached.
    async fn serve(&self, mux: &Arc<FrameMuxer>, record: &Arc<ConnectionRecord>) {
        loop {
            let stream = match mux.accept().await {
                Ok(stream) => stream,
                Err(_) => break,
            };

            let router = self.handler.clone();
            let record = record.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: hyper::Request<Incoming>| {
                    let router = router.clone();
                    let record = record.clone();
                    async move {
                        let mut req = req.map(axum::body::Body::new);
                        req.extensions_mut().insert(record);
                        router.oneshot(req).await
                    }
                });

                if let Err(err) = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    debug!("minion stream ended: {err}");
                }
            });
        }
    }

    /// 32-64 random bytes per session.
    fn issue_key(&self) -> Vec<u8> {
        let mut rng = self.random.lock().unwrap();
        let len = rng.gen_range(32..=64);
        let mut key = vec![0u8; len];
        rng.fill_bytes(&mut key);
        key
    }
}
