//! The broker's session to the manager.

use crate::addr::{Address, AddressList};
use crate::backoff::BackoffClock;
use crate::dialer::{DialedConn, IterDialer};
use crate::ClientError;
use bytes::Bytes;
use chrono::Utc;
use hivelink_connection::{FrameMuxer, MuxError, MuxStream, Muxer};
use hivelink_proto::{
    decrypt_json, encrypt_json, handshake, BrokerIdent, BrokerIssue, Cipher, HandshakeError,
    BROKER_JOIN_PATH,
};
use http::{Method, Request, Response};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-attempt TCP/TLS connect timeout.
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Path the heartbeat pings on the manager.
const PING_PATH: &str = "/api/v1/ping";

/// Pre-shared bootstrap facts for this broker.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Node id the manager provisioned.
    pub id: i64,
    /// Shared secret proving ownership of the id.
    pub secret: String,
    /// Broker software version reported at handshake.
    pub semver: String,
    /// Candidate manager endpoints.
    pub servers: Vec<Address>,
}

struct Session {
    ident: BrokerIdent,
    issue: BrokerIssue,
    mux: Arc<dyn Muxer>,
    scope: CancellationToken,
}

/// The broker's single resilient session to the manager.
pub struct ManagerClient {
    config: BrokerConfig,
    cipher: Arc<dyn Cipher>,
    dialer: IterDialer,
    parent: CancellationToken,
    session: RwLock<Option<Session>>,
}

impl std::fmt::Debug for ManagerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ManagerClient {
    /// Dial the manager, blocking until a session is established, the
    /// manager rejects this broker permanently, or `parent` is cancelled.
    pub async fn dial(
        config: BrokerConfig,
        cipher: Arc<dyn Cipher>,
        parent: CancellationToken,
    ) -> Result<Self, ClientError> {
        if config.servers.is_empty() {
            return Err(ClientError::EmptyAddress);
        }
        let mut servers = AddressList::new(config.servers.clone());
        servers.format();

        let client = Self {
            config,
            cipher,
            dialer: IterDialer::new(servers),
            parent,
            session: RwLock::new(None),
        };
        let session = client.dial_session().await?;
        *client.session.write().unwrap() = Some(session);
        Ok(client)
    }

    /// Tear down the current session and dial again from a fresh backoff
    /// clock.
    pub async fn reconnect(&self) -> Result<(), ClientError> {
        let stale = self.session.write().unwrap().take();
        if let Some(session) = stale {
            session.scope.cancel();
            session.mux.close().await;
        }

        let session = self.dial_session().await?;
        *self.session.write().unwrap() = Some(session);
        Ok(())
    }

    /// Identity presented at the last successful handshake.
    pub fn ident(&self) -> Option<BrokerIdent> {
        self.session
            .read()
            .unwrap()
            .as_ref()
            .map(|session| session.ident.clone())
    }

    /// Credential the manager issued at the last successful handshake.
    pub fn issue(&self) -> Option<BrokerIssue> {
        self.session
            .read()
            .unwrap()
            .as_ref()
            .map(|session| session.issue.clone())
    }

    /// `broker-{inet}-{id}`, once a session exists.
    pub fn node_name(&self) -> Option<String> {
        self.ident()
            .map(|ident| format!("broker-{}-{}", ident.inet, ident.id))
    }

    /// The session multiplexer as a stream acceptor: this is how the manager
    /// pushes logical streams into the broker's own request server.
    pub fn listen(&self) -> Result<MuxListener, ClientError> {
        Ok(MuxListener { mux: self.muxer()? })
    }

    /// Issue one request to the manager over a fresh logical stream.
    pub async fn fetch(
        &self,
        req: Request<Full<Bytes>>,
    ) -> Result<Response<Incoming>, ClientError> {
        let mux = self.muxer()?;
        let stream = mux.dial().await?;
        let io = TokioIo::new(stream);

        let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                debug!("manager request connection ended: {err}");
            }
        });

        Ok(sender.send_request(req).await?)
    }

    /// Like [`fetch`](Self::fetch), discarding the response.
    pub async fn oneway(&self, req: Request<Full<Bytes>>) -> Result<(), ClientError> {
        self.fetch(req).await.map(drop)
    }

    /// Periodically ping the manager until the root cancellation fires.
    /// Failures are reported and the loop keeps going; a dead session is the
    /// reconnect path's problem, not the heartbeat's.
    pub async fn heartbeat(&self, period: Duration) {
        let first = tokio::time::Instant::now() + period;
        let mut ticker = tokio::time::interval_at(first, period);
        loop {
            tokio::select! {
                _ = self.parent.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.ping().await {
                        warn!("manager heartbeat failed: {err}");
                    }
                }
            }
        }
    }

    async fn ping(&self) -> Result<(), ClientError> {
        let req = Request::builder()
            .method(Method::POST)
            .uri(PING_PATH)
            .body(Full::default())?;
        self.oneway(req).await
    }

    fn muxer(&self) -> Result<Arc<dyn Muxer>, ClientError> {
        self.session
            .read()
            .unwrap()
            .as_ref()
            .map(|session| session.mux.clone())
            .ok_or(ClientError::NotConnected)
    }

    async fn dial_session(&self) -> Result<Session, ClientError> {
        let scope = self.parent.child_token();
        let clock = BackoffClock::start();

        loop {
            if self.parent.is_cancelled() {
                return Err(ClientError::Cancelled);
            }

            let dialed = match self.dialer.dial(DIAL_TIMEOUT).await {
                Ok(dialed) => dialed,
                Err(err) => {
                    if self.parent.is_cancelled() {
                        return Err(ClientError::Cancelled);
                    }
                    warn!("manager dial failed: {err}");
                    clock.sleep(&scope).await;
                    continue;
                }
            };

            let address = dialed.address.clone();
            match self.consult(dialed).await {
                Ok((ident, issue, stream)) => {
                    info!(address = %address, name = %issue.name, "manager session established");
                    let mux: Arc<dyn Muxer> = FrameMuxer::client(stream, &issue.passwd);

                    // cancelling the session scope (reconnect or process
                    // shutdown) must fail every consumer of the muxer
                    let session_mux = mux.clone();
                    let session_scope = scope.clone();
                    tokio::spawn(async move {
                        session_scope.cancelled().await;
                        session_mux.close().await;
                    });

                    return Ok(Session {
                        ident,
                        issue,
                        mux,
                        scope,
                    });
                }
                Err(err) => {
                    if self.parent.is_cancelled() {
                        return Err(ClientError::Cancelled);
                    }
                    if let ClientError::Rejected(reject) = &err {
                        if reject.is_forbidden() {
                            warn!(address = %address, "manager refused this broker: {}", reject.message);
                            return Err(err);
                        }
                    }
                    warn!(address = %address, "manager consult failed: {err}");
                    clock.sleep(&scope).await;
                }
            }
        }
    }

    /// Application-level handshake on a fresh TCP connection.
    async fn consult(
        &self,
        dialed: DialedConn,
    ) -> Result<(BrokerIdent, BrokerIssue, MuxStream), ClientError> {
        let DialedConn {
            mut stream,
            local_ip,
            address,
        } = dialed;

        let ident = self.local_ident(local_ip);
        let sealed = encrypt_json(self.cipher.as_ref(), &ident)?;

        handshake::write_connect_request(&mut stream, address.host_name(), BROKER_JOIN_PATH, &sealed)
            .await?;
        let body = match handshake::read_response(&mut stream).await {
            Ok(body) => body,
            Err(HandshakeError::Rejected(reject)) => return Err(ClientError::Rejected(reject)),
            Err(err) => return Err(err.into()),
        };
        let issue: BrokerIssue = decrypt_json(self.cipher.as_ref(), &body)?;

        Ok((ident, issue, stream))
    }

    /// Machine facts are gathered fresh for every attempt.
    fn local_ident(&self, local_ip: IpAddr) -> BrokerIdent {
        let inet = match local_ip {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
        };
        let mac = mac_address::get_mac_address()
            .ok()
            .flatten()
            .map(|mac| mac.to_string())
            .unwrap_or_default();

        BrokerIdent {
            id: self.config.id,
            secret: self.config.secret.clone(),
            semver: self.config.semver.clone(),
            inet,
            mac,
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            cpu: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            pid: std::process::id(),
            workdir: std::env::current_dir()
                .map(|path| path.display().to_string())
                .unwrap_or_default(),
            executable: std::env::current_exe()
                .map(|path| path.display().to_string())
                .unwrap_or_default(),
            username: std::env::var("USER")
                .or_else(|_| std::env::var("USERNAME"))
                .unwrap_or_default(),
            hostname: hostname::get()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            time_at: Utc::now(),
        }
    }
}

/// Acceptor over the session multiplexer, for the broker's local request
/// server.
pub struct MuxListener {
    mux: Arc<dyn Muxer>,
}

impl MuxListener {
    /// Wait for the manager to open the next logical stream.
    pub async fn accept(&self) -> Result<MuxStream, MuxError> {
        self.mux.accept().await
    }
}
