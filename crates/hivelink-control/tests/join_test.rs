//! End-to-end join protocol: a real gateway on a real socket, a scripted
//! minion on the other end.

use async_trait::async_trait;
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use chrono::Utc;
use hivelink_connection::{FrameMuxer, Muxer};
use hivelink_control::{
    caller, DirectoryError, Gateway, HubError, MemoryDirectory, MinionHub, NodeDirectory,
    NodeRecord, NodeStatus, SessionRegistry,
};
use hivelink_proto::{
    decrypt_json, encrypt_json, handshake, HandshakeError, MinionIdent, MinionIssue,
    PresharedCipher, RejectError, MINION_JOIN_PATH,
};
use http::Request;
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

const PSK: &[u8] = b"hive-link-preshared";

fn ident(inet: Ipv4Addr) -> MinionIdent {
    MinionIdent {
        semver: "1.0.0".to_string(),
        inet,
        mac: "aa:bb:cc:dd:ee:ff".to_string(),
        os: "linux".to_string(),
        arch: "x86_64".to_string(),
        cpu: 4,
        pid: 321,
        workdir: "/opt/minion".to_string(),
        executable: "/opt/minion/minion".to_string(),
        username: "svc".to_string(),
        hostname: "minion-1".to_string(),
        time_at: Utc::now(),
    }
}

async fn whoami(req: axum::extract::Request) -> String {
    match caller(&req) {
        Some(record) => record.inet().to_string(),
        None => "anonymous".to_string(),
    }
}

struct TestBroker {
    addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    directory: Arc<MemoryDirectory>,
    shutdown: CancellationToken,
}

async fn spawn_broker() -> TestBroker {
    let directory = Arc::new(MemoryDirectory::new());
    let registry = Arc::new(SessionRegistry::new());
    let router = Router::new().route("/whoami", get(whoami));
    let hub = Arc::new(MinionHub::new(directory.clone(), registry.clone(), router));
    let gateway = Gateway::new(hub, Arc::new(PresharedCipher::new(PSK)));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let guard = shutdown.clone();
    tokio::spawn(async move { gateway.serve(listener, guard).await });

    TestBroker {
        addr,
        registry,
        directory,
        shutdown,
    }
}

/// Run the minion side of a join. On 202 the returned muxer is the live
/// session.
async fn join(
    addr: SocketAddr,
    ident: &MinionIdent,
) -> Result<(Arc<FrameMuxer>, MinionIssue), RejectError> {
    let cipher = PresharedCipher::new(PSK);
    let mut conn = TcpStream::connect(addr).await.unwrap();

    let sealed = encrypt_json(&cipher, ident).unwrap();
    handshake::write_connect_request(&mut conn, "broker.hive", MINION_JOIN_PATH, &sealed)
        .await
        .unwrap();

    match handshake::read_response(&mut conn).await {
        Ok(body) => {
            let issue: MinionIssue = decrypt_json(&cipher, &body).unwrap();
            let mux = FrameMuxer::client(conn, &issue.passwd);
            Ok((mux, issue))
        }
        Err(HandshakeError::Rejected(reject)) => Err(reject),
        Err(err) => panic!("unexpected handshake failure: {err}"),
    }
}

async fn wait_until(mut probe: impl FnMut() -> bool) {
    for _ in 0..250 {
        if probe() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn join_serve_close_lifecycle() {
    let broker = spawn_broker().await;
    let inet = Ipv4Addr::new(10, 0, 0, 8);
    let id = broker.directory.seed(inet, NodeStatus::Offline);

    let (mux, issue) = join(broker.addr, &ident(inet)).await.unwrap();
    assert_eq!(issue.id, id);
    assert!((32..=64).contains(&issue.passwd.len()));

    // the registry holds exactly this session, the directory says online
    let key = id.to_string();
    wait_until(|| broker.registry.get(&key).is_some()).await;
    assert_eq!(broker.registry.len(), 1);
    wait_until(|| broker.directory.status_of(inet) == Some(NodeStatus::Online)).await;

    // a request over the session reaches the handler with the caller
    // identity attached
    let stream = mux.dial().await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(conn);
    let res = sender
        .send_request(
            Request::get("/whoami")
                .body(Full::<Bytes>::default())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    let body = res.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body, Bytes::from(inet.to_string()));

    // the peer disconnecting tears the session down
    mux.close().await;
    wait_until(|| broker.registry.get(&key).is_none()).await;
    wait_until(|| broker.directory.status_of(inet) == Some(NodeStatus::Offline)).await;

    broker.shutdown.cancel();
}

#[tokio::test]
async fn unknown_node_is_parked_then_told_to_activate() {
    let broker = spawn_broker().await;
    let inet = Ipv4Addr::new(10, 0, 0, 9);

    let reject = join(broker.addr, &ident(inet)).await.unwrap_err();
    assert_eq!(reject.status, 400);
    assert!(reject.message.contains("registering"), "{}", reject.message);
    assert_eq!(broker.directory.status_of(inet), Some(NodeStatus::Inactive));

    // retrying before activation stays transient
    let reject = join(broker.addr, &ident(inet)).await.unwrap_err();
    assert_eq!(reject.status, 400);
    assert!(!reject.is_forbidden());
}

#[tokio::test]
async fn removed_node_is_forbidden() {
    let broker = spawn_broker().await;
    let inet = Ipv4Addr::new(10, 0, 0, 10);
    broker.directory.seed(inet, NodeStatus::Removed);

    let reject = join(broker.addr, &ident(inet)).await.unwrap_err();
    assert_eq!(reject.status, 406);
    assert!(reject.is_forbidden());
}

#[tokio::test]
async fn node_marked_online_is_forbidden() {
    let broker = spawn_broker().await;
    let inet = Ipv4Addr::new(10, 0, 0, 11);
    broker.directory.seed(inet, NodeStatus::Online);

    let reject = join(broker.addr, &ident(inet)).await.unwrap_err();
    assert_eq!(reject.status, 406);
    assert!(reject.is_forbidden());
}

#[tokio::test]
async fn loopback_identity_is_refused() {
    let broker = spawn_broker().await;

    let reject = join(broker.addr, &ident(Ipv4Addr::LOCALHOST))
        .await
        .unwrap_err();
    assert_eq!(reject.status, 400);
}

#[tokio::test]
async fn non_connect_method_is_refused_before_any_state_exists() {
    let broker = spawn_broker().await;

    let mut conn = TcpStream::connect(broker.addr).await.unwrap();
    conn.write_all(b"GET /api/v1/minion HTTP/1.1\r\nContent-Length: 0\r\n\r\n")
        .await
        .unwrap();

    let err = handshake::read_response(&mut conn).await.unwrap_err();
    let reject = err.rejection().unwrap();
    assert_eq!(reject.status, 400);
    assert!(reject.message.contains("unsupported method"));
    assert!(broker.registry.is_empty());
}

#[tokio::test]
async fn undecryptable_identity_is_refused() {
    let broker = spawn_broker().await;

    let mut conn = TcpStream::connect(broker.addr).await.unwrap();
    handshake::write_connect_request(&mut conn, "broker.hive", MINION_JOIN_PATH, b"not sealed")
        .await
        .unwrap();

    let err = handshake::read_response(&mut conn).await.unwrap_err();
    assert_eq!(err.rejection().unwrap().status, 400);
}

#[tokio::test]
async fn racing_joins_for_one_id_elect_a_single_session() {
    // drive the hub directly so both joins pass auth with the same id
    let directory = Arc::new(MemoryDirectory::new());
    let registry = Arc::new(SessionRegistry::new());
    let hub = Arc::new(MinionHub::new(
        directory.clone(),
        registry.clone(),
        Router::new(),
    ));
    let inet = Ipv4Addr::new(10, 0, 0, 12);
    directory.seed(inet, NodeStatus::Offline);

    let issue = MinionIssue {
        id: 1,
        passwd: vec![7u8; 32],
    };

    let (first_local, first_remote) = tokio::io::duplex(64 * 1024);
    let winner = {
        let hub = hub.clone();
        let issue = issue.clone();
        tokio::spawn(async move { hub.join(Box::new(first_remote), ident(inet), issue).await })
    };
    wait_until(|| registry.get("1").is_some()).await;

    let (_second_local, second_remote) = tokio::io::duplex(64 * 1024);
    let err = hub
        .join(Box::new(second_remote), ident(inet), issue)
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::AlreadyOnline));
    assert_eq!(registry.len(), 1);

    // the loser must not have torn down the winner
    drop(first_local);
    winner.await.unwrap().unwrap();
    assert!(registry.is_empty());
}

/// Directory whose online write always fails, for the rollback path.
struct BrokenDirectory {
    inner: MemoryDirectory,
}

#[async_trait]
impl NodeDirectory for BrokenDirectory {
    async fn find_by_inet(&self, inet: Ipv4Addr) -> Result<Option<NodeRecord>, DirectoryError> {
        self.inner.find_by_inet(inet).await
    }

    async fn create_pending(&self, ident: &MinionIdent) -> Result<(), DirectoryError> {
        self.inner.create_pending(ident).await
    }

    async fn mark_online(&self, _id: i64, _ident: &MinionIdent) -> Result<(), DirectoryError> {
        Err(DirectoryError::Backend("write refused".to_string()))
    }

    async fn mark_offline_if_online(&self, id: i64) -> Result<(), DirectoryError> {
        self.inner.mark_offline_if_online(id).await
    }

    async fn reset_online(&self) -> Result<u64, DirectoryError> {
        self.inner.reset_online().await
    }
}

#[tokio::test]
async fn failed_online_write_rolls_the_registry_back() {
    let directory = Arc::new(BrokenDirectory {
        inner: MemoryDirectory::new(),
    });
    let registry = Arc::new(SessionRegistry::new());
    let hub = MinionHub::new(directory, registry.clone(), Router::new());

    let (_local, remote) = tokio::io::duplex(64 * 1024);
    let issue = MinionIssue {
        id: 5,
        passwd: vec![9u8; 32],
    };

    let err = hub
        .join(Box::new(remote), ident(Ipv4Addr::new(10, 0, 0, 13)), issue)
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::Directory(_)));
    assert!(registry.is_empty());
}
