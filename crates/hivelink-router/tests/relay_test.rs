//! Relay behavior over live multiplexed sessions.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use hivelink_connection::{FrameMuxer, Muxer};
use hivelink_control::{ConnectionRecord, SessionRegistry};
use hivelink_proto::{MinionIdent, MinionIssue};
use hivelink_router::{routes, RouteError, RoutingFabric};
use http::Request;
use http_body_util::{BodyExt, Full};
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::Message as WireMessage;
use tower::ServiceExt;

const KEY: &[u8] = b"relay-session-key-0123456789abcd";

fn ident() -> MinionIdent {
    MinionIdent {
        semver: "1.0.0".to_string(),
        inet: Ipv4Addr::new(10, 0, 0, 21),
        mac: String::new(),
        os: "linux".to_string(),
        arch: "x86_64".to_string(),
        cpu: 2,
        pid: 11,
        workdir: String::new(),
        executable: String::new(),
        username: String::new(),
        hostname: "minion-21".to_string(),
        time_at: chrono::Utc::now(),
    }
}

/// Register a live session under `id` whose minion end runs `serve`.
fn register_minion<F, Fut>(registry: &Arc<SessionRegistry>, id: i64, serve: F)
where
    F: FnOnce(Arc<FrameMuxer>) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (broker_io, minion_io) = tokio::io::duplex(256 * 1024);
    let broker_mux = FrameMuxer::server(broker_io, KEY);
    let minion_mux = FrameMuxer::client(minion_io, KEY);
    tokio::spawn(serve(minion_mux));

    let mux: Arc<dyn Muxer> = broker_mux;
    let issue = MinionIssue {
        id,
        passwd: KEY.to_vec(),
    };
    let record = Arc::new(ConnectionRecord::new(ident(), issue, mux));
    assert!(registry.insert(id.to_string(), record));
}

/// Minion end answering each logical stream with one echo of the request
/// line.
async fn http_echo(mux: Arc<FrameMuxer>) {
    while let Ok(stream) = mux.accept().await {
        tokio::spawn(
            hyper::server::conn::http1::Builder::new().serve_connection(
                TokioIo::new(stream),
                service_fn(|req: hyper::Request<hyper::body::Incoming>| async move {
                    let reply = format!("{} {}", req.method(), req.uri());
                    Ok::<_, Infallible>(hyper::Response::new(Full::new(Bytes::from(reply))))
                }),
            ),
        );
    }
}

/// Minion end speaking WebSocket on each logical stream, echoing frames.
async fn ws_echo(mux: Arc<FrameMuxer>) {
    while let Ok(stream) = mux.accept().await {
        tokio::spawn(async move {
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_close() {
                    break;
                }
                if (msg.is_text() || msg.is_binary()) && ws.send(msg).await.is_err() {
                    break;
                }
            }
        });
    }
}

#[tokio::test]
async fn relay_to_an_absent_minion_fails_offline_without_dialing() {
    let fabric = RoutingFabric::new(Arc::new(SessionRegistry::new()));

    let err = fabric.open("404").await.unwrap_err();
    assert!(matches!(err, RouteError::Offline(_)));

    let req = Request::get("/anything")
        .body(Full::<Bytes>::default())
        .unwrap();
    let err = fabric.forward("404", req).await.unwrap_err();
    assert!(matches!(err, RouteError::Offline(_)));

    let err = fabric
        .stream("404", "/anything", http::HeaderMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RouteError::Offline(_)));
}

#[tokio::test]
async fn forward_relays_one_exchange_over_the_session() {
    let registry = Arc::new(SessionRegistry::new());
    register_minion(&registry, 7, http_echo);
    let fabric = RoutingFabric::new(registry);

    let req = Request::post("/tasks/run?mode=fast")
        .body(Full::<Bytes>::default())
        .unwrap();
    let res = fabric.forward("7", req).await.unwrap();
    assert_eq!(res.status(), 200);

    let body = res.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body, Bytes::from_static(b"POST /tasks/run?mode=fast"));
}

#[tokio::test]
async fn arr_route_rewrites_the_path_and_forwards_the_query() {
    let registry = Arc::new(SessionRegistry::new());
    register_minion(&registry, 7, http_echo);
    let app = routes(Arc::new(RoutingFabric::new(registry)));

    let res = app
        .oneshot(
            Request::get("/api/v1/arr/7/status/detail?verbose=1")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), 200);

    let body = res.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body, Bytes::from_static(b"GET /status/detail?verbose=1"));
}

#[tokio::test]
async fn arr_route_reports_offline_minions_as_bad_gateway() {
    let app = routes(Arc::new(RoutingFabric::new(Arc::new(
        SessionRegistry::new(),
    ))));

    let res = app
        .oneshot(
            Request::get("/api/v1/arr/404/anything")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), 502);

    let body = res.into_body().collect().await.unwrap().to_bytes();
    let message: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert!(message["message"].as_str().unwrap().contains("offline"));
}

#[tokio::test]
async fn aws_route_refuses_the_upgrade_when_the_minion_is_offline() {
    let app = routes(Arc::new(RoutingFabric::new(Arc::new(
        SessionRegistry::new(),
    ))));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // the miss must come back as a plain HTTP error, never a half-upgrade
    let err = tokio_tungstenite::connect_async(format!("ws://{addr}/api/v1/aws/404/term"))
        .await
        .unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 502);
        }
        other => panic!("expected an HTTP rejection, got {other}"),
    }
}

#[tokio::test]
async fn aws_route_splices_the_manager_and_minion_streams() {
    let registry = Arc::new(SessionRegistry::new());
    register_minion(&registry, 7, ws_echo);
    let app = routes(Arc::new(RoutingFabric::new(registry)));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let (mut ws, _res) =
        tokio_tungstenite::connect_async(format!("ws://{addr}/api/v1/aws/7/term?cols=80"))
            .await
            .unwrap();

    ws.send(WireMessage::Text("hello hive".to_string()))
        .await
        .unwrap();
    let echoed = ws.next().await.unwrap().unwrap();
    assert_eq!(echoed, WireMessage::Text("hello hive".to_string()));

    ws.send(WireMessage::Binary(vec![1, 2, 3])).await.unwrap();
    let echoed = ws.next().await.unwrap().unwrap();
    assert_eq!(echoed, WireMessage::Binary(vec![1, 2, 3]));

    ws.close(None).await.unwrap();
}
