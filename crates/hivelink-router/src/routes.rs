//! Manager-facing route surface.
//!
//! `ANY /api/v1/arr/{mid}/{*path}` relays one request/response to minion
//! `mid`; `GET /api/v1/aws/{mid}/{*path}` upgrades to a WebSocket and
//! splices it with a stream tunnel to the minion. The query string is
//! forwarded verbatim on both.

use crate::fabric::{RouteError, RoutingFabric};
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, RawQuery, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use hivelink_connection::MuxStream;
use http::{Request, StatusCode};
use std::sync::Arc;
use tokio_tungstenite::tungstenite::Message as WireMessage;
use tokio_tungstenite::WebSocketStream;

/// Routes served to the manager over the broker's upstream session.
pub fn routes(fabric: Arc<RoutingFabric>) -> Router {
    Router::new()
        .route("/api/v1/arr/{mid}/{*path}", any(arr))
        .route("/api/v1/aws/{mid}/{*path}", get(aws))
        .with_state(fabric)
}

/// Request/response relay.
async fn arr(
    State(fabric): State<Arc<RoutingFabric>>,
    Path((mid, path)): Path<(String, String)>,
    req: axum::extract::Request,
) -> Response {
    let target = match req.uri().query() {
        Some(query) => format!("/{path}?{query}"),
        None => format!("/{path}"),
    };

    let (mut parts, body) = req.into_parts();
    parts.uri = match target.parse() {
        Ok(uri) => uri,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "message": "invalid relay path" })),
            )
                .into_response()
        }
    };

    match fabric.forward(&mid, Request::from_parts(parts, body)).await {
        Ok(res) => res.map(axum::body::Body::new).into_response(),
        Err(err) => route_error(err),
    }
}

/// Duplex stream relay.
async fn aws(
    State(fabric): State<Arc<RoutingFabric>>,
    Path((mid, path)): Path<(String, String)>,
    RawQuery(query): RawQuery,
    ws: WebSocketUpgrade,
) -> Response {
    let target = match query {
        Some(query) => format!("/{path}?{query}"),
        None => format!("/{path}"),
    };

    // reach the minion before upgrading: an offline target must fail as a
    // plain HTTP error, not a dead socket
    match fabric.stream(&mid, &target, http::HeaderMap::new()).await {
        Ok(back) => ws.on_upgrade(move |fore| splice(fore, back)).into_response(),
        Err(err) => route_error(err),
    }
}

fn route_error(err: RouteError) -> Response {
    (
        StatusCode::BAD_GATEWAY,
        Json(serde_json::json!({ "message": err.to_string() })),
    )
        .into_response()
}

/// Copy messages both ways until either side closes or errors; the first
/// close tears the other side down.
async fn splice(fore: WebSocket, back: WebSocketStream<MuxStream>) {
    let (mut fore_tx, mut fore_rx) = fore.split();
    let (mut back_tx, mut back_rx) = back.split();

    let manager_to_minion = async {
        while let Some(Ok(msg)) = fore_rx.next().await {
            let msg = match manager_to_wire(msg) {
                Some(msg) => msg,
                None => break,
            };
            if back_tx.send(msg).await.is_err() {
                break;
            }
        }
        let _ = back_tx.send(WireMessage::Close(None)).await;
    };

    let minion_to_manager = async {
        while let Some(Ok(msg)) = back_rx.next().await {
            let msg = match wire_to_manager(msg) {
                Some(msg) => msg,
                None => break,
            };
            if fore_tx.send(msg).await.is_err() {
                break;
            }
        }
        let _ = fore_tx.send(WsMessage::Close(None)).await;
    };

    tokio::select! {
        _ = manager_to_minion => {}
        _ = minion_to_manager => {}
    }
}

fn manager_to_wire(msg: WsMessage) -> Option<WireMessage> {
    match msg {
        WsMessage::Text(text) => Some(WireMessage::Text(text.to_string())),
        WsMessage::Binary(data) => Some(WireMessage::Binary(data.to_vec())),
        WsMessage::Ping(data) => Some(WireMessage::Ping(data.to_vec())),
        WsMessage::Pong(data) => Some(WireMessage::Pong(data.to_vec())),
        WsMessage::Close(_) => None,
    }
}

fn wire_to_manager(msg: WireMessage) -> Option<WsMessage> {
    match msg {
        WireMessage::Text(text) => Some(WsMessage::Text(text.into())),
        WireMessage::Binary(data) => Some(WsMessage::Binary(data.into())),
        WireMessage::Ping(data) => Some(WsMessage::Ping(data.into())),
        WireMessage::Pong(data) => Some(WsMessage::Pong(data.into())),
        WireMessage::Close(_) | WireMessage::Frame(_) => None,
    }
}
