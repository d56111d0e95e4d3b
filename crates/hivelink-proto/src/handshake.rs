//! Raw-socket framing for the join handshake.
//!
//! A join is one HTTP/1.1 CONNECT exchange written by hand onto the socket:
//! the joining side sends an encrypted identity as the request body, the
//! accepting side answers 202 with an encrypted credential body and keeps the
//! socket for the multiplexed transport, or rejects with a JSON `{"message"}`
//! body. After the 202 the connection no longer speaks HTTP, so both sides
//! frame these messages themselves instead of going through a server stack.

use crate::{MAX_CREDENTIAL_SIZE, MAX_IDENT_SIZE};
use http::{HeaderMap, Method, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a request or status line plus headers.
const MAX_HEAD_SIZE: usize = 8 * 1024;

/// Upper bound read from a rejection body.
const MAX_REJECT_BODY: usize = 4 * 1024;

const MAX_HEADERS: usize = 32;

/// Handshake errors
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake io failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer closed the connection mid-handshake")]
    UnexpectedEof,

    #[error("handshake head exceeds {MAX_HEAD_SIZE} bytes")]
    HeadTooLarge,

    #[error("handshake body of {0} bytes exceeds the cap")]
    BodyTooLarge(usize),

    #[error("malformed handshake: {0}")]
    Malformed(&'static str),

    #[error(transparent)]
    Rejected(#[from] RejectError),
}

impl HandshakeError {
    /// The rejection carried by this error, when the peer answered non-202.
    pub fn rejection(&self) -> Option<&RejectError> {
        match self {
            HandshakeError::Rejected(reject) => Some(reject),
            _ => None,
        }
    }
}

/// A non-202 answer from the accepting side, preserving the HTTP status so
/// callers can tell permanent rejections from retriable ones.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("handshake rejected ({status}): {message}")]
pub struct RejectError {
    pub status: u16,
    pub message: String,
}

impl RejectError {
    /// Permanent rejections are carried as 406 Not Acceptable; everything
    /// else is worth retrying later.
    pub fn is_forbidden(&self) -> bool {
        self.status == StatusCode::NOT_ACCEPTABLE.as_u16()
    }
}

/// A parsed join request: the method still has to be checked by the caller.
#[derive(Debug)]
pub struct JoinRequest {
    pub method: Method,
    pub path: String,
    pub body: Vec<u8>,
}

impl JoinRequest {
    pub fn is_connect(&self) -> bool {
        self.method == Method::CONNECT
    }
}

/// Write a CONNECT request with `body` as the encrypted identity payload.
pub async fn write_connect_request<S>(
    io: &mut S,
    host: &str,
    path: &str,
    body: &[u8],
) -> Result<(), HandshakeError>
where
    S: AsyncWrite + Unpin,
{
    let head = format!(
        "CONNECT {path} HTTP/1.1\r\nHost: {host}\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    io.write_all(head.as_bytes()).await?;
    io.write_all(body).await?;
    io.flush().await?;
    Ok(())
}

/// Read one join request, with the body capped at [`MAX_IDENT_SIZE`].
pub async fn read_connect_request<S>(io: &mut S) -> Result<JoinRequest, HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let (head_len, method, path, content_length) = loop {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        match req
            .parse(&buf)
            .map_err(|_| HandshakeError::Malformed("request head"))?
        {
            httparse::Status::Complete(head_len) => {
                let method = req.method.ok_or(HandshakeError::Malformed("method"))?;
                let method = Method::from_bytes(method.as_bytes())
                    .map_err(|_| HandshakeError::Malformed("method"))?;
                let path = req
                    .path
                    .ok_or(HandshakeError::Malformed("path"))?
                    .to_string();
                let content_length = content_length(req.headers)?;
                break (head_len, method, path, content_length);
            }
            httparse::Status::Partial => {
                if buf.len() > MAX_HEAD_SIZE {
                    return Err(HandshakeError::HeadTooLarge);
                }
                fill(io, &mut buf).await?;
            }
        }
    };

    if content_length > MAX_IDENT_SIZE {
        return Err(HandshakeError::BodyTooLarge(content_length));
    }
    let body = read_body(io, &mut buf, head_len, content_length, true).await?;

    Ok(JoinRequest { method, path, body })
}

/// Write the 202 join response directly onto the socket: extra headers from
/// the auth step, then the encrypted credential as the body.
pub async fn write_accept_response<S>(
    io: &mut S,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), HandshakeError>
where
    S: AsyncWrite + Unpin,
{
    let mut head = String::with_capacity(128);
    head.push_str("HTTP/1.1 202 Accepted\r\n");
    for (name, value) in headers {
        let value = value
            .to_str()
            .map_err(|_| HandshakeError::Malformed("response header"))?;
        head.push_str(name.as_str());
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));

    io.write_all(head.as_bytes()).await?;
    io.write_all(body).await?;
    io.flush().await?;
    Ok(())
}

/// Write a rejection with a JSON `{"message"}` body. Statuses outside the
/// 4xx/5xx range are clamped to 400.
pub async fn write_reject_response<S>(
    io: &mut S,
    status: u16,
    message: &str,
) -> Result<(), HandshakeError>
where
    S: AsyncWrite + Unpin,
{
    let status = if (400..=511).contains(&status) {
        status
    } else {
        400
    };
    let reason = StatusCode::from_u16(status)
        .ok()
        .and_then(|code| code.canonical_reason())
        .unwrap_or("Error");
    let body = serde_json::json!({ "message": message }).to_string();
    let head = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json; charset=utf-8\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );

    io.write_all(head.as_bytes()).await?;
    io.write_all(body.as_bytes()).await?;
    io.flush().await?;
    Ok(())
}

/// Read the join response. A 202 yields the credential body; anything else
/// becomes a [`RejectError`] with the JSON message when one was sent, the
/// raw body otherwise.
pub async fn read_response<S>(io: &mut S) -> Result<Vec<u8>, HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let (head_len, status, content_length) = loop {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut res = httparse::Response::new(&mut headers);
        match res
            .parse(&buf)
            .map_err(|_| HandshakeError::Malformed("response head"))?
        {
            httparse::Status::Complete(head_len) => {
                let status = res.code.ok_or(HandshakeError::Malformed("status"))?;
                let content_length = content_length(res.headers)?;
                break (head_len, status, content_length);
            }
            httparse::Status::Partial => {
                if buf.len() > MAX_HEAD_SIZE {
                    return Err(HandshakeError::HeadTooLarge);
                }
                fill(io, &mut buf).await?;
            }
        }
    };

    if status == StatusCode::ACCEPTED.as_u16() {
        if content_length > MAX_CREDENTIAL_SIZE {
            return Err(HandshakeError::BodyTooLarge(content_length));
        }
        return read_body(io, &mut buf, head_len, content_length, true).await;
    }

    // A rejection body is best-effort: whatever arrived before the peer hung
    // up still makes a usable message.
    let want = content_length.min(MAX_REJECT_BODY);
    let body = read_body(io, &mut buf, head_len, want, false).await?;
    let message = match serde_json::from_slice::<RejectBody>(&body) {
        Ok(reject) => reject.message,
        Err(_) => String::from_utf8_lossy(&body).into_owned(),
    };

    Err(RejectError { status, message }.into())
}

#[derive(Deserialize)]
struct RejectBody {
    message: String,
}

fn content_length(headers: &[httparse::Header<'_>]) -> Result<usize, HandshakeError> {
    for header in headers {
        if header.name.eq_ignore_ascii_case("content-length") {
            return std::str::from_utf8(header.value)
                .ok()
                .and_then(|value| value.trim().parse::<usize>().ok())
                .ok_or(HandshakeError::Malformed("content-length"));
        }
    }
    Ok(0)
}

async fn fill<S>(io: &mut S, buf: &mut Vec<u8>) -> Result<(), HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 1024];
    let n = io.read(&mut chunk).await?;
    if n == 0 {
        return Err(HandshakeError::UnexpectedEof);
    }
    buf.extend_from_slice(&chunk[..n]);
    Ok(())
}

async fn read_body<S>(
    io: &mut S,
    buf: &mut Vec<u8>,
    head_len: usize,
    want: usize,
    strict: bool,
) -> Result<Vec<u8>, HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let mut body = buf.split_off(head_len);
    while body.len() < want {
        let mut chunk = vec![0u8; (want - body.len()).min(8 * 1024)];
        let n = io.read(&mut chunk).await?;
        if n == 0 {
            if strict {
                return Err(HandshakeError::UnexpectedEof);
            }
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(want);
    Ok(body)
}
