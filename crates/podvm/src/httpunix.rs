//! Minimal HTTP/1 client over unix sockets, one connection per request.

use bytes::Bytes;
use http_body_util::Empty;
use hyper::StatusCode;
use hyper_util::rt::TokioIo;
use std::path::Path;
use std::time::Duration;
use tokio::net::UnixStream;

/// Issues a GET against a unix-socket HTTP server. The timeout covers
/// connect, send, and response head.
pub async fn get(socket: &Path, uri: &str, timeout: Duration) -> std::io::Result<StatusCode> {
    tokio::time::timeout(timeout, get_inner(socket, uri))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "request timed out"))?
}

async fn get_inner(socket: &Path, uri: &str) -> std::io::Result<StatusCode> {
    let stream = UnixStream::connect(socket).await?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(std::io::Error::other)?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!("unix http connection ended: {e}");
        }
    });

    let request = hyper::Request::get(uri)
        .header(hyper::header::HOST, "podvm")
        .body(Empty::<Bytes>::new())
        .map_err(std::io::Error::other)?;

    let response = sender
        .send_request(request)
        .await
        .map_err(std::io::Error::other)?;
    Ok(response.status())
}

/// Percent-encodes a query value (RFC 3986 unreserved characters pass
/// through, spaces become %20).
pub fn query_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
