//! Control mux for the virtual network.
//!
//! Served twice: the full mux (data-plane adoption plus forwarder
//! control) on the host unix endpoint, and the forwarder routes alone on
//! an in-network listener at `gateway:80`.

use crate::error::{NetError, Result};
use crate::forward::ForwardTable;
use crate::stack::{GuestStream, VirtualNetwork};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use serde::Deserialize;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const HEADER_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_HEAD: usize = 8192;

/// Serves the full control mux on the host unix endpoint until cancelled.
///
/// `POST /connect` hands the connection over to the data plane; every
/// other request is HTTP against the forwarder API.
pub async fn serve_control(
    listener: UnixListener,
    vn: VirtualNetwork,
    forwards: ForwardTable,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let stream = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    tracing::warn!("control mux accept failed: {e}");
                    continue;
                }
            },
        };

        let vn = vn.clone();
        let forwards = forwards.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_control_conn(stream, vn, forwards, cancel).await {
                tracing::debug!("control connection ended: {e}");
            }
        });
    }
}

async fn handle_control_conn(
    mut stream: tokio::net::UnixStream,
    vn: VirtualNetwork,
    forwards: ForwardTable,
    cancel: CancellationToken,
) -> Result<()> {
    // Read the request head ourselves so /connect can take the raw stream.
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];

    let head_result = tokio::time::timeout(HEADER_TIMEOUT, async {
        while !head.ends_with(b"\r\n\r\n") {
            if head.len() >= MAX_HEAD {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "request head too large",
                ));
            }
            let n = stream.read(&mut byte).await?;
            if n == 0 {
                return Err(std::io::ErrorKind::UnexpectedEof.into());
            }
            head.push(byte[0]);
        }
        Ok(())
    })
    .await
    .map_err(|_| {
        NetError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "request head timeout",
        ))
    })?;
    head_result?;

    if head.starts_with(b"POST /connect ") || head.starts_with(b"POST /connect\r") {
        stream.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await?;
        stream.flush().await?;
        tracing::info!("guest data plane connected");
        return vn.attach_stream(stream).await;
    }

    // Anything else is regular HTTP: replay the consumed head in front of
    // the stream and let hyper parse it.
    let replay = PrefixedStream::new(head, stream);
    serve_http(replay, forwards, cancel).await
}

/// Serves the forwarder-only mux for connections arriving inside the
/// virtual network on `gateway:80`.
pub async fn serve_guest_mux(
    mut conns: mpsc::Receiver<GuestStream>,
    forwards: ForwardTable,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let stream = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            conn = conns.recv() => match conn {
                Some(stream) => stream,
                None => return Ok(()),
            },
        };

        let forwards = forwards.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_http(stream, forwards, cancel).await {
                tracing::debug!("in-network mux connection ended: {e}");
            }
        });
    }
}

async fn serve_http<S>(stream: S, forwards: ForwardTable, cancel: CancellationToken) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| {
        let forwards = forwards.clone();
        async move { Ok::<_, std::convert::Infallible>(forwarder_api(req, forwards).await) }
    });

    let conn = hyper::server::conn::http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(HEADER_TIMEOUT)
        .serve_connection(TokioIo::new(stream), service);

    tokio::select! {
        result = conn => result.map_err(|e| NetError::Io(std::io::Error::other(e))),
        _ = cancel.cancelled() => Ok(()),
    }
}

#[derive(Deserialize)]
struct ExposeBody {
    local: String,
    remote: String,
}

#[derive(Deserialize)]
struct UnexposeBody {
    local: String,
}

async fn forwarder_api(req: Request<Incoming>, forwards: ForwardTable) -> Response<Full<Bytes>> {
    let method = req.method().clone();

    match req.uri().path() {
        "/services/forwarder/all" if method == Method::GET => {
            let listed = forwards.list().await;
            json_response(StatusCode::OK, &listed)
        }
        "/services/forwarder/expose" if method == Method::POST => {
            let Ok(body) = read_json::<ExposeBody>(req).await else {
                return plain_response(StatusCode::BAD_REQUEST, "invalid body");
            };
            match forwards.expose(&body.local, &body.remote).await {
                Ok(()) => plain_response(StatusCode::OK, ""),
                Err(e) => plain_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
            }
        }
        "/services/forwarder/unexpose" if method == Method::POST => {
            let Ok(body) = read_json::<UnexposeBody>(req).await else {
                return plain_response(StatusCode::BAD_REQUEST, "invalid body");
            };
            match forwards.unexpose(&body.local).await {
                Ok(()) => plain_response(StatusCode::OK, ""),
                Err(e) => plain_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
            }
        }
        _ => plain_response(StatusCode::NOT_FOUND, "not found"),
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(
    req: Request<Incoming>,
) -> std::result::Result<T, ()> {
    let bytes = req.into_body().collect().await.map_err(|_| ())?.to_bytes();
    serde_json::from_slice(&bytes).map_err(|_| ())
}

fn json_response<T: serde::Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(value).unwrap_or_default();
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_default()
}

fn plain_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(message.to_string())))
        .unwrap_or_default()
}

/// A stream with some already-read bytes stitched back in front.
struct PrefixedStream<S> {
    prefix: Vec<u8>,
    offset: usize,
    inner: S,
}

impl<S> PrefixedStream<S> {
    fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            offset: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.offset < self.prefix.len() {
            let remaining = &self.prefix[self.offset..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            self.offset += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
