//! Event notifier: a fire-and-forget stream of supervisor milestones
//! posted to an external unix-socket listener.
//!
//! Producers never block. A single drain task delivers each event as an
//! HTTP GET with a short budget; losses are logged and swallowed. `exit`
//! is terminal: it flushes the queue, ends the drain task, and unblocks
//! the shutdown path.

use crate::httpunix;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};

pub const EVENT_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEvent {
    Initializing,
    GvProxyReady,
    IgnitionProgress,
    IgnitionDone,
    Ready,
}

impl fmt::Display for AppEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initializing => "Initializing",
            Self::GvProxyReady => "GVProxyReady",
            Self::IgnitionProgress => "IgnitionProgress",
            Self::IgnitionDone => "IgnitionDone",
            Self::Ready => "Ready",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Datum {
    kind: &'static str,
    message: String,
}

struct Inner {
    queue: mpsc::UnboundedSender<Datum>,
    queued: AtomicUsize,
    exit_done: Mutex<Option<oneshot::Receiver<()>>>,
}

/// Handle for emitting events. A handle built without a socket is inert:
/// every notify is a no-op.
#[derive(Clone)]
pub struct Events {
    inner: Option<Arc<Inner>>,
}

impl Events {
    /// No-op notifier for configurations without an event socket.
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    /// Builds the notifier and starts its drain task.
    pub fn setup(socket_path: Option<PathBuf>) -> Self {
        let Some(socket_path) = socket_path else {
            tracing::info!("no event socket path, events will not be sent");
            return Self::disabled();
        };

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();
        let inner = Arc::new(Inner {
            queue: queue_tx,
            queued: AtomicUsize::new(0),
            exit_done: Mutex::new(Some(done_rx)),
        });

        tokio::spawn(drain(socket_path, queue_rx, inner.clone(), done_tx));

        Self { inner: Some(inner) }
    }

    pub fn notify_app(&self, event: AppEvent) {
        self.enqueue("app", event.to_string());
    }

    pub fn notify_error(&self, message: impl fmt::Display) {
        self.enqueue("error", message.to_string());
    }

    /// Sends the terminal event and waits for the queue to flush. The
    /// wait is bounded by the per-event budget, so a dead receiver cannot
    /// hang shutdown.
    pub async fn notify_exit(&self) {
        let Some(inner) = &self.inner else {
            return;
        };

        let backlog = inner.queued.load(Ordering::SeqCst) as u32 + 1;
        self.enqueue("exit", String::new());

        let Some(done) = inner.exit_done.lock().await.take() else {
            return;
        };

        let budget = EVENT_TIMEOUT * backlog + Duration::from_millis(50);
        if tokio::time::timeout(budget, done).await.is_err() {
            tracing::warn!("event drain did not confirm exit in time");
        }
    }

    fn enqueue(&self, kind: &'static str, message: String) {
        let Some(inner) = &self.inner else {
            return;
        };
        inner.queued.fetch_add(1, Ordering::SeqCst);
        let _ = inner.queue.send(Datum { kind, message });
    }
}

async fn drain(
    socket_path: PathBuf,
    mut queue: mpsc::UnboundedReceiver<Datum>,
    inner: Arc<Inner>,
    done: oneshot::Sender<()>,
) {
    while let Some(datum) = queue.recv().await {
        inner.queued.fetch_sub(1, Ordering::SeqCst);

        let uri = format!(
            "http://podvm/notify?event={}&message={}",
            datum.kind,
            httpunix::query_escape(&datum.message)
        );
        tracing::info!("notify {} event to {uri}", datum.kind);

        match httpunix::get(&socket_path, &uri, EVENT_TIMEOUT).await {
            Ok(status) if status.is_success() => {}
            Ok(status) => {
                tracing::warn!("notify {datum:?} failed, status code is: {status}");
            }
            Err(e) => {
                tracing::warn!("notify {datum:?} failed: {e}");
            }
        }

        if datum.kind == "exit" {
            let _ = done.send(());
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Full;
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;
    use std::path::Path;
    use tokio::net::UnixListener;

    /// Records `(event, message)` pairs in arrival order.
    fn spawn_receiver(path: &Path) -> mpsc::UnboundedReceiver<(String, String)> {
        let listener = UnixListener::bind(path).unwrap();
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let seen_tx = seen_tx.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
                        let seen_tx = seen_tx.clone();
                        async move {
                            let query = req.uri().query().unwrap_or_default().to_string();
                            let mut event = String::new();
                            let mut message = String::new();
                            for pair in query.split('&') {
                                if let Some(v) = pair.strip_prefix("event=") {
                                    event = v.to_string();
                                }
                                if let Some(v) = pair.strip_prefix("message=") {
                                    message = v.to_string();
                                }
                            }
                            let _ = seen_tx.send((event, message));
                            Ok::<_, std::convert::Infallible>(hyper::Response::new(Full::new(
                                bytes::Bytes::new(),
                            )))
                        }
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        seen_rx
    }

    #[tokio::test]
    async fn events_arrive_in_order_and_exit_is_last() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("events.sock");
        let mut seen = spawn_receiver(&path);

        let events = Events::setup(Some(path));
        events.notify_app(AppEvent::Initializing);
        events.notify_app(AppEvent::GvProxyReady);
        events.notify_error("boom happened");
        events.notify_exit().await;

        let mut got = Vec::new();
        while let Ok(pair) = seen.try_recv() {
            got.push(pair);
        }

        assert_eq!(
            got,
            vec![
                ("app".to_string(), "Initializing".to_string()),
                ("app".to_string(), "GVProxyReady".to_string()),
                ("error".to_string(), "boom%20happened".to_string()),
                ("exit".to_string(), String::new()),
            ]
        );
    }

    #[tokio::test]
    async fn exit_with_dead_receiver_does_not_hang() {
        let tmp = tempfile::tempdir().unwrap();
        // Nothing listens on this path.
        let events = Events::setup(Some(tmp.path().join("void.sock")));

        events.notify_app(AppEvent::Ready);
        tokio::time::timeout(Duration::from_secs(2), events.notify_exit())
            .await
            .expect("exit must be bounded");
    }

    #[tokio::test]
    async fn disabled_notifier_is_inert() {
        let events = Events::disabled();
        events.notify_app(AppEvent::Ready);
        events.notify_error("ignored");
        events.notify_exit().await;
    }

    #[tokio::test]
    async fn notify_after_exit_is_dropped() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("events.sock");
        let mut seen = spawn_receiver(&path);

        let events = Events::setup(Some(path));
        events.notify_exit().await;
        events.notify_app(AppEvent::Ready);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut got = Vec::new();
        while let Ok(pair) = seen.try_recv() {
            got.push(pair.0);
        }
        assert_eq!(got, vec!["exit".to_string()]);
    }
}
