//! Signaling fabric: the ready barriers and the time-sync tick stream.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

/// One-shot barrier: signaled at most once per process lifetime.
struct Barrier {
    tx: std::sync::Mutex<Option<mpsc::Sender<bool>>>,
    rx: tokio::sync::Mutex<Option<mpsc::Receiver<bool>>>,
    signaled: AtomicBool,
}

impl Barrier {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            tx: std::sync::Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(Some(rx)),
            signaled: AtomicBool::new(false),
        }
    }

    fn notify(&self, name: &str) {
        if self.signaled.swap(true, Ordering::SeqCst) {
            debug_assert!(false, "{name} signaled twice");
            tracing::warn!("{name} signaled twice, ignoring");
            return;
        }

        if let Some(tx) = self.tx.lock().unwrap().as_ref() {
            let _ = tx.try_send(true);
        } else {
            tracing::warn!("{name} signaled after close, ignoring");
        }
    }

    /// Waits for the signal. Returns false once the fabric closed
    /// unsignaled.
    async fn receive(&self) -> bool {
        let mut guard = self.rx.lock().await;
        match guard.as_mut() {
            Some(rx) => rx.recv().await.unwrap_or(false),
            None => false,
        }
    }

    fn close(&self) {
        self.tx.lock().unwrap().take();
    }
}

struct Inner {
    gvproxy_ready: Barrier,
    vm_ready: Barrier,
    sync_time_tx: std::sync::Mutex<Option<mpsc::UnboundedSender<bool>>>,
    sync_time_rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<bool>>>,
    closed: AtomicBool,
}

/// Process-scoped signal handles shared by the supervisor tasks.
#[derive(Clone)]
pub struct Signals {
    inner: Arc<Inner>,
}

impl Signals {
    pub fn new() -> Self {
        let (sync_tx, sync_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                gvproxy_ready: Barrier::new(),
                vm_ready: Barrier::new(),
                sync_time_tx: std::sync::Mutex::new(Some(sync_tx)),
                sync_time_rx: tokio::sync::Mutex::new(Some(sync_rx)),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn notify_gvproxy_ready(&self) {
        self.inner.gvproxy_ready.notify("gvproxy-ready");
    }

    pub async fn receive_gvproxy_ready(&self) -> bool {
        self.inner.gvproxy_ready.receive().await
    }

    pub fn notify_vm_ready(&self) {
        self.inner.vm_ready.notify("vm-ready");
    }

    pub async fn receive_vm_ready(&self) -> bool {
        self.inner.vm_ready.receive().await
    }

    /// Never blocks the producer; ticks queue unboundedly until the
    /// consumer drains them in order.
    pub fn notify_sync_time(&self) {
        if let Some(tx) = self.inner.sync_time_tx.lock().unwrap().as_ref() {
            let _ = tx.send(true);
        }
    }

    /// Waits for the next sync tick. Returns false once closed.
    pub async fn receive_sync_time(&self) -> bool {
        let mut guard = self.inner.sync_time_rx.lock().await;
        match guard.as_mut() {
            Some(rx) => rx.recv().await.unwrap_or(false),
            None => false,
        }
    }

    /// Idempotent; concurrent callers are fine.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.gvproxy_ready.close();
        self.inner.vm_ready.close();
        self.inner.sync_time_tx.lock().unwrap().take();
    }
}

impl Default for Signals {
    fn default() -> Self {
        Self::new()
    }
}
