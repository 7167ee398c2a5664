//! Structured task scope with error-group semantics.
//!
//! Every supervisor task runs inside one `TaskGroup`: the first task to
//! return an error cancels the scope, every other task observes the
//! cancellation and unwinds, and `wait` hands back that first error.
//! Panics convert to errors instead of taking the process down.

use crate::error::{Error, Result};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct TaskGroup {
    inner: Arc<Inner>,
}

struct Inner {
    cancel: CancellationToken,
    pending: AtomicUsize,
    first_error: std::sync::Mutex<Option<Error>>,
    done: Notify,
}

impl TaskGroup {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancel: CancellationToken::new(),
                pending: AtomicUsize::new(0),
                first_error: std::sync::Mutex::new(None),
                done: Notify::new(),
            }),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    /// Spawns a task into the scope. Its error (or panic) cancels every
    /// sibling.
    pub fn spawn<F>(&self, name: &'static str, future: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.clone();

        tokio::spawn(async move {
            let result = match AssertUnwindSafe(future).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err(Error::TaskPanic { task: name }),
            };

            if let Err(error) = result {
                let mut slot = inner.first_error.lock().unwrap();
                if slot.is_none() {
                    tracing::error!("task {name} failed: {error}");
                    *slot = Some(error);
                } else {
                    tracing::warn!("task {name} failed after shutdown began: {error}");
                }
                drop(slot);
                inner.cancel.cancel();
            } else {
                tracing::debug!("task {name} finished");
            }

            if inner.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                inner.done.notify_waiters();
            }
        });
    }

    /// Waits for every spawned task, returning the first error.
    pub async fn wait(&self) -> Result<()> {
        loop {
            if self.inner.pending.load(Ordering::SeqCst) == 0 {
                break;
            }
            let notified = self.inner.done.notified();
            if self.inner.pending.load(Ordering::SeqCst) == 0 {
                break;
            }
            notified.await;
        }

        match self.inner.first_error.lock().unwrap().take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn empty_group_waits_cleanly() {
        let group = TaskGroup::new();
        assert!(group.wait().await.is_ok());
    }

    #[tokio::test]
    async fn all_ok_tasks_yield_ok() {
        let group = TaskGroup::new();
        group.spawn("a", async { Ok(()) });
        group.spawn("b", async { Ok(()) });
        assert!(group.wait().await.is_ok());
    }

    #[tokio::test]
    async fn first_error_cancels_siblings_and_wins() {
        let group = TaskGroup::new();
        let cancel = group.cancel_token();

        group.spawn("failing", async {
            Err(Error::Other("boom".to_string()))
        });
        group.spawn("waiting", async move {
            cancel.cancelled().await;
            Err(Error::Other("secondary".to_string()))
        });

        let err = group.wait().await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[tokio::test]
    async fn panic_becomes_an_error() {
        let group = TaskGroup::new();
        group.spawn("exploding", async {
            panic!("surprise");
        });

        let err = group.wait().await.unwrap_err();
        assert_eq!(err.to_string(), "exploding panicked");
    }

    #[tokio::test]
    async fn cancellation_reaches_blocked_tasks() {
        let group = TaskGroup::new();
        let cancel = group.cancel_token();

        group.spawn("blocked", async move {
            tokio::select! {
                _ = cancel.cancelled() => Ok(()),
                _ = tokio::time::sleep(Duration::from_secs(600)) => {
                    Err(Error::Other("should not get here".to_string()))
                }
            }
        });

        group.cancel();
        tokio::time::timeout(Duration::from_secs(5), group.wait())
            .await
            .expect("group must unwind quickly")
            .unwrap();
    }
}
