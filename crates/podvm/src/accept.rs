//! Cancellable, deadline-bound unix accepts.

use crate::error::{Error, Result};
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

/// Accepts one connection, giving up on cancellation or after `timeout`.
/// The listener is always closed when this returns without a connection.
pub async fn accept_timeout(
    listener: UnixListener,
    cancel: &CancellationToken,
    timeout: Duration,
    what: &'static str,
) -> Result<UnixStream> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Other(format!(
            "cancel wait accept {what} because scope done"
        ))),
        _ = tokio::time::sleep(timeout) => Err(Error::Timeout(what)),
        accepted = listener.accept() => {
            let (stream, _) = accepted?;
            Ok(stream)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn accepts_a_connection() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let cancel = CancellationToken::new();

        let client = tokio::spawn({
            let path = path.clone();
            async move { UnixStream::connect(path).await.unwrap() }
        });

        let stream = accept_timeout(listener, &cancel, Duration::from_secs(5), "test")
            .await
            .unwrap();
        drop(stream);
        client.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_without_a_connection() {
        let tmp = tempfile::tempdir().unwrap();
        let listener = UnixListener::bind(tmp.path().join("b.sock")).unwrap();
        let cancel = CancellationToken::new();

        let err = accept_timeout(listener, &cancel, Duration::from_secs(30), "ready")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "timeout waiting for ready");
    }

    #[tokio::test]
    async fn cancellation_wins_over_waiting() {
        let tmp = tempfile::tempdir().unwrap();
        let listener = UnixListener::bind(tmp.path().join("c.sock")).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = accept_timeout(listener, &cancel, Duration::from_secs(30), "ready")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("scope done"));
    }
}
