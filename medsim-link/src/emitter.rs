//! Cancellable background task bound to the link lifetime

use std::future::Future;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Handle on a spawned periodic task
///
/// The task receives its own child token and must return once it fires.
/// Cancelling the parent (link teardown) cancels every emitter.
pub(crate) struct Emitter {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Emitter {
    pub(crate) fn spawn<F, Fut>(parent: &CancellationToken, body: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = parent.child_token();
        let task = tokio::spawn(body(cancel.clone()));
        Self { cancel, task }
    }

    pub(crate) fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    /// Cancel and wait until the task has fully returned
    pub(crate) async fn shutdown(self) {
        self.cancel.cancel();
        // a panicked or aborted task is already gone
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_shutdown_waits_for_task() {
        let root = CancellationToken::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();

        let emitter = Emitter::spawn(&root, |cancel| async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(5)) => {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
        });
        assert!(emitter.is_active());
        tokio::time::sleep(Duration::from_millis(30)).await;
        emitter.shutdown().await;

        let after = ticks.load(Ordering::SeqCst);
        assert!(after > 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), after);
    }

    #[tokio::test]
    async fn test_parent_cancel_stops_emitter() {
        let root = CancellationToken::new();
        let emitter = Emitter::spawn(&root, |cancel| async move { cancel.cancelled().await });
        root.cancel();
        tokio::time::timeout(Duration::from_secs(1), emitter.shutdown())
            .await
            .unwrap();
    }
}
