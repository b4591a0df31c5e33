//! Cancellable one-shot timers

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Handle to a scheduled callback.
///
/// Cancelling before the delay elapses guarantees the callback never runs.
/// A callback that already started is not interrupted, so callbacks must
/// re-check the state they act on.
#[derive(Debug)]
pub struct TimerHandle {
    token: CancellationToken,
}

impl TimerHandle {
    /// Run `callback` after `delay` unless this handle or `parent` is cancelled
    pub fn schedule<F>(parent: &CancellationToken, delay: Duration, callback: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = parent.child_token();
        let guard = token.clone();

        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = guard.cancelled() => {}
                _ = tokio::time::sleep(delay) => callback.await,
            }
        });

        Self { token }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}
