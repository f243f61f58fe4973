//! Owned handles for background loops.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Handle to a spawned background loop.
///
/// Dropping the handle cancels the loop; [`TaskHandle::shutdown`] cancels and
/// waits for it to finish.
#[derive(Debug)]
pub struct TaskHandle {
    name: &'static str,
    token: CancellationToken,
    join: Option<JoinHandle<()>>,
}

impl TaskHandle {
    /// Spawns `make_future(token)` on the current runtime.
    ///
    /// The future must return once the token is cancelled.
    pub fn spawn<F, Fut>(name: &'static str, make_future: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let join = tokio::spawn(make_future(token.clone()));
        debug!(task = name, "background task started");
        Self {
            name,
            token,
            join: Some(join),
        }
    }

    /// Spawns a loop calling `tick` every `period` until cancelled.
    ///
    /// Missed ticks are delayed rather than bursted.
    pub fn periodic<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        Self::spawn(name, move |token| async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => tick().await,
                }
            }
        })
    }

    /// Name given at spawn time.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Requests cancellation without waiting.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Cancels the loop and waits for it to exit.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                warn!(task = self.name, "background task ended abnormally: {}", e);
            }
        }
        debug!(task = self.name, "background task stopped");
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
