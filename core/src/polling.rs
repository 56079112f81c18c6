/// Polling fallback: periodic unread-count reconciliation over REST
///
/// Runs regardless of push state so a degraded or unavailable push channel
/// only delays updates by one interval.
use crate::notification_store::NotificationStore;
use crate::rest::RestApi;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Running poll loop. Dropping the handle stops it.
pub struct PollingFallback {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl PollingFallback {
    /// Start polling every `period`. The first poll happens one period in.
    pub fn start(store: NotificationStore, rest: Arc<dyn RestApi>, period: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately
            ticker.tick().await;
            info!("Unread-count polling every {:?}", period);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => poll_once(&store, rest.as_ref()).await,
                }
            }
            debug!("Unread-count polling stopped");
        });
        Self {
            cancel,
            task: Some(task),
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Cancel the loop and wait for it to finish.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for PollingFallback {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn poll_once(store: &NotificationStore, rest: &dyn RestApi) {
    let Some(user_id) = store.user_id() else {
        debug!("No user loaded yet, skipping unread poll");
        return;
    };
    match rest.fetch_unread_count(&user_id).await {
        Ok(count) => {
            if let Err(e) = store.reconcile_unread(count).await {
                warn!("Reload after unread drift failed: {}", e);
            }
        }
        Err(e) => warn!("Unread-count poll for user {} failed: {}", user_id, e),
    }
}
