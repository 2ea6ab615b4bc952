//! Periodic eviction of identifiers with no live requests.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::backend::RateLimiterBackend;

/// Background task that calls [`RateLimiterBackend::sweep`] on an interval.
#[derive(Debug)]
pub struct Sweeper {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Sweeper {
    /// Start sweeping `backend` every `interval`.
    ///
    /// The first sweep runs one full interval after spawning.
    pub fn spawn<R: RateLimiterBackend + 'static>(backend: Arc<R>, interval: Duration) -> Self {
        let (stop, mut stopped) = watch::channel(false);

        info!(interval_secs = interval.as_secs_f64(), "Starting rate limit sweeper");

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = backend.sweep().await;
                        if evicted > 0 {
                            debug!(evicted, "Swept expired rate limit identifiers");
                        }
                    }
                    _ = stopped.changed() => break,
                }
            }

            debug!("Rate limit sweeper stopped");
        });

        Self { stop, handle }
    }

    /// Stop the task and wait for it to finish.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        let _ = self.handle.await;
    }
}
