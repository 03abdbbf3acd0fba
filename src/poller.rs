//! Background status polling with capped exponential backoff.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(300);

/// Delay schedule for the poll loop. After `n` consecutive failures the next
/// delay is `interval * 2^(n-1)`, never more than `cap`.
#[derive(Debug, Clone)]
pub struct Backoff {
    interval: Duration,
    cap: Duration,
    errors: u32,
}

impl Backoff {
    pub fn new(interval: Duration, cap: Duration) -> Self {
        Self { interval, cap: cap.max(interval), errors: 0 }
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.errors
    }

    /// Record the outcome of a poll and return the delay before the next one.
    pub fn next_delay(&mut self, success: bool) -> Duration {
        if success {
            self.errors = 0;
            return self.interval;
        }
        self.errors = self.errors.saturating_add(1);
        let factor = 2u32.saturating_pow(self.errors - 1);
        self.interval.saturating_mul(factor).min(self.cap)
    }
}

/// Handle to a running poll loop. Dropping it does not stop the loop.
pub struct Poller {
    stopped: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl Poller {
    /// Run `refresh` now and then again after every computed delay.
    /// `refresh` resolves to `true` on success.
    pub fn spawn<F, Fut>(interval: Duration, cap: Duration, mut refresh: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = stopped.clone();
        let task = tokio::spawn(async move {
            let mut backoff = Backoff::new(interval, cap);
            loop {
                if flag.load(Ordering::SeqCst) {
                    break;
                }
                let ok = refresh().await;
                let delay = backoff.next_delay(ok);
                // stop() may have landed while the refresh was in flight
                if flag.load(Ordering::SeqCst) {
                    break;
                }
                if ok {
                    debug!(delay = ?delay, "Poll ok");
                } else {
                    warn!(
                        errors = backoff.consecutive_errors(),
                        delay = ?delay,
                        "Poll failed, backing off"
                    );
                }
                tokio::time::sleep(delay).await;
            }
            debug!("Poll loop stopped");
        });
        Self { stopped, task }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.task.abort();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}
