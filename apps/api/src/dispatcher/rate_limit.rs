use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Process-wide request ceiling over a sliding window.
///
/// Independent of retry policy: every attempt, first or retried, takes a slot.
pub struct RateLimiter {
    window: Duration,
    max_requests: usize,
    sent: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(window: Duration, max_requests: usize) -> Self {
        Self {
            window,
            max_requests: max_requests.max(1),
            sent: Mutex::new(VecDeque::new()),
        }
    }

    /// Waits until a slot is free in the current window, then takes it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut sent = self.sent.lock().await;
                let now = Instant::now();
                while sent
                    .front()
                    .is_some_and(|oldest| now.duration_since(*oldest) >= self.window)
                {
                    sent.pop_front();
                }

                if sent.len() < self.max_requests {
                    sent.push_back(now);
                    return;
                }

                sent.front()
                    .map(|oldest| self.window.saturating_sub(now.duration_since(*oldest)))
                    .unwrap_or_default()
            };

            debug!("Rate ceiling reached; waiting {}ms for a slot", wait.as_millis());
            tokio::time::sleep(wait).await;
        }
    }

    /// Slots taken in the current window.
    #[cfg(test)]
    pub async fn in_window(&self) -> usize {
        let sent = self.sent.lock().await;
        let now = Instant::now();
        sent.iter()
            .filter(|t| now.duration_since(**t) < self.window)
            .count()
    }
}
