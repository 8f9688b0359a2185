use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use tokio::{sync::Mutex, time::Instant};

/// Outcome of one admission check. Denial is a value, never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub allowed: bool,
    pub limit: usize,
    /// Time until the oldest request leaves the window; zero when allowed.
    pub retry_after: Duration,
}

/// In-memory sliding-window limiter keyed by client address.
#[derive(Debug)]
pub struct RateLimiter {
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
    max_requests: usize,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            max_requests,
            window,
        }
    }

    pub fn limit(&self) -> usize {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub async fn admit(&self, client_id: &str) -> Admission {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        let timestamps = windows.entry(client_id.to_string()).or_default();
        purge_expired(timestamps, now, self.window);

        if timestamps.len() >= self.max_requests {
            let retry_after = timestamps
                .front()
                .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
                .unwrap_or(self.window);
            return Admission {
                allowed: false,
                limit: self.max_requests,
                retry_after,
            };
        }

        timestamps.push_back(now);
        Admission {
            allowed: true,
            limit: self.max_requests,
            retry_after: Duration::ZERO,
        }
    }

    /// Drops clients with nothing left inside the window. Returns how many went.
    pub async fn prune(&self) -> usize {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        let before = windows.len();
        windows.retain(|_, timestamps| {
            purge_expired(timestamps, now, self.window);
            !timestamps.is_empty()
        });
        before - windows.len()
    }

    pub async fn tracked_clients(&self) -> usize {
        self.windows.lock().await.len()
    }
}

fn purge_expired(timestamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = timestamps.front() {
        if now.saturating_duration_since(*oldest) >= window {
            timestamps.pop_front();
        } else {
            break;
        }
    }
}
