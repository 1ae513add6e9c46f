//! Fixed-window admission control.
//!
//! Same counter semantics as the platform's INCR+EXPIRE HTTP limiter: a
//! counter per key plus a window deadline. A client that exhausts a window
//! right before it resets can burst up to ~2x the nominal limit across the
//! boundary; that behavior is deliberate and covered by tests.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::GateConfig;
use crate::error::{AppError, AppResult};
use crate::metrics;

struct Bucket {
    count: u32,
    window_reset_at: Instant,
}

pub struct FixedWindowLimiter {
    limit: u32,
    window: Duration,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl FixedWindowLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Counts one attempt for `key`. Returns how long the caller must wait
    /// when the window is exhausted.
    pub fn check(&self, key: &str) -> Result<(), Duration> {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("limiter mutex poisoned");

        match buckets.get_mut(key) {
            Some(bucket) if now > bucket.window_reset_at => {
                bucket.count = 1;
                bucket.window_reset_at = now + self.window;
                Ok(())
            }
            Some(bucket) if bucket.count >= self.limit => {
                Err(bucket.window_reset_at.saturating_duration_since(now))
            }
            Some(bucket) => {
                bucket.count += 1;
                Ok(())
            }
            None => {
                buckets.insert(
                    key.to_string(),
                    Bucket {
                        count: 1,
                        window_reset_at: now + self.window,
                    },
                );
                Ok(())
            }
        }
    }

    /// Drops buckets whose window has ended. Called from the sweep task to
    /// keep the key map from growing with connection churn.
    pub fn prune_expired(&self) {
        let now = Instant::now();
        self.buckets
            .lock()
            .expect("limiter mutex poisoned")
            .retain(|_, bucket| now <= bucket.window_reset_at);
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.lock().expect("limiter mutex poisoned").len()
    }
}

/// Per-connection and per-message admission control: three independent
/// fixed-window limiters keyed by IP, user id, and user id respectively.
pub struct ConnectionGate {
    per_ip: FixedWindowLimiter,
    per_user: FixedWindowLimiter,
    per_user_messages: FixedWindowLimiter,
}

impl ConnectionGate {
    pub fn new(cfg: &GateConfig) -> Self {
        Self {
            per_ip: FixedWindowLimiter::new(cfg.ip_connection_limit, cfg.window),
            per_user: FixedWindowLimiter::new(cfg.user_connection_limit, cfg.window),
            per_user_messages: FixedWindowLimiter::new(cfg.user_message_limit, cfg.window),
        }
    }

    pub fn admit_connection(&self, ip: IpAddr, user_id: Uuid) -> AppResult<()> {
        self.per_ip.check(&ip.to_string()).map_err(|retry| {
            metrics::rate_limited("ip");
            tracing::warn!(%ip, "connection rejected: per-ip limit");
            rate_limited(retry)
        })?;
        self.per_user.check(&user_id.to_string()).map_err(|retry| {
            metrics::rate_limited("user");
            tracing::warn!(%user_id, "connection rejected: per-user limit");
            rate_limited(retry)
        })
    }

    pub fn allow_message(&self, user_id: Uuid) -> AppResult<()> {
        self.per_user_messages
            .check(&user_id.to_string())
            .map_err(|retry| {
                metrics::rate_limited("message");
                rate_limited(retry)
            })
    }

    pub fn prune_expired(&self) {
        self.per_ip.prune_expired();
        self.per_user.prune_expired();
        self.per_user_messages.prune_expired();
    }
}

fn rate_limited(retry: Duration) -> AppError {
    AppError::RateLimited {
        retry_after_secs: retry.as_secs().max(1),
    }
}
