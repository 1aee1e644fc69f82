//! Fixed-window request throttle keyed by `(client_id, endpoint)`.
//!
//! Windows live in a `DashMap`; each decision runs under the entry's shard
//! lock so concurrent requests cannot lose an increment. Expired windows are
//! swept on a random fraction of requests.

use dashmap::DashMap;
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::RateLimitConfig;
use crate::error::ThrottleError;

/// Outcome of one rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Requests left in the current window.
    pub remaining: u32,
    /// Seconds until the window resets; 0 when allowed.
    pub retry_after_secs: u64,
}

#[derive(Debug)]
struct Window {
    count: u32,
    reset_at: Instant,
}

type Key = (String, String);

#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: DashMap<Key, Window>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
        }
    }

    /// Count a request from `client_id` against `endpoint` and decide on it.
    /// Rejected requests are not counted.
    pub fn check(&self, client_id: &str, endpoint: &str) -> RateDecision {
        let rule = self.config.rule_for(endpoint);
        let now = Instant::now();

        let decision = {
            let mut window = self
                .windows
                .entry((client_id.to_owned(), endpoint.to_owned()))
                .or_insert_with(|| Window {
                    count: 0,
                    reset_at: now,
                });

            if now >= window.reset_at {
                window.count = 1;
                window.reset_at = now + rule.window();
                RateDecision {
                    allowed: true,
                    remaining: rule.limit - 1,
                    retry_after_secs: 0,
                }
            } else if window.count >= rule.limit {
                RateDecision {
                    allowed: false,
                    remaining: 0,
                    retry_after_secs: (window.reset_at - now).as_secs_f64().ceil() as u64,
                }
            } else {
                window.count += 1;
                RateDecision {
                    allowed: true,
                    remaining: rule.limit - window.count,
                    retry_after_secs: 0,
                }
            }
        };

        self.maybe_prune(now);
        decision
    }

    /// Like [`check`](Self::check), but a rejection is an error.
    pub fn hit(&self, client_id: &str, endpoint: &str) -> Result<RateDecision, ThrottleError> {
        let decision = self.check(client_id, endpoint);
        if decision.allowed {
            Ok(decision)
        } else {
            info!(
                client = client_id,
                endpoint,
                retry_after = decision.retry_after_secs,
                "rate limit exceeded"
            );
            Err(ThrottleError::RateLimitExceeded {
                endpoint: endpoint.to_string(),
                retry_after_secs: decision.retry_after_secs,
            })
        }
    }

    /// Forget the window of one client on one endpoint.
    pub fn reset(&self, client_id: &str, endpoint: &str) {
        self.windows
            .remove(&(client_id.to_owned(), endpoint.to_owned()));
    }

    /// Remove every expired window, returning how many were dropped.
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows.retain(|_, window| window.reset_at > now);
        let pruned = before.saturating_sub(self.windows.len());
        debug!(pruned, "pruned expired rate limit windows");
        pruned
    }

    /// Drop all windows.
    pub fn clear(&self) {
        self.windows.clear();
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    fn maybe_prune(&self, now: Instant) {
        let p = self.config.prune_probability.clamp(0.0, 1.0);
        if p > 0.0 && rand::rng().random_bool(p) {
            self.windows.retain(|_, window| window.reset_at > now);
        }
    }
}
