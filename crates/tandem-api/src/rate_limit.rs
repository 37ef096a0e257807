use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::config::AppConfig;
use crate::error::AppError;

/// Fixed-window request limiter keyed by account
#[derive(Clone)]
pub struct AccountRateLimiter {
    state: Arc<Mutex<HashMap<String, RateWindow>>>,
    window: Duration,
    limit: u32,
    metrics: Arc<RateLimitMetrics>,
}

#[derive(Default)]
struct RateLimitMetrics {
    allowed: AtomicU64,
    limited: AtomicU64,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct RateLimitMetricsSnapshot {
    pub allowed: u64,
    pub limited: u64,
}

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    started_at: Instant,
    count: u32,
}

impl AccountRateLimiter {
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.rate_limit_window, config.requests_per_window)
    }

    fn new(window: Duration, limit: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(HashMap::new())),
            window,
            limit,
            metrics: Arc::new(RateLimitMetrics::default()),
        }
    }

    pub async fn check(&self, account_id: &str) -> Result<(), AppError> {
        let now = Instant::now();
        let mut guard = self.state.lock().await;
        let entry = guard.entry(account_id.to_string()).or_insert(RateWindow {
            started_at: now,
            count: 0,
        });

        if now.duration_since(entry.started_at) >= self.window {
            entry.started_at = now;
            entry.count = 0;
        }

        if entry.count >= self.limit {
            let retry_after_secs = self
                .window
                .saturating_sub(now.duration_since(entry.started_at))
                .as_secs();
            self.metrics.limited.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                account = account_fingerprint(account_id),
                retry_after_secs,
                "Rate limit exceeded"
            );
            return Err(AppError::too_many_requests(
                "Rate limit exceeded for account",
                retry_after_secs,
            ));
        }

        entry.count += 1;
        self.metrics.allowed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn metrics_snapshot(&self) -> RateLimitMetricsSnapshot {
        RateLimitMetricsSnapshot {
            allowed: self.metrics.allowed.load(Ordering::Relaxed),
            limited: self.metrics.limited.load(Ordering::Relaxed),
        }
    }
}

/// Stable hash so logs never carry raw account IDs
pub fn account_fingerprint(account_id: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    account_id.hash(&mut hasher);
    hasher.finish()
}
