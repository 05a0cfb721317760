//! Rate limiting
//!
//! Sliding-window limiter keyed by client identifier. The limiter itself only
//! knows about profiles and decisions; counting is delegated to a
//! [`RateLimitStore`] so the process-local store and the Redis-backed store
//! are interchangeable without touching call sites.
//!
//! The in-memory store is best-effort: several API instances each keep their
//! own counters, so limits are per instance unless Redis is configured.

mod memory;
mod redis_store;

pub use memory::InMemoryRateLimitStore;
pub use redis_store::RedisRateLimitStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::SharedResult;

/// Bucket used when the caller cannot be identified
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Snapshot of one key's window after a store operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowState {
    /// Hits currently inside the window (including an admitted one)
    pub count: u32,
    /// Whether the last `increment` recorded the hit
    pub admitted: bool,
    /// Time until the oldest hit leaves the window, if any hit is present
    pub oldest_expires_in: Option<Duration>,
}

/// Counter storage behind the limiter
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Read the current window for a key without recording a hit
    async fn get(&self, key: &str, window: Duration) -> SharedResult<WindowState>;

    /// Record a hit if fewer than `max` hits are inside the window.
    ///
    /// The check and the insert are atomic per key.
    async fn increment(&self, key: &str, window: Duration, max: u32) -> SharedResult<WindowState>;

    /// Drop keys whose hits have all expired. Returns the number of keys removed.
    async fn sweep(&self) -> SharedResult<usize>;
}

/// Limiter profile per endpoint class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitProfile {
    /// Admin and credential operations
    Strict,
    /// Order and payment creation
    Payment,
    /// Inbound webhooks. External senders retry aggressively and must not be starved.
    Webhook,
    /// Everything else
    Default,
}

impl RateLimitProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitProfile::Strict => "strict",
            RateLimitProfile::Payment => "payment",
            RateLimitProfile::Webhook => "webhook",
            RateLimitProfile::Default => "default",
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(60)
    }

    pub fn max_requests(&self) -> u32 {
        match self {
            RateLimitProfile::Strict => 10,
            RateLimitProfile::Payment => 20,
            RateLimitProfile::Webhook => 300,
            RateLimitProfile::Default => 100,
        }
    }
}

/// Outcome of a rate limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed { remaining: u32 },
    Limited { retry_after: Duration },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed { .. })
    }

    /// Retry hint in whole seconds, rounded up
    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            RateLimitDecision::Allowed { .. } => None,
            RateLimitDecision::Limited { retry_after } => {
                let secs = retry_after.as_secs();
                Some(if retry_after.subsec_nanos() > 0 { secs + 1 } else { secs.max(1) })
            }
        }
    }
}

/// Rate limiter shared by all public endpoints
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>) -> Self {
        Self { store }
    }

    /// Limiter backed by the process-local store
    pub fn new_in_memory() -> Self {
        Self::new(Arc::new(InMemoryRateLimitStore::new()))
    }

    /// Check (and on success record) a request for `identifier` under `profile`
    pub async fn check(
        &self,
        identifier: &str,
        profile: RateLimitProfile,
    ) -> SharedResult<RateLimitDecision> {
        self.check_with(identifier, profile.as_str(), profile.window(), profile.max_requests())
            .await
    }

    /// Check against an explicit window and limit
    pub async fn check_with(
        &self,
        identifier: &str,
        bucket: &str,
        window: Duration,
        max_requests: u32,
    ) -> SharedResult<RateLimitDecision> {
        let key = format!("rl:{}:{}", bucket, identifier);
        let state = self.store.increment(&key, window, max_requests).await?;

        if state.admitted {
            return Ok(RateLimitDecision::Allowed {
                remaining: max_requests.saturating_sub(state.count),
            });
        }

        Ok(RateLimitDecision::Limited {
            retry_after: state.oldest_expires_in.unwrap_or(window),
        })
    }

    /// Remove expired counters
    pub async fn cleanup(&self) -> usize {
        match self.store.sweep().await {
            Ok(removed) => removed,
            Err(e) => {
                tracing::warn!(error = %e, "Rate limit sweep failed");
                0
            }
        }
    }
}

/// Resolve the client identifier from a forwarded-for header value.
///
/// Takes the first address of the list; missing or empty values fall into
/// the shared [`UNKNOWN_CLIENT`] bucket.
pub fn client_identifier(forwarded_for: Option<&str>) -> String {
    forwarded_for
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(String::from)
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}
