//! Per-client admission control for the search route.
//!
//! Buckets live in a sharded keyed store owned by the limiter instance; the
//! limiter itself is handed to the pipeline by reference, so every replica
//! enforces its own budget.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::{
    Quota, RateLimiter,
    clock::{Clock, DefaultClock},
    middleware::NoOpMiddleware,
    state::keyed::DashMapStateStore,
};
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::config::RateLimitConfig;

type KeyedBuckets<C> =
    RateLimiter<String, DashMapStateStore<String>, C, NoOpMiddleware<<C as Clock>::Instant>>;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RateLimitConfigError {
    #[error("refill_per_sec must be a finite positive number, got {0}")]
    InvalidRefill(f64),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("rate limit exceeded for client `{key}`")]
pub struct RateLimitExceeded {
    pub key: String,
}

/// Token bucket keyed by client identity.
///
/// Backed by GCRA, which admits exactly the same request sequences as a token
/// bucket of capacity `burst` refilled continuously at `refill_per_sec`.
/// Rejections leave the bucket untouched.
pub struct ClientRateLimiter<C: Clock = DefaultClock> {
    buckets: KeyedBuckets<C>,
}

impl ClientRateLimiter<DefaultClock> {
    pub fn try_new(cfg: &RateLimitConfig) -> Result<Self, RateLimitConfigError> {
        Self::with_clock(cfg.refill_per_sec, cfg.burst, &DefaultClock::default())
    }
}

impl<C: Clock> ClientRateLimiter<C> {
    pub fn with_clock(
        refill_per_sec: f64,
        burst: NonZeroU32,
        clock: &C,
    ) -> Result<Self, RateLimitConfigError> {
        let quota = build_quota(refill_per_sec, burst)?;
        Ok(Self {
            buckets: RateLimiter::dashmap_with_clock(quota, clock),
        })
    }

    /// Consume one token for `key`, or reject without side effects.
    pub fn acquire(&self, key: &str) -> Result<(), RateLimitExceeded> {
        debug_assert!(!key.is_empty());
        self.buckets
            .check_key(&key.to_string())
            .map_err(|_| RateLimitExceeded {
                key: key.to_string(),
            })
    }

    /// Drop buckets that have fully refilled; they are indistinguishable from
    /// unknown keys.
    pub fn prune(&self) {
        self.buckets.retain_recent();
        self.buckets.shrink_to_fit();
    }

    pub fn tracked_clients(&self) -> usize {
        self.buckets.len()
    }
}

impl<C> ClientRateLimiter<C>
where
    C: Clock + Send + Sync + 'static,
    C::Instant: Send + Sync,
{
    /// Periodically forget idle clients so the keyed store stays bounded.
    pub fn spawn_pruner(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        debug_assert!(!every.is_zero());
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let before = self.tracked_clients();
                self.prune();
                tracing::debug!(before, after = self.tracked_clients(), "pruned rate limit buckets");
            }
        })
    }
}

fn build_quota(refill_per_sec: f64, burst: NonZeroU32) -> Result<Quota, RateLimitConfigError> {
    if !refill_per_sec.is_finite() || refill_per_sec <= 0.0 {
        return Err(RateLimitConfigError::InvalidRefill(refill_per_sec));
    }
    let period = Duration::try_from_secs_f64(1.0 / refill_per_sec)
        .map_err(|_| RateLimitConfigError::InvalidRefill(refill_per_sec))?;
    let quota =
        Quota::with_period(period).ok_or(RateLimitConfigError::InvalidRefill(refill_per_sec))?;
    Ok(quota.allow_burst(burst))
}
