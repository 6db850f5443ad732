//! Per-provider call budgets.
//!
//! Two separate mechanisms live here:
//! - a fixed local window (`calls_per_window` per `window`) that shapes outgoing
//!   traffic so the remote limit is never hit in the first place;
//! - a bounded retry policy for when the provider itself reports its quota as
//!   exceeded.
//!
//! The governor never sleeps. It reports how long a caller must wait and
//! leaves scheduling to the gateway.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::domain::provider::ProviderId;

pub const DEFAULT_CALLS_PER_WINDOW: u32 = 60;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_QUOTA_BACKOFF: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_QUOTA_ATTEMPTS: u32 = 5;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QuotaPolicy {
    pub calls_per_window: u32,
    pub window: Duration,
    /// Total attempts allowed when the provider keeps reporting quota exhaustion.
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self {
            calls_per_window: DEFAULT_CALLS_PER_WINDOW,
            window: DEFAULT_WINDOW,
            max_attempts: DEFAULT_MAX_QUOTA_ATTEMPTS,
            backoff: DEFAULT_QUOTA_BACKOFF,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QuotaDecision {
    Granted { used: u32, limit: u32 },
    Wait(Duration),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    Exhausted { attempts: u32 },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QuotaUsage {
    pub provider: ProviderId,
    pub used: u32,
    pub limit: u32,
    pub resets_in_ms: u64,
}

#[derive(Debug)]
struct QuotaWindow {
    count: u32,
    resets_at: Instant,
}

impl QuotaWindow {
    fn roll_forward(&mut self, now: Instant, window: Duration) {
        if now >= self.resets_at {
            self.count = 0;
            self.resets_at = now + window;
        }
    }
}

/// Owned map from provider to its window; windows of different providers
/// never contend with each other once created.
#[derive(Debug, Default)]
pub struct QuotaGovernor {
    default_policy: QuotaPolicy,
    policies: HashMap<ProviderId, QuotaPolicy>,
    windows: RwLock<HashMap<ProviderId, Arc<Mutex<QuotaWindow>>>>,
}

impl QuotaGovernor {
    pub fn new(default_policy: QuotaPolicy) -> Self {
        Self { default_policy, policies: HashMap::new(), windows: RwLock::new(HashMap::new()) }
    }

    pub fn with_policy(mut self, provider: ProviderId, policy: QuotaPolicy) -> Self {
        self.policies.insert(provider, policy);
        self
    }

    pub fn policy(&self, provider: &ProviderId) -> &QuotaPolicy {
        self.policies.get(provider).unwrap_or(&self.default_policy)
    }

    pub fn acquire(&self, provider: &ProviderId) -> QuotaDecision {
        self.acquire_at(provider, Instant::now())
    }

    /// Read-count, compare and increment happen under the provider's own lock.
    pub fn acquire_at(&self, provider: &ProviderId, now: Instant) -> QuotaDecision {
        let policy = self.policy(provider);
        let window = self.window_for(provider, now);
        let mut window = lock_window(&window);
        window.roll_forward(now, policy.window);

        if window.count < policy.calls_per_window {
            window.count += 1;
            QuotaDecision::Granted { used: window.count, limit: policy.calls_per_window }
        } else {
            QuotaDecision::Wait(window.resets_at.saturating_duration_since(now))
        }
    }

    /// Decision after the provider reported quota exhaustion on `attempt` (1-based).
    pub fn retry_after_quota_exceeded(&self, provider: &ProviderId, attempt: u32) -> RetryDecision {
        let policy = self.policy(provider);
        if attempt < policy.max_attempts {
            RetryDecision::RetryAfter(policy.backoff)
        } else {
            RetryDecision::Exhausted { attempts: attempt }
        }
    }

    pub fn snapshot(&self) -> Vec<QuotaUsage> {
        self.snapshot_at(Instant::now())
    }

    pub fn snapshot_at(&self, now: Instant) -> Vec<QuotaUsage> {
        let windows = match self.windows.read() {
            Ok(windows) => windows,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut usage = windows
            .iter()
            .map(|(provider, window)| {
                let window = lock_window(window);
                let expired = now >= window.resets_at;
                QuotaUsage {
                    provider: provider.clone(),
                    used: if expired { 0 } else { window.count },
                    limit: self.policy(provider).calls_per_window,
                    resets_in_ms: window.resets_at.saturating_duration_since(now).as_millis()
                        as u64,
                }
            })
            .collect::<Vec<_>>();
        usage.sort_by(|left, right| left.provider.cmp(&right.provider));
        usage
    }

    fn window_for(&self, provider: &ProviderId, now: Instant) -> Arc<Mutex<QuotaWindow>> {
        {
            let windows = match self.windows.read() {
                Ok(windows) => windows,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(window) = windows.get(provider) {
                return Arc::clone(window);
            }
        }

        let mut windows = match self.windows.write() {
            Ok(windows) => windows,
            Err(poisoned) => poisoned.into_inner(),
        };
        let window = self.policy(provider).window;
        Arc::clone(windows.entry(provider.clone()).or_insert_with(|| {
            Arc::new(Mutex::new(QuotaWindow { count: 0, resets_at: now + window }))
        }))
    }
}

fn lock_window(window: &Mutex<QuotaWindow>) -> MutexGuard<'_, QuotaWindow> {
    match window.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
