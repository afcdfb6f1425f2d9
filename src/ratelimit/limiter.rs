//! Core sliding-window rate limiter.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::backend::WindowStore;
use super::clock::{Clock, SystemClock};
use super::script::{WindowInvocation, WindowOutcome};
use crate::error::{Result, WindowGuardError};

/// Quota and window shared by every caller of one limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPolicy {
    limit: u64,
    window: Duration,
}

impl WindowPolicy {
    /// At most `limit` admissions per trailing `window`. A limit of zero
    /// denies everything.
    pub fn new(limit: u64, window: Duration) -> Self {
        Self { limit, window }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

/// What to decide when the store cannot be consulted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Admit the request; an unreachable store must not take the service down
    #[default]
    Open,
    /// Deny the request
    Closed,
}

impl FailurePolicy {
    fn allows(self) -> bool {
        self == FailurePolicy::Open
    }
}

/// Outcome of one admission check.
#[derive(Debug)]
pub enum Decision {
    /// An entry was recorded against the key
    Admitted,
    /// The key's quota is exhausted for the current window
    Denied,
    /// The store could not be consulted; `allowed` follows the failure policy
    Unavailable {
        allowed: bool,
        reason: WindowGuardError,
    },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        match self {
            Decision::Admitted => true,
            Decision::Denied => false,
            Decision::Unavailable { allowed, .. } => *allowed,
        }
    }

    /// The store failure behind this decision, if any.
    pub fn failure(&self) -> Option<&WindowGuardError> {
        match self {
            Decision::Unavailable { reason, .. } => Some(reason),
            _ => None,
        }
    }
}

/// Sliding-window rate limiter over a shared [`WindowStore`].
///
/// The limiter holds no mutable state of its own and takes no locks; it can
/// be shared behind an `Arc` and called from any number of tasks. All
/// cross-caller correctness comes from the store's atomic evaluation.
pub struct WindowLimiter {
    store: Arc<dyn WindowStore>,
    clock: Arc<dyn Clock>,
    policy: WindowPolicy,
    failure_policy: FailurePolicy,
    store_timeout: Option<Duration>,
}

impl std::fmt::Debug for WindowLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowLimiter")
            .field("policy", &self.policy)
            .field("failure_policy", &self.failure_policy)
            .field("store_timeout", &self.store_timeout)
            .finish()
    }
}

impl WindowLimiter {
    /// Create a fail-open limiter using the system clock.
    pub fn new(store: Arc<dyn WindowStore>, policy: WindowPolicy) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            policy,
            failure_policy: FailurePolicy::default(),
            store_timeout: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_failure_policy(mut self, failure_policy: FailurePolicy) -> Self {
        self.failure_policy = failure_policy;
        self
    }

    /// Bound each store round trip. Expiry counts as a store failure.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = Some(timeout);
        self
    }

    pub fn policy(&self) -> WindowPolicy {
        self.policy
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    /// Report whether an operation on `key` is admitted.
    ///
    /// Store failures never surface here; they resolve through the failure
    /// policy (admit, by default).
    pub async fn allow(&self, key: &str) -> bool {
        self.check(key).await.is_allowed()
    }

    /// Like [`allow`](Self::allow), aborting the store call if `cancel`
    /// resolves first. A cancelled call is a store failure.
    pub async fn allow_with_cancel<F>(&self, key: &str, cancel: F) -> bool
    where
        F: Future<Output = ()>,
    {
        self.check_with_cancel(key, cancel).await.is_allowed()
    }

    /// Check `key` and report the full decision, including any store failure.
    pub async fn check(&self, key: &str) -> Decision {
        self.check_with_cancel(key, std::future::pending()).await
    }

    pub async fn check_with_cancel<F>(&self, key: &str, cancel: F) -> Decision
    where
        F: Future<Output = ()>,
    {
        let now = self.clock.now_millis();
        let invocation = WindowInvocation::new(
            key,
            now,
            self.policy.window,
            self.policy.limit,
            entry_id(now),
        );

        let result = tokio::select! {
            biased;
            _ = cancel => Err(WindowGuardError::Cancelled),
            result = self.evaluate(&invocation) => result,
        };

        match result {
            Ok(WindowOutcome::Admitted) => {
                trace!(key = %key, now = now, "Admitted");
                Decision::Admitted
            }
            Ok(WindowOutcome::Denied) => {
                debug!(
                    key = %key,
                    limit = self.policy.limit,
                    window_ms = invocation.window_ms,
                    "Rate limit exceeded"
                );
                Decision::Denied
            }
            Err(reason) => {
                let allowed = self.failure_policy.allows();
                warn!(
                    key = %key,
                    error = %reason,
                    allowed = allowed,
                    "Window store unavailable, applying failure policy"
                );
                Decision::Unavailable { allowed, reason }
            }
        }
    }

    async fn evaluate(&self, invocation: &WindowInvocation) -> Result<WindowOutcome> {
        match self.store_timeout {
            Some(limit) => tokio::time::timeout(limit, self.store.evaluate(invocation))
                .await
                .map_err(|_| WindowGuardError::Timeout(limit))?,
            None => self.store.evaluate(invocation).await,
        }
    }
}

/// Entry identity: the admission millisecond plus a random v4 UUID, so two
/// admissions in the same millisecond never collapse into one member.
fn entry_id(now_ms: i64) -> String {
    format!("{}-{}", now_ms, Uuid::new_v4().simple())
}
