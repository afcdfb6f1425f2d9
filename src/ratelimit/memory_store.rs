//! In-process window store.
//!
//! Mirrors the Redis evaluator: a time-ordered history per key, evicted by
//! score range, with a key-level expiry refreshed on every admission. The
//! per-key atomic unit is the map shard lock held for the whole evaluation.
//! Only correct inside a single process.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::backend::WindowStore;
use super::script::{WindowInvocation, WindowOutcome};
use crate::error::{Result, WindowGuardError};

/// History of one key: `(timestamp, entry id)` pairs ordered by timestamp.
#[derive(Debug, Default)]
struct KeyHistory {
    entries: BTreeSet<(i64, String)>,
    /// The key vanishes once the clock reaches this instant.
    expires_at_ms: i64,
}

impl KeyHistory {
    fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms <= now_ms
    }

    fn evict_through(&mut self, clear_before: i64) {
        // keep only timestamps strictly greater than clear_before
        self.entries = self
            .entries
            .split_off(&(clear_before.saturating_add(1), String::new()));
    }

    fn record(&mut self, invocation: &WindowInvocation) {
        self.entries
            .insert((invocation.now_ms, invocation.entry_id.clone()));
        self.expires_at_ms = invocation.now_ms.saturating_add(invocation.window_ms);
    }
}

/// A window store held in process memory.
#[derive(Debug, Default)]
pub struct MemoryWindowStore {
    histories: DashMap<String, KeyHistory>,
    closed: AtomicBool,
}

impl MemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every key whose expiry has passed. Returns how many were removed.
    pub fn sweep_expired(&self, now_ms: i64) -> usize {
        let before = self.histories.len();
        self.histories.retain(|_, history| !history.is_expired(now_ms));
        let removed = before.saturating_sub(self.histories.len());
        if removed > 0 {
            debug!(removed, remaining = self.histories.len(), "Swept expired histories");
        }
        removed
    }

    /// Number of keys currently held, expired or not.
    pub fn key_count(&self) -> usize {
        self.histories.len()
    }

    /// Number of entries stored for `key`, including stragglers not yet evicted.
    pub fn history_len(&self, key: &str) -> usize {
        self.histories
            .get(key)
            .map(|history| history.entries.len())
            .unwrap_or(0)
    }

    fn evaluate_locked(&self, invocation: &WindowInvocation) -> WindowOutcome {
        let now = invocation.now_ms;

        match self.histories.entry(invocation.key.clone()) {
            Entry::Occupied(mut occupied) => {
                let history = occupied.get_mut();
                if history.is_expired(now) {
                    history.entries.clear();
                }
                history.evict_through(invocation.clear_before());

                let outcome = if (history.entries.len() as u64) < invocation.limit {
                    history.record(invocation);
                    WindowOutcome::Admitted
                } else {
                    WindowOutcome::Denied
                };

                // an emptied sorted set no longer exists
                if occupied.get().entries.is_empty() {
                    occupied.remove();
                }
                outcome
            }
            Entry::Vacant(vacant) => {
                if invocation.limit == 0 {
                    return WindowOutcome::Denied;
                }
                let mut history = KeyHistory::default();
                history.record(invocation);
                vacant.insert(history);
                WindowOutcome::Admitted
            }
        }
    }
}

#[async_trait]
impl WindowStore for MemoryWindowStore {
    async fn evaluate(&self, invocation: &WindowInvocation) -> Result<WindowOutcome> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WindowGuardError::StoreClosed);
        }

        let outcome = self.evaluate_locked(invocation);
        trace!(key = %invocation.key, outcome = ?outcome, "Evaluated in-memory window");
        Ok(outcome)
    }

    async fn ping(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WindowGuardError::StoreClosed);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.histories.clear();
        Ok(())
    }
}
