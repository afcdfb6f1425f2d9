//! The atomic sliding-window evaluator.
//!
//! One evaluation evicts stale entries from a key's history, counts what is
//! left and conditionally records a new entry. The three steps must run as a
//! single unit in the store: splitting the count from the insert lets two
//! callers both see spare capacity and both insert.

use std::time::Duration;

use crate::error::{Result, WindowGuardError};

/// Reply code for an admitted evaluation.
pub const ADMITTED: i64 = 0;
/// Reply code for a denied evaluation.
pub const DENIED: i64 = 1;

/// Lua body executed by the store. Redis runs script bodies one at a time,
/// which gives the evaluation its atomicity.
///
/// `KEYS[1]` history key, `ARGV[1]` now (ms), `ARGV[2]` window (ms),
/// `ARGV[3]` limit, `ARGV[4]` unique entry id.
pub const SLIDING_WINDOW_LUA: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)

if redis.call('ZCARD', key) < limit then
    redis.call('ZADD', key, now, ARGV[4])
    redis.call('PEXPIRE', key, window)
    return 0
end

return 1
"#;

/// Positional inputs of one evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowInvocation {
    /// History key, conventionally `"limit:" + identity`
    pub key: String,
    /// Admission time in epoch milliseconds
    pub now_ms: i64,
    /// Window length in milliseconds
    pub window_ms: i64,
    /// Maximum live entries
    pub limit: u64,
    /// Member identity of the entry recorded on admission
    pub entry_id: String,
}

impl WindowInvocation {
    pub fn new(
        key: impl Into<String>,
        now_ms: i64,
        window: Duration,
        limit: u64,
        entry_id: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            now_ms,
            window_ms: window.as_millis() as i64,
            limit,
            entry_id: entry_id.into(),
        }
    }

    /// Entries with a timestamp at or below this value are evicted.
    pub fn clear_before(&self) -> i64 {
        self.now_ms - self.window_ms
    }
}

/// Result of one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowOutcome {
    /// An entry was recorded
    Admitted,
    /// The window was full; nothing was recorded
    Denied,
}

impl WindowOutcome {
    /// Decode the evaluator's integer reply.
    pub fn from_reply(code: i64) -> Result<Self> {
        match code {
            ADMITTED => Ok(WindowOutcome::Admitted),
            DENIED => Ok(WindowOutcome::Denied),
            other => Err(WindowGuardError::UnexpectedReply(other)),
        }
    }

    pub fn to_reply(self) -> i64 {
        match self {
            WindowOutcome::Admitted => ADMITTED,
            WindowOutcome::Denied => DENIED,
        }
    }
}
