//! Sliding-window admission control and the stores that back it.

mod backend;
mod clock;
mod limiter;
mod memory_store;
mod redis_store;
mod script;

pub use backend::WindowStore;
pub use clock::{Clock, ManualClock, SystemClock};
pub use limiter::{Decision, FailurePolicy, WindowLimiter, WindowPolicy};
pub use memory_store::MemoryWindowStore;
pub use redis_store::RedisWindowStore;
pub use script::{WindowInvocation, WindowOutcome, SLIDING_WINDOW_LUA};
