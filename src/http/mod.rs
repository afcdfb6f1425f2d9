//! HTTP surface: caller identification, the rate-limit decorator and the
//! server lifecycle.

mod identity;
mod middleware;
mod server;

pub use identity::{client_identity, rate_limit_key};
pub use middleware::{QuotaExceeded, RateLimitLayer, RateLimitService, StoreUnavailable};
pub use server::{HttpServer, ServerHandle};
