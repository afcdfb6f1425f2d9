//! Store trait for abstracting the shared and in-process window stores.

use async_trait::async_trait;

use super::script::{WindowInvocation, WindowOutcome};
use crate::error::Result;

/// The contract the limiter needs from a coordination store.
///
/// `evaluate` must run the whole evict/count/insert sequence as one atomic
/// unit with respect to every other evaluation, in this process or any other
/// process sharing the store. Implementations perform exactly one round trip
/// and never retry.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Run one sliding-window evaluation.
    async fn evaluate(&self, invocation: &WindowInvocation) -> Result<WindowOutcome>;

    /// Check that the store is reachable.
    async fn ping(&self) -> Result<()>;

    /// Release the store connection. Later evaluations fail.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
