//! Cancelable delayed-scheduling abstraction.

use crate::BoxFut;
use std::time::Duration;

/// Clock used for fetch timeouts, polling and keep-alive expiry.
///
/// Injectable so the engine can run against a simulated clock in tests
/// instead of real wall-clock waits.
pub trait Timer: 'static + Send + Sync + std::fmt::Debug {
    /// Resolve after the given duration has elapsed.
    fn sleep(&self, dur: Duration) -> BoxFut<'static, ()>;
}

/// Trait object [Timer].
pub type DynTimer = std::sync::Arc<dyn Timer>;
