//! Types for configuring the fount engine.
//!
//! Unlike configuration that is fixed at startup, these settings are
//! late-bound: the registry holds them behind a lock and the engine
//! snapshots them at the start of every fetch cycle, never at resource
//! creation.

use crate::provider::DynResponseHandler;
use std::time::Duration;

/// Timing parameters for fetch cycles.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchConfig {
    /// How long a single fetch attempt may stay outstanding before
    /// another attempt is raced against it. Default: 30 s.
    pub fetch_timeout: Duration,

    /// How many extra attempts may be issued after the first one.
    /// A fetch cycle fails with
    /// [FetchTimeout](crate::FountError::FetchTimeout) once
    /// `fetch_timeout * (max_timeout_retries + 1)` elapses with no
    /// attempt completing. Also bounds handler-requested retries.
    /// Default: 3.
    pub max_timeout_retries: u32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(30),
            max_timeout_retries: 3,
        }
    }
}

/// Process-wide settings affecting all resources of a registry.
#[derive(Clone, Default)]
pub struct Tunables {
    /// Fetch timing configuration.
    pub fetch: FetchConfig,

    /// Fallback response handler applied when a provider does not set
    /// its own. `None` means responses are committed as-is.
    pub response_handler: Option<DynResponseHandler>,
}

impl std::fmt::Debug for Tunables {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunables")
            .field("fetch", &self.fetch)
            .field("has_response_handler", &self.response_handler.is_some())
            .finish()
    }
}
