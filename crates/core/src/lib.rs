#![deny(missing_docs)]
//! The fount engine: coordinated fetching and sharing of remote data
//! among many concurrent consumers that come and go over time.
//!
//! The engine guarantees at-most-one fetch in flight per logical
//! resource, deduplicates identical registrations, supports polling
//! refresh, bounded retry with timeout races, and a post-unsubscribe
//! grace period that retains data briefly before discarding state.
//!
//! It consists of three parts:
//! - [FetchScheduler] orders pending fetch invocations so that fetches
//!   consumers cannot proceed without are never starved behind
//!   speculative background fetches.
//! - [ResourceEntry] is the per-resource state machine owning the
//!   fetch / retry / poll / expiry logic.
//! - [Registry] indexes resource entries by key and consumers by
//!   identity, and is the single mutation point for consumer
//!   registration and removal.

mod timer;
pub use timer::*;

mod scheduler;
pub use scheduler::*;

mod provider;
pub use provider::*;

mod registry;
pub use registry::*;

#[cfg(test)]
pub(crate) mod test_utils;
