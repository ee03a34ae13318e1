#![deny(missing_docs)]
//! Fount API contains the types and traits shared between the fount
//! engine and the code embedding it.
//!
//! Fount coordinates fetching and sharing of remote data among many
//! concurrent consumers that subscribe and unsubscribe dynamically.
//! If you want to use the engine itself, please see the fount_core crate.

/// Boxed future type.
pub type BoxFut<'a, T> =
    std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

pub mod config;
pub use config::*;

mod error;
pub use error::*;

pub mod id;
pub use id::{ConsumerId, ResourceId, ResourceKey};

pub mod provider;
pub use provider::*;

mod timer;
pub use timer::*;
