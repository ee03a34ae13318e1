//! Fount error types.

use crate::id::ResourceKey;
use std::sync::Arc;

/// A clonable trait-object inner error.
#[derive(Clone, Default)]
pub struct DynInnerError(
    pub Option<Arc<dyn std::error::Error + 'static + Send + Sync>>,
);

impl std::fmt::Debug for DynInnerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Display for DynInnerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0.as_ref() {
            None => f.write_str("None"),
            Some(s) => s.fmt(f),
        }
    }
}

impl std::error::Error for DynInnerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.as_ref().map(|s| {
            let out: &(dyn std::error::Error + 'static) = &**s;
            out
        })
    }
}

impl DynInnerError {
    /// Construct a new DynInnerError from a source error.
    pub fn new<E: std::error::Error + 'static + Send + Sync>(e: E) -> Self {
        Self(Some(Arc::new(e)))
    }
}

/// The core fount error type. This type is used in all external
/// fount apis as well as internally in the engine.
///
/// This type is required to implement `Clone` to ease the use of
/// shared futures, which require the entire `Result` to be `Clone`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FountError {
    /// A never-seen resource key was registered without the spec
    /// parts required to create it.
    #[error(
        "provider for key {key} was never defined: \
         fetch_fn and on_data are required"
    )]
    MissingFetchSpec {
        /// The offending resource key.
        key: ResourceKey,
    },

    /// A registration for an existing resource supplied a different
    /// callback identity. Callbacks cannot change post-creation.
    #[error("conflicting {what} for already defined provider {key}")]
    ConflictingProviderSpec {
        /// The offending resource key.
        key: ResourceKey,
        /// Which callback identity differed.
        what: &'static str,
    },

    /// Multiple live resource entries matched one key. Keys must be
    /// unique within a registry at any instant.
    #[error("multiple providers registered for key {key}")]
    AmbiguousRef {
        /// The offending resource key.
        key: ResourceKey,
    },

    /// No live resource entry matched the key.
    #[error("no provider registered for key {key}")]
    UnknownResource {
        /// The offending resource key.
        key: ResourceKey,
    },

    /// All timeout-race attempts of a fetch cycle were exhausted
    /// without any of them completing.
    #[error("fetch timed out after {attempts} attempts")]
    FetchTimeout {
        /// How many fetch attempts were issued.
        attempts: u32,
    },

    /// The response handler rejected the fetched response.
    #[error("response handler aborted the fetch")]
    AbortSignaled,

    /// Generic fount internal error.
    #[error("{ctx} (src: {src})")]
    Other {
        /// Any context associated with this error.
        ctx: Arc<str>,

        /// The inner error (if any).
        #[source]
        src: DynInnerError,
    },
}

impl FountError {
    /// Construct an "other" error with an inner source error.
    pub fn other_src<
        C: std::fmt::Display,
        S: std::error::Error + 'static + Send + Sync,
    >(
        ctx: C,
        src: S,
    ) -> Self {
        Self::Other {
            ctx: ctx.to_string().into_boxed_str().into(),
            src: DynInnerError::new(src),
        }
    }

    /// Construct an "other" error.
    pub fn other<C: std::fmt::Display>(ctx: C) -> Self {
        Self::Other {
            ctx: ctx.to_string().into_boxed_str().into(),
            src: DynInnerError::default(),
        }
    }
}

/// The core fount result type.
pub type FountResult<T> = Result<T, FountError>;
