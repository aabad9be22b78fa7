//! Error types for the query cache.

use std::fmt;
use std::sync::Arc;

use crate::key::QueryHash;

/// Errors raised by the cache itself.
///
/// Fetch failures are not `QueryError`s. They are captured into
/// [`QueryState::error`](crate::QueryState::error) as a [`FetchError`] and are
/// only observable through state snapshots.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    /// The key could not be represented as JSON.
    #[error("invalid query key: {0}")]
    InvalidKey(#[source] serde_json::Error),

    /// A query with this hash already exists with a different output type.
    #[error("query {hash} holds `{found}`, requested as `{expected}`")]
    TypeMismatch {
        /// Hash of the existing query.
        hash: QueryHash,
        /// Output type requested by the caller.
        expected: &'static str,
        /// Output type the query was registered with.
        found: &'static str,
    },
}

/// Failure value produced by a fetch function.
///
/// Cheap to clone: the underlying [`anyhow::Error`] is shared.
#[derive(Clone)]
pub struct FetchError(Arc<anyhow::Error>);

impl FetchError {
    /// Wrap a fetch failure.
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(err.into()))
    }

    /// The underlying error.
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }

    /// Attempts to downcast the failure to a specific error type.
    pub fn downcast_ref<E: fmt::Display + fmt::Debug + Send + Sync + 'static>(&self) -> Option<&E> {
        self.0.downcast_ref::<E>()
    }

    /// Returns `true` if the failure is of type `E`.
    pub fn is<E: fmt::Display + fmt::Debug + Send + Sync + 'static>(&self) -> bool {
        self.downcast_ref::<E>().is_some()
    }

    /// Returns `true` if both values share the same underlying error.
    pub fn ptr_eq(&self, other: &FetchError) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl From<anyhow::Error> for FetchError {
    fn from(err: anyhow::Error) -> Self {
        Self(Arc::new(err))
    }
}
