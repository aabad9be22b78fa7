//! Snapshot of a query's state.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::FetchError;

/// Resolution status of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    /// No attempt has resolved yet.
    Loading,
    /// The last resolved attempt succeeded.
    Success,
    /// The last resolved attempt failed.
    Error,
}

/// Point-in-time view of a query.
///
/// `data` and `error` keep the last resolved value while a refetch runs, so
/// stale data stays visible until the new attempt resolves.
pub struct QueryState<T> {
    /// Resolution status.
    pub status: QueryStatus,
    /// Whether an attempt is in flight.
    pub is_fetching: bool,
    /// Last successful result.
    pub data: Option<Arc<T>>,
    /// Last failure. Cleared when a new attempt starts.
    pub error: Option<FetchError>,
}

impl<T> QueryState<T> {
    /// State of a query that has never resolved.
    pub fn new() -> Self {
        Self {
            status: QueryStatus::Loading,
            is_fetching: true,
            data: None,
            error: None,
        }
    }

    /// Returns `true` while no attempt has resolved.
    pub fn is_loading(&self) -> bool {
        self.status == QueryStatus::Loading
    }

    /// Returns `true` if the last resolved attempt succeeded.
    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    /// Returns `true` if the last resolved attempt failed.
    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }
}

impl<T> Default for QueryState<T> {
    fn default() -> Self {
        Self::new()
    }
}

// Manual impl: cloning only bumps the Arc counts, `T` need not be `Clone`.
impl<T> Clone for QueryState<T> {
    fn clone(&self) -> Self {
        Self {
            status: self.status,
            is_fetching: self.is_fetching,
            data: self.data.clone(),
            error: self.error.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for QueryState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryState")
            .field("status", &self.status)
            .field("is_fetching", &self.is_fetching)
            .field("data", &self.data)
            .field("error", &self.error)
            .finish()
    }
}
