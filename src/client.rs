//! Query registry.

use std::any::Any;
use std::sync::Arc;

use papaya::HashMap;
use tokio::runtime::Handle;

use crate::error::QueryError;
use crate::key::{QueryHash, QueryKey};
use crate::query::{Fetcher, Query};
use crate::tracer::{NoopTracer, Tracer};

/// Type-erased view of a stored query.
trait ErasedQuery: Send + Sync {
    fn output_type(&self) -> &'static str;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Send + Sync + 'static> ErasedQuery for Query<T> {
    fn output_type(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

struct ClientInner {
    queries: HashMap<QueryHash, Arc<dyn ErasedQuery>, ahash::RandomState>,
    tracer: Arc<dyn Tracer>,
    runtime: Option<Handle>,
}

/// Registry of queries, one per distinct [`QueryHash`].
///
/// Create one per application session and hand it to whatever consumes
/// queries. This is cheap to clone; clones share the same registry.
///
/// Queries are never removed: a query lives as long as the client.
///
/// # Example
///
/// ```ignore
/// let client = QueryClient::new();
///
/// let posts = client.get_query("posts", || async { anyhow::Ok(load_posts().await?) })?;
/// let same = client.get_query("posts", || async { anyhow::Ok(Vec::new()) })?;
/// assert!(Arc::ptr_eq(&posts, &same));
/// ```
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<ClientInner>,
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryClient {
    /// Create a client with default settings.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Create a builder for customizing the client.
    pub fn builder() -> QueryClientBuilder {
        QueryClientBuilder::new()
    }

    /// Get the query for `key`, creating it on first access.
    ///
    /// If a query with the same hash exists it is returned and `fetcher` is
    /// dropped unused: the first registration for a key wins.
    ///
    /// Fails if `key` is already registered with a different output type.
    pub fn get_query<T, F>(
        &self,
        key: impl Into<QueryKey>,
        fetcher: F,
    ) -> Result<Arc<Query<T>>, QueryError>
    where
        T: Send + Sync + 'static,
        F: Fetcher<T>,
    {
        self.get_query_with(key.into(), Arc::new(fetcher))
    }

    pub(crate) fn get_query_with<T>(
        &self,
        key: QueryKey,
        fetcher: Arc<dyn Fetcher<T>>,
    ) -> Result<Arc<Query<T>>, QueryError>
    where
        T: Send + Sync + 'static,
    {
        let hash = key.hash();
        let pinned = self.inner.queries.pin();

        let mut fresh: Option<Arc<dyn ErasedQuery>> = None;
        let entry = pinned.get_or_insert_with(hash.clone(), || {
            let query: Arc<dyn ErasedQuery> = Query::new(
                key,
                hash.clone(),
                fetcher,
                self.inner.tracer.clone(),
                self.inner.runtime.clone(),
            );
            fresh = Some(query.clone());
            query
        });

        // A concurrent caller may have won the insert; only ours counts.
        if fresh.is_some_and(|query| Arc::ptr_eq(&query, entry)) {
            self.inner.tracer.on_query_created(&hash);
        } else {
            self.inner.tracer.on_fetcher_ignored(&hash);
        }

        let found = entry.output_type();
        entry
            .clone()
            .into_any()
            .downcast::<Query<T>>()
            .map_err(|_| QueryError::TypeMismatch {
                hash,
                expected: std::any::type_name::<T>(),
                found,
            })
    }

    /// Returns `true` if a query exists for `key`.
    pub fn contains(&self, key: &QueryKey) -> bool {
        self.inner.queries.pin().contains_key(&key.hash())
    }

    /// Number of queries in the registry.
    pub fn len(&self) -> usize {
        self.inner.queries.len()
    }

    /// Returns `true` if no query has been created yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hashes of all registered queries, sorted.
    pub fn query_hashes(&self) -> Vec<QueryHash> {
        let mut hashes: Vec<QueryHash> = self.inner.queries.pin().keys().cloned().collect();
        hashes.sort();
        hashes
    }
}

/// Builder for [`QueryClient`].
pub struct QueryClientBuilder {
    tracer: Arc<dyn Tracer>,
    runtime: Option<Handle>,
}

impl Default for QueryClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryClientBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self {
            tracer: Arc::new(NoopTracer),
            runtime: None,
        }
    }

    /// Set the tracer that observes queries created by this client.
    ///
    /// Defaults to [`NoopTracer`].
    pub fn tracer(mut self, tracer: impl Tracer) -> Self {
        self.tracer = Arc::new(tracer);
        self
    }

    /// Run fetch attempts on this runtime.
    ///
    /// Without one, attempts are spawned on the runtime current at the time
    /// `fetch` is called.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Build the client.
    pub fn build(self) -> QueryClient {
        QueryClient {
            inner: Arc::new(ClientInner {
                queries: HashMap::with_hasher(ahash::RandomState::new()),
                tracer: self.tracer,
                runtime: self.runtime,
            }),
        }
    }
}
