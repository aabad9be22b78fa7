//! Query-Cache: a small client-side data-fetching cache.
//!
//! Given a query key and a fetch function, the cache deduplicates concurrent
//! fetches, keeps the latest result and notifies observers whenever the state
//! changes.
//!
//! # Key Features
//!
//! - **Stable identity**: structured keys are canonicalized, so equal keys
//!   always resolve to the same [`Query`]
//! - **Request coalescing**: at most one fetch per query is in flight; extra
//!   callers join the pending attempt
//! - **Stale-while-refetching**: the last result stays visible while a new
//!   attempt runs
//! - **Captured failures**: fetch errors become state, never panics or
//!   propagated errors, and every query stays retryable
//! - **Observer fan-out**: each consumer binds one render callback that runs
//!   on every state change
//!
//! # Example
//!
//! ```ignore
//! use query_cache::{QueryClient, QueryObserver};
//!
//! let client = QueryClient::new();
//! let observer = QueryObserver::new(&client, "posts", || async {
//!     anyhow::Ok(vec!["hello".to_string()])
//! })?;
//!
//! let subscription = observer.bind_and_subscribe(|| println!("changed"));
//! let state = observer.result();
//! assert!(state.is_fetching);
//! ```
//!
//! Fetch attempts run as Tokio tasks, on the runtime configured with
//! [`QueryClientBuilder::runtime`] or the one current when `fetch` is called.

#![warn(missing_docs)]

mod binding;
mod client;
mod error;
mod key;
mod observer;
mod query;
mod state;
pub mod tracer;

pub use binding::QueryBinding;
pub use client::{QueryClient, QueryClientBuilder};
pub use error::{FetchError, QueryError};
pub use key::{QueryHash, QueryKey};
pub use observer::{QueryObserver, RenderCallback};
pub use query::{Fetcher, PendingFetch, Query, Subscriber, Subscription};
pub use state::{QueryState, QueryStatus};
pub use tracer::{
    EventCollector, FetchOutcome, NoopTracer, SpanId, SubscriberId, TraceEvent, Tracer,
};
