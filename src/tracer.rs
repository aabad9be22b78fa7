//! Tracer trait for observing cache activity.
//!
//! This module defines the [`Tracer`] trait and related types for observing
//! query creation, fetch attempts and subscriber fan-out. The default
//! [`NoopTracer`] discards everything. [`EventCollector`] records events for
//! tests and debugging.
//!
//! # Example
//!
//! ```ignore
//! use query_cache::{QueryClient, QueryHash, SpanId, Tracer};
//!
//! struct PrintTracer;
//!
//! impl Tracer for PrintTracer {
//!     fn new_span_id(&self) -> SpanId {
//!         SpanId(1)
//!     }
//!
//!     fn on_fetch_start(&self, span_id: SpanId, query: &QueryHash) {
//!         println!("fetch {:?} started: {}", span_id, query);
//!     }
//! }
//!
//! let client = QueryClient::builder().tracer(PrintTracer).build();
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::key::QueryHash;

/// Unique identifier for one fetch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpanId(pub u64);

/// Identifier of one subscription on a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriberId(pub u64);

/// How a fetch attempt resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The fetch function returned a value.
    Success,
    /// The fetch function failed.
    Error {
        /// Display form of the returned error.
        message: String,
    },
    /// The fetch function panicked; recorded as a failure.
    Panicked {
        /// Panic payload, when it was a string.
        message: String,
    },
}

/// Tracer trait for observing the cache.
///
/// All methods except [`Tracer::new_span_id`] have empty defaults, so only
/// the interesting events need overriding.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`: fetch attempts run as spawned tasks
/// and may report from any runtime thread.
pub trait Tracer: Send + Sync + 'static {
    /// Generate a new unique span ID. Called once per fetch attempt.
    fn new_span_id(&self) -> SpanId;

    /// Called when the registry creates a query for a new hash.
    #[inline]
    fn on_query_created(&self, _query: &QueryHash) {}

    /// Called when a registration for an existing hash supplied a fetcher
    /// that will not be used.
    #[inline]
    fn on_fetcher_ignored(&self, _query: &QueryHash) {}

    /// Called when a new fetch attempt starts.
    #[inline]
    fn on_fetch_start(&self, _span_id: SpanId, _query: &QueryHash) {}

    /// Called when `fetch` joined an attempt already in flight.
    #[inline]
    fn on_fetch_coalesced(&self, _query: &QueryHash) {}

    /// Called when a fetch attempt resolves.
    #[inline]
    fn on_fetch_end(&self, _span_id: SpanId, _query: &QueryHash, _outcome: FetchOutcome) {}

    /// Called when a subscriber is added.
    #[inline]
    fn on_subscribe(&self, _query: &QueryHash, _subscriber: SubscriberId) {}

    /// Called when a subscriber is removed.
    #[inline]
    fn on_unsubscribe(&self, _query: &QueryHash, _subscriber: SubscriberId) {}

    /// Called before subscribers are notified of a state change.
    #[inline]
    fn on_notify(&self, _query: &QueryHash, _subscribers: usize) {}
}

/// Zero-cost tracer that discards all events.
///
/// This is the default tracer for [`QueryClient`](crate::QueryClient).
pub struct NoopTracer;

/// Global span counter for NoopTracer.
static NOOP_SPAN_COUNTER: AtomicU64 = AtomicU64::new(1);

impl Tracer for NoopTracer {
    #[inline(always)]
    fn new_span_id(&self) -> SpanId {
        SpanId(NOOP_SPAN_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// A recorded tracer event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    /// See [`Tracer::on_query_created`].
    QueryCreated {
        /// The new query.
        query: QueryHash,
    },
    /// See [`Tracer::on_fetcher_ignored`].
    FetcherIgnored {
        /// The already registered query.
        query: QueryHash,
    },
    /// See [`Tracer::on_fetch_start`].
    FetchStart {
        /// Span of this attempt.
        span_id: SpanId,
        /// The fetching query.
        query: QueryHash,
    },
    /// See [`Tracer::on_fetch_coalesced`].
    FetchCoalesced {
        /// The query whose attempt was joined.
        query: QueryHash,
    },
    /// See [`Tracer::on_fetch_end`].
    FetchEnd {
        /// Span of this attempt, as passed to `FetchStart`.
        span_id: SpanId,
        /// The fetching query.
        query: QueryHash,
        /// How the attempt resolved.
        outcome: FetchOutcome,
    },
    /// See [`Tracer::on_subscribe`].
    Subscribe {
        /// The observed query.
        query: QueryHash,
        /// Id of the new subscription.
        subscriber: SubscriberId,
    },
    /// See [`Tracer::on_unsubscribe`].
    Unsubscribe {
        /// The observed query.
        query: QueryHash,
        /// Id of the released subscription.
        subscriber: SubscriberId,
    },
    /// See [`Tracer::on_notify`].
    Notify {
        /// The changed query.
        query: QueryHash,
        /// Number of subscribers notified.
        subscribers: usize,
    },
}

/// Tracer that accumulates events for later inspection.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use query_cache::{EventCollector, QueryClient};
///
/// let collector = Arc::new(EventCollector::new());
/// let client = QueryClient::builder().tracer(collector.clone()).build();
/// // ... run queries ...
/// assert!(!collector.is_empty());
/// ```
#[derive(Debug, Default)]
pub struct EventCollector {
    next_span: AtomicU64,
    events: Mutex<Vec<TraceEvent>>,
}

impl EventCollector {
    /// Create a new empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get collected events.
    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().clone()
    }

    /// Take collected events, clearing the collector.
    pub fn take(&self) -> Vec<TraceEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Clear all collected events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Get the number of collected events.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Check if no events have been collected.
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    fn push(&self, event: TraceEvent) {
        self.events.lock().push(event);
    }
}

impl Tracer for EventCollector {
    fn new_span_id(&self) -> SpanId {
        SpanId(self.next_span.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn on_query_created(&self, query: &QueryHash) {
        self.push(TraceEvent::QueryCreated {
            query: query.clone(),
        });
    }

    fn on_fetcher_ignored(&self, query: &QueryHash) {
        self.push(TraceEvent::FetcherIgnored {
            query: query.clone(),
        });
    }

    fn on_fetch_start(&self, span_id: SpanId, query: &QueryHash) {
        self.push(TraceEvent::FetchStart {
            span_id,
            query: query.clone(),
        });
    }

    fn on_fetch_coalesced(&self, query: &QueryHash) {
        self.push(TraceEvent::FetchCoalesced {
            query: query.clone(),
        });
    }

    fn on_fetch_end(&self, span_id: SpanId, query: &QueryHash, outcome: FetchOutcome) {
        self.push(TraceEvent::FetchEnd {
            span_id,
            query: query.clone(),
            outcome,
        });
    }

    fn on_subscribe(&self, query: &QueryHash, subscriber: SubscriberId) {
        self.push(TraceEvent::Subscribe {
            query: query.clone(),
            subscriber,
        });
    }

    fn on_unsubscribe(&self, query: &QueryHash, subscriber: SubscriberId) {
        self.push(TraceEvent::Unsubscribe {
            query: query.clone(),
            subscriber,
        });
    }

    fn on_notify(&self, query: &QueryHash, subscribers: usize) {
        self.push(TraceEvent::Notify {
            query: query.clone(),
            subscribers,
        });
    }
}

// Lets callers keep a handle to a tracer they hand to the client.
impl<T: Tracer> Tracer for std::sync::Arc<T> {
    fn new_span_id(&self) -> SpanId {
        (**self).new_span_id()
    }

    fn on_query_created(&self, query: &QueryHash) {
        (**self).on_query_created(query)
    }

    fn on_fetcher_ignored(&self, query: &QueryHash) {
        (**self).on_fetcher_ignored(query)
    }

    fn on_fetch_start(&self, span_id: SpanId, query: &QueryHash) {
        (**self).on_fetch_start(span_id, query)
    }

    fn on_fetch_coalesced(&self, query: &QueryHash) {
        (**self).on_fetch_coalesced(query)
    }

    fn on_fetch_end(&self, span_id: SpanId, query: &QueryHash, outcome: FetchOutcome) {
        (**self).on_fetch_end(span_id, query, outcome)
    }

    fn on_subscribe(&self, query: &QueryHash, subscriber: SubscriberId) {
        (**self).on_subscribe(query, subscriber)
    }

    fn on_unsubscribe(&self, query: &QueryHash, subscriber: SubscriberId) {
        (**self).on_unsubscribe(query, subscriber)
    }

    fn on_notify(&self, query: &QueryHash, subscribers: usize) {
        (**self).on_notify(query, subscribers)
    }
}
