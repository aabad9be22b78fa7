//! A single cache entry and its fetch coordination.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::error::FetchError;
use crate::key::{QueryHash, QueryKey};
use crate::state::{QueryState, QueryStatus};
use crate::tracer::{FetchOutcome, SubscriberId, Tracer};

/// Produces the value for a query.
///
/// Implemented for every `Fn() -> impl Future<Output = anyhow::Result<T>>`
/// closure, so most callers never name this trait:
///
/// ```ignore
/// let query = client.get_query("posts", || async {
///     let posts = load_posts().await?;
///     anyhow::Ok(posts)
/// })?;
/// ```
#[async_trait]
pub trait Fetcher<T>: Send + Sync + 'static {
    /// Run one fetch.
    async fn fetch(&self) -> anyhow::Result<T>;
}

#[async_trait]
impl<T, F, Fut> Fetcher<T> for F
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    async fn fetch(&self) -> anyhow::Result<T> {
        (self)().await
    }
}

/// Receives change notifications from a [`Query`].
pub trait Subscriber: Send + Sync + 'static {
    /// Called after every state change. Carries no payload; read the
    /// current state from the query.
    fn notify(&self);

    /// Called once when the subscription `id` is released.
    fn on_unsubscribe(&self, _id: SubscriberId) {}
}

/// A fetch in progress, shared by every caller that asked for it.
///
/// Resolves to the query state as it stood when the attempt finished.
/// Awaiting it is optional when a Tokio runtime is available, since the
/// attempt is spawned on it. Without one, the attempt only makes progress
/// while some handle is polled, and the query stays in flight until then.
pub type PendingFetch<T> = Shared<BoxFuture<'static, QueryState<T>>>;

/// One cache entry: the state for a key, its in-flight fetch and its
/// subscribers.
///
/// Queries are created and owned by a [`QueryClient`](crate::QueryClient)
/// and live as long as it does.
pub struct Query<T> {
    key: QueryKey,
    hash: QueryHash,
    fetcher: Arc<dyn Fetcher<T>>,
    tracer: Arc<dyn Tracer>,
    runtime: Option<Handle>,
    state: Mutex<QueryState<T>>,
    in_flight: Mutex<Option<PendingFetch<T>>>,
    subscribers: Mutex<Vec<(SubscriberId, Arc<dyn Subscriber>)>>,
    next_subscriber: AtomicU64,
    weak_self: Weak<Query<T>>,
}

impl<T: Send + Sync + 'static> Query<T> {
    pub(crate) fn new(
        key: QueryKey,
        hash: QueryHash,
        fetcher: Arc<dyn Fetcher<T>>,
        tracer: Arc<dyn Tracer>,
        runtime: Option<Handle>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            key,
            hash,
            fetcher,
            tracer,
            runtime,
            state: Mutex::new(QueryState::new()),
            in_flight: Mutex::new(None),
            subscribers: Mutex::new(Vec::new()),
            next_subscriber: AtomicU64::new(0),
            weak_self: weak_self.clone(),
        })
    }

    /// The key this query was created for.
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Canonical hash of the key.
    pub fn hash(&self) -> &QueryHash {
        &self.hash
    }

    /// Current state snapshot.
    pub fn state(&self) -> QueryState<T> {
        self.state.lock().clone()
    }

    /// Whether an attempt is in flight.
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.lock().is_some()
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Whether the subscription `id` is still registered.
    pub fn is_subscribed(&self, id: SubscriberId) -> bool {
        SubscriberSet::contains(self, id)
    }

    /// Release the subscription `id`. A no-op if it is already gone.
    ///
    /// The [`Subscription`] handle for `id` becomes inert.
    pub fn unsubscribe(&self, id: SubscriberId) {
        SubscriberSet::remove(self, id);
    }

    /// Add a subscriber to the notification list.
    ///
    /// Subscribing the same subscriber twice yields two subscriptions and two
    /// notifications per change. Notifications follow registration order.
    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber>) -> Subscription {
        let id = SubscriberId(self.next_subscriber.fetch_add(1, Ordering::Relaxed));
        self.subscribers.lock().push((id, subscriber));
        self.tracer.on_subscribe(&self.hash, id);

        let owner: Weak<dyn SubscriberSet> = self.weak_self.clone();
        Subscription {
            owner: Mutex::new(Some(owner)),
            id,
        }
    }

    /// Start a fetch, or join the one already in flight.
    ///
    /// At most one attempt runs at a time: while an attempt is pending, every
    /// call returns a handle to that same attempt and the fetch function is
    /// not invoked again. Failures are captured into the state, never
    /// returned, and a later call always starts a fresh attempt.
    pub fn fetch(&self) -> PendingFetch<T> {
        let pending = {
            let mut in_flight = self.in_flight.lock();
            if let Some(pending) = in_flight.as_ref() {
                self.tracer.on_fetch_coalesced(&self.hash);
                return pending.clone();
            }
            let Some(this) = self.weak_self.upgrade() else {
                // Only reachable while the query is being dropped.
                let state = self.state();
                return async move { state }.boxed().shared();
            };
            let pending = this.run_attempt().boxed().shared();
            *in_flight = Some(pending.clone());
            pending
        };

        // Applied before the attempt is spawned, so the fetch function never
        // runs ahead of this notification.
        self.set_state(|state| {
            state.is_fetching = true;
            state.error = None;
        });

        match self.runtime.clone().or_else(|| Handle::try_current().ok()) {
            Some(handle) => {
                handle.spawn(pending.clone());
            }
            None => tracing::warn!(
                query = %self.hash,
                "no tokio runtime available; fetch runs only when awaited, \
                 and the query stays in flight (later fetches join it) until \
                 a returned PendingFetch is awaited"
            ),
        }

        pending
    }

    async fn run_attempt(self: Arc<Self>) -> QueryState<T> {
        let span_id = self.tracer.new_span_id();
        self.tracer.on_fetch_start(span_id, &self.hash);

        let result = AssertUnwindSafe(self.fetcher.fetch()).catch_unwind().await;

        let outcome = match result {
            Ok(Ok(data)) => {
                self.set_state(|state| {
                    state.status = QueryStatus::Success;
                    state.data = Some(Arc::new(data));
                });
                FetchOutcome::Success
            }
            Ok(Err(err)) => {
                let message = err.to_string();
                self.set_state(|state| {
                    state.status = QueryStatus::Error;
                    state.error = Some(FetchError::from(err));
                });
                FetchOutcome::Error { message }
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(query = %self.hash, %message, "fetch function panicked");
                let err = anyhow::anyhow!("fetch function panicked: {message}");
                self.set_state(|state| {
                    state.status = QueryStatus::Error;
                    state.error = Some(FetchError::from(err));
                });
                FetchOutcome::Panicked { message }
            }
        };
        self.tracer.on_fetch_end(span_id, &self.hash, outcome);

        // Marker and flag are cleared together: a concurrent `fetch` either
        // joins this attempt or starts one whose flag nothing overwrites.
        {
            let mut in_flight = self.in_flight.lock();
            in_flight.take();
            self.state.lock().is_fetching = false;
        }
        self.notify_subscribers();
        self.state()
    }

    /// Apply a mutation, then notify subscribers in registration order.
    ///
    /// No lock is held while subscribers run, so they may read the state or
    /// call `fetch` from `notify`.
    fn set_state(&self, update: impl FnOnce(&mut QueryState<T>)) {
        update(&mut *self.state.lock());
        self.notify_subscribers();
    }

    fn notify_subscribers(&self) {
        let subscribers: Vec<Arc<dyn Subscriber>> = self
            .subscribers
            .lock()
            .iter()
            .map(|(_, subscriber)| subscriber.clone())
            .collect();
        self.tracer.on_notify(&self.hash, subscribers.len());
        for subscriber in subscribers {
            subscriber.notify();
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

/// Type-erased removal used by [`Subscription`].
trait SubscriberSet: Send + Sync {
    fn contains(&self, id: SubscriberId) -> bool;
    fn remove(&self, id: SubscriberId);
}

impl<T: Send + Sync + 'static> SubscriberSet for Query<T> {
    fn contains(&self, id: SubscriberId) -> bool {
        self.subscribers.lock().iter().any(|(sub_id, _)| *sub_id == id)
    }

    fn remove(&self, id: SubscriberId) {
        let removed = {
            let mut subscribers = self.subscribers.lock();
            subscribers
                .iter()
                .position(|(sub_id, _)| *sub_id == id)
                .map(|index| subscribers.remove(index).1)
        };
        if let Some(subscriber) = removed {
            self.tracer.on_unsubscribe(&self.hash, id);
            subscriber.on_unsubscribe(id);
        }
    }
}

/// Handle to one subscription on a [`Query`].
///
/// Releasing it removes the subscriber. Release happens on
/// [`Subscription::unsubscribe`] or on drop, whichever comes first; further
/// calls are no-ops. A subscription released through
/// [`Query::unsubscribe`] leaves this handle inert.
pub struct Subscription {
    owner: Mutex<Option<Weak<dyn SubscriberSet>>>,
    id: SubscriberId,
}

impl Subscription {
    /// Identifier of this subscription.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Whether this subscription is still registered.
    pub fn is_active(&self) -> bool {
        self.owner
            .lock()
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some_and(|query| query.contains(self.id))
    }

    /// Remove the subscriber. Idempotent.
    pub fn unsubscribe(&self) {
        let owner = self.owner.lock().take();
        if let Some(query) = owner.and_then(|weak| weak.upgrade()) {
            query.remove(self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::NoopTracer;
    use std::sync::atomic::AtomicUsize;

    struct Counter(AtomicUsize);

    impl Subscriber for Counter {
        fn notify(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn query_with<T: Send + Sync + 'static>(fetcher: impl Fetcher<T>) -> Arc<Query<T>> {
        let key = QueryKey::from("test");
        let hash = key.hash();
        Query::new(key, hash, Arc::new(fetcher), Arc::new(NoopTracer), None)
    }

    #[test]
    fn test_subscribe_and_unsubscribe() {
        let query = query_with(|| async { anyhow::Ok(1u32) });
        let counter = Arc::new(Counter(AtomicUsize::new(0)));

        let sub = query.subscribe(counter.clone());
        assert_eq!(query.subscriber_count(), 1);
        assert!(sub.is_active());

        query.set_state(|state| state.is_fetching = false);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        sub.unsubscribe();
        sub.unsubscribe();
        assert!(!sub.is_active());
        assert_eq!(query.subscriber_count(), 0);

        query.set_state(|state| state.is_fetching = true);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_releases_subscription() {
        let query = query_with(|| async { anyhow::Ok(1u32) });
        let counter = Arc::new(Counter(AtomicUsize::new(0)));

        {
            let _sub = query.subscribe(counter.clone());
            assert_eq!(query.subscriber_count(), 1);
        }
        assert_eq!(query.subscriber_count(), 0);
    }

    #[test]
    fn test_fetch_without_runtime_runs_when_awaited() {
        let calls = Arc::new(AtomicUsize::new(0));
        let query = query_with({
            let calls = calls.clone();
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { anyhow::Ok("done".to_string()) }
            }
        });

        let first = query.fetch();
        let second = query.fetch();
        assert!(query.is_in_flight());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let state = futures::executor::block_on(first);
        assert_eq!(state.status, QueryStatus::Success);
        assert_eq!(state.data.as_deref().map(String::as_str), Some("done"));

        let joined = futures::executor::block_on(second);
        assert_eq!(joined.status, QueryStatus::Success);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!query.is_in_flight());
    }

    #[test]
    fn test_dropped_fetch_without_runtime_stays_in_flight() {
        let calls = Arc::new(AtomicUsize::new(0));
        let query = query_with({
            let calls = calls.clone();
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { anyhow::Ok(7u8) }
            }
        });

        drop(query.fetch());
        assert!(query.is_in_flight());
        assert!(query.state().is_fetching);

        // Nothing polls the attempt, so a later call joins it.
        let joined = query.fetch();
        assert!(query.is_in_flight());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let state = futures::executor::block_on(joined);
        assert_eq!(state.data.as_deref(), Some(&7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!query.is_in_flight());
        assert!(!query.state().is_fetching);
    }

    #[test]
    fn test_unsubscribe_by_id_makes_handle_inert() {
        let query = query_with(|| async { anyhow::Ok(1u32) });
        let counter = Arc::new(Counter(AtomicUsize::new(0)));

        let sub = query.subscribe(counter.clone());
        assert!(query.is_subscribed(sub.id()));

        query.unsubscribe(sub.id());
        assert!(!sub.is_active());
        assert!(!query.is_subscribed(sub.id()));

        // Re-subscribing the same subscriber is unaffected by the stale handle.
        let again = query.subscribe(counter.clone());
        drop(sub);
        assert!(again.is_active());
        assert_eq!(query.subscriber_count(), 1);

        query.set_state(|state| state.is_fetching = false);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");

        let payload: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }
}
