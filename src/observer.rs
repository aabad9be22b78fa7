//! Per-consumer bridge between a query and a render callback.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::client::QueryClient;
use crate::error::QueryError;
use crate::key::QueryKey;
use crate::query::{Fetcher, Query, Subscriber, Subscription};
use crate::state::QueryState;
use crate::tracer::SubscriberId;

/// Callback invoked when the observed query changes.
pub type RenderCallback = Arc<dyn Fn() + Send + Sync>;

/// The render callback and the subscription it is bound through.
/// `None` means unbound.
#[derive(Default)]
struct RenderSlot {
    bound: Mutex<Option<(SubscriberId, RenderCallback)>>,
}

impl Subscriber for RenderSlot {
    fn notify(&self) {
        // Cloned out so the callback may rebind or read the observer.
        let render = self.bound.lock().as_ref().map(|(_, render)| render.clone());
        if let Some(render) = render {
            render();
        }
    }

    fn on_unsubscribe(&self, id: SubscriberId) {
        let mut bound = self.bound.lock();
        if bound.as_ref().is_some_and(|(bound_id, _)| *bound_id == id) {
            bound.take();
        }
    }
}

/// A consumer's view of one query.
///
/// An observer is created once per consuming unit and relays that query's
/// change notifications to a single render callback. It starts unbound;
/// [`bind_and_subscribe`](Self::bind_and_subscribe) binds it and triggers a
/// fetch, releasing the returned [`Subscription`] unbinds it again.
pub struct QueryObserver<T> {
    query: Arc<Query<T>>,
    slot: Arc<RenderSlot>,
}

impl<T: Send + Sync + 'static> QueryObserver<T> {
    /// Resolve (or create) the query for `key` and observe it.
    ///
    /// Does not fetch.
    pub fn new<F: Fetcher<T>>(
        client: &QueryClient,
        key: impl Into<QueryKey>,
        fetcher: F,
    ) -> Result<Self, QueryError> {
        Ok(Self::for_query(client.get_query(key, fetcher)?))
    }

    /// Observe an already resolved query.
    pub fn for_query(query: Arc<Query<T>>) -> Self {
        Self {
            query,
            slot: Arc::default(),
        }
    }

    /// The observed query.
    pub fn query(&self) -> &Arc<Query<T>> {
        &self.query
    }

    /// Current state of the observed query.
    pub fn result(&self) -> QueryState<T> {
        self.query.state()
    }

    /// Whether a render callback is bound.
    pub fn is_bound(&self) -> bool {
        self.slot.bound.lock().is_some()
    }

    /// Bind `render`, subscribe to the query and kick off a fetch.
    ///
    /// The fetch is not awaited; its progress arrives through `render`. Keep
    /// the returned subscription for as long as the consumer is alive:
    /// dropping or releasing it unbinds the observer.
    ///
    /// Binding again replaces the callback. The subscription from the earlier
    /// bind is released here, so its handle becomes inert and releasing it
    /// later leaves the observer bound. Clones share one binding.
    ///
    /// Without a Tokio runtime the fetch handle is dropped unpolled, so the
    /// query stays in flight until someone awaits [`Query::fetch`].
    pub fn bind_and_subscribe(&self, render: impl Fn() + Send + Sync + 'static) -> Subscription {
        let previous = self.slot.bound.lock().take();
        if let Some((id, _)) = previous {
            self.query.unsubscribe(id);
        }

        let subscription = self.query.subscribe(self.slot.clone());
        *self.slot.bound.lock() = Some((subscription.id(), Arc::new(render)));

        // Driven by the runtime; the handle is not needed here.
        drop(self.query.fetch());

        subscription
    }
}

impl<T> Clone for QueryObserver<T> {
    /// Clones share the render slot, so they are the same observer.
    fn clone(&self) -> Self {
        Self {
            query: self.query.clone(),
            slot: self.slot.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_new_does_not_fetch() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let observer = QueryObserver::new(&client, "posts", {
            let calls = calls.clone();
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { anyhow::Ok(1u32) }
            }
        })
        .unwrap();

        assert!(!observer.is_bound());
        assert!(!observer.query().is_in_flight());
        assert!(observer.result().is_loading());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unsubscribe_unbinds() {
        let client = QueryClient::new();
        let observer =
            QueryObserver::new(&client, "posts", || async { anyhow::Ok(1u32) }).unwrap();
        let renders = Arc::new(AtomicUsize::new(0));

        let subscription = observer.bind_and_subscribe({
            let renders = renders.clone();
            move || {
                renders.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert!(observer.is_bound());
        // Start-of-fetch notification.
        assert_eq!(renders.load(Ordering::SeqCst), 1);

        subscription.unsubscribe();
        assert!(!observer.is_bound());
        assert_eq!(observer.query().subscriber_count(), 0);

        // Unbound slot ignores stray notifications.
        observer.slot.notify();
        assert_eq!(renders.load(Ordering::SeqCst), 1);
    }

    fn counting(count: &Arc<AtomicUsize>) -> impl Fn() + Send + Sync + 'static {
        let count = count.clone();
        move || {
            count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_rebind_replaces_callback() {
        let client = QueryClient::new();
        let observer =
            QueryObserver::new(&client, "posts", || async { anyhow::Ok(1u32) }).unwrap();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let old = observer.bind_and_subscribe(counting(&first));
        assert_eq!(first.load(Ordering::SeqCst), 1);

        // Joins the pending attempt, so no start notification this time.
        let current = observer.bind_and_subscribe(counting(&second));
        assert!(!old.is_active());
        assert!(current.is_active());
        assert_eq!(observer.query().subscriber_count(), 1);

        drop(old);
        assert!(observer.is_bound());
        assert!(current.is_active());

        observer.query().fetch().await;
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 2);

        current.unsubscribe();
        assert!(!observer.is_bound());
    }

    #[tokio::test]
    async fn test_clones_share_one_binding() {
        let client = QueryClient::new();
        let observer =
            QueryObserver::new(&client, "posts", || async { anyhow::Ok(1u32) }).unwrap();
        let twin = observer.clone();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let _old = observer.bind_and_subscribe(counting(&first));
        let current = twin.bind_and_subscribe(counting(&second));
        assert_eq!(observer.query().subscriber_count(), 1);

        observer.query().fetch().await;
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 2);

        drop(current);
        assert!(!observer.is_bound());
        assert!(!twin.is_bound());
    }
}
