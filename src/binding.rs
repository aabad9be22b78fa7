//! Lifecycle glue for one consuming unit.
//!
//! A UI component (or any other consumer with a mount/teardown lifecycle)
//! owns one [`QueryBinding`]. The binding creates its observer lazily,
//! subscribes once on mount and releases the subscription once on unmount.
//!
//! ```ignore
//! struct PostList {
//!     posts: QueryBinding<Vec<Post>>,
//! }
//!
//! impl PostList {
//!     fn new(client: &QueryClient) -> Self {
//!         Self {
//!             posts: QueryBinding::new(client, "posts", || async { fetch_posts().await }),
//!         }
//!     }
//!
//!     fn mounted(&mut self, rerender: impl Fn() + Send + Sync + 'static) -> Result<(), QueryError> {
//!         self.posts.mount(rerender)
//!     }
//!
//!     fn render(&mut self) -> Result<(), QueryError> {
//!         let state = self.posts.result()?;
//!         if state.is_fetching {
//!             draw_spinner();
//!         }
//!         if let Some(posts) = &state.data {
//!             draw(posts);
//!         }
//!         Ok(())
//!     }
//! }
//! ```

use std::sync::Arc;

use crate::client::QueryClient;
use crate::error::QueryError;
use crate::key::QueryKey;
use crate::observer::QueryObserver;
use crate::query::{Fetcher, Subscription};
use crate::state::QueryState;

/// A consuming unit's hold on one query.
pub struct QueryBinding<T> {
    client: QueryClient,
    key: QueryKey,
    fetcher: Arc<dyn Fetcher<T>>,
    observer: Option<QueryObserver<T>>,
    subscription: Option<Subscription>,
    mounted: bool,
}

impl<T: Send + Sync + 'static> QueryBinding<T> {
    /// Describe the query this unit consumes. Nothing is resolved yet.
    pub fn new(client: &QueryClient, key: impl Into<QueryKey>, fetcher: impl Fetcher<T>) -> Self {
        Self {
            client: client.clone(),
            key: key.into(),
            fetcher: Arc::new(fetcher),
            observer: None,
            subscription: None,
            mounted: false,
        }
    }

    /// The observer, created on first use.
    pub fn observer(&mut self) -> Result<&QueryObserver<T>, QueryError> {
        let observer = match self.observer.take() {
            Some(observer) => observer,
            None => QueryObserver::for_query(
                self.client
                    .get_query_with(self.key.clone(), self.fetcher.clone())?,
            ),
        };
        Ok(&*self.observer.insert(observer))
    }

    /// Current state of the query.
    pub fn result(&mut self) -> Result<QueryState<T>, QueryError> {
        Ok(self.observer()?.result())
    }

    /// Bind `render` and start fetching. Only the first call has an effect.
    pub fn mount(&mut self, render: impl Fn() + Send + Sync + 'static) -> Result<(), QueryError> {
        if self.mounted {
            return Ok(());
        }
        let subscription = self.observer()?.bind_and_subscribe(render);
        self.subscription = Some(subscription);
        self.mounted = true;
        Ok(())
    }

    /// Whether [`mount`](Self::mount) has run.
    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    /// Release the subscription. Only the first call after mount has an
    /// effect; dropping the binding does the same.
    pub fn unmount(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observer_is_lazy() {
        let client = QueryClient::new();
        let mut binding = QueryBinding::new(&client, "posts", || async { anyhow::Ok(1u32) });
        assert!(client.is_empty());

        assert!(binding.result().unwrap().is_loading());
        assert_eq!(client.len(), 1);
        assert!(!binding.is_mounted());
    }

    #[test]
    fn test_mount_once_unmount_once() {
        let client = QueryClient::new();
        let mut binding = QueryBinding::new(&client, "posts", || async { anyhow::Ok(1u32) });

        binding.mount(|| {}).unwrap();
        binding.mount(|| {}).unwrap();
        let query = binding.observer().unwrap().query().clone();
        assert_eq!(query.subscriber_count(), 1);

        binding.unmount();
        binding.unmount();
        assert_eq!(query.subscriber_count(), 0);
        assert!(!binding.observer().unwrap().is_bound());
    }

    #[test]
    fn test_drop_releases_subscription() {
        let client = QueryClient::new();
        let mut binding = QueryBinding::new(&client, "posts", || async { anyhow::Ok(1u32) });
        binding.mount(|| {}).unwrap();
        let query = binding.observer().unwrap().query().clone();

        drop(binding);
        assert_eq!(query.subscriber_count(), 0);
    }
}
