//! Role Last-Used Cache
//!
//! Memoizes role last-used lookups for the duration of one run. Each key owns
//! a `OnceCell`, so concurrent callers asking for the same uncached role wait
//! on a single in-flight fetch and all observe its result.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::debug;

/// `None` inside the cell means "fetched, but unknown"
type Slot = Arc<OnceCell<Option<DateTime<Utc>>>>;

/// Single-flight cache of role last-used timestamps
#[derive(Debug, Default)]
pub struct LastUsedCache {
    slots: Mutex<HashMap<String, Slot>>,
    fetches: AtomicUsize,
}

impl LastUsedCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached value for `role_name`, running `fetch` only if no
    /// other caller has fetched (or is fetching) it yet
    pub async fn get_or_fetch<F, Fut>(&self, role_name: &str, fetch: F) -> Option<DateTime<Utc>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Option<DateTime<Utc>>>,
    {
        let slot = {
            let mut slots = self.slots.lock().await;
            slots.entry(role_name.to_string()).or_default().clone()
        };

        let value = slot
            .get_or_init(|| async {
                self.fetches.fetch_add(1, Ordering::SeqCst);
                debug!(role = %role_name, "Role last-used cache miss");
                fetch().await
            })
            .await;

        *value
    }

    /// Cached value without fetching: `None` if never fetched
    pub async fn peek(&self, role_name: &str) -> Option<Option<DateTime<Utc>>> {
        let slots = self.slots.lock().await;
        slots.get(role_name).and_then(|slot| slot.get().copied())
    }

    /// Number of fetches issued through this cache
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Number of distinct roles seen
    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
