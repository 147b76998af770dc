//! Entity Cache: query results keyed by [`Query`], observable per key.
//!
//! Every entry carries the last good value, the last error and a stale flag.
//! Reads start a fetch when an entry is missing or stale, and concurrent
//! reads of one key share a single in-flight fetch. A failed fetch keeps the
//! previous value readable.
//!
//! Patches and invalidations bump the entry's generation. A fetch that
//! started before such a change still stores its result, but leaves the
//! entry stale and, when someone is subscribed, fetches again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use noticeboard_common::{AppError, AppResult};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, warn};

use crate::fetcher::QueryFetcher;
use crate::query::{CacheValue, Query, QueryKey};

/// What a view renders for one query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryState {
    /// Last good value, kept across failed refetches.
    pub data: Option<CacheValue>,
    pub is_loading: bool,
    pub error: Option<AppError>,
    /// Invalidated or patched since the last completed fetch.
    pub is_stale: bool,
}

type SharedFetch = Shared<BoxFuture<'static, AppResult<CacheValue>>>;

struct InFlight {
    id: u64,
    generation: u64,
    result: SharedFetch,
}

struct Entry {
    data: Option<CacheValue>,
    error: Option<AppError>,
    stale: bool,
    generation: u64,
    subscribers: usize,
    in_flight: Option<InFlight>,
    tx: watch::Sender<QueryState>,
}

impl Entry {
    fn new() -> Self {
        let (tx, _) = watch::channel(QueryState::default());
        Self {
            data: None,
            error: None,
            stale: false,
            generation: 0,
            subscribers: 0,
            in_flight: None,
            tx,
        }
    }

    fn state(&self) -> QueryState {
        QueryState {
            data: self.data.clone(),
            is_loading: self.in_flight.is_some(),
            error: self.error.clone(),
            is_stale: self.stale,
        }
    }

    fn publish(&self) {
        self.tx.send_replace(self.state());
    }

    /// Nothing cached and nothing tried yet, or explicitly invalidated.
    const fn needs_fetch(&self) -> bool {
        self.in_flight.is_none() && ((self.data.is_none() && self.error.is_none()) || self.stale)
    }

    fn reset(&mut self) {
        self.data = None;
        self.error = None;
        self.stale = false;
        self.in_flight = None;
        self.generation += 1;
    }
}

struct Inner {
    entries: Mutex<HashMap<Query, Entry>>,
    fetcher: Arc<dyn QueryFetcher>,
    next_fetch: AtomicU64,
}

/// Process-wide query cache. Cheap to clone; clones share state.
///
/// Fetches run on spawned tasks, so methods that may start one ([`read`],
/// [`subscribe`], [`fetch`], [`refetch`], [`invalidate`]) must be called
/// from within a Tokio runtime.
///
/// [`read`]: Self::read
/// [`subscribe`]: Self::subscribe
/// [`fetch`]: Self::fetch
/// [`refetch`]: Self::refetch
/// [`invalidate`]: Self::invalidate
#[derive(Clone)]
pub struct EntityCache {
    inner: Arc<Inner>,
}

impl EntityCache {
    #[must_use]
    pub fn new(fetcher: Arc<dyn QueryFetcher>) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                fetcher,
                next_fetch: AtomicU64::new(1),
            }),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<Query, Entry>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state of `query`, starting a fetch if it is missing or stale.
    pub fn read(&self, query: &Query) -> QueryState {
        let mut entries = self.entries();
        let entry = entries.entry(query.clone()).or_insert_with(Entry::new);
        if entry.needs_fetch() {
            self.start(query, entry);
        }
        entry.state()
    }

    /// Observe `query`; interest is released when the subscription drops.
    pub fn subscribe(&self, query: Query) -> QuerySubscription {
        let rx = {
            let mut entries = self.entries();
            let entry = entries.entry(query.clone()).or_insert_with(Entry::new);
            entry.subscribers += 1;
            if entry.needs_fetch() {
                self.start(&query, entry);
            }
            entry.tx.subscribe()
        };
        debug!(query = %query, "Subscribed");
        QuerySubscription {
            cache: self.clone(),
            query,
            rx,
        }
    }

    /// Fresh value of `query`.
    ///
    /// Returns the cached value when it is neither stale nor being refetched,
    /// otherwise joins or starts a fetch.
    pub async fn fetch(&self, query: &Query) -> AppResult<CacheValue> {
        let pending = {
            let mut entries = self.entries();
            let entry = entries.entry(query.clone()).or_insert_with(Entry::new);
            if entry.in_flight.is_none()
                && !entry.stale
                && let Some(data) = &entry.data
            {
                debug!(query = %query, "Cache hit");
                return Ok(data.clone());
            }
            self.begin(query, entry)
        };
        pending.await
    }

    /// Fetch `query` again regardless of freshness, joining one in flight.
    pub async fn refetch(&self, query: &Query) -> AppResult<CacheValue> {
        let pending = {
            let mut entries = self.entries();
            let entry = entries.entry(query.clone()).or_insert_with(Entry::new);
            self.begin(query, entry)
        };
        pending.await
    }

    /// Mark every entry under `prefix` stale; subscribed ones refetch.
    ///
    /// Returns the number of entries marked.
    pub fn invalidate(&self, prefix: &QueryKey) -> usize {
        let mut entries = self.entries();
        let mut marked = 0;
        for (query, entry) in entries.iter_mut() {
            if !query.key().starts_with(prefix) {
                continue;
            }
            marked += 1;
            entry.stale = true;
            entry.generation += 1;
            if entry.subscribers > 0 && entry.in_flight.is_none() {
                self.start(query, entry);
            } else {
                entry.publish();
            }
        }
        debug!(prefix = %prefix, marked, "Invalidated");
        marked
    }

    /// Replace the value of `query` with `updater(current)`.
    ///
    /// The updater sees `None` when nothing is cached and returns `None` to
    /// leave the entry untouched. It runs under the cache lock and must not
    /// call back into the cache. An entry first populated by a patch is
    /// stale, so its first reader still fetches the authoritative value.
    pub fn patch<F>(&self, query: &Query, updater: F) -> bool
    where
        F: FnOnce(Option<&CacheValue>) -> Option<CacheValue>,
    {
        let mut entries = self.entries();
        let entry = entries.entry(query.clone()).or_insert_with(Entry::new);
        let Some(next) = updater(entry.data.as_ref()) else {
            return false;
        };
        if entry.data.is_none() {
            entry.stale = true;
        }
        entry.data = Some(next);
        entry.generation += 1;
        entry.publish();
        debug!(query = %query, "Patched");
        true
    }

    /// Patch every populated entry under `prefix`; returns entries changed.
    pub fn patch_matching<F>(&self, prefix: &QueryKey, updater: F) -> usize
    where
        F: Fn(&Query, &CacheValue) -> Option<CacheValue>,
    {
        let mut entries = self.entries();
        let mut changed = 0;
        for (query, entry) in entries.iter_mut() {
            if !query.key().starts_with(prefix) {
                continue;
            }
            let Some(next) = entry.data.as_ref().and_then(|data| updater(query, data)) else {
                continue;
            };
            entry.data = Some(next);
            entry.generation += 1;
            entry.publish();
            changed += 1;
        }
        if changed > 0 {
            debug!(prefix = %prefix, changed, "Patched matching");
        }
        changed
    }

    /// Drop the cached value of `query`.
    ///
    /// Subscribed entries are emptied in place; a fetch in flight no longer
    /// lands.
    pub fn remove(&self, query: &Query) {
        let mut entries = self.entries();
        let subscribed = match entries.get_mut(query) {
            None => return,
            Some(entry) if entry.subscribers > 0 => {
                entry.reset();
                entry.publish();
                true
            }
            Some(_) => false,
        };
        if !subscribed {
            entries.remove(query);
        }
        debug!(query = %query, "Removed");
    }

    /// Drop `query` if nobody observes it; returns whether it was dropped.
    pub fn evict(&self, query: &Query) -> bool {
        let mut entries = self.entries();
        if entries.get(query).is_none_or(|entry| entry.subscribers > 0) {
            return false;
        }
        entries.remove(query);
        debug!(query = %query, "Evicted");
        true
    }

    /// State of `query` without side effects.
    #[must_use]
    pub fn snapshot(&self, query: &Query) -> Option<QueryState> {
        self.entries().get(query).map(Entry::state)
    }

    /// Drop everything, as on logout.
    pub fn clear(&self) {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, entry| {
            if entry.subscribers == 0 {
                return false;
            }
            entry.reset();
            entry.publish();
            true
        });
        debug!(entries = before, "Cache cleared");
    }

    /// Make sure a fetch for `query` is running.
    fn start(&self, query: &Query, entry: &mut Entry) {
        drop(self.begin(query, entry));
    }

    /// Join the fetch in flight for `query` or start one.
    fn begin(&self, query: &Query, entry: &mut Entry) -> SharedFetch {
        if let Some(flight) = &entry.in_flight {
            debug!(query = %query, "Joining in-flight fetch");
            return flight.result.clone();
        }

        let id = self.inner.next_fetch.fetch_add(1, Ordering::Relaxed);
        let task = {
            let cache = self.clone();
            let fetcher = self.inner.fetcher.clone();
            let query = query.clone();
            tokio::spawn(async move {
                let result = fetcher.fetch(&query).await;
                cache.settle(&query, id, &result);
                result
            })
        };
        let result = task
            .map(|joined| {
                joined.unwrap_or_else(|e| Err(AppError::Internal(format!("fetch task failed: {e}"))))
            })
            .boxed()
            .shared();

        entry.in_flight = Some(InFlight {
            id,
            generation: entry.generation,
            result: result.clone(),
        });
        entry.publish();
        debug!(query = %query, fetch = id, "Fetch started");
        result
    }

    /// Store the outcome of fetch `id`, unless it was superseded by a reset.
    fn settle(&self, query: &Query, id: u64, result: &AppResult<CacheValue>) {
        let refetch = {
            let mut entries = self.entries();
            let Some(entry) = entries.get_mut(query) else {
                return;
            };
            let Some(flight) = entry.in_flight.take_if(|f| f.id == id) else {
                return;
            };
            let overtaken = flight.generation != entry.generation;

            match result {
                Ok(value) => {
                    entry.data = Some(value.clone());
                    entry.error = None;
                    entry.stale = overtaken;
                }
                Err(error) if entry.subscribers == 0 => {
                    debug!(query = %query, error = %error, "Fetch failed with no subscribers");
                    entry.stale = true;
                }
                Err(error) => {
                    warn!(query = %query, error = %error, "Fetch failed");
                    entry.error = Some(error.clone());
                }
            }
            entry.publish();
            overtaken && result.is_ok() && entry.subscribers > 0
        };

        if refetch {
            debug!(query = %query, "Fetch overtaken by a newer change, refetching");
            let mut entries = self.entries();
            if let Some(entry) = entries.get_mut(query)
                && entry.in_flight.is_none()
            {
                self.start(query, entry);
            }
        }
    }

    fn release(&self, query: &Query) {
        if let Some(entry) = self.entries().get_mut(query) {
            entry.subscribers = entry.subscribers.saturating_sub(1);
        }
        debug!(query = %query, "Unsubscribed");
    }
}

/// Interest in one query; released on drop.
///
/// The entry itself stays cached for the next subscriber.
pub struct QuerySubscription {
    cache: EntityCache,
    query: Query,
    rx: watch::Receiver<QueryState>,
}

impl QuerySubscription {
    #[must_use]
    pub const fn query(&self) -> &Query {
        &self.query
    }

    #[must_use]
    pub fn current(&self) -> QueryState {
        self.rx.borrow().clone()
    }

    /// Wait for the next change; `None` once the entry is gone.
    pub async fn changed(&mut self) -> Option<QueryState> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// Wait until the state satisfies `predicate`.
    pub async fn wait_for(
        &mut self,
        predicate: impl FnMut(&QueryState) -> bool,
    ) -> Option<QueryState> {
        self.rx.wait_for(predicate).await.ok().map(|state| state.clone())
    }

    /// Stream of states, starting with the current one.
    #[must_use]
    pub fn stream(&self) -> WatchStream<QueryState> {
        WatchStream::new(self.rx.clone())
    }
}

impl Drop for QuerySubscription {
    fn drop(&mut self) {
        self.cache.release(&self.query);
    }
}

#[cfg(test)]
mod tests {
    use noticeboard_client::CampusApi;
    use noticeboard_client::test_utils::{MemoryBackend, endpoints};
    use noticeboard_common::config::CacheConfig;
    use noticeboard_model::CommentTarget;

    use super::*;
    use crate::fetcher::ApiFetcher;

    fn cache_over(backend: &Arc<MemoryBackend>) -> EntityCache {
        let api: Arc<dyn CampusApi> = backend.clone();
        EntityCache::new(Arc::new(ApiFetcher::new(api, CacheConfig::default())))
    }

    fn titles(state: &QueryState) -> Vec<String> {
        state
            .data
            .as_ref()
            .and_then(CacheValue::announcements)
            .unwrap_or_default()
            .iter()
            .map(|a| a.title.clone())
            .collect()
    }

    #[tokio::test]
    async fn test_concurrent_reads_share_one_fetch() {
        let backend = Arc::new(MemoryBackend::new());
        backend.seed_announcement("Library hours", "Open until 22:00");
        let gate = backend.hold(endpoints::LIST_ANNOUNCEMENTS);
        let cache = cache_over(&backend);

        let first = cache.read(&Query::Announcements);
        let second = cache.read(&Query::Announcements);
        assert!(first.is_loading);
        assert!(second.is_loading);
        assert!(second.data.is_none());

        gate.open();
        let value = cache.fetch(&Query::Announcements).await.unwrap();

        assert_eq!(value.len(), 1);
        assert_eq!(backend.calls(endpoints::LIST_ANNOUNCEMENTS), 1);
        let state = cache.read(&Query::Announcements);
        assert!(!state.is_loading);
        assert_eq!(titles(&state), vec!["Library hours"]);
        assert_eq!(backend.calls(endpoints::LIST_ANNOUNCEMENTS), 1);
    }

    #[tokio::test]
    async fn test_failed_refetch_keeps_stale_data() {
        let backend = Arc::new(MemoryBackend::new());
        backend.seed_announcement("Exams", "Timetable is out");
        let cache = cache_over(&backend);
        let sub = cache.subscribe(Query::Announcements);
        cache.fetch(&Query::Announcements).await.unwrap();

        backend.fail_next(
            endpoints::LIST_ANNOUNCEMENTS,
            AppError::Network("connection reset".to_string()),
        );
        let err = cache.refetch(&Query::Announcements).await.unwrap_err();

        assert!(err.is_network());
        let state = sub.current();
        assert_eq!(titles(&state), vec!["Exams"]);
        assert_eq!(state.error, Some(err));
        assert!(!state.is_loading);
    }

    #[tokio::test]
    async fn test_unsubscribed_failure_surfaces_no_error() {
        let backend = Arc::new(MemoryBackend::new());
        let cache = cache_over(&backend);
        backend.fail_next(
            endpoints::LIST_ANNOUNCEMENTS,
            AppError::Network("offline".to_string()),
        );

        assert!(cache.fetch(&Query::Announcements).await.is_err());

        let state = cache.snapshot(&Query::Announcements).unwrap();
        assert!(state.error.is_none());
        assert!(state.is_stale);

        // The next reader retries.
        let _sub = cache.subscribe(Query::Announcements);
        assert!(cache.fetch(&Query::Announcements).await.is_ok());
        assert_eq!(backend.calls(endpoints::LIST_ANNOUNCEMENTS), 2);
    }

    #[tokio::test]
    async fn test_patch_without_entry_or_subscriber() {
        let backend = Arc::new(MemoryBackend::new());
        let cache = cache_over(&backend);
        let query = Query::Announcements;

        let patched = cache.patch(&query, |current| {
            assert!(current.is_none());
            Some(CacheValue::Announcements(Vec::new()))
        });
        assert!(patched);

        let state = cache.snapshot(&query).unwrap();
        assert_eq!(state.data, Some(CacheValue::Announcements(Vec::new())));
        assert!(state.is_stale);
        assert_eq!(backend.calls(endpoints::LIST_ANNOUNCEMENTS), 0);

        // A returned `None` leaves the entry alone.
        assert!(!cache.patch(&query, |_| None));
    }

    #[tokio::test]
    async fn test_fetch_overtaken_by_patch_refetches() {
        let backend = Arc::new(MemoryBackend::new());
        let announcement = backend.seed_announcement("Exams", "Timetable is out");
        let target = CommentTarget::general_announcement(announcement.id);
        let query = Query::Comments(target);
        let gate = backend.hold(endpoints::LIST_COMMENTS);
        let cache = cache_over(&backend);

        let mut sub = cache.subscribe(query.clone());
        assert!(sub.current().is_loading);

        let pushed = backend.seed_comment(target, "Room 101?");
        cache.patch(&query, |current| {
            let mut list = current
                .and_then(CacheValue::comments)
                .map(<[_]>::to_vec)
                .unwrap_or_default();
            list.push(pushed.clone());
            Some(CacheValue::Comments(list))
        });

        gate.open();
        let state = sub
            .wait_for(|s| !s.is_loading && !s.is_stale)
            .await
            .unwrap();

        assert_eq!(backend.calls(endpoints::LIST_COMMENTS), 2);
        let comments = state.data.as_ref().and_then(CacheValue::comments).unwrap();
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].content, "Room 101?");
    }

    #[tokio::test]
    async fn test_invalidate_refetches_only_subscribed() {
        let backend = Arc::new(MemoryBackend::new());
        let first = backend.seed_announcement("First", "a");
        let second = backend.seed_announcement("Second", "b");
        let cache = cache_over(&backend);

        let watched = Query::Announcement(first.id);
        let idle = Query::Announcement(second.id);
        let mut sub = cache.subscribe(watched.clone());
        cache.fetch(&watched).await.unwrap();
        cache.fetch(&idle).await.unwrap();
        assert_eq!(backend.calls(endpoints::GET_ANNOUNCEMENT), 2);

        let marked = cache.invalidate(&QueryKey::announcement_details());
        assert_eq!(marked, 2);
        sub.wait_for(|s| !s.is_loading && !s.is_stale).await.unwrap();

        assert_eq!(backend.calls(endpoints::GET_ANNOUNCEMENT), 3);
        assert!(cache.snapshot(&idle).unwrap().is_stale);

        // The idle entry refetches on its next read.
        assert!(cache.read(&idle).is_loading);
    }

    #[tokio::test]
    async fn test_patch_matching_touches_populated_entries_under_prefix() {
        let backend = Arc::new(MemoryBackend::new());
        let first = backend.seed_announcement("First", "a");
        let second = backend.seed_announcement("Second", "b");
        let cache = cache_over(&backend);
        cache.fetch(&Query::Announcement(first.id)).await.unwrap();
        cache.fetch(&Query::Announcement(second.id)).await.unwrap();
        cache.fetch(&Query::Announcements).await.unwrap();
        // Known key with nothing cached yet.
        cache.patch(&Query::Announcement(99), |_| None);

        let changed = cache.patch_matching(&QueryKey::announcement_details(), |query, value| {
            let mut next = value.announcement()?.clone();
            if *query == Query::Announcement(second.id) {
                return None;
            }
            next.title.push_str(" (updated)");
            Some(CacheValue::Announcement(Box::new(next)))
        });

        assert_eq!(changed, 1);
        let title = |id| {
            cache
                .snapshot(&Query::Announcement(id))
                .and_then(|s| s.data)
                .and_then(|d| d.announcement().map(|a| a.title.clone()))
        };
        assert_eq!(title(first.id).as_deref(), Some("First (updated)"));
        assert_eq!(title(second.id).as_deref(), Some("Second"));
        assert_eq!(
            titles(&cache.snapshot(&Query::Announcements).unwrap()),
            vec!["Second", "First"]
        );
    }

    #[tokio::test]
    async fn test_evict_skips_observed_entries() {
        let backend = Arc::new(MemoryBackend::new());
        let cache = cache_over(&backend);
        let sub = cache.subscribe(Query::Announcements);
        cache.fetch(&Query::Announcements).await.unwrap();

        assert!(!cache.evict(&Query::Announcements));
        assert!(cache.snapshot(&Query::Announcements).is_some());

        drop(sub);
        assert!(cache.evict(&Query::Announcements));
        assert!(cache.snapshot(&Query::Announcements).is_none());
        assert!(!cache.evict(&Query::Announcements));
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let backend = Arc::new(MemoryBackend::new());
        let announcement = backend.seed_announcement("Exams", "Timetable is out");
        let cache = cache_over(&backend);
        let query = Query::Announcement(announcement.id);

        let sub = cache.subscribe(query.clone());
        cache.fetch(&query).await.unwrap();
        cache.fetch(&Query::Announcements).await.unwrap();

        cache.remove(&query);
        assert!(sub.current().data.is_none());

        cache.clear();
        assert!(cache.snapshot(&Query::Announcements).is_none());
        assert!(cache.snapshot(&query).is_some());

        drop(sub);
        cache.clear();
        assert!(cache.snapshot(&query).is_none());
    }
}
