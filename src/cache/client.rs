//! Query executor: cache-first reads with request de-duplication.
//!
//! All shared state sits behind one mutex that is never held across an
//! `.await`, so every section between suspension points is atomic. The only
//! suspension points are the remote calls themselves and retry sleeps.

use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use super::clock::{Clock, TokioClock};
use super::graph::RelationshipGraph;
use super::result::CacheResult;
use super::retry::RetryPolicy;
use super::store::{CacheEntry, CacheStore, InvalidateMode};
use super::tag::{ListParams, Tag, TagPattern};
use crate::entity::DynBinding;
use crate::error::{CacheError, RemoteError};
use crate::event::{CacheEvent, EventBus, EventStream};
use crate::models::EntityKind;

/// A boxed future resolving to fetched JSON
pub type FetchFuture = BoxFuture<'static, Result<Value, RemoteError>>;

/// A factory function that creates futures for fetching data
pub type Fetcher = Arc<dyn Fn() -> FetchFuture + Send + Sync>;

type SharedFetch = Shared<BoxFuture<'static, Result<Value, CacheError>>>;

/// Freshness settings for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
  /// How long fetched data is served without a refetch
  pub stale_time: Duration,
  /// How long an unobserved entry is kept before `collect_garbage` drops it
  pub gc_time: Duration,
}

impl Default for QueryOptions {
  fn default() -> Self {
    Self {
      stale_time: Duration::from_secs(30),
      gc_time: Duration::from_secs(5 * 60),
    }
  }
}

pub(crate) struct InFlight {
  generation: u64,
  result: SharedFetch,
}

/// The fetcher a tag was last resolved with, kept for forced refetches.
#[derive(Clone)]
pub(crate) struct Registered {
  fetcher: Fetcher,
  options: QueryOptions,
}

pub(crate) struct Observed {
  count: usize,
  version: watch::Sender<u64>,
}

/// Everything the executor and mutation coordinator share.
#[derive(Default)]
pub(crate) struct State {
  pub(crate) store: CacheStore,
  in_flight: HashMap<Tag, InFlight>,
  fetchers: HashMap<Tag, Registered>,
  observers: HashMap<Tag, Observed>,
  /// Tags carrying a pending optimistic patch, with the number of mutations holding them
  pub(crate) holds: HashMap<Tag, usize>,
  /// Params a binding-backed list tag was fetched with
  list_params: HashMap<Tag, ListParams>,
  bindings: HashMap<EntityKind, Arc<dyn DynBinding>>,
  next_generation: u64,
}

impl State {
  /// Whether a new row could belong to the list cached at `tag`. False when
  /// the list was fetched with an equality filter the row contradicts.
  pub(crate) fn admits_row(&self, tag: &Tag, row: &Value) -> bool {
    let Some(params) = self.list_params.get(tag) else {
      return true;
    };
    params
      .filters()
      .filter(|(field, _)| field.as_str() != "search")
      .all(|(field, expected)| row.get(field.as_str()).map_or(true, |actual| actual == expected))
  }

  pub(crate) fn is_observed(&self, tag: &Tag) -> bool {
    self.observers.contains_key(tag)
  }

  /// Bump the change counter of an observed tag.
  pub(crate) fn notify(&self, tag: &Tag) {
    if let Some(observed) = self.observers.get(tag) {
      observed.version.send_modify(|v| *v += 1);
    }
  }

  /// Discard the in-flight fetch for a tag. Its response will be ignored.
  pub(crate) fn cancel(&mut self, tag: &Tag) {
    if let Some(in_flight) = self.in_flight.remove(tag) {
      debug!(%tag, generation = in_flight.generation, "cancelled in-flight fetch");
    }
    if let Some(entry) = self.store.get_mut(tag) {
      entry.in_flight = false;
    }
  }

  pub(crate) fn hold(&mut self, tag: &Tag) {
    *self.holds.entry(tag.clone()).or_insert(0) += 1;
  }

  pub(crate) fn release(&mut self, tag: &Tag) {
    if let Some(count) = self.holds.get_mut(tag) {
      *count -= 1;
      if *count == 0 {
        self.holds.remove(tag);
      }
    }
  }

  pub(crate) fn restore(&mut self, tag: &Tag, snapshot: Option<CacheEntry>) {
    self.store.restore(tag, snapshot);
    self.notify(tag);
  }

  pub(crate) fn remove(&mut self, tag: &Tag) -> Option<CacheEntry> {
    self.cancel(tag);
    let removed = self.store.remove(tag);
    self.notify(tag);
    removed
  }
}

pub(crate) struct Inner {
  state: Mutex<State>,
  pub(crate) options: QueryOptions,
  retry: RetryPolicy,
  pub(crate) clock: Arc<dyn Clock>,
  pub(crate) events: EventBus,
  pub(crate) graph: RelationshipGraph,
}

impl Inner {
  pub(crate) fn lock(&self) -> MutexGuard<'_, State> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn join_or_start(
    self: &Arc<Self>,
    state: &mut State,
    tag: &Tag,
    registered: Registered,
  ) -> SharedFetch {
    if let Some(in_flight) = state.in_flight.get(tag) {
      trace!(%tag, generation = in_flight.generation, "joining in-flight fetch");
      return in_flight.result.clone();
    }
    self.start_fetch(state, tag, registered)
  }

  /// Spawn a fetch for `tag`. The task runs to completion even if every
  /// caller stops waiting, so the in-flight record is always settled.
  fn start_fetch(self: &Arc<Self>, state: &mut State, tag: &Tag, registered: Registered) -> SharedFetch {
    state.next_generation += 1;
    let generation = state.next_generation;
    if let Some(entry) = state.store.get_mut(tag) {
      entry.in_flight = true;
    }
    debug!(%tag, generation, "fetch started");

    let inner = Arc::clone(self);
    let task_tag = tag.clone();
    let Registered { fetcher, options } = registered;
    let handle = tokio::spawn(async move {
      let outcome = inner.retry.run(|| (*fetcher)()).await;
      inner.settle(&task_tag, generation, outcome, options)
    });

    let cancelled = tag.clone();
    let shared = async move {
      handle
        .await
        .unwrap_or_else(|_| Err(CacheError::Cancelled(cancelled)))
    }
    .boxed()
    .shared();

    state.in_flight.insert(
      tag.clone(),
      InFlight {
        generation,
        result: shared.clone(),
      },
    );
    shared
  }

  fn settle(
    &self,
    tag: &Tag,
    generation: u64,
    outcome: Result<Value, (RemoteError, u32)>,
    options: QueryOptions,
  ) -> Result<Value, CacheError> {
    let mut state = self.lock();
    let current = state
      .in_flight
      .get(tag)
      .is_some_and(|f| f.generation == generation);
    if current {
      state.in_flight.remove(tag);
    }

    match outcome {
      Ok(data) => {
        if !current {
          debug!(%tag, generation, "discarding superseded response");
          return Ok(data);
        }
        if let Some(previous) = state.store.get(tag) {
          if previous.optimistic && previous.data != data {
            info!(%tag, "authoritative data replaced optimistic value");
            self.events.emit(CacheEvent::ConflictResolved { tag: tag.clone() });
          }
        }
        let now = self.clock.now();
        state
          .store
          .set(tag.clone(), data.clone(), now, options.stale_time, options.gc_time);
        state.notify(tag);
        debug!(%tag, generation, "fetch settled");
        Ok(data)
      }
      Err((source, attempts)) => {
        if current {
          if let Some(entry) = state.store.get_mut(tag) {
            entry.in_flight = false;
            entry.retry_count = attempts;
          }
        }
        warn!(%tag, attempts, error = %source, "fetch failed");
        self.events.emit(CacheEvent::FetchFailed {
          tag: tag.clone(),
          attempts,
          error: source.to_string(),
        });
        Err(CacheError::Network {
          tag: tag.clone(),
          attempts,
          source,
        })
      }
    }
  }

  /// Start a fresh fetch with the tag's registered fetcher, replacing any
  /// fetch already in flight.
  fn refetch(self: &Arc<Self>, state: &mut State, tag: &Tag) {
    state.cancel(tag);
    if state.holds.contains_key(tag) {
      debug!(%tag, "held by a pending mutation, left stale");
      return;
    }
    match state.fetchers.get(tag).cloned() {
      Some(registered) => {
        let _ = self.start_fetch(state, tag, registered);
      }
      None => debug!(%tag, "no fetcher registered, left stale"),
    }
  }

  /// Invalidate every entry matching any pattern.
  ///
  /// Entries backing a mounted view (or all of them, when `force` is set) are
  /// refetched right away; the rest are only marked stale. In-flight fetches
  /// on matched tags are discarded either way so a response computed before
  /// the invalidation cannot land afterwards.
  pub(crate) fn invalidate(self: &Arc<Self>, state: &mut State, patterns: &[TagPattern], force: bool) -> Vec<Tag> {
    let matches = |tag: &Tag| patterns.iter().any(|p| p.matches(tag));

    let State {
      store, observers, ..
    } = &mut *state;
    let active = |tag: &Tag| force || observers.contains_key(tag);
    let mut forced = store.match_invalidate(|t| matches(t) && active(t), InvalidateMode::ForceRefetch);
    let stale = store.match_invalidate(|t| matches(t) && !active(t), InvalidateMode::MarkStale);

    let loading: Vec<Tag> = state
      .in_flight
      .keys()
      .filter(|t| matches(t) && !state.store.contains(t))
      .cloned()
      .collect();

    for tag in &stale {
      state.cancel(tag);
      state.notify(tag);
    }
    for tag in loading {
      if force || state.is_observed(&tag) {
        forced.push(tag);
      } else {
        state.cancel(&tag);
      }
    }
    for tag in &forced {
      self.refetch(state, tag);
      state.notify(tag);
    }

    debug!(
      refetched = forced.len(),
      marked_stale = stale.len(),
      "invalidation applied"
    );
    forced.into_iter().chain(stale).collect()
  }
}

/// Shared handle to the cache. Cheap to clone.
#[derive(Clone)]
pub struct QueryClient {
  pub(crate) inner: Arc<Inner>,
}

/// Builder for `QueryClient`.
pub struct ClientBuilder {
  options: QueryOptions,
  retry: RetryPolicy,
  clock: Arc<dyn Clock>,
  events: EventBus,
  graph: RelationshipGraph,
}

impl ClientBuilder {
  pub fn options(mut self, options: QueryOptions) -> Self {
    self.options = options;
    self
  }

  pub fn stale_time(mut self, stale_time: Duration) -> Self {
    self.options.stale_time = stale_time;
    self
  }

  pub fn retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn events(mut self, events: EventBus) -> Self {
    self.events = events;
    self
  }

  pub fn graph(mut self, graph: RelationshipGraph) -> Self {
    self.graph = graph;
    self
  }

  pub fn build(self) -> QueryClient {
    QueryClient {
      inner: Arc::new(Inner {
        state: Mutex::new(State::default()),
        options: self.options,
        retry: self.retry,
        clock: self.clock,
        events: self.events,
        graph: self.graph,
      }),
    }
  }
}

impl Default for QueryClient {
  fn default() -> Self {
    Self::builder().build()
  }
}

impl QueryClient {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn builder() -> ClientBuilder {
    ClientBuilder {
      options: QueryOptions::default(),
      retry: RetryPolicy::default(),
      clock: Arc::new(TokioClock),
      events: EventBus::default(),
      graph: RelationshipGraph::default(),
    }
  }

  pub fn options(&self) -> QueryOptions {
    self.inner.options
  }

  pub fn events(&self) -> &EventBus {
    &self.inner.events
  }

  pub fn subscribe_events(&self) -> EventStream {
    self.inner.events.subscribe()
  }

  pub fn clock(&self) -> Arc<dyn Clock> {
    Arc::clone(&self.inner.clock)
  }

  // --------------------------------------------------------------------------
  // Bindings
  // --------------------------------------------------------------------------

  /// Register the remote operations for one entity kind, replacing any
  /// earlier registration.
  pub fn register(&self, binding: Arc<dyn DynBinding>) {
    let kind = binding.kind();
    self.inner.lock().bindings.insert(kind, binding);
    debug!(%kind, "binding registered");
  }

  pub fn binding(&self, kind: EntityKind) -> Result<Arc<dyn DynBinding>, CacheError> {
    self
      .inner
      .lock()
      .bindings
      .get(&kind)
      .cloned()
      .ok_or_else(|| CacheError::UnknownEntity(kind.to_string()))
  }

  // --------------------------------------------------------------------------
  // Reads
  // --------------------------------------------------------------------------

  /// Resolve a tag cache-first.
  ///
  /// 1. Fresh entry (or one held by a pending mutation): return it, no network
  /// 2. A fetch for this tag is in flight: wait on that same fetch
  /// 3. Otherwise start a fetch with retry and backoff
  /// 4. If the fetch fails and an entry exists, return it as offline data
  pub async fn resolve(
    &self,
    tag: Tag,
    fetcher: Fetcher,
    options: QueryOptions,
  ) -> Result<CacheResult<Value>, CacheError> {
    let pending = {
      let mut state = self.inner.lock();
      let registered = Registered { fetcher, options };
      state.fetchers.insert(tag.clone(), registered.clone());

      if let Some(entry) = state.store.get(&tag) {
        if state.holds.contains_key(&tag) {
          return Ok(CacheResult::optimistic(entry.data.clone(), entry.fetched_at));
        }
        if entry.is_fresh(self.inner.clock.now()) {
          trace!(%tag, "cache hit");
          return Ok(if entry.optimistic {
            CacheResult::optimistic(entry.data.clone(), entry.fetched_at)
          } else {
            CacheResult::from_cache(entry.data.clone(), entry.fetched_at)
          });
        }
      }
      self.inner.join_or_start(&mut state, &tag, registered)
    };

    let outcome = pending.await;

    let state = self.inner.lock();
    match outcome {
      Ok(data) => Ok(match state.store.get(&tag) {
        Some(entry) if entry.optimistic => {
          CacheResult::optimistic(entry.data.clone(), entry.fetched_at)
        }
        _ => CacheResult::from_network(data),
      }),
      Err(err @ CacheError::Network { .. }) => match state.store.get(&tag) {
        Some(entry) => Ok(CacheResult::offline(entry.data.clone(), entry.fetched_at, err)),
        None => Err(err),
      },
      Err(err) => Err(err),
    }
  }

  /// Resolve a list page through the registered binding.
  pub async fn resolve_list(
    &self,
    kind: EntityKind,
    params: &ListParams,
  ) -> Result<CacheResult<Value>, CacheError> {
    let binding = self.binding(kind)?;
    let tag = Tag::list(kind, params);
    self.inner.lock().list_params.insert(tag.clone(), params.clone());
    self
      .resolve(tag, list_fetcher(binding, params.clone()), self.inner.options)
      .await
  }

  /// Resolve one record through the registered binding.
  pub async fn resolve_by_id(&self, kind: EntityKind, id: &str) -> Result<CacheResult<Value>, CacheError> {
    let binding = self.binding(kind)?;
    let tag = Tag::detail(kind, id);
    self
      .resolve(tag, detail_fetcher(binding, id.to_string()), self.inner.options)
      .await
  }

  /// Resolve a parent's child collection, e.g. the teams of a line.
  ///
  /// Fetched through the child's list operation filtered on its parent key.
  pub async fn resolve_children(
    &self,
    parent: EntityKind,
    parent_id: &str,
    child: EntityKind,
    params: &ListParams,
  ) -> Result<CacheResult<Value>, CacheError> {
    let rel = self
      .inner
      .graph
      .relationship(parent, child)
      .ok_or_else(|| CacheError::UnknownEntity(format!("{parent}/{}", child.collection_name())))?;
    let binding = self.binding(child)?;
    let tag = Tag::subresource(parent, parent_id, child.collection_name(), Some(params));
    let fetch_params = params.clone().with(rel.parent_key_field, parent_id);
    self.inner.lock().list_params.insert(tag.clone(), fetch_params.clone());
    self
      .resolve(tag, list_fetcher(binding, fetch_params), self.inner.options)
      .await
  }

  /// Warm the cache for one record without subscribing to it.
  pub async fn prefetch(&self, kind: EntityKind, id: &str) -> Result<(), CacheError> {
    self.resolve_by_id(kind, id).await.map(|_| ())
  }

  /// Current data for a tag without triggering a fetch.
  pub fn peek(&self, tag: &Tag) -> Option<Value> {
    self.inner.lock().store.get(tag).map(|e| e.data.clone())
  }

  pub fn entry(&self, tag: &Tag) -> Option<CacheEntry> {
    self.inner.lock().store.get(tag).cloned()
  }

  /// Every entry, ordered by tag.
  pub fn snapshot(&self) -> Vec<CacheEntry> {
    let state = self.inner.lock();
    let mut entries: Vec<CacheEntry> = state.store.entries().cloned().collect();
    entries.sort_by(|a, b| a.tag.cmp(&b.tag));
    entries
  }

  pub fn is_fetching(&self, tag: &Tag) -> bool {
    self.inner.lock().in_flight.contains_key(tag)
  }

  // --------------------------------------------------------------------------
  // Invalidation and eviction
  // --------------------------------------------------------------------------

  /// Invalidate a record (or every record of a kind) and the kind's lists.
  ///
  /// With `force_refetch` every matched entry is refetched now; otherwise
  /// only entries backing a mounted view are.
  pub fn invalidate(&self, kind: EntityKind, id: Option<&str>, force_refetch: bool) -> Vec<Tag> {
    let mut patterns = vec![TagPattern::lists(kind)];
    patterns.push(match id {
      Some(id) => TagPattern::entity(kind, id),
      None => TagPattern::kind(kind),
    });
    self.invalidate_matching(&patterns, force_refetch)
  }

  pub fn invalidate_matching(&self, patterns: &[TagPattern], force_refetch: bool) -> Vec<Tag> {
    let mut state = self.inner.lock();
    self.inner.invalidate(&mut state, patterns, force_refetch)
  }

  /// Mark one entry stale without touching anything else.
  pub fn mark_stale(&self, tag: &Tag) {
    let mut state = self.inner.lock();
    state.store.match_invalidate(|t| t == tag, InvalidateMode::MarkStale);
  }

  /// Drop unobserved entries past their gc horizon.
  pub fn collect_garbage(&self) -> Vec<Tag> {
    let now = self.inner.clock.now();
    let mut state = self.inner.lock();
    let State {
      store,
      in_flight,
      observers,
      holds,
      fetchers,
      list_params,
      ..
    } = &mut *state;
    let evicted = store.evict_expired(now, |t| observers.contains_key(t) || holds.contains_key(t));
    // Registrations outlive their entry only while something can still use them.
    fetchers.retain(|t, _| store.contains(t) || in_flight.contains_key(t) || observers.contains_key(t));
    list_params.retain(|t, _| fetchers.contains_key(t));
    if !evicted.is_empty() {
      debug!(count = evicted.len(), "evicted expired entries");
    }
    evicted
  }

  // --------------------------------------------------------------------------
  // Observation
  // --------------------------------------------------------------------------

  /// Mark a tag as backing a mounted view until the subscription drops.
  pub fn subscribe(&self, tag: &Tag) -> Subscription {
    let mut state = self.inner.lock();
    let observed = state.observers.entry(tag.clone()).or_insert_with(|| Observed {
      count: 0,
      version: watch::channel(0).0,
    });
    observed.count += 1;
    let changes = observed.version.subscribe();
    trace!(%tag, observers = observed.count, "subscribed");
    Subscription {
      tag: tag.clone(),
      inner: Arc::downgrade(&self.inner),
      changes,
    }
  }

  pub fn is_observed(&self, tag: &Tag) -> bool {
    self.inner.lock().is_observed(tag)
  }
}

/// A mounted view's claim on a tag. Dropping it unmounts the view.
pub struct Subscription {
  tag: Tag,
  inner: Weak<Inner>,
  changes: watch::Receiver<u64>,
}

impl Subscription {
  pub fn tag(&self) -> &Tag {
    &self.tag
  }

  /// Whether the entry was written since the last call.
  pub fn take_change(&mut self) -> bool {
    match self.changes.has_changed() {
      Ok(true) => {
        self.changes.borrow_and_update();
        true
      }
      _ => false,
    }
  }

  /// Wait for the next write to the entry.
  pub async fn changed(&mut self) -> bool {
    self.changes.changed().await.is_ok()
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    let Some(inner) = self.inner.upgrade() else {
      return;
    };
    let mut state = inner.lock();
    if let Some(observed) = state.observers.get_mut(&self.tag) {
      observed.count = observed.count.saturating_sub(1);
      if observed.count == 0 {
        state.observers.remove(&self.tag);
        trace!(tag = %self.tag, "unsubscribed");
      }
    }
  }
}

pub(crate) fn list_fetcher(binding: Arc<dyn DynBinding>, params: ListParams) -> Fetcher {
  Arc::new(move || {
    let binding = Arc::clone(&binding);
    let params = params.clone();
    async move { binding.fetch_list(&params).await }.boxed()
  })
}

pub(crate) fn detail_fetcher(binding: Arc<dyn DynBinding>, id: String) -> Fetcher {
  Arc::new(move || {
    let binding = Arc::clone(&binding);
    let id = id.clone();
    async move { binding.fetch_by_id(&id).await }.boxed()
  })
}

/// Wrap an async closure as a `Fetcher`.
pub fn fetcher<F, Fut>(f: F) -> Fetcher
where
  F: Fn() -> Fut + Send + Sync + 'static,
  Fut: std::future::Future<Output = Result<Value, RemoteError>> + Send + 'static,
{
  Arc::new(move || f().boxed())
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use std::sync::atomic::{AtomicU32, Ordering};

  fn counting_fetcher(calls: Arc<AtomicU32>, value: Value) -> Fetcher {
    fetcher(move || {
      let calls = calls.clone();
      let value = value.clone();
      async move {
        calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(value)
      }
    })
  }

  fn tag() -> Tag {
    Tag::detail(EntityKind::Factory, "F1")
  }

  #[tokio::test(start_paused = true)]
  async fn test_fresh_entry_skips_network() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let f = counting_fetcher(calls.clone(), json!({ "id": "F1" }));

    let first = client.resolve(tag(), f.clone(), client.options()).await.unwrap();
    assert_eq!(first.source, crate::cache::CacheSource::Network);
    let second = client.resolve(tag(), f, client.options()).await.unwrap();
    assert_eq!(second.source, crate::cache::CacheSource::CacheFresh);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_resolves_share_one_fetch() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let f = counting_fetcher(calls.clone(), json!({ "id": "F1" }));
    let opts = client.options();

    let (a, b, c) = tokio::join!(
      client.resolve(tag(), f.clone(), opts),
      client.resolve(tag(), f.clone(), opts),
      client.resolve(tag(), f.clone(), opts),
    );

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    for result in [a, b, c] {
      assert_eq!(result.unwrap().data, json!({ "id": "F1" }));
    }
    assert!(!client.is_fetching(&tag()));
  }

  #[tokio::test(start_paused = true)]
  async fn test_stale_entry_refetches() {
    let client = QueryClient::builder().stale_time(Duration::from_secs(1)).build();
    let calls = Arc::new(AtomicU32::new(0));
    let f = counting_fetcher(calls.clone(), json!(1));

    client.resolve(tag(), f.clone(), client.options()).await.unwrap();
    tokio::time::advance(Duration::from_secs(2)).await;
    client.resolve(tag(), f, client.options()).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_failure_keeps_stale_value() {
    let client = QueryClient::builder()
      .stale_time(Duration::ZERO)
      .retry(RetryPolicy {
        max_retries: 2,
        ..RetryPolicy::default()
      })
      .build();
    client
      .resolve(tag(), fetcher(|| async { Ok(json!("good")) }), client.options())
      .await
      .unwrap();

    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let failing = fetcher(move || {
      counter.fetch_add(1, Ordering::SeqCst);
      async { Err(RemoteError::Status { code: 500, message: "boom".to_string() }) }
    });

    let result = client.resolve(tag(), failing, client.options()).await.unwrap();
    assert!(result.is_offline());
    assert_eq!(result.data, json!("good"));
    assert!(matches!(result.error, Some(CacheError::Network { attempts: 3, .. })));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(client.entry(&tag()).unwrap().retry_count, 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_failure_without_cache_is_an_error() {
    let client = QueryClient::builder().retry(RetryPolicy::none()).build();
    let failing = fetcher(|| async { Err(RemoteError::Timeout) });
    let err = client.resolve(tag(), failing, client.options()).await.unwrap_err();
    assert!(err.is_retryable());
    assert!(client.entry(&tag()).is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_collect_garbage_drops_fetchers_of_uncached_tags() {
    let client = QueryClient::builder().retry(RetryPolicy::none()).build();
    let failing = fetcher(|| async { Err(RemoteError::Timeout) });
    client.resolve(tag(), failing, client.options()).await.unwrap_err();
    assert!(client.inner.lock().fetchers.contains_key(&tag()));

    let cached = Tag::detail(EntityKind::Factory, "F2");
    client
      .resolve(cached.clone(), fetcher(|| async { Ok(json!("kept")) }), client.options())
      .await
      .unwrap();

    assert!(client.collect_garbage().is_empty());
    let state = client.inner.lock();
    assert!(!state.fetchers.contains_key(&tag()));
    assert!(state.fetchers.contains_key(&cached));
  }

  #[tokio::test(start_paused = true)]
  async fn test_cancelled_fetch_does_not_write() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let f = counting_fetcher(calls, json!("late"));

    let waiting = {
      let client = client.clone();
      let f = f.clone();
      tokio::spawn(async move { client.resolve(tag(), f, client.options()).await })
    };
    tokio::task::yield_now().await;
    assert!(client.is_fetching(&tag()));

    client.inner.lock().cancel(&tag());
    let result = waiting.await.unwrap().unwrap();
    assert_eq!(result.data, json!("late"));
    assert!(client.entry(&tag()).is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidate_refetches_only_observed() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let watched = Tag::detail(EntityKind::Factory, "F1");
    let unwatched = Tag::detail(EntityKind::Factory, "F2");
    let f = counting_fetcher(calls.clone(), json!({}));

    client.resolve(watched.clone(), f.clone(), client.options()).await.unwrap();
    client.resolve(unwatched.clone(), f.clone(), client.options()).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let mut sub = client.subscribe(&watched);
    let touched = client.invalidate(EntityKind::Factory, None, false);
    assert_eq!(touched.len(), 2);
    assert!(client.is_fetching(&watched));
    assert!(!client.is_fetching(&unwatched));

    assert!(sub.changed().await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(client.entry(&watched).unwrap().is_fresh(client.clock().now()));
    assert!(client.entry(&unwatched).unwrap().is_stale(client.clock().now()));
  }

  #[tokio::test(start_paused = true)]
  async fn test_subscription_drop_unmounts() {
    let client = QueryClient::new();
    let sub = client.subscribe(&tag());
    let second = client.subscribe(&tag());
    drop(sub);
    assert!(client.is_observed(&tag()));
    drop(second);
    assert!(!client.is_observed(&tag()));
  }

  #[tokio::test(start_paused = true)]
  async fn test_collect_garbage_keeps_observed() {
    let client = QueryClient::builder()
      .options(QueryOptions {
        stale_time: Duration::from_secs(1),
        gc_time: Duration::from_secs(10),
      })
      .build();
    let other = Tag::detail(EntityKind::Factory, "F2");
    let f = fetcher(|| async { Ok(json!({})) });
    client.resolve(tag(), f.clone(), client.options()).await.unwrap();
    client.resolve(other.clone(), f, client.options()).await.unwrap();

    let _sub = client.subscribe(&tag());
    tokio::time::advance(Duration::from_secs(11)).await;
    assert_eq!(client.collect_garbage(), vec![other]);
    assert!(client.entry(&tag()).is_some());
  }
}
