//! Async query handle over the shared cache.
//!
//! Inspired by TanStack Query, a `Query<T>` binds one tag to a view: it
//! resolves the tag through the `QueryClient`, tracks loading/success/error
//! state, and keeps the tag mounted for as long as the handle lives, so
//! cascades refetch it eagerly instead of just marking it stale.
//!
//! # Example
//!
//! ```ignore
//! let mut teams: Query<Page<Team>> = Query::list(&client, EntityKind::Team, &params)?;
//!
//! // Start fetching
//! teams.fetch();
//!
//! // In event loop tick
//! if teams.poll() {
//!     // State changed, trigger re-render
//! }
//!
//! // In render
//! match teams.state() {
//!     QueryState::Loading => render_spinner(),
//!     QueryState::Success(page) => render_rows(page),
//!     QueryState::Degraded { data, error } => render_stale(data, error),
//!     QueryState::Error(e) => render_error(e),
//!     QueryState::Idle => {}
//! }
//! ```

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::cache::{
  detail_fetcher, list_fetcher, CacheResult, Fetcher, ListParams, QueryClient, QueryOptions, Subscription, Tag,
};
use crate::error::CacheError;
use crate::models::EntityKind;

/// The state of a query
#[derive(Debug, Clone, PartialEq)]
pub enum QueryState<T> {
  /// Query has not been started, or its entry was purged
  Idle,
  /// Query is fetching and has no data yet
  Loading,
  /// Query has data
  Success(T),
  /// The last fetch failed; showing the last known good data
  Degraded { data: T, error: String },
  /// Query failed with nothing cached
  Error(String),
}

impl<T> QueryState<T> {
  pub fn is_loading(&self) -> bool {
    matches!(self, QueryState::Loading)
  }

  pub fn is_success(&self) -> bool {
    matches!(self, QueryState::Success(_))
  }

  pub fn is_degraded(&self) -> bool {
    matches!(self, QueryState::Degraded { .. })
  }

  pub fn is_error(&self) -> bool {
    matches!(self, QueryState::Error(_))
  }

  pub fn data(&self) -> Option<&T> {
    match self {
      QueryState::Success(data) | QueryState::Degraded { data, .. } => Some(data),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&str> {
    match self {
      QueryState::Error(e) | QueryState::Degraded { error: e, .. } => Some(e),
      _ => None,
    }
  }
}

type Settled = Result<CacheResult<Value>, CacheError>;

/// Poll-driven handle on one cached tag.
pub struct Query<T> {
  client: QueryClient,
  tag: Tag,
  fetcher: Fetcher,
  options: QueryOptions,
  subscription: Subscription,
  state: QueryState<T>,
  receiver: Option<mpsc::UnboundedReceiver<Settled>>,
  fetched_at: Option<Instant>,
}

impl<T: DeserializeOwned> Query<T> {
  /// Create a query for `tag`, fetched with `fetcher` on a miss.
  ///
  /// The tag counts as mounted from here until the query is dropped.
  pub fn new(client: &QueryClient, tag: Tag, fetcher: Fetcher) -> Self {
    Self {
      subscription: client.subscribe(&tag),
      client: client.clone(),
      tag,
      fetcher,
      options: client.options(),
      state: QueryState::Idle,
      receiver: None,
      fetched_at: None,
    }
  }

  /// A list page fetched through the kind's registered binding.
  pub fn list(client: &QueryClient, kind: EntityKind, params: &ListParams) -> Result<Self, CacheError> {
    let binding = client.binding(kind)?;
    Ok(Self::new(client, Tag::list(kind, params), list_fetcher(binding, params.clone())))
  }

  /// One record fetched through the kind's registered binding.
  pub fn detail(client: &QueryClient, kind: EntityKind, id: &str) -> Result<Self, CacheError> {
    let binding = client.binding(kind)?;
    Ok(Self::new(client, Tag::detail(kind, id), detail_fetcher(binding, id.to_string())))
  }

  /// Override the client's freshness settings for this query.
  pub fn with_options(mut self, options: QueryOptions) -> Self {
    self.options = options;
    self
  }

  pub fn tag(&self) -> &Tag {
    &self.tag
  }

  /// Get the current state of the query.
  pub fn state(&self) -> &QueryState<T> {
    &self.state
  }

  pub fn data(&self) -> Option<&T> {
    self.state.data()
  }

  pub fn error(&self) -> Option<&str> {
    self.state.error()
  }

  pub fn is_loading(&self) -> bool {
    self.state.is_loading()
  }

  /// A fetch is running, possibly in the background behind shown data.
  pub fn is_fetching(&self) -> bool {
    self.receiver.is_some()
  }

  /// When the shown data was fetched, if it came from the cache.
  pub fn fetched_at(&self) -> Option<Instant> {
    self.fetched_at
  }

  /// Check if the cached data is past its stale time, or missing.
  pub fn is_stale(&self) -> bool {
    let now = self.client.clock().now();
    self.client.entry(&self.tag).map_or(true, |e| e.is_stale(now))
  }

  /// Start resolving the tag if not already doing so.
  pub fn fetch(&mut self) {
    if self.receiver.is_some() {
      return;
    }
    self.start_fetch();
  }

  /// Mark the entry stale and resolve it again, keeping shown data meanwhile.
  pub fn refetch(&mut self) {
    self.client.mark_stale(&self.tag);
    self.receiver = None;
    self.start_fetch();
  }

  /// Pick up the result of our own fetch and any writes other code made to
  /// the entry (optimistic patches, cascades, purges).
  ///
  /// Returns `true` if the state may have changed. Call this in your event
  /// loop tick handler.
  pub fn poll(&mut self) -> bool {
    let mut changed = self.poll_fetch();
    if self.receiver.is_none() && self.subscription.take_change() {
      self.sync_from_cache();
      changed = true;
    }
    changed
  }

  fn poll_fetch(&mut self) -> bool {
    let Some(receiver) = &mut self.receiver else {
      return false;
    };
    let settled = match receiver.try_recv() {
      Ok(settled) => settled,
      Err(mpsc::error::TryRecvError::Empty) => return false,
      Err(mpsc::error::TryRecvError::Disconnected) => Err(CacheError::Cancelled(self.tag.clone())),
    };
    self.receiver = None;

    self.state = match settled.and_then(|result| result.decode::<T>()) {
      Ok(result) => {
        self.fetched_at = result.fetched_at.or_else(|| Some(self.client.clock().now()));
        match result.error {
          Some(error) => QueryState::Degraded {
            data: result.data,
            error: error.to_string(),
          },
          None => QueryState::Success(result.data),
        }
      }
      Err(error) => QueryState::Error(error.to_string()),
    };
    true
  }

  fn sync_from_cache(&mut self) {
    match self.client.entry(&self.tag) {
      Some(entry) => match serde_json::from_value::<T>(entry.data) {
        Ok(data) => {
          self.fetched_at = Some(entry.fetched_at);
          self.state = QueryState::Success(data);
        }
        Err(error) => self.state = QueryState::Error(CacheError::from(error).to_string()),
      },
      None => {
        self.fetched_at = None;
        self.state = QueryState::Idle;
      }
    }
  }

  fn start_fetch(&mut self) {
    let (tx, rx) = mpsc::unbounded_channel();
    self.receiver = Some(rx);
    if self.state.data().is_none() {
      self.state = QueryState::Loading;
    }

    let client = self.client.clone();
    let tag = self.tag.clone();
    let fetcher = self.fetcher.clone();
    let options = self.options;
    tokio::spawn(async move {
      let result = client.resolve(tag, fetcher, options).await;
      // Ignore send errors - the query may have been dropped
      let _ = tx.send(result);
    });
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Query<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Query")
      .field("tag", &self.tag)
      .field("state", &self.state)
      .field("fetched_at", &self.fetched_at)
      .finish_non_exhaustive()
  }
}
