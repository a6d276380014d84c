//! In-memory cache store.

use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use super::tag::Tag;

/// A cached value for one tag with its freshness metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
  pub tag: Tag,
  pub data: Value,
  /// When the data was last written by a fetch
  pub fetched_at: Instant,
  /// Reads at or after this instant trigger a refetch
  pub stale_at: Instant,
  /// Past this instant the entry may be collected if nobody observes it
  pub gc_at: Instant,
  pub in_flight: bool,
  /// Failed attempts of the most recent fetch; reset on success
  pub retry_count: u32,
  /// Data carries an optimistic patch not yet confirmed by the remote
  pub optimistic: bool,
}

impl CacheEntry {
  pub fn is_fresh(&self, now: Instant) -> bool {
    now < self.stale_at
  }

  pub fn is_stale(&self, now: Instant) -> bool {
    !self.is_fresh(now)
  }
}

/// How `match_invalidate` treats matched entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidateMode {
  /// Refetch deferred until the next read
  MarkStale,
  /// Marked stale and refetched right away by the caller
  ForceRefetch,
}

/// Map from tag to entry.
///
/// Entries are only dropped through `remove` or `evict_expired`; invalidation
/// never deletes data.
#[derive(Debug, Default)]
pub struct CacheStore {
  entries: HashMap<Tag, CacheEntry>,
}

impl CacheStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, tag: &Tag) -> Option<&CacheEntry> {
    self.entries.get(tag)
  }

  pub fn get_mut(&mut self, tag: &Tag) -> Option<&mut CacheEntry> {
    self.entries.get_mut(tag)
  }

  pub fn contains(&self, tag: &Tag) -> bool {
    self.entries.contains_key(tag)
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Store fetched data. Resets the failure counter and the optimistic flag.
  pub fn set(&mut self, tag: Tag, data: Value, now: Instant, stale_time: Duration, gc_time: Duration) {
    let entry = CacheEntry {
      tag: tag.clone(),
      data,
      fetched_at: now,
      stale_at: now + stale_time,
      gc_at: now + gc_time,
      in_flight: false,
      retry_count: 0,
      optimistic: false,
    };
    self.entries.insert(tag, entry);
  }

  /// Put an entry back exactly as it was, or drop the tag if it did not exist.
  pub fn restore(&mut self, tag: &Tag, snapshot: Option<CacheEntry>) {
    match snapshot {
      Some(entry) => {
        self.entries.insert(tag.clone(), entry);
      }
      None => {
        self.entries.remove(tag);
      }
    }
  }

  pub fn remove(&mut self, tag: &Tag) -> Option<CacheEntry> {
    self.entries.remove(tag)
  }

  pub fn tags(&self) -> impl Iterator<Item = &Tag> {
    self.entries.keys()
  }

  pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
    self.entries.values()
  }

  /// Tags of every entry the predicate accepts, in a stable order.
  pub fn tags_matching<P>(&self, predicate: P) -> Vec<Tag>
  where
    P: Fn(&Tag) -> bool,
  {
    let mut tags: Vec<Tag> = self.entries.keys().filter(|t| predicate(t)).cloned().collect();
    tags.sort();
    tags
  }

  /// Mark every matching entry stale and return the matched tags.
  ///
  /// Staleness is pinned to `fetched_at`, so repeating the call leaves the
  /// store in the same state. For `ForceRefetch` the caller starts the fetches.
  pub fn match_invalidate<P>(&mut self, predicate: P, mode: InvalidateMode) -> Vec<Tag>
  where
    P: Fn(&Tag) -> bool,
  {
    let tags = self.tags_matching(predicate);
    for tag in &tags {
      if let Some(entry) = self.entries.get_mut(tag) {
        entry.stale_at = entry.fetched_at;
      }
    }
    tracing::trace!(count = tags.len(), ?mode, "invalidated entries");
    tags
  }

  /// Drop entries past their gc horizon unless `keep` says otherwise.
  pub fn evict_expired<K>(&mut self, now: Instant, keep: K) -> Vec<Tag>
  where
    K: Fn(&Tag) -> bool,
  {
    let expired = self.tags_matching(|tag| {
      self
        .entries
        .get(tag)
        .is_some_and(|e| now >= e.gc_at && !e.in_flight)
        && !keep(tag)
    });
    for tag in &expired {
      self.entries.remove(tag);
    }
    expired
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::tag::{ListParams, TagPattern};
  use crate::models::EntityKind;
  use serde_json::json;

  const MINUTE: Duration = Duration::from_secs(60);

  fn team(id: &str) -> Tag {
    Tag::detail(EntityKind::Team, id)
  }

  #[test]
  fn test_set_and_get() {
    let mut store = CacheStore::new();
    let now = Instant::now();
    store.set(team("t-1"), json!({"id": "t-1"}), now, MINUTE, 5 * MINUTE);

    let entry = store.get(&team("t-1")).unwrap();
    assert_eq!(entry.data["id"], "t-1");
    assert!(entry.is_fresh(now));
    assert!(entry.is_stale(now + MINUTE));
    assert!(store.get(&team("t-2")).is_none());
  }

  #[test]
  fn test_invalidate_marks_stale_without_dropping() {
    let mut store = CacheStore::new();
    let now = Instant::now();
    store.set(team("t-1"), json!(1), now, MINUTE, MINUTE);
    store.set(team("t-2"), json!(2), now, MINUTE, MINUTE);

    let pattern = TagPattern::entity(EntityKind::Team, "t-1");
    let matched = store.match_invalidate(|t| pattern.matches(t), InvalidateMode::MarkStale);

    assert_eq!(matched, vec![team("t-1")]);
    assert!(store.get(&team("t-1")).unwrap().is_stale(now));
    assert_eq!(store.get(&team("t-1")).unwrap().data, json!(1));
    assert!(store.get(&team("t-2")).unwrap().is_fresh(now));
  }

  #[test]
  fn test_invalidate_is_idempotent() {
    let mut store = CacheStore::new();
    let now = Instant::now();
    store.set(team("t-1"), json!(1), now, MINUTE, MINUTE);
    let list = Tag::list(EntityKind::Team, &ListParams::new());
    store.set(list.clone(), json!({"data": []}), now, MINUTE, MINUTE);

    let pattern = TagPattern::lists(EntityKind::Team);
    store.match_invalidate(|t| pattern.matches(t), InvalidateMode::MarkStale);
    let once = store.get(&list).cloned();
    store.match_invalidate(|t| pattern.matches(t), InvalidateMode::MarkStale);
    assert_eq!(store.get(&list).cloned(), once);
  }

  #[test]
  fn test_restore_absent_removes() {
    let mut store = CacheStore::new();
    let now = Instant::now();
    store.set(team("t-1"), json!(1), now, MINUTE, MINUTE);
    store.restore(&team("t-1"), None);
    assert!(store.is_empty());
  }

  #[test]
  fn test_evict_expired_respects_keep() {
    let mut store = CacheStore::new();
    let now = Instant::now();
    store.set(team("t-1"), json!(1), now, MINUTE, MINUTE);
    store.set(team("t-2"), json!(2), now, MINUTE, MINUTE);

    let evicted = store.evict_expired(now + MINUTE, |t| *t == team("t-2"));
    assert_eq!(evicted, vec![team("t-1")]);
    assert!(store.contains(&team("t-2")));
  }
}
