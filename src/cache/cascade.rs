//! Invalidation cascade: which tags a mutation makes stale, and which it purges.

use serde_json::Value;
use std::collections::BTreeSet;

use super::graph::RelationshipGraph;
use super::mutation::MutationKind;
use super::patch;
use super::store::CacheStore;
use super::tag::TagPattern;
use crate::models::EntityKind;

/// Identity of a mutated record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CascadeTarget {
  pub kind: EntityKind,
  pub id: String,
  pub operation: MutationKind,
  /// Parent ids known for the record; more than one when an update moved it
  pub parent_ids: Vec<String>,
}

/// Child rows to strip from list entries after their parent is deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowPrune {
  pub rows_of: EntityKind,
  pub field: &'static str,
  pub parent_id: String,
}

/// Output of the resolver, applied by the mutation coordinator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cascade {
  /// Mark stale, or refetch when a view is mounted on them
  pub invalidate: Vec<TagPattern>,
  /// Remove outright
  pub purge: Vec<TagPattern>,
  pub prune: Vec<RowPrune>,
}

impl Cascade {
  fn invalidate(&mut self, pattern: TagPattern) {
    if !self.invalidate.contains(&pattern) {
      self.invalidate.push(pattern);
    }
  }

  fn purge(&mut self, pattern: TagPattern) {
    if !self.purge.contains(&pattern) {
      self.purge.push(pattern);
    }
  }
}

/// Compute the cascade for a mutation against the current cache contents.
pub fn resolve(graph: &RelationshipGraph, store: &CacheStore, target: &CascadeTarget) -> Cascade {
  let mut cascade = Cascade::default();

  cascade.invalidate(TagPattern::lists(target.kind));
  if let Some(rel) = graph.parent_of(target.kind) {
    for parent_id in &target.parent_ids {
      cascade.invalidate(TagPattern::children(rel.parent, parent_id.as_str(), target.kind));
    }
  }

  match target.operation {
    MutationKind::Delete => {
      let mut visited = BTreeSet::new();
      purge_subtree(graph, store, target.kind, &target.id, &mut cascade, &mut visited);
    }
    MutationKind::Create | MutationKind::Update => {
      cascade.invalidate(TagPattern::entity(target.kind, target.id.as_str()));
    }
  }

  cascade
}

/// Purge a record and, transitively, every child record that points at it.
fn purge_subtree(
  graph: &RelationshipGraph,
  store: &CacheStore,
  kind: EntityKind,
  id: &str,
  cascade: &mut Cascade,
  visited: &mut BTreeSet<(EntityKind, String)>,
) {
  if !visited.insert((kind, id.to_string())) {
    return;
  }
  cascade.purge(TagPattern::entity(kind, id));

  for rel in graph.children_of(kind) {
    cascade.invalidate(TagPattern::lists(rel.child));
    cascade.prune.push(RowPrune {
      rows_of: rel.child,
      field: rel.parent_key_field,
      parent_id: id.to_string(),
    });
    for child_id in cached_children(store, rel.child, rel.parent_key_field, id) {
      purge_subtree(graph, store, rel.child, &child_id, cascade, visited);
    }
  }
}

/// Ids of cached `child` records whose `field` points at `parent_id`, found in
/// detail entries and in any list holding child rows.
fn cached_children(store: &CacheStore, child: EntityKind, field: &str, parent_id: &str) -> BTreeSet<String> {
  let mut ids = BTreeSet::new();
  for entry in store.entries() {
    let tag = &entry.tag;
    if tag.is_detail() && tag.kind() == Some(child) {
      if entry.data.get(field).and_then(Value::as_str) == Some(parent_id) {
        if let Some(id) = tag.id() {
          ids.insert(id.to_string());
        }
      }
    } else if tag.holds_rows_of(child) {
      ids.extend(patch::row_ids_where(&entry.data, field, parent_id));
    }
  }
  ids
}

/// Parent ids of a record known from the payload and the cache.
///
/// Looks at the payload's parent key first, then the cached detail entry, then
/// any cached list row for the record.
pub fn known_parent_ids(
  graph: &RelationshipGraph,
  store: &CacheStore,
  kind: EntityKind,
  id: Option<&str>,
  payload: Option<&Value>,
) -> Vec<String> {
  let Some(rel) = graph.parent_of(kind) else {
    return Vec::new();
  };
  let field = rel.parent_key_field;
  let mut ids = BTreeSet::new();

  if let Some(parent) = payload.and_then(|p| p.get(field)).and_then(Value::as_str) {
    ids.insert(parent.to_string());
  }

  if let Some(id) = id {
    for entry in store.entries() {
      let tag = &entry.tag;
      let record = if tag.is_detail() && tag.kind() == Some(kind) && tag.id() == Some(id) {
        Some(&entry.data)
      } else if tag.holds_rows_of(kind) {
        patch::find_row(&entry.data, id)
      } else {
        None
      };
      if let Some(parent) = record.and_then(|r| r.get(field)).and_then(Value::as_str) {
        ids.insert(parent.to_string());
      }
    }
  }

  ids.into_iter().collect()
}
