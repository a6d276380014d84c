//! Mutation coordinator: optimistic patch, remote write, then commit or rollback.
//!
//! Each mutation moves through `Pending -> Committed | RolledBack`:
//!
//! 1. Cancel in-flight fetches for every tag the patch touches
//! 2. Snapshot those entries from the current cache state
//! 3. Apply the patch and hold the tags so no fetch overwrites it
//! 4. Run the remote write
//! 5. Commit: swap provisional ids, resolve the cascade, purge and invalidate
//! 6. Or roll back: put every snapshot back exactly as it was
//!
//! Snapshots are taken from whatever the cache holds when the mutation
//! starts, including another mutation's optimistic state, so a rollback
//! restores the state immediately before this mutation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::cascade::{self, CascadeTarget};
use super::client::{QueryClient, State};
use super::patch::{self, Patch};
use super::store::CacheEntry;
use super::tag::{Tag, TagPattern};
use crate::error::{CacheError, RemoteError, ValidationError};
use crate::event::CacheEvent;
use crate::models::EntityKind;

/// Which remote write a mutation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
  Create,
  Update,
  Delete,
}

impl fmt::Display for MutationKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      MutationKind::Create => "create",
      MutationKind::Update => "update",
      MutationKind::Delete => "delete",
    };
    write!(f, "{}", s)
  }
}

/// A write against one entity kind, with its JSON payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
  Create(Value),
  Update { id: String, patch: Value },
  Delete { id: String },
}

impl Mutation {
  pub fn kind(&self) -> MutationKind {
    match self {
      Mutation::Create(_) => MutationKind::Create,
      Mutation::Update { .. } => MutationKind::Update,
      Mutation::Delete { .. } => MutationKind::Delete,
    }
  }

  /// Id of the targeted record; none for a create.
  pub fn target_id(&self) -> Option<&str> {
    match self {
      Mutation::Create(_) => None,
      Mutation::Update { id, .. } | Mutation::Delete { id } => Some(id),
    }
  }

  pub fn payload(&self) -> Option<&Value> {
    match self {
      Mutation::Create(payload) => Some(payload),
      Mutation::Update { patch, .. } => Some(patch),
      Mutation::Delete { .. } => None,
    }
  }

  /// Checks that hold for every kind, before the kind's own DTO checks.
  fn check_shape(&self) -> Result<(), ValidationError> {
    if let Some(id) = self.target_id() {
      if id.trim().is_empty() {
        return Err(ValidationError::missing("id"));
      }
    }
    match self {
      Mutation::Create(payload) if !payload.is_object() => Err(ValidationError::NotAnObject),
      Mutation::Update { patch, .. } => match patch.as_object() {
        None => Err(ValidationError::NotAnObject),
        Some(fields) if fields.is_empty() => Err(ValidationError::EmptyUpdate),
        Some(_) => Ok(()),
      },
      _ => Ok(()),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
  Pending,
  Committed,
  RolledBack,
}

/// Per-call mutation settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationOptions {
  /// Patch the cache before the remote write. When false the cache is only
  /// touched by the cascade after the write succeeds.
  pub optimistic: bool,
}

impl Default for MutationOptions {
  fn default() -> Self {
    Self { optimistic: true }
  }
}

/// Bookkeeping for a mutation between invocation and settlement.
#[derive(Debug, Clone)]
pub struct PendingMutation {
  pub id: String,
  pub kind: EntityKind,
  pub operation: MutationKind,
  /// Id of the record; provisional for a create until the remote assigns one
  pub entity_id: String,
  /// Tags patched, with what was applied to each
  pub patches: Vec<(Tag, Patch)>,
  /// Entries as they were right before the patch; `None` for absent tags
  pub snapshot: Vec<(Tag, Option<CacheEntry>)>,
  pub parent_ids: Vec<String>,
  pub status: MutationStatus,
}

/// What a settled mutation reports to its caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationOutcome {
  pub mutation_id: String,
  pub kind: EntityKind,
  pub operation: MutationKind,
  /// Authoritative id of the record (the remote's id for a create)
  pub entity_id: String,
  pub status: MutationStatus,
  /// Tags invalidated by the cascade
  pub invalidated: Vec<Tag>,
  /// Tags removed by the cascade
  pub purged: Vec<Tag>,
}

fn provisional_id() -> String {
  format!("temp-{}", Uuid::new_v4())
}

impl QueryClient {
  /// Run a mutation with the default (optimistic) options.
  pub async fn mutate(&self, kind: EntityKind, mutation: Mutation) -> Result<MutationOutcome, CacheError> {
    self.mutate_with(kind, mutation, MutationOptions::default()).await
  }

  pub async fn mutate_with(
    &self,
    kind: EntityKind,
    mutation: Mutation,
    options: MutationOptions,
  ) -> Result<MutationOutcome, CacheError> {
    let binding = self.binding(kind)?;
    mutation.check_shape()?;
    binding.validate(&mutation)?;

    let pending = self.begin(kind, &mutation, options);
    info!(
      mutation_id = %pending.id,
      %kind,
      operation = %pending.operation,
      entity_id = %pending.entity_id,
      patched = pending.patches.len(),
      "mutation started"
    );

    // The write and its settlement run on their own task so a caller that
    // stops waiting cannot leave tags held.
    let mutation_id = pending.id.clone();
    let client = self.clone();
    let task = tokio::spawn(async move {
      let result = binding.execute(&mutation).await;
      match result {
        Ok(assigned) => Ok(client.commit(pending, assigned)),
        Err(source) => Err(client.rollback(pending, source)),
      }
    });

    match task.await {
      Ok(result) => result,
      Err(join) => Err(CacheError::Remote {
        mutation_id,
        source: RemoteError::Transport(format!("mutation task failed: {join}")),
      }),
    }
  }

  /// Steps 1-3: cancel, snapshot, patch.
  fn begin(&self, kind: EntityKind, mutation: &Mutation, options: MutationOptions) -> PendingMutation {
    let mut state = self.inner.lock();
    let operation = mutation.kind();
    let entity_id = match mutation.target_id() {
      Some(id) => id.to_string(),
      None => provisional_id(),
    };
    let parent_ids = cascade::known_parent_ids(
      &self.inner.graph,
      &state.store,
      kind,
      mutation.target_id(),
      mutation.payload(),
    );

    let mut pending = PendingMutation {
      id: Uuid::new_v4().to_string(),
      kind,
      operation,
      entity_id,
      patches: Vec::new(),
      snapshot: Vec::new(),
      parent_ids,
      status: MutationStatus::Pending,
    };

    if !options.optimistic {
      return pending;
    }

    pending.patches = self.plan(&state, kind, mutation, &pending.entity_id);
    for (tag, patch) in &pending.patches {
      state.cancel(tag);
      if !pending.snapshot.iter().any(|(t, _)| t == tag) {
        pending.snapshot.push((tag.clone(), state.store.get(tag).cloned()));
      }
      if let Some(entry) = state.store.get_mut(tag) {
        if patch::apply(&mut entry.data, patch) {
          entry.optimistic = true;
        }
      }
      state.hold(tag);
      state.notify(tag);
      debug!(%tag, "optimistic patch applied");
    }
    pending
  }

  /// Which cached entries the optimistic patch touches, and how.
  fn plan(&self, state: &State, kind: EntityKind, mutation: &Mutation, entity_id: &str) -> Vec<(Tag, Patch)> {
    let store = &state.store;
    match mutation {
      Mutation::Create(payload) => {
        let mut row = payload.clone();
        if let Some(obj) = row.as_object_mut() {
          obj.insert("id".to_string(), Value::String(entity_id.to_string()));
        }
        let parent = self.inner.graph.parent_of(kind).and_then(|rel| {
          let parent_id = payload.get(rel.parent_key_field)?.as_str()?;
          Some(TagPattern::children(rel.parent, parent_id, kind))
        });
        store
          .tags_matching(|tag| {
            if !tag.holds_rows_of(kind) {
              return false;
            }
            let on_first_page = store
              .get(tag)
              .and_then(|e| e.data.get("page"))
              .and_then(Value::as_u64)
              .map_or(true, |page| page == 1);
            let in_scope = tag.is_list() || parent.as_ref().is_some_and(|p| p.matches(tag));
            in_scope && on_first_page && state.admits_row(tag, &row)
          })
          .into_iter()
          .map(|tag| (tag, Patch::InsertRow(row.clone())))
          .collect()
      }
      Mutation::Update { id, patch } => {
        let fields = patch.as_object().cloned().unwrap_or_else(Map::new);
        let detail = Tag::detail(kind, id.as_str());
        store
          .tags_matching(|tag| {
            *tag == detail
              || (tag.holds_rows_of(kind) && store.get(tag).is_some_and(|e| patch::contains_row(&e.data, id)))
          })
          .into_iter()
          .map(|tag| {
            (
              tag,
              Patch::MergeFields {
                id: id.clone(),
                fields: fields.clone(),
              },
            )
          })
          .collect()
      }
      Mutation::Delete { id } => store
        .tags_matching(|tag| tag.holds_rows_of(kind) && store.get(tag).is_some_and(|e| patch::contains_row(&e.data, id)))
        .into_iter()
        .map(|tag| (tag, Patch::RemoveRow { id: id.clone() }))
        .collect(),
    }
  }

  /// Step 5: the remote accepted the write.
  fn commit(&self, mut pending: PendingMutation, assigned: Option<String>) -> MutationOutcome {
    let mut state = self.inner.lock();
    for (tag, _) in &pending.patches {
      state.release(tag);
    }

    if let Some(real_id) = assigned.filter(|id| *id != pending.entity_id) {
      for (tag, _) in &pending.patches {
        if let Some(entry) = state.store.get_mut(tag) {
          patch::replace_id(&mut entry.data, &pending.entity_id, &real_id);
        }
        state.notify(tag);
      }
      debug!(provisional = %pending.entity_id, assigned = %real_id, "provisional id replaced");
      pending.entity_id = real_id;
    }

    if pending.operation == MutationKind::Create {
      self.populate_detail(&mut state, &pending);
    }

    let target = CascadeTarget {
      kind: pending.kind,
      id: pending.entity_id.clone(),
      operation: pending.operation,
      parent_ids: pending.parent_ids.clone(),
    };
    let resolved = cascade::resolve(&self.inner.graph, &state.store, &target);

    for prune in &resolved.prune {
      let holders = state.store.tags_matching(|t| t.holds_rows_of(prune.rows_of));
      for tag in holders {
        let removed = state
          .store
          .get_mut(&tag)
          .map(|e| patch::remove_rows_where(&mut e.data, prune.field, &prune.parent_id))
          .unwrap_or_default();
        if !removed.is_empty() {
          state.notify(&tag);
        }
      }
    }

    let purged = state
      .store
      .tags_matching(|t| resolved.purge.iter().any(|p| p.matches(t)));
    for tag in &purged {
      state.remove(tag);
    }

    let invalidated = self.inner.invalidate(&mut state, &resolved.invalidate, false);
    pending.status = MutationStatus::Committed;
    info!(
      mutation_id = %pending.id,
      kind = %pending.kind,
      entity_id = %pending.entity_id,
      invalidated = invalidated.len(),
      purged = purged.len(),
      "mutation committed"
    );

    self.inner.events.emit(CacheEvent::Committed {
      mutation_id: pending.id.clone(),
      kind: pending.kind,
      operation: pending.operation,
      entity_id: pending.entity_id.clone(),
    });

    MutationOutcome {
      mutation_id: pending.id,
      kind: pending.kind,
      operation: pending.operation,
      entity_id: pending.entity_id,
      status: pending.status,
      invalidated,
      purged,
    }
  }

  /// Seed the detail entry of a created record from the payload and its new id.
  fn populate_detail(&self, state: &mut State, pending: &PendingMutation) {
    let row = pending
      .patches
      .iter()
      .find_map(|(tag, _)| state.store.get(tag).and_then(|e| patch::find_row(&e.data, &pending.entity_id)))
      .cloned();
    let Some(row) = row else {
      return;
    };
    let tag = Tag::detail(pending.kind, pending.entity_id.as_str());
    let now = self.inner.clock.now();
    let options = self.inner.options;
    state.store.set(tag.clone(), row, now, options.stale_time, options.gc_time);
    if let Some(entry) = state.store.get_mut(&tag) {
      entry.optimistic = true;
    }
    state.notify(&tag);
  }

  /// Step 6: the remote rejected the write.
  fn rollback(&self, mut pending: PendingMutation, source: RemoteError) -> CacheError {
    let mut state = self.inner.lock();
    for (tag, snapshot) in pending.snapshot.drain(..).rev() {
      state.restore(&tag, snapshot);
    }
    for (tag, _) in &pending.patches {
      state.release(tag);
    }
    pending.status = MutationStatus::RolledBack;
    warn!(
      mutation_id = %pending.id,
      kind = %pending.kind,
      restored = pending.patches.len(),
      error = %source,
      "mutation rolled back"
    );

    self.inner.events.emit(CacheEvent::RolledBack {
      mutation_id: pending.id.clone(),
      kind: pending.kind,
      operation: pending.operation,
      error: source.to_string(),
    });

    CacheError::Remote {
      mutation_id: pending.id,
      source,
    }
  }
}
