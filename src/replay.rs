//! Scripted sessions against the in-memory remote.
//!
//! A script seeds records per kind, then runs steps in order. Every step
//! reports its outcome plus the cache events it produced, so a session can be
//! inspected without a UI.
//!
//! ```yaml
//! seed:
//!   line: [{ id: L1, factoryId: F1, name: Line 1, code: L1 }]
//! filters:
//!   kind: team
//! steps:
//!   - children: { parent: line, id: L1, child: team }
//!   - create: { kind: team, payload: { lineId: L1, name: T-09, code: T09 } }
//!   - filter: { field: search, value: abc }
//!   - settle
//! ```

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::cache::{CacheResult, ListParams, Mutation, MutationOptions, MutationOutcome, QueryClient, Subscription, Tag};
use crate::config::Config;
use crate::error::{CacheError, RemoteError};
use crate::event::{CacheEvent, EventStream};
use crate::filter::{FieldClass, FilterCommit, FilterMachine, SortOrder};
use crate::models::EntityKind;
use crate::remote::{self, Op, RemoteControl};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Script {
  /// Records each remote starts with
  pub seed: BTreeMap<EntityKind, Vec<Value>>,
  /// List view driven by the filter steps
  pub filters: Option<FilterView>,
  pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilterView {
  pub kind: EntityKind,
  /// Field classes; undeclared fields are classed by value type
  #[serde(default)]
  pub fields: BTreeMap<String, FieldKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
  Debounced,
  Immediate,
}

fn optimistic() -> bool {
  true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
  List {
    kind: EntityKind,
    #[serde(default)]
    params: ListParams,
  },
  Get {
    kind: EntityKind,
    id: String,
  },
  Children {
    parent: EntityKind,
    id: String,
    child: EntityKind,
    #[serde(default)]
    params: ListParams,
  },
  Prefetch {
    kind: EntityKind,
    id: String,
  },
  Create {
    kind: EntityKind,
    payload: Value,
    #[serde(default = "optimistic")]
    optimistic: bool,
  },
  Update {
    kind: EntityKind,
    id: String,
    patch: Value,
    #[serde(default = "optimistic")]
    optimistic: bool,
  },
  Delete {
    kind: EntityKind,
    id: String,
    #[serde(default = "optimistic")]
    optimistic: bool,
  },
  Invalidate {
    kind: EntityKind,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    force: bool,
  },
  /// Mount a view on a detail tag, or on a list tag when no id is given
  Mount {
    kind: EntityKind,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    params: ListParams,
  },
  Unmount {
    kind: EntityKind,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    params: ListParams,
  },
  Filter {
    field: String,
    value: Value,
  },
  Paginate {
    page: u64,
    limit: u64,
  },
  Sort {
    #[serde(default)]
    by: Option<String>,
    #[serde(default)]
    order: SortOrder,
  },
  ResetFilters,
  /// Wait out the filter debounce window
  Settle,
  Sleep {
    ms: u64,
  },
  FailNext {
    kind: EntityKind,
    op: Op,
    #[serde(default = "one")]
    times: usize,
    #[serde(default = "server_error")]
    status: u16,
  },
  Latency {
    kind: EntityKind,
    ms: u64,
  },
  Gc,
  Snapshot,
}

fn one() -> usize {
  1
}

fn server_error() -> u16 {
  500
}

/// What one step did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepReport {
  pub step: String,
  pub outcome: Value,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub events: Vec<String>,
}

pub struct Replay {
  client: QueryClient,
  remotes: HashMap<EntityKind, Arc<dyn RemoteControl>>,
  filters: Option<(EntityKind, FilterMachine)>,
  mounted: HashMap<Tag, Subscription>,
  events: EventStream,
}

impl Replay {
  pub fn new(config: &Config) -> Self {
    let client = config.client_builder().build();
    let remotes = EntityKind::ALL
      .iter()
      .map(|kind| (*kind, remote::install(&client, *kind)))
      .collect();
    let events = client.subscribe_events();
    Self {
      client,
      remotes,
      filters: None,
      mounted: HashMap::new(),
      events,
    }
  }

  pub fn client(&self) -> &QueryClient {
    &self.client
  }

  pub fn remote(&self, kind: EntityKind) -> Result<&Arc<dyn RemoteControl>> {
    self
      .remotes
      .get(&kind)
      .ok_or_else(|| eyre!("No remote installed for {}", kind))
  }

  pub fn load_script(path: &Path) -> Result<Script> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read script {}: {}", path.display(), e))?;
    serde_yaml::from_str(&contents).map_err(|e| eyre!("Failed to parse script {}: {}", path.display(), e))
  }

  /// Seed the remotes and run every step.
  pub async fn run(&mut self, script: &Script, config: &Config) -> Result<Vec<StepReport>> {
    for (kind, rows) in &script.seed {
      self
        .remote(*kind)?
        .seed_json(rows)
        .map_err(|e| eyre!("Failed to seed {}: {}", kind, e))?;
      debug!(%kind, rows = rows.len(), "seeded remote");
    }

    if let Some(view) = &script.filters {
      let machine = view.fields.iter().fold(
        FilterMachine::new(config.filters.clone()).with_events(self.client.events().clone()),
        |machine, (field, kind)| {
          let class = match kind {
            FieldKind::Debounced => FieldClass::Debounced,
            FieldKind::Immediate => FieldClass::Immediate,
          };
          machine.with_field(field.as_str(), class)
        },
      );
      self.filters = Some((view.kind, machine));
    }

    let mut reports = Vec::with_capacity(script.steps.len());
    for (i, step) in script.steps.iter().enumerate() {
      info!(index = i + 1, ?step, "replaying step");
      let outcome = self.step(step).await?;
      // Let spawned refetches started by this step land before reporting
      tokio::task::yield_now().await;
      let events = self.events.drain().iter().map(describe_event).collect();
      reports.push(StepReport {
        step: step_name(step),
        outcome,
        events,
      });
    }
    Ok(reports)
  }

  async fn step(&mut self, step: &Step) -> Result<Value> {
    let client = self.client.clone();
    let outcome = match step {
      Step::List { kind, params } => read(client.resolve_list(*kind, params).await),
      Step::Get { kind, id } => read(client.resolve_by_id(*kind, id).await),
      Step::Children {
        parent,
        id,
        child,
        params,
      } => read(client.resolve_children(*parent, id, *child, params).await),
      Step::Prefetch { kind, id } => match client.prefetch(*kind, id).await {
        Ok(()) => json!({ "prefetched": Tag::detail(*kind, id.as_str()).to_string() }),
        Err(e) => failure(&e),
      },
      Step::Create {
        kind,
        payload,
        optimistic,
      } => {
        let mutation = Mutation::Create(payload.clone());
        written(client.mutate_with(*kind, mutation, MutationOptions { optimistic: *optimistic }).await)
      }
      Step::Update {
        kind,
        id,
        patch,
        optimistic,
      } => {
        let mutation = Mutation::Update {
          id: id.clone(),
          patch: patch.clone(),
        };
        written(client.mutate_with(*kind, mutation, MutationOptions { optimistic: *optimistic }).await)
      }
      Step::Delete { kind, id, optimistic } => {
        let mutation = Mutation::Delete { id: id.clone() };
        written(client.mutate_with(*kind, mutation, MutationOptions { optimistic: *optimistic }).await)
      }
      Step::Invalidate { kind, id, force } => {
        let tags = client.invalidate(*kind, id.as_deref(), *force);
        json!({ "invalidated": tag_names(&tags) })
      }
      Step::Mount { kind, id, params } => {
        let tag = view_tag(*kind, id.as_deref(), params);
        let subscription = client.subscribe(&tag);
        self.mounted.insert(tag.clone(), subscription);
        json!({ "mounted": tag.to_string() })
      }
      Step::Unmount { kind, id, params } => {
        let tag = view_tag(*kind, id.as_deref(), params);
        let was_mounted = self.mounted.remove(&tag).is_some();
        json!({ "unmounted": tag.to_string(), "was_mounted": was_mounted })
      }
      Step::Filter { field, value } => {
        let committed = self.filter_machine()?.update_filter(field, value.clone());
        self.after_filter(committed).await?
      }
      Step::Paginate { page, limit } => {
        let committed = self.filter_machine()?.update_pagination(*page, *limit);
        self.after_filter(committed).await?
      }
      Step::Sort { by, order } => {
        let committed = self.filter_machine()?.update_sort(by.as_deref(), *order);
        self.after_filter(committed).await?
      }
      Step::ResetFilters => {
        let committed = self.filter_machine()?.reset_filters();
        self.after_filter(committed).await?
      }
      Step::Settle => {
        let committed = self.filter_machine()?.settle().await;
        self.after_filter(committed).await?
      }
      Step::Sleep { ms } => {
        tokio::time::sleep(Duration::from_millis(*ms)).await;
        json!({ "slept_ms": ms })
      }
      Step::FailNext {
        kind,
        op,
        times,
        status,
      } => {
        self.remote(*kind)?.fail_next(
          *op,
          *times,
          RemoteError::Status {
            code: *status,
            message: "injected failure".to_string(),
          },
        );
        json!({ "failing": op.to_string(), "times": times })
      }
      Step::Latency { kind, ms } => {
        self.remote(*kind)?.set_latency(Duration::from_millis(*ms));
        json!({ "latency_ms": ms })
      }
      Step::Gc => json!({ "evicted": tag_names(&client.collect_garbage()) }),
      Step::Snapshot => {
        let now = client.clock().now();
        let entries: Vec<Value> = client
          .snapshot()
          .into_iter()
          .map(|e| {
            json!({
              "tag": e.tag.to_string(),
              "fresh": e.is_fresh(now),
              "optimistic": e.optimistic,
              "data": e.data,
            })
          })
          .collect();
        Value::Array(entries)
      }
    };
    Ok(outcome)
  }

  fn filter_machine(&mut self) -> Result<&mut FilterMachine> {
    self
      .filters
      .as_mut()
      .map(|(_, machine)| machine)
      .ok_or_else(|| eyre!("Script has filter steps but no `filters` view"))
  }

  /// Resolve the list view for a filter commit.
  async fn after_filter(&mut self, committed: Result<Option<FilterCommit>, CacheError>) -> Result<Value> {
    let Some((kind, machine)) = &self.filters else {
      return Err(eyre!("Script has filter steps but no `filters` view"));
    };
    let commit = match committed {
      Ok(Some(commit)) => commit,
      Ok(None) => return Ok(json!({ "committed": false, "phase": format!("{:?}", machine.phase()) })),
      Err(e) => return Ok(failure(&e)),
    };
    let params = machine.params();
    let kind = *kind;
    let list = read(self.client.resolve_list(kind, &params).await);
    Ok(json!({
      "committed": true,
      "operation": commit.operation.to_string(),
      "page_reset": commit.page_reset,
      "params": params,
      "list": list,
    }))
  }
}

fn view_tag(kind: EntityKind, id: Option<&str>, params: &ListParams) -> Tag {
  match id {
    Some(id) => Tag::detail(kind, id),
    None => Tag::list(kind, params),
  }
}

fn read(result: Result<CacheResult<Value>, CacheError>) -> Value {
  match result {
    Ok(result) => {
      let mut out = json!({
        "source": format!("{:?}", result.source),
        "data": result.data,
      });
      if let Some(error) = &result.error {
        out["error"] = Value::String(error.to_string());
      }
      out
    }
    Err(e) => failure(&e),
  }
}

fn written(result: Result<MutationOutcome, CacheError>) -> Value {
  match result {
    Ok(outcome) => json!({
      "status": format!("{:?}", outcome.status),
      "id": outcome.entity_id,
      "invalidated": tag_names(&outcome.invalidated),
      "purged": tag_names(&outcome.purged),
    }),
    Err(e) => failure(&e),
  }
}

fn failure(error: &CacheError) -> Value {
  json!({ "error": error.to_string() })
}

fn tag_names(tags: &[Tag]) -> Vec<String> {
  tags.iter().map(Tag::to_string).collect()
}

fn step_name(step: &Step) -> String {
  let name = match step {
    Step::List { .. } => "list",
    Step::Get { .. } => "get",
    Step::Children { .. } => "children",
    Step::Prefetch { .. } => "prefetch",
    Step::Create { .. } => "create",
    Step::Update { .. } => "update",
    Step::Delete { .. } => "delete",
    Step::Invalidate { .. } => "invalidate",
    Step::Mount { .. } => "mount",
    Step::Unmount { .. } => "unmount",
    Step::Filter { .. } => "filter",
    Step::Paginate { .. } => "paginate",
    Step::Sort { .. } => "sort",
    Step::ResetFilters => "reset_filters",
    Step::Settle => "settle",
    Step::Sleep { .. } => "sleep",
    Step::FailNext { .. } => "fail_next",
    Step::Latency { .. } => "latency",
    Step::Gc => "gc",
    Step::Snapshot => "snapshot",
  };
  name.to_string()
}

fn describe_event(event: &CacheEvent) -> String {
  match event {
    CacheEvent::Committed {
      kind,
      operation,
      entity_id,
      ..
    } => format!("committed {} {} {}", operation, kind, entity_id),
    CacheEvent::RolledBack {
      kind, operation, error, ..
    } => format!("rolled back {} {}: {}", operation, kind, error),
    CacheEvent::OperationLimitExceeded {
      operation,
      count,
      ceiling,
    } => format!("operation limit exceeded for {} ({}/{})", operation, count, ceiling),
    CacheEvent::FetchFailed { tag, attempts, error } => {
      format!("fetch of {} failed after {} attempts: {}", tag, attempts, error)
    }
    CacheEvent::ConflictResolved { tag } => format!("authoritative data replaced optimistic value at {}", tag),
  }
}
