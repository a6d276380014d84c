use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::trace;

use crate::cache::ListParams;
use crate::entity::{Created, Entity, EntityBinding, Page};
use crate::error::RemoteError;

/// Remote operations, for counters and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Op {
  List,
  Get,
  Create,
  Update,
  Delete,
}

impl fmt::Display for Op {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Op::List => "list",
      Op::Get => "get",
      Op::Create => "create",
      Op::Update => "update",
      Op::Delete => "delete",
    };
    f.write_str(s)
  }
}

#[derive(Default)]
struct Table {
  rows: Vec<Value>,
  calls: HashMap<Op, u32>,
  failures: HashMap<Op, VecDeque<RemoteError>>,
  latency: Duration,
}

/// In-process stand-in for a remote service, holding one kind's records.
///
/// Lists support equality filters on any field, a case-insensitive `search`
/// across string fields, `sortBy`/`sortOrder`, and `page`/`limit`.
pub struct MemoryBinding<T> {
  table: Mutex<Table>,
  id_prefix: String,
  next_id: AtomicU64,
  _record: PhantomData<fn() -> T>,
}

fn to_object<S: Serialize>(value: &S) -> Result<Map<String, Value>, RemoteError> {
  match serde_json::to_value(value) {
    Ok(Value::Object(map)) => Ok(map),
    Ok(_) => Err(RemoteError::Transport("record is not an object".to_string())),
    Err(e) => Err(RemoteError::Transport(e.to_string())),
  }
}

fn from_row<T: Entity>(row: &Value) -> Result<T, RemoteError> {
  serde_json::from_value(row.clone()).map_err(|e| RemoteError::Transport(e.to_string()))
}

fn compare(a: Option<&Value>, b: Option<&Value>) -> CmpOrdering {
  match (a, b) {
    (Some(Value::Number(x)), Some(Value::Number(y))) => x
      .as_f64()
      .partial_cmp(&y.as_f64())
      .unwrap_or(CmpOrdering::Equal),
    (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
    (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
    (None, Some(_)) => CmpOrdering::Less,
    (Some(_), None) => CmpOrdering::Greater,
    _ => CmpOrdering::Equal,
  }
}

fn matches_search(row: &Value, needle: &str) -> bool {
  let needle = needle.to_lowercase();
  row
    .as_object()
    .is_some_and(|obj| obj.values().filter_map(Value::as_str).any(|s| s.to_lowercase().contains(&needle)))
}

impl<T: Entity> MemoryBinding<T> {
  pub fn new() -> Self {
    Self {
      table: Mutex::new(Table::default()),
      id_prefix: T::kind().as_str().to_string(),
      next_id: AtomicU64::new(1),
      _record: PhantomData,
    }
  }

  /// Ids are assigned as `<prefix>-<n>`.
  pub fn with_ids(mut self, prefix: impl Into<String>, first: u64) -> Self {
    self.id_prefix = prefix.into();
    self.next_id = AtomicU64::new(first);
    self
  }

  pub fn with_latency(self, latency: Duration) -> Self {
    self.lock().latency = latency;
    self
  }

  pub fn into_shared(self) -> Arc<Self> {
    Arc::new(self)
  }

  fn lock(&self) -> MutexGuard<'_, Table> {
    self.table.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Insert records as-is, replacing any with the same id.
  pub fn seed(&self, records: impl IntoIterator<Item = T>) -> Result<(), RemoteError> {
    let mut table = self.lock();
    for record in records {
      let row = Value::Object(to_object(&record)?);
      let id = record.cache_key().to_string();
      match table.rows.iter_mut().find(|r| r.get("id").and_then(Value::as_str) == Some(id.as_str())) {
        Some(existing) => *existing = row,
        None => table.rows.push(row),
      }
    }
    Ok(())
  }

  /// Seed from JSON rows, each of which must decode as a full record.
  pub fn seed_json(&self, rows: &[Value]) -> Result<(), RemoteError> {
    let records = rows.iter().map(from_row).collect::<Result<Vec<T>, _>>()?;
    self.seed(records)
  }

  pub fn records(&self) -> Vec<T> {
    self.lock().rows.iter().filter_map(|row| from_row(row).ok()).collect()
  }

  pub fn len(&self) -> usize {
    self.lock().rows.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn calls(&self, op: Op) -> u32 {
    self.lock().calls.get(&op).copied().unwrap_or(0)
  }

  pub fn set_latency(&self, latency: Duration) {
    self.lock().latency = latency;
  }

  /// Make the next `times` calls of `op` fail with `error`.
  pub fn fail_next(&self, op: Op, times: usize, error: RemoteError) {
    let mut table = self.lock();
    let queue = table.failures.entry(op).or_default();
    queue.extend(std::iter::repeat(error).take(times));
  }

  /// Count the call and wait out the latency. Injected failures surface here.
  async fn enter(&self, op: Op) -> Result<(), RemoteError> {
    let (latency, failure) = {
      let mut table = self.lock();
      *table.calls.entry(op).or_insert(0) += 1;
      let failure = table.failures.get_mut(&op).and_then(VecDeque::pop_front);
      (table.latency, failure)
    };
    trace!(kind = %T::kind(), %op, "remote call");
    if !latency.is_zero() {
      tokio::time::sleep(latency).await;
    }
    match failure {
      Some(err) => Err(err),
      None => Ok(()),
    }
  }

  fn not_found(id: &str) -> RemoteError {
    RemoteError::NotFound {
      kind: T::kind().to_string(),
      id: id.to_string(),
    }
  }

  fn list_rows(&self, params: &ListParams) -> Result<Page<T>, RemoteError> {
    let table = self.lock();
    let mut rows: Vec<&Value> = table
      .rows
      .iter()
      .filter(|row| {
        params.filters().all(|(field, expected)| match (field.as_str(), expected) {
          ("search", Value::String(needle)) => matches_search(row, needle),
          (field, expected) => row.get(field) == Some(expected),
        })
      })
      .collect();

    if let Some(sort_by) = params.get_str("sortBy") {
      rows.sort_by(|a, b| compare(a.get(sort_by), b.get(sort_by)));
      if params.get_str("sortOrder") == Some("desc") {
        rows.reverse();
      }
    }

    let total = rows.len() as u64;
    let page = params.get_u64("page").unwrap_or(1).max(1);
    let limit = params.get_u64("limit").unwrap_or(total.max(1)).max(1);
    let offset = usize::try_from((page - 1).saturating_mul(limit)).unwrap_or(usize::MAX);
    let data = rows
      .into_iter()
      .skip(offset)
      .take(usize::try_from(limit).unwrap_or(usize::MAX))
      .map(from_row)
      .collect::<Result<Vec<T>, _>>()?;

    Ok(Page {
      data,
      total,
      page,
      limit,
    })
  }
}

impl<T: Entity> Default for MemoryBinding<T> {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl<T: Entity> EntityBinding for MemoryBinding<T> {
  type Record = T;

  async fn fetch_list(&self, params: &ListParams) -> Result<Page<T>, RemoteError> {
    self.enter(Op::List).await?;
    self.list_rows(params)
  }

  async fn fetch_by_id(&self, id: &str) -> Result<T, RemoteError> {
    self.enter(Op::Get).await?;
    let table = self.lock();
    let row = table
      .rows
      .iter()
      .find(|r| r.get("id").and_then(Value::as_str) == Some(id))
      .ok_or_else(|| Self::not_found(id))?;
    from_row(row)
  }

  async fn create(&self, dto: &T::Create) -> Result<Created, RemoteError> {
    self.enter(Op::Create).await?;
    let mut row = to_object(dto)?;
    let id = format!("{}-{}", self.id_prefix, self.next_id.fetch_add(1, Ordering::SeqCst));
    row.insert("id".to_string(), Value::String(id.clone()));
    let row = Value::Object(row);
    // Fill serde defaults so the row reads back as a full record
    let record: T = from_row(&row)?;
    let row = Value::Object(to_object(&record)?);
    self.lock().rows.push(row);
    Ok(Created { id })
  }

  async fn update(&self, id: &str, dto: &T::Update) -> Result<(), RemoteError> {
    self.enter(Op::Update).await?;
    let fields = to_object(dto)?;
    let mut table = self.lock();
    let row = table
      .rows
      .iter_mut()
      .find(|r| r.get("id").and_then(Value::as_str) == Some(id))
      .ok_or_else(|| Self::not_found(id))?;
    let mut merged = row.clone();
    if let Value::Object(obj) = &mut merged {
      obj.extend(fields);
    }
    let _: T = from_row(&merged)?;
    *row = merged;
    Ok(())
  }

  async fn delete(&self, id: &str) -> Result<(), RemoteError> {
    self.enter(Op::Delete).await?;
    let mut table = self.lock();
    let before = table.rows.len();
    table.rows.retain(|r| r.get("id").and_then(Value::as_str) != Some(id));
    if table.rows.len() == before {
      return Err(Self::not_found(id));
    }
    Ok(())
  }
}
