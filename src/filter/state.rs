use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::guard::{GuardLimits, OperationGuard};
use crate::cache::{Clock, ListParams, TokioClock};
use crate::error::CacheError;
use crate::event::{CacheEvent, EventBus};

/// How a field's edits reach the committed filter set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldClass {
  /// Free text; commits once the debounce window passes without edits
  Debounced,
  /// Enums, ids, toggles; commits on the spot
  Immediate,
}

impl FieldClass {
  /// Class for a field nobody declared: strings are debounced.
  fn infer(value: &Value) -> Self {
    match value {
      Value::String(_) => FieldClass::Debounced,
      _ => FieldClass::Immediate,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
  Idle,
  Debouncing,
  Committing,
}

/// Counted operation types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationType {
  Filter,
  Pagination,
  Reset,
}

impl OperationType {
  pub fn as_str(&self) -> &'static str {
    match self {
      OperationType::Filter => "filter",
      OperationType::Pagination => "pagination",
      OperationType::Reset => "reset",
    }
  }
}

impl fmt::Display for OperationType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
  #[default]
  Asc,
  Desc,
}

impl SortOrder {
  pub fn as_str(&self) -> &'static str {
    match self {
      SortOrder::Asc => "asc",
      SortOrder::Desc => "desc",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pagination {
  pub page: u64,
  pub limit: u64,
  pub sort_by: Option<String>,
  pub sort_order: SortOrder,
}

/// Timing and ceilings for a filter machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
  #[serde(with = "crate::cache::millis", rename = "debounce_ms")]
  pub debounce: Duration,
  pub default_limit: u64,
  #[serde(flatten)]
  pub guard: GuardLimits,
}

impl Default for FilterConfig {
  fn default() -> Self {
    Self {
      debounce: Duration::from_millis(300),
      default_limit: 10,
      guard: GuardLimits::default(),
    }
  }
}

/// Raw input, committed values and pagination.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterState {
  pub raw: BTreeMap<String, Value>,
  pub committed: BTreeMap<String, Value>,
  pub pagination: Pagination,
}

/// A change to the committed state, to be turned into a new list query.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterCommit {
  pub operation: OperationType,
  pub filters: BTreeMap<String, Value>,
  pub pagination: Pagination,
  /// Page went back to 1 as part of this commit
  pub page_reset: bool,
}

/// Debounced filter and pagination state for one list view.
///
/// Poll-driven: edits return immediately, and `tick` (or `settle`) commits
/// debounced edits once their window has passed.
pub struct FilterMachine {
  config: FilterConfig,
  classes: HashMap<String, FieldClass>,
  state: FilterState,
  deadline: Option<Instant>,
  phase: Phase,
  clock: Arc<dyn Clock>,
  guard: OperationGuard,
  events: Option<EventBus>,
}

impl FilterMachine {
  pub fn new(config: FilterConfig) -> Self {
    Self::with_clock(config, Arc::new(TokioClock))
  }

  pub fn with_clock(config: FilterConfig, clock: Arc<dyn Clock>) -> Self {
    let guard = OperationGuard::with_clock(config.guard.clone(), Arc::clone(&clock));
    let pagination = Pagination {
      page: 1,
      limit: config.default_limit,
      sort_by: None,
      sort_order: SortOrder::Asc,
    };
    Self {
      config,
      classes: HashMap::new(),
      state: FilterState {
        raw: BTreeMap::new(),
        committed: BTreeMap::new(),
        pagination,
      },
      deadline: None,
      phase: Phase::Idle,
      clock,
      guard,
      events: None,
    }
  }

  /// Declare how a field commits instead of inferring it from its value.
  pub fn with_field(mut self, field: impl Into<String>, class: FieldClass) -> Self {
    self.classes.insert(field.into(), class);
    self
  }

  /// Report rejected commits on this bus.
  pub fn with_events(mut self, events: EventBus) -> Self {
    self.events = Some(events);
    self
  }

  pub fn state(&self) -> &FilterState {
    &self.state
  }

  pub fn committed(&self) -> &BTreeMap<String, Value> {
    &self.state.committed
  }

  pub fn pagination(&self) -> &Pagination {
    &self.state.pagination
  }

  pub fn phase(&self) -> Phase {
    self.phase
  }

  pub fn next_deadline(&self) -> Option<Instant> {
    self.deadline
  }

  pub fn guard(&self) -> &OperationGuard {
    &self.guard
  }

  /// Record a raw edit. `null` or an empty string clears the field.
  ///
  /// Immediate fields commit right away, along with any debounced edits
  /// still waiting; debounced fields restart the window.
  pub fn update_filter(&mut self, field: &str, value: impl Into<Value>) -> Result<Option<FilterCommit>, CacheError> {
    let value = value.into();
    let class = self
      .classes
      .get(field)
      .copied()
      .unwrap_or_else(|| FieldClass::infer(&value));

    match value {
      Value::Null => {
        self.state.raw.remove(field);
      }
      Value::String(s) if s.is_empty() => {
        self.state.raw.remove(field);
      }
      value => {
        self.state.raw.insert(field.to_string(), value);
      }
    }

    match class {
      FieldClass::Debounced => {
        self.deadline = Some(self.clock.now() + self.config.debounce);
        self.phase = Phase::Debouncing;
        trace!(field, "debounce window restarted");
        Ok(None)
      }
      FieldClass::Immediate => {
        self.deadline = None;
        self.commit_filters(OperationType::Filter)
      }
    }
  }

  /// Commit pending edits whose debounce window has passed.
  pub fn tick(&mut self) -> Result<Option<FilterCommit>, CacheError> {
    match self.deadline {
      Some(deadline) if self.clock.now() >= deadline => {
        self.deadline = None;
        self.commit_filters(OperationType::Filter)
      }
      _ => Ok(None),
    }
  }

  /// Wait out the debounce window on the tokio timer, then tick.
  pub async fn settle(&mut self) -> Result<Option<FilterCommit>, CacheError> {
    match self.deadline {
      Some(deadline) => {
        tokio::time::sleep_until(deadline).await;
        self.tick()
      }
      None => Ok(None),
    }
  }

  /// Change page and page size. Filters stay as they are.
  pub fn update_pagination(&mut self, page: u64, limit: u64) -> Result<Option<FilterCommit>, CacheError> {
    let page = page.max(1);
    let limit = limit.max(1);
    let current = &self.state.pagination;
    if current.page == page && current.limit == limit {
      return Ok(None);
    }
    self.admit(OperationType::Pagination)?;

    let pagination = &mut self.state.pagination;
    pagination.page = page;
    pagination.limit = limit;
    Ok(Some(self.commit_record(OperationType::Pagination, false)))
  }

  /// Change sorting. Goes back to the first page.
  pub fn update_sort(&mut self, sort_by: Option<&str>, sort_order: SortOrder) -> Result<Option<FilterCommit>, CacheError> {
    let sort_by = sort_by.filter(|s| !s.is_empty()).map(String::from);
    let current = &self.state.pagination;
    if current.sort_by == sort_by && current.sort_order == sort_order {
      return Ok(None);
    }
    self.admit(OperationType::Pagination)?;

    let pagination = &mut self.state.pagination;
    let page_reset = pagination.page != 1;
    pagination.sort_by = sort_by;
    pagination.sort_order = sort_order;
    pagination.page = 1;
    Ok(Some(self.commit_record(OperationType::Pagination, page_reset)))
  }

  /// Clear every filter and sort, drop pending edits, back to page 1.
  pub fn reset_filters(&mut self) -> Result<Option<FilterCommit>, CacheError> {
    let pagination = &self.state.pagination;
    let pristine = self.state.raw.is_empty()
      && self.state.committed.is_empty()
      && pagination.page == 1
      && pagination.sort_by.is_none();
    if pristine {
      self.deadline = None;
      self.phase = Phase::Idle;
      return Ok(None);
    }
    self.admit(OperationType::Reset)?;

    self.deadline = None;
    self.state.raw.clear();
    self.state.committed.clear();
    let pagination = &mut self.state.pagination;
    let page_reset = pagination.page != 1;
    pagination.page = 1;
    pagination.sort_by = None;
    pagination.sort_order = SortOrder::Asc;
    Ok(Some(self.commit_record(OperationType::Reset, page_reset)))
  }

  /// Start a new guard session.
  pub fn reset_session(&mut self) {
    self.guard.reset();
  }

  /// Query parameters for the committed state.
  pub fn params(&self) -> ListParams {
    let pagination = &self.state.pagination;
    let mut params: ListParams = self
      .state
      .committed
      .iter()
      .map(|(k, v)| (k.clone(), v.clone()))
      .collect();
    params.insert("page", pagination.page);
    params.insert("limit", pagination.limit);
    if let Some(sort_by) = &pagination.sort_by {
      params.insert("sortBy", sort_by.as_str());
      params.insert("sortOrder", pagination.sort_order.as_str());
    }
    params
  }

  fn commit_filters(&mut self, operation: OperationType) -> Result<Option<FilterCommit>, CacheError> {
    if self.state.raw == self.state.committed {
      self.phase = Phase::Idle;
      debug!("filters unchanged, nothing to commit");
      return Ok(None);
    }
    self.phase = Phase::Committing;
    if let Err(err) = self.admit(operation) {
      self.phase = Phase::Idle;
      return Err(err);
    }

    self.state.committed = self.state.raw.clone();
    let page_reset = self.state.pagination.page != 1;
    self.state.pagination.page = 1;
    Ok(Some(self.commit_record(operation, page_reset)))
  }

  fn admit(&mut self, operation: OperationType) -> Result<(), CacheError> {
    let result = self.guard.check(operation.as_str());
    if let (Err(CacheError::OperationLimitExceeded { operation, count, ceiling }), Some(events)) = (&result, &self.events) {
      events.emit(CacheEvent::OperationLimitExceeded {
        operation: operation.clone(),
        count: *count,
        ceiling: *ceiling,
      });
    }
    result
  }

  fn commit_record(&mut self, operation: OperationType, page_reset: bool) -> FilterCommit {
    self.phase = Phase::Idle;
    debug!(%operation, page = self.state.pagination.page, page_reset, "filter state committed");
    FilterCommit {
      operation,
      filters: self.state.committed.clone(),
      pagination: self.state.pagination.clone(),
      page_reset,
    }
  }
}

impl fmt::Debug for FilterMachine {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("FilterMachine")
      .field("state", &self.state)
      .field("phase", &self.phase)
      .field("deadline", &self.deadline)
      .field("guard", &self.guard)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::ManualClock;
  use serde_json::json;

  fn machine() -> (FilterMachine, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    let machine = FilterMachine::with_clock(FilterConfig::default(), clock.clone())
      .with_field("status", FieldClass::Immediate);
    (machine, clock)
  }

  #[test]
  fn test_burst_commits_once_with_last_value() {
    let (mut filters, clock) = machine();
    filters.update_pagination(3, 10).unwrap();

    for partial in ["a", "ab", "abc"] {
      assert_eq!(filters.update_filter("search", partial).unwrap(), None);
      clock.advance(Duration::from_millis(100));
      assert_eq!(filters.tick().unwrap(), None);
    }
    assert_eq!(filters.phase(), Phase::Debouncing);

    clock.advance(Duration::from_millis(200));
    let commit = filters.tick().unwrap().unwrap();
    assert_eq!(commit.filters.get("search"), Some(&json!("abc")));
    assert!(commit.page_reset);
    assert_eq!(commit.pagination.page, 1);
    assert_eq!(filters.phase(), Phase::Idle);
    assert_eq!(filters.tick().unwrap(), None);
  }

  #[test]
  fn test_unchanged_value_does_not_commit() {
    let (mut filters, clock) = machine();
    filters.update_filter("search", "abc").unwrap();
    clock.advance(Duration::from_millis(300));
    assert!(filters.tick().unwrap().is_some());

    filters.update_filter("search", "abcd").unwrap();
    filters.update_filter("search", "abc").unwrap();
    clock.advance(Duration::from_millis(300));
    assert_eq!(filters.tick().unwrap(), None);
    assert_eq!(filters.guard().count("filter"), 1);
  }

  #[test]
  fn test_immediate_field_and_clearing() {
    let (mut filters, _clock) = machine();
    let commit = filters.update_filter("status", "ACTIVE").unwrap().unwrap();
    assert_eq!(commit.filters.get("status"), Some(&json!("ACTIVE")));

    let commit = filters.update_filter("lineId", 7).unwrap().unwrap();
    assert_eq!(commit.filters.len(), 2);

    let commit = filters.update_filter("status", "").unwrap().unwrap();
    assert!(!commit.filters.contains_key("status"));
    let commit = filters.update_filter("lineId", Value::Null).unwrap().unwrap();
    assert!(commit.filters.is_empty());
  }

  #[test]
  fn test_pagination_keeps_filters() {
    let (mut filters, _clock) = machine();
    filters.update_filter("status", "ACTIVE").unwrap();
    let commit = filters.update_pagination(2, 25).unwrap().unwrap();
    assert_eq!(commit.operation, OperationType::Pagination);
    assert!(!commit.page_reset);
    assert_eq!(commit.filters.get("status"), Some(&json!("ACTIVE")));
    assert_eq!(filters.update_pagination(2, 25).unwrap(), None);

    let commit = filters.update_sort(Some("name"), SortOrder::Desc).unwrap().unwrap();
    assert!(commit.page_reset);
    assert_eq!(
      filters.params(),
      ListParams::new()
        .with("status", "ACTIVE")
        .with("page", 1)
        .with("limit", 25)
        .with("sortBy", "name")
        .with("sortOrder", "desc")
    );
  }

  #[test]
  fn test_reset_clears_everything() {
    let (mut filters, _clock) = machine();
    filters.update_filter("status", "ACTIVE").unwrap();
    filters.update_filter("search", "pending").unwrap();
    filters.update_pagination(4, 10).unwrap();

    let commit = filters.reset_filters().unwrap().unwrap();
    assert_eq!(commit.operation, OperationType::Reset);
    assert!(commit.filters.is_empty());
    assert!(commit.page_reset);
    assert_eq!(filters.next_deadline(), None);
    assert_eq!(filters.reset_filters().unwrap(), None);
  }

  #[test]
  fn test_guard_drops_commits_and_reports() {
    let clock = Arc::new(ManualClock::new());
    let mut config = FilterConfig::default();
    config.guard.global_ceiling = 2;
    let events = EventBus::default();
    let mut stream = events.subscribe();
    let mut filters = FilterMachine::with_clock(config, clock)
      .with_field("status", FieldClass::Immediate)
      .with_events(events);

    filters.update_filter("status", "A").unwrap();
    filters.update_filter("status", "B").unwrap();
    let before = filters.state().clone();

    for value in ["C", "D"] {
      let err = filters.update_filter("status", value).unwrap_err();
      assert!(matches!(err, CacheError::OperationLimitExceeded { count: 2, ceiling: 2, .. }));
    }
    assert!(filters.update_pagination(5, 10).is_err());
    assert_eq!(filters.committed(), &before.committed);
    assert_eq!(filters.pagination(), &before.pagination);
    assert_eq!(stream.drain().len(), 3);

    filters.reset_session();
    assert!(filters.update_filter("status", "E").unwrap().is_some());
  }

  #[tokio::test(start_paused = true)]
  async fn test_settle_waits_for_window() {
    let mut filters = FilterMachine::new(FilterConfig::default());
    filters.update_filter("search", "abc").unwrap();
    let started = Instant::now();
    let commit = filters.settle().await.unwrap().unwrap();
    assert_eq!(started.elapsed(), Duration::from_millis(300));
    assert_eq!(commit.filters.get("search"), Some(&json!("abc")));
  }
}
