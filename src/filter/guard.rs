//! Loop protection for state commits.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache::{Clock, TokioClock};
use crate::error::CacheError;

/// Ceilings for one session of operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardLimits {
  /// Most operations of any type allowed per session
  pub global_ceiling: u32,
  /// Most operations of one type allowed per session, unless overridden
  pub per_type_ceiling: u32,
  /// Per-type overrides, keyed by operation type
  pub type_ceilings: BTreeMap<String, u32>,
  /// Counters reset by themselves once a session is this old
  #[serde(with = "opt_millis", rename = "session_window_ms")]
  pub session_window: Option<Duration>,
}

impl Default for GuardLimits {
  fn default() -> Self {
    Self {
      global_ceiling: 200,
      per_type_ceiling: 100,
      type_ceilings: BTreeMap::new(),
      session_window: None,
    }
  }
}

impl GuardLimits {
  pub fn ceiling_for(&self, operation: &str) -> u32 {
    self
      .type_ceilings
      .get(operation)
      .copied()
      .unwrap_or(self.per_type_ceiling)
  }
}

/// Per-session operation counters with ceilings.
///
/// An operation is admitted only while both its type counter and the total
/// are below their ceilings. Rejected operations are not counted, so once a
/// ceiling is reached every further operation of that kind is rejected until
/// the session resets.
pub struct OperationGuard {
  limits: GuardLimits,
  clock: Arc<dyn Clock>,
  total: u32,
  by_type: HashMap<String, u32>,
  session_started: Instant,
}

impl OperationGuard {
  pub fn new(limits: GuardLimits) -> Self {
    Self::with_clock(limits, Arc::new(TokioClock))
  }

  pub fn with_clock(limits: GuardLimits, clock: Arc<dyn Clock>) -> Self {
    let session_started = clock.now();
    Self {
      limits,
      clock,
      total: 0,
      by_type: HashMap::new(),
      session_started,
    }
  }

  pub fn limits(&self) -> &GuardLimits {
    &self.limits
  }

  pub fn total(&self) -> u32 {
    self.total
  }

  pub fn count(&self, operation: &str) -> u32 {
    self.by_type.get(operation).copied().unwrap_or(0)
  }

  /// Admit one operation or reject it without side effects.
  pub fn check(&mut self, operation: &str) -> Result<(), CacheError> {
    self.roll_session();

    if self.total >= self.limits.global_ceiling {
      warn!(operation, total = self.total, "global operation ceiling reached");
      return Err(CacheError::OperationLimitExceeded {
        operation: operation.to_string(),
        count: self.total,
        ceiling: self.limits.global_ceiling,
      });
    }

    let count = self.count(operation);
    let ceiling = self.limits.ceiling_for(operation);
    if count >= ceiling {
      warn!(operation, count, "operation ceiling reached");
      return Err(CacheError::OperationLimitExceeded {
        operation: operation.to_string(),
        count,
        ceiling,
      });
    }

    self.total += 1;
    *self.by_type.entry(operation.to_string()).or_insert(0) += 1;
    Ok(())
  }

  /// Start a new session.
  pub fn reset(&mut self) {
    self.total = 0;
    self.by_type.clear();
    self.session_started = self.clock.now();
    debug!("operation guard reset");
  }

  fn roll_session(&mut self) {
    let Some(window) = self.limits.session_window else {
      return;
    };
    if self.clock.now().duration_since(self.session_started) >= window {
      self.reset();
    }
  }
}

impl std::fmt::Debug for OperationGuard {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("OperationGuard")
      .field("limits", &self.limits)
      .field("total", &self.total)
      .field("by_type", &self.by_type)
      .finish_non_exhaustive()
  }
}

mod opt_millis {
  use serde::{Deserialize, Deserializer, Serializer};
  use std::time::Duration;

  pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match d {
      Some(d) => s.serialize_some(&(d.as_millis() as u64)),
      None => s.serialize_none(),
    }
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
    Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::ManualClock;

  fn limits(global: u32, per_type: u32) -> GuardLimits {
    GuardLimits {
      global_ceiling: global,
      per_type_ceiling: per_type,
      ..GuardLimits::default()
    }
  }

  #[test]
  fn test_rejects_past_global_ceiling_until_reset() {
    let mut guard = OperationGuard::with_clock(limits(3, 10), Arc::new(ManualClock::new()));
    assert!(guard.check("filter").is_ok());
    assert!(guard.check("pagination").is_ok());
    assert!(guard.check("filter").is_ok());

    for _ in 0..5 {
      assert_eq!(
        guard.check("reset"),
        Err(CacheError::OperationLimitExceeded {
          operation: "reset".to_string(),
          count: 3,
          ceiling: 3,
        })
      );
    }
    assert_eq!(guard.total(), 3);
    assert_eq!(guard.count("reset"), 0);

    guard.reset();
    assert!(guard.check("reset").is_ok());
  }

  #[test]
  fn test_per_type_ceiling_leaves_other_types_alone() {
    let mut limits = limits(100, 2);
    limits.type_ceilings.insert("pagination".to_string(), 1);
    let mut guard = OperationGuard::with_clock(limits, Arc::new(ManualClock::new()));

    assert!(guard.check("pagination").is_ok());
    assert!(guard.check("pagination").is_err());
    assert!(guard.check("filter").is_ok());
    assert!(guard.check("filter").is_ok());
    assert!(guard.check("filter").is_err());
  }

  #[test]
  fn test_session_window_resets_counters() {
    let clock = Arc::new(ManualClock::new());
    let mut limits = limits(1, 1);
    limits.session_window = Some(Duration::from_secs(60));
    let mut guard = OperationGuard::with_clock(limits, clock.clone());

    assert!(guard.check("filter").is_ok());
    assert!(guard.check("filter").is_err());
    clock.advance(Duration::from_secs(61));
    assert!(guard.check("filter").is_ok());
  }

  #[test]
  fn test_limits_from_yaml() {
    let limits: GuardLimits = serde_yaml::from_str("global_ceiling: 5\nsession_window_ms: 1000\n").unwrap();
    assert_eq!(limits.global_ceiling, 5);
    assert_eq!(limits.per_type_ceiling, 100);
    assert_eq!(limits.session_window, Some(Duration::from_secs(1)));
  }
}
