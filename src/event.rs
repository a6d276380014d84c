use tokio::sync::broadcast;

use crate::cache::{MutationKind, Tag};
use crate::models::EntityKind;

/// Events emitted by the cache layer for UI code to present
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
  /// Remote accepted a mutation; authoritative state is being refetched
  Committed {
    mutation_id: String,
    kind: EntityKind,
    operation: MutationKind,
    entity_id: String,
  },
  /// Remote rejected a mutation; the optimistic patch was undone
  RolledBack {
    mutation_id: String,
    kind: EntityKind,
    operation: MutationKind,
    error: String,
  },
  /// An operation guard ceiling was hit and the operation dropped
  OperationLimitExceeded {
    operation: String,
    count: u32,
    ceiling: u32,
  },
  /// A fetch exhausted its retries
  FetchFailed {
    tag: Tag,
    attempts: u32,
    error: String,
  },
  /// A refetch replaced optimistic data with a different authoritative value
  ConflictResolved { tag: Tag },
}

/// Fan-out of cache events to any number of subscribers.
///
/// Sending never blocks; with no subscribers events are dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
  tx: broadcast::Sender<CacheEvent>,
}

impl EventBus {
  pub fn new(capacity: usize) -> Self {
    let (tx, _rx) = broadcast::channel(capacity.max(1));
    Self { tx }
  }

  pub fn emit(&self, event: CacheEvent) {
    // Ignore send errors - nobody may be listening
    let _ = self.tx.send(event);
  }

  pub fn subscribe(&self) -> EventStream {
    EventStream {
      rx: self.tx.subscribe(),
    }
  }
}

impl Default for EventBus {
  fn default() -> Self {
    Self::new(256)
  }
}

/// Receiving side of the event bus
pub struct EventStream {
  rx: broadcast::Receiver<CacheEvent>,
}

impl EventStream {
  /// Receive the next event, skipping over any the stream lagged behind on
  pub async fn next(&mut self) -> Option<CacheEvent> {
    loop {
      match self.rx.recv().await {
        Ok(event) => return Some(event),
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
          tracing::warn!(skipped, "event subscriber lagged");
        }
        Err(broadcast::error::RecvError::Closed) => return None,
      }
    }
  }

  /// Non-blocking receive for poll-driven loops
  pub fn try_next(&mut self) -> Option<CacheEvent> {
    loop {
      match self.rx.try_recv() {
        Ok(event) => return Some(event),
        Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
        Err(_) => return None,
      }
    }
  }

  /// Everything currently queued
  pub fn drain(&mut self) -> Vec<CacheEvent> {
    std::iter::from_fn(|| self.try_next()).collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_every_subscriber_sees_events() {
    let bus = EventBus::default();
    let mut a = bus.subscribe();
    let mut b = bus.subscribe();

    bus.emit(CacheEvent::ConflictResolved {
      tag: Tag::detail(EntityKind::Team, "t-1"),
    });

    assert!(matches!(a.next().await, Some(CacheEvent::ConflictResolved { .. })));
    assert!(matches!(b.try_next(), Some(CacheEvent::ConflictResolved { .. })));
    assert!(b.try_next().is_none());
  }

  #[test]
  fn test_emit_without_subscribers() {
    let bus = EventBus::new(4);
    bus.emit(CacheEvent::OperationLimitExceeded {
      operation: "filter".to_string(),
      count: 1,
      ceiling: 1,
    });
    assert!(bus.subscribe().drain().is_empty());
  }
}
