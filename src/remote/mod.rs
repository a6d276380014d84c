//! In-process remote used by tests and the replay tool.

mod memory;

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::QueryClient;
use crate::entity::{erase, Entity};
use crate::error::RemoteError;
use crate::models::{
  BagColor, BagColorProcess, DigitalForm, DigitalFormEntry, EntityKind, Factory, HandBag, Line, Team,
};

pub use memory::{MemoryBinding, Op};

/// Kind-agnostic handle on a `MemoryBinding`.
pub trait RemoteControl: Send + Sync {
  fn kind(&self) -> EntityKind;
  fn seed_json(&self, rows: &[Value]) -> Result<(), RemoteError>;
  fn calls(&self, op: Op) -> u32;
  fn fail_next(&self, op: Op, times: usize, error: RemoteError);
  fn set_latency(&self, latency: Duration);
  fn len(&self) -> usize;
}

impl<T: Entity> RemoteControl for MemoryBinding<T> {
  fn kind(&self) -> EntityKind {
    T::kind()
  }

  fn seed_json(&self, rows: &[Value]) -> Result<(), RemoteError> {
    MemoryBinding::seed_json(self, rows)
  }

  fn calls(&self, op: Op) -> u32 {
    MemoryBinding::calls(self, op)
  }

  fn fail_next(&self, op: Op, times: usize, error: RemoteError) {
    MemoryBinding::fail_next(self, op, times, error)
  }

  fn set_latency(&self, latency: Duration) {
    MemoryBinding::set_latency(self, latency)
  }

  fn len(&self) -> usize {
    MemoryBinding::len(self)
  }
}

fn install_as<T: Entity>(client: &QueryClient) -> Arc<dyn RemoteControl> {
  let binding = MemoryBinding::<T>::new().into_shared();
  client.register(erase(binding.clone()));
  binding
}

/// Register an empty in-memory remote for `kind` on the client.
pub fn install(client: &QueryClient, kind: EntityKind) -> Arc<dyn RemoteControl> {
  match kind {
    EntityKind::Factory => install_as::<Factory>(client),
    EntityKind::Line => install_as::<Line>(client),
    EntityKind::Team => install_as::<Team>(client),
    EntityKind::HandBag => install_as::<HandBag>(client),
    EntityKind::BagColor => install_as::<BagColor>(client),
    EntityKind::BagColorProcess => install_as::<BagColorProcess>(client),
    EntityKind::DigitalForm => install_as::<DigitalForm>(client),
    EntityKind::DigitalFormEntry => install_as::<DigitalFormEntry>(client),
  }
}
