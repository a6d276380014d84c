//! Typed entities and the remote operations bound to them.
//!
//! The cache holds JSON. Everything in this module converts between that and
//! the typed records in `models` at the binding boundary.

mod binding;
mod repo;

use serde::{de::DeserializeOwned, Serialize};

use crate::error::ValidationError;
use crate::models::EntityKind;

pub use binding::{erase, Created, DynBinding, EntityBinding, Page};
pub use repo::EntityRepo;

/// Trait for records that can be cached.
///
/// Implementors name their kind and the DTOs used to create and update them.
pub trait Entity: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  type Create: Dto;
  type Update: Dto;

  /// Kind used for this record's tags
  fn kind() -> EntityKind;

  /// Unique identifier, the id segment of the detail tag
  fn cache_key(&self) -> &str;
}

/// Structural checks on a payload before it reaches the cache.
pub trait Validate {
  fn validate(&self) -> Result<(), ValidationError>;
}

/// A create or update payload.
pub trait Dto: Clone + Send + Sync + Serialize + DeserializeOwned + Validate + 'static {}

impl<T> Dto for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + Validate + 'static {}
