//! Typed error hierarchy for the cache layer.
//!
//! - `RemoteError`: failures reported by an entity binding (the transport)
//! - `ValidationError`: local rejection before any cache is touched
//! - `CacheError`: everything the query executor, mutation coordinator and
//!   filter machine hand back to callers
//!
//! All three are `Clone` because a single fetch result is shared between
//! every caller awaiting the same tag.

use thiserror::Error;

use crate::cache::Tag;

/// Errors from a remote data source.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
  #[error("Remote returned status {code}: {message}")]
  Status { code: u16, message: String },

  #[error("{kind} {id} not found")]
  NotFound { kind: String, id: String },

  #[error("Remote call timed out")]
  Timeout,

  #[error("Transport error: {0}")]
  Transport(String),
}

/// Local rejection of a mutation payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
  #[error("Field {field} is required")]
  MissingField { field: String },

  #[error("Field {field} is invalid: {reason}")]
  InvalidField { field: String, reason: String },

  #[error("Payload must be a JSON object")]
  NotAnObject,

  #[error("Update carries no fields")]
  EmptyUpdate,
}

impl ValidationError {
  pub fn missing(field: impl Into<String>) -> Self {
    ValidationError::MissingField {
      field: field.into(),
    }
  }

  pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
    ValidationError::InvalidField {
      field: field.into(),
      reason: reason.into(),
    }
  }
}

/// Errors surfaced by the cache layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
  #[error("Fetching {tag} failed after {attempts} attempts: {source}")]
  Network {
    tag: Tag,
    attempts: u32,
    #[source]
    source: RemoteError,
  },

  #[error("Validation failed: {0}")]
  Validation(#[from] ValidationError),

  #[error("Mutation {mutation_id} rolled back: {source}")]
  Remote {
    mutation_id: String,
    #[source]
    source: RemoteError,
  },

  #[error("Operation limit exceeded for {operation} ({count}/{ceiling})")]
  OperationLimitExceeded {
    operation: String,
    count: u32,
    ceiling: u32,
  },

  #[error("No binding registered for entity type {0}")]
  UnknownEntity(String),

  #[error("Failed to (de)serialize cached data: {0}")]
  Serialization(String),

  #[error("Fetch for {0} was cancelled")]
  Cancelled(Tag),
}

impl From<serde_json::Error> for CacheError {
  fn from(err: serde_json::Error) -> Self {
    CacheError::Serialization(err.to_string())
  }
}

impl CacheError {
  /// Whether the executor's retry policy applies.
  pub fn is_retryable(&self) -> bool {
    matches!(self, CacheError::Network { .. })
  }
}
