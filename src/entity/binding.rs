use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use super::{Entity, Validate};
use crate::cache::{ListParams, Mutation};
use crate::error::{RemoteError, ValidationError};
use crate::models::EntityKind;

/// One page of a list response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
  pub data: Vec<T>,
  pub total: u64,
  pub page: u64,
  pub limit: u64,
}

/// Acknowledgement of a create: the id the remote assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Created {
  pub id: String,
}

/// The remote operations for one entity kind.
///
/// Transport is up to the implementor; the cache only sees these five calls.
#[async_trait]
pub trait EntityBinding: Send + Sync + 'static {
  type Record: Entity;

  async fn fetch_list(&self, params: &ListParams) -> Result<Page<Self::Record>, RemoteError>;

  async fn fetch_by_id(&self, id: &str) -> Result<Self::Record, RemoteError>;

  async fn create(&self, dto: &<Self::Record as Entity>::Create) -> Result<Created, RemoteError>;

  async fn update(&self, id: &str, dto: &<Self::Record as Entity>::Update) -> Result<(), RemoteError>;

  async fn delete(&self, id: &str) -> Result<(), RemoteError>;
}

/// An `EntityBinding` with its record type erased to JSON, so the client can
/// hold bindings for every kind in one map.
#[async_trait]
pub trait DynBinding: Send + Sync {
  fn kind(&self) -> EntityKind;

  /// Decode the mutation payload into the kind's DTO and run its checks.
  fn validate(&self, mutation: &Mutation) -> Result<(), ValidationError>;

  async fn fetch_list(&self, params: &ListParams) -> Result<Value, RemoteError>;

  async fn fetch_by_id(&self, id: &str) -> Result<Value, RemoteError>;

  /// Perform the remote write. Returns the assigned id for creates.
  async fn execute(&self, mutation: &Mutation) -> Result<Option<String>, RemoteError>;
}

struct Erased<B> {
  inner: Arc<B>,
}

/// Wrap a typed binding for registration on a `QueryClient`.
pub fn erase<B: EntityBinding>(binding: Arc<B>) -> Arc<dyn DynBinding> {
  Arc::new(Erased { inner: binding })
}

fn decode<T: serde::de::DeserializeOwned>(payload: &Value) -> Result<T, ValidationError> {
  serde_json::from_value(payload.clone()).map_err(|e| ValidationError::invalid("payload", e.to_string()))
}

fn encode<T: Serialize>(value: &T) -> Result<Value, RemoteError> {
  serde_json::to_value(value).map_err(|e| RemoteError::Transport(format!("unencodable response: {e}")))
}

#[async_trait]
impl<B: EntityBinding> DynBinding for Erased<B> {
  fn kind(&self) -> EntityKind {
    <B::Record as Entity>::kind()
  }

  fn validate(&self, mutation: &Mutation) -> Result<(), ValidationError> {
    match mutation {
      Mutation::Create(payload) => decode::<<B::Record as Entity>::Create>(payload)?.validate(),
      Mutation::Update { patch, .. } => decode::<<B::Record as Entity>::Update>(patch)?.validate(),
      Mutation::Delete { .. } => Ok(()),
    }
  }

  async fn fetch_list(&self, params: &ListParams) -> Result<Value, RemoteError> {
    let page = self.inner.fetch_list(params).await?;
    encode(&page)
  }

  async fn fetch_by_id(&self, id: &str) -> Result<Value, RemoteError> {
    let record = self.inner.fetch_by_id(id).await?;
    encode(&record)
  }

  async fn execute(&self, mutation: &Mutation) -> Result<Option<String>, RemoteError> {
    let rejected = |e: ValidationError| RemoteError::Transport(e.to_string());
    match mutation {
      Mutation::Create(payload) => {
        let dto = decode::<<B::Record as Entity>::Create>(payload).map_err(rejected)?;
        self.inner.create(&dto).await.map(|created| Some(created.id))
      }
      Mutation::Update { id, patch } => {
        let dto = decode::<<B::Record as Entity>::Update>(patch).map_err(rejected)?;
        self.inner.update(id, &dto).await.map(|_| None)
      }
      Mutation::Delete { id } => self.inner.delete(id).await.map(|_| None),
    }
  }
}
