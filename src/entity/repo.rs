use std::marker::PhantomData;
use std::sync::Arc;

use super::binding::{erase, EntityBinding, Page};
use super::Entity;
use crate::cache::{CacheResult, ListParams, Mutation, MutationOutcome, QueryClient, Tag};
use crate::error::{CacheError, ValidationError};
use crate::models::EntityKind;
use crate::query::Query;

fn encode<S: serde::Serialize>(dto: &S) -> Result<serde_json::Value, CacheError> {
  serde_json::to_value(dto).map_err(|e| ValidationError::invalid("payload", e.to_string()).into())
}

/// Typed access to one entity kind through the shared cache.
pub struct EntityRepo<T> {
  client: QueryClient,
  _record: PhantomData<fn() -> T>,
}

impl<T> Clone for EntityRepo<T> {
  fn clone(&self) -> Self {
    Self {
      client: self.client.clone(),
      _record: PhantomData,
    }
  }
}

impl<T: Entity> EntityRepo<T> {
  /// Repo over a kind whose binding is already registered.
  pub fn new(client: &QueryClient) -> Self {
    Self {
      client: client.clone(),
      _record: PhantomData,
    }
  }

  /// Register `binding` for its kind and return a repo over it.
  pub fn register<B>(client: &QueryClient, binding: Arc<B>) -> Self
  where
    B: EntityBinding<Record = T>,
  {
    client.register(erase(binding));
    Self::new(client)
  }

  pub fn kind(&self) -> EntityKind {
    T::kind()
  }

  pub fn client(&self) -> &QueryClient {
    &self.client
  }

  pub async fn list(&self, params: &ListParams) -> Result<CacheResult<Page<T>>, CacheError> {
    self.client.resolve_list(T::kind(), params).await?.decode()
  }

  pub async fn get(&self, id: &str) -> Result<CacheResult<T>, CacheError> {
    self.client.resolve_by_id(T::kind(), id).await?.decode()
  }

  /// A page of `C` records belonging to the record `parent_id`.
  pub async fn children<C: Entity>(
    &self,
    parent_id: &str,
    params: &ListParams,
  ) -> Result<CacheResult<Page<C>>, CacheError> {
    self
      .client
      .resolve_children(T::kind(), parent_id, C::kind(), params)
      .await?
      .decode()
  }

  pub async fn create(&self, dto: &T::Create) -> Result<MutationOutcome, CacheError> {
    let payload = encode(dto)?;
    self.client.mutate(T::kind(), Mutation::Create(payload)).await
  }

  pub async fn update(&self, id: &str, dto: &T::Update) -> Result<MutationOutcome, CacheError> {
    let patch = encode(dto)?;
    let mutation = Mutation::Update {
      id: id.to_string(),
      patch,
    };
    self.client.mutate(T::kind(), mutation).await
  }

  pub async fn delete(&self, id: &str) -> Result<MutationOutcome, CacheError> {
    let mutation = Mutation::Delete { id: id.to_string() };
    self.client.mutate(T::kind(), mutation).await
  }

  pub async fn prefetch(&self, id: &str) -> Result<(), CacheError> {
    self.client.prefetch(T::kind(), id).await
  }

  pub fn invalidate(&self, id: Option<&str>, force_refetch: bool) -> Vec<Tag> {
    self.client.invalidate(T::kind(), id, force_refetch)
  }

  /// A mounted list view.
  pub fn watch_list(&self, params: &ListParams) -> Result<Query<Page<T>>, CacheError> {
    Query::list(&self.client, T::kind(), params)
  }

  /// A mounted detail view.
  pub fn watch(&self, id: &str) -> Result<Query<T>, CacheError> {
    Query::detail(&self.client, T::kind(), id)
  }
}
