use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::Instant;

use crate::error::CacheError;

/// Result from a cache read, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was fetched (if from cache)
  pub fetched_at: Option<Instant>,
  /// Why fresh data could not be served, for offline results
  pub error: Option<CacheError>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      fetched_at: None,
      error: None,
    }
  }

  /// Create a new cache result from data that is still fresh.
  pub fn from_cache(data: T, fetched_at: Instant) -> Self {
    Self {
      data,
      source: CacheSource::CacheFresh,
      fetched_at: Some(fetched_at),
      error: None,
    }
  }

  /// Data carrying a pending optimistic patch.
  pub fn optimistic(data: T, fetched_at: Instant) -> Self {
    Self {
      data,
      source: CacheSource::Optimistic,
      fetched_at: Some(fetched_at),
      error: None,
    }
  }

  /// Stale data served because the network failed.
  pub fn offline(data: T, fetched_at: Instant, error: CacheError) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      fetched_at: Some(fetched_at),
      error: Some(error),
    }
  }

  pub fn is_offline(&self) -> bool {
    self.source == CacheSource::Offline
  }

  pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CacheResult<U> {
    CacheResult {
      data: f(self.data),
      source: self.source,
      fetched_at: self.fetched_at,
      error: self.error,
    }
  }
}

impl CacheResult<Value> {
  /// Deserialize the cached JSON into a typed value.
  pub fn decode<T: DeserializeOwned>(self) -> Result<CacheResult<T>, CacheError> {
    let data = serde_json::from_value(self.data)?;
    Ok(CacheResult {
      data,
      source: self.source,
      fetched_at: self.fetched_at,
      error: self.error,
    })
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache with an unconfirmed local change
  Optimistic,
  /// Network failed after retries, serving the last known good value
  Offline,
}
