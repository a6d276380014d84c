use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use crate::error::RemoteError;

/// Capped exponential backoff for fetches.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
  /// Retries after the first attempt
  pub max_retries: u32,
  #[serde(with = "millis", rename = "base_delay_ms")]
  pub base_delay: Duration,
  pub growth: f64,
  #[serde(with = "millis", rename = "max_delay_ms")]
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_retries: 3,
      base_delay: Duration::from_millis(1000),
      growth: 2.0,
      max_delay: Duration::from_secs(30),
    }
  }
}

impl RetryPolicy {
  pub fn none() -> Self {
    Self {
      max_retries: 0,
      ..Self::default()
    }
  }

  /// Delay before retry number `attempt` (0-based): `min(base * growth^attempt, cap)`.
  pub fn delay(&self, attempt: u32) -> Duration {
    let factor = self.growth.max(1.0).powi(attempt.min(i32::MAX as u32) as i32);
    let millis = self.base_delay.as_millis() as f64 * factor;
    let capped = millis.min(self.max_delay.as_millis() as f64);
    Duration::from_millis(capped as u64)
  }

  /// Run `op` until it succeeds or retries run out.
  ///
  /// On failure returns the last error and the number of attempts made.
  pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, (RemoteError, u32)>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
  {
    let mut attempt = 0;
    loop {
      match op().await {
        Ok(value) => return Ok(value),
        Err(err) if attempt < self.max_retries => {
          let delay = self.delay(attempt);
          tracing::debug!(attempt = attempt + 1, ?delay, error = %err, "fetch failed, retrying");
          tokio::time::sleep(delay).await;
          attempt += 1;
        }
        Err(err) => return Err((err, attempt + 1)),
      }
    }
  }
}

pub(crate) mod millis {
  use serde::{Deserialize, Deserializer, Serializer};
  use std::time::Duration;

  pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    u64::deserialize(d).map(Duration::from_millis)
  }
}
