pub mod json_feed;

use crate::config::{IngestConfig, SourceConfig};
use crate::domain::RawRecord;
use crate::error::FetchError;
use rand::Rng;
use std::time::Duration;
use tracing::{info, warn};

pub use json_feed::JsonFeedAdapter;

/// Connection details handed to an adapter at construction.
#[derive(Debug, Clone)]
pub struct SourceDescriptor {
    pub name: String,
    pub url: String,
}

impl From<&SourceConfig> for SourceDescriptor {
    fn from(config: &SourceConfig) -> Self {
        Self {
            name: config.name.clone(),
            url: config.url.clone(),
        }
    }
}

/// Capability every event source must implement. One implementation per
/// site; adapters hold no shared mutable state.
#[async_trait::async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Unique identifier for this source, recorded as `source_id` on every
    /// raw record it produces.
    fn source_id(&self) -> &str;

    /// Fetch all currently listed raw records from this source.
    async fn fetch(&self) -> Result<Vec<RawRecord>, FetchError>;
}

/// Fetch with a bounded retry budget and exponential backoff on transient
/// failures. Permanent failures surface immediately. A mandatory
/// inter-request delay is applied before every attempt after the first, and
/// each attempt runs under the configured timeout; an expired attempt counts
/// as a transient failure.
pub async fn fetch_with_retry(
    adapter: &dyn SourceAdapter,
    config: &IngestConfig,
) -> Result<Vec<RawRecord>, FetchError> {
    let base_delay = Duration::from_millis(config.request_delay_ms);
    let timeout = Duration::from_secs(config.fetch_timeout_secs);

    let mut last_error = None;
    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let backoff = backoff_delay(base_delay, attempt);
            info!(
                source = adapter.source_id(),
                attempt,
                delay_ms = backoff.as_millis() as u64,
                "Retrying fetch after transient failure"
            );
            tokio::time::sleep(backoff).await;
        }

        let attempt_result = match tokio::time::timeout(timeout, adapter.fetch()).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Transient(format!(
                "fetch timed out after {}s",
                timeout.as_secs()
            ))),
        };

        match attempt_result {
            Ok(records) => {
                info!(
                    source = adapter.source_id(),
                    records = records.len(),
                    "Fetched raw records"
                );
                return Ok(records);
            }
            Err(e) if e.is_transient() && attempt < config.max_retries => {
                warn!(source = adapter.source_id(), error = %e, "Transient fetch failure");
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_error
        .unwrap_or_else(|| FetchError::Transient("retry budget exhausted".to_string())))
}

/// Exponential backoff with up to 25% random jitter.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
    let jitter = rand::thread_rng().gen_range(0..=exp.as_millis() as u64 / 4);
    exp + Duration::from_millis(jitter)
}
