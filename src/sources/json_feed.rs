use super::{SourceAdapter, SourceDescriptor};
use crate::domain::RawRecord;
use crate::error::FetchError;
use tracing::debug;

/// Mechanical adapter for sources that publish their listings as a JSON
/// array of flat field objects. Site-specific DOM scraping lives outside
/// this crate; anything that can shape its output into such a feed plugs in
/// here without further code.
pub struct JsonFeedAdapter {
    descriptor: SourceDescriptor,
    client: reqwest::Client,
}

impl JsonFeedAdapter {
    pub fn new(descriptor: SourceDescriptor) -> Self {
        Self {
            descriptor,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl SourceAdapter for JsonFeedAdapter {
    fn source_id(&self) -> &str {
        &self.descriptor.name
    }

    async fn fetch(&self) -> Result<Vec<RawRecord>, FetchError> {
        let response = self
            .client
            .get(&self.descriptor.url)
            .header("User-Agent", "Mozilla/5.0 (compatible; FestCalBot/1.0)")
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    FetchError::Transient(e.to_string())
                } else {
                    FetchError::Permanent(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(FetchError::Transient(format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(FetchError::Permanent(format!("HTTP {status}")));
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| FetchError::Permanent(format!("invalid JSON payload: {e}")))?;

        let items = payload
            .as_array()
            .ok_or_else(|| FetchError::Permanent("expected a JSON array of records".to_string()))?;

        debug!(
            source = self.source_id(),
            items = items.len(),
            "Parsed JSON feed"
        );

        Ok(items
            .iter()
            .cloned()
            .map(|fields| RawRecord::new(self.descriptor.name.clone(), fields))
            .collect())
    }
}
