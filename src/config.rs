use crate::error::{FestcalError, Result};
use chrono_tz::Tz;
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Top-level configuration, loaded from a TOML file and passed explicitly
/// into each component at construction.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub ingest: IngestConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

/// Pipeline tuning knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Similarity score at or above which two events are duplicates.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    /// Day tolerance applied when two sightings share a location but their
    /// start days differ by timezone or rounding artifacts.
    #[serde(default = "default_date_tolerance_days")]
    pub date_tolerance_days: i64,
    /// Mandatory delay between requests against the same source.
    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,
    /// Retry budget for transient fetch failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Per-fetch timeout; on expiry the source is marked failed for the run.
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// Bounded retries for store write conflicts.
    #[serde(default = "default_store_retry_limit")]
    pub store_retry_limit: u32,
    /// Zone used to interpret naive local datetimes from sources.
    #[serde(default = "default_timezone")]
    pub timezone: Tz,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            date_tolerance_days: default_date_tolerance_days(),
            request_delay_ms: default_request_delay_ms(),
            max_retries: default_max_retries(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            store_retry_limit: default_store_retry_limit(),
            timezone: default_timezone(),
        }
    }
}

/// One scrape source. `trust` ranks sources for merge conflict resolution;
/// higher wins.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub url: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub trust: u32,
}

fn default_similarity_threshold() -> f64 {
    0.85
}

fn default_date_tolerance_days() -> i64 {
    1
}

fn default_request_delay_ms() -> u64 {
    2000
}

fn default_max_retries() -> u32 {
    3
}

fn default_fetch_timeout_secs() -> u64 {
    30
}

fn default_store_retry_limit() -> u32 {
    3
}

fn default_timezone() -> Tz {
    chrono_tz::Europe::Berlin
}

fn default_enabled() -> bool {
    true
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            FestcalError::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;

        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.ingest.similarity_threshold) {
            return Err(FestcalError::Config(format!(
                "similarity_threshold must be within [0, 1], got {}",
                self.ingest.similarity_threshold
            )));
        }
        if self.ingest.date_tolerance_days < 0 {
            return Err(FestcalError::Config(
                "date_tolerance_days must not be negative".to_string(),
            ));
        }
        Ok(())
    }

    /// Sources enabled for this run, optionally narrowed to a name list.
    pub fn enabled_sources(&self, only: Option<&[String]>) -> Vec<&SourceConfig> {
        self.sources
            .iter()
            .filter(|s| s.enabled)
            .filter(|s| match only {
                Some(names) => names.iter().any(|n| n == &s.name),
                None => true,
            })
            .collect()
    }

    /// Trust priority for a source; unknown sources rank lowest.
    pub fn trust_for(&self, source_id: &str) -> u32 {
        self.sources
            .iter()
            .find(|s| s.name == source_id)
            .map(|s| s.trust)
            .unwrap_or(0)
    }
}
