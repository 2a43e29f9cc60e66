use crate::config::IngestConfig;
use crate::dedupe::Deduplicator;
use crate::domain::{IngestOutcome, IngestionRun, SourceFailure};
use crate::error::Result;
use crate::normalize::Normalizer;
use crate::sources::{fetch_with_retry, SourceAdapter};
use crate::store::CanonicalStore;
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, info_span, warn, Instrument};

/// Per-source tally folded into the run record.
#[derive(Debug, Default, Clone)]
struct SourceTally {
    raw_records: usize,
    normalized_events: usize,
    rejected_records: usize,
    created_events: usize,
    merged_events: usize,
    failed_events: usize,
}

/// Drives one ingestion run: one worker per enabled source, each fetching,
/// normalizing inline and feeding the deduplicator. A failing source is
/// recorded and the run proceeds with the remaining sources.
pub struct IngestionRunner {
    config: IngestConfig,
    normalizer: Arc<Normalizer>,
    deduplicator: Arc<Deduplicator>,
    store: Arc<dyn CanonicalStore>,
}

impl IngestionRunner {
    pub fn new(
        config: IngestConfig,
        deduplicator: Deduplicator,
        store: Arc<dyn CanonicalStore>,
    ) -> Self {
        let normalizer = Arc::new(Normalizer::new(config.timezone));
        Self {
            config,
            normalizer,
            deduplicator: Arc::new(deduplicator),
            store,
        }
    }

    /// Execute the full fetch → normalize → dedup → store pipeline across
    /// the given adapters. Never fails as a whole: per-source and per-record
    /// outcomes land in the returned run record.
    pub async fn run(&self, adapters: Vec<Arc<dyn SourceAdapter>>) -> Result<IngestionRun> {
        let mut run = IngestionRun::start(Utc::now());
        info!(run_id = %run.id, sources = adapters.len(), "Starting ingestion run");

        let mut handles = Vec::with_capacity(adapters.len());
        for adapter in adapters {
            let config = self.config.clone();
            let normalizer = self.normalizer.clone();
            let deduplicator = self.deduplicator.clone();
            let store = self.store.clone();
            let source_id = adapter.source_id().to_string();

            let span = info_span!("source_worker", source = %source_id);
            handles.push(tokio::spawn(
                async move {
                    let result = ingest_source(
                        adapter.as_ref(),
                        &config,
                        &normalizer,
                        &deduplicator,
                        store.as_ref(),
                    )
                    .await;
                    (source_id, result)
                }
                .instrument(span),
            ));
        }

        for handle in handles {
            let (source_id, result) = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(error = %e, "Source worker panicked");
                    run.source_failures.push(SourceFailure {
                        source_id: "unknown".to_string(),
                        reason: format!("worker panicked: {e}"),
                    });
                    continue;
                }
            };

            match result {
                Ok(tally) => {
                    run.raw_records += tally.raw_records;
                    run.normalized_events += tally.normalized_events;
                    run.rejected_records += tally.rejected_records;
                    run.created_events += tally.created_events;
                    run.merged_events += tally.merged_events;
                    run.failed_events += tally.failed_events;
                }
                Err(reason) => {
                    warn!(source = %source_id, reason = %reason, "Source failed for this run");
                    run.source_failures.push(SourceFailure { source_id, reason });
                }
            }
        }

        run.finalize(Utc::now());
        info!(
            run_id = %run.id,
            raw = run.raw_records,
            normalized = run.normalized_events,
            rejected = run.rejected_records,
            created = run.created_events,
            merged = run.merged_events,
            failed = run.failed_events,
            failed_sources = run.source_failures.len(),
            "Ingestion run finished"
        );
        Ok(run)
    }
}

/// Fetch and process a single source. Returns the tally, or the failure
/// reason that marks the source failed for this run.
async fn ingest_source(
    adapter: &dyn SourceAdapter,
    config: &IngestConfig,
    normalizer: &Normalizer,
    deduplicator: &Deduplicator,
    store: &dyn CanonicalStore,
) -> std::result::Result<SourceTally, String> {
    let records = fetch_with_retry(adapter, config)
        .await
        .map_err(|e| e.to_string())?;

    let mut tally = SourceTally {
        raw_records: records.len(),
        ..SourceTally::default()
    };

    for record in &records {
        let events = match normalizer.normalize(record) {
            Ok(events) => events,
            Err(failure) => {
                warn!(source = adapter.source_id(), error = %failure, "Dropped invalid record");
                tally.rejected_records += 1;
                continue;
            }
        };

        tally.normalized_events += events.len();
        for event in &events {
            match deduplicator.ingest(event, store).await {
                Ok(IngestOutcome::Created(_)) => tally.created_events += 1,
                Ok(IngestOutcome::Merged(_)) => tally.merged_events += 1,
                Err(e) => {
                    // Event-level store failure; the rest of the source's
                    // records still flow.
                    tally.failed_events += 1;
                    error!(
                        source = adapter.source_id(),
                        title = %event.title,
                        error = %e,
                        "Failed to ingest event"
                    );
                }
            }
        }
    }

    Ok(tally)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RawRecord;
    use crate::error::FetchError;
    use crate::fingerprint::Matcher;
    use crate::store::InMemoryStore;
    use serde_json::json;

    struct StaticAdapter {
        name: String,
        records: Vec<serde_json::Value>,
    }

    #[async_trait::async_trait]
    impl SourceAdapter for StaticAdapter {
        fn source_id(&self) -> &str {
            &self.name
        }

        async fn fetch(&self) -> std::result::Result<Vec<RawRecord>, FetchError> {
            Ok(self
                .records
                .iter()
                .cloned()
                .map(|fields| RawRecord::new(self.name.clone(), fields))
                .collect())
        }
    }

    struct FailingAdapter;

    #[async_trait::async_trait]
    impl SourceAdapter for FailingAdapter {
        fn source_id(&self) -> &str {
            "unreachable"
        }

        async fn fetch(&self) -> std::result::Result<Vec<RawRecord>, FetchError> {
            Err(FetchError::Permanent("HTTP 410".to_string()))
        }
    }

    fn runner(store: Arc<dyn CanonicalStore>) -> IngestionRunner {
        let config = IngestConfig {
            request_delay_ms: 1,
            max_retries: 0,
            ..IngestConfig::default()
        };
        let dedup = Deduplicator::new(
            Matcher::new(0.85, 1, chrono_tz::UTC),
            Default::default(),
            1,
            3,
        );
        IngestionRunner::new(config, dedup, store)
    }

    #[tokio::test]
    async fn counts_created_merged_and_rejected() {
        let store = Arc::new(InMemoryStore::new(chrono_tz::UTC));
        let adapter = StaticAdapter {
            name: "a".to_string(),
            records: vec![
                json!({"title": "Weinfest", "city": "Wiesbaden", "start": "2024-09-01T18:00:00Z"}),
                json!({"title": "Weinfest Wiesbaden", "city": "Wiesbaden", "start": "2024-09-01T12:00:00Z"}),
                json!({"title": "Kaputt", "city": "Wiesbaden", "start": "not a date"}),
            ],
        };

        let run = runner(store.clone())
            .run(vec![Arc::new(adapter)])
            .await
            .unwrap();

        assert_eq!(run.raw_records, 3);
        assert_eq!(run.normalized_events, 2);
        assert_eq!(run.rejected_records, 1);
        assert_eq!(run.created_events, 1);
        assert_eq!(run.merged_events, 1);
        assert!(run.source_failures.is_empty());
        assert!(run.finished_at.is_some());
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_source_does_not_abort_the_run() {
        let store = Arc::new(InMemoryStore::new(chrono_tz::UTC));
        let good = StaticAdapter {
            name: "b".to_string(),
            records: vec![
                json!({"title": "Konzert", "city": "Mainz", "start": "2024-10-01T20:00:00Z"}),
            ],
        };

        let run = runner(store.clone())
            .run(vec![Arc::new(FailingAdapter), Arc::new(good)])
            .await
            .unwrap();

        assert_eq!(run.created_events, 1);
        assert_eq!(run.source_failures.len(), 1);
        assert_eq!(run.source_failures[0].source_id, "unreachable");
        assert!(run.is_degraded());
        assert_eq!(store.count().await.unwrap(), 1);
    }

    struct ConflictingStore;

    #[async_trait::async_trait]
    impl CanonicalStore for ConflictingStore {
        async fn upsert(&self, event: &crate::domain::CanonicalEvent) -> crate::error::Result<()> {
            Err(crate::error::FestcalError::StoreConflict {
                canonical_id: event.canonical_id,
            })
        }

        async fn get(
            &self,
            _canonical_id: uuid::Uuid,
        ) -> crate::error::Result<Option<crate::domain::CanonicalEvent>> {
            Ok(None)
        }

        async fn find_candidates(
            &self,
            _city: &str,
            _from_day: chrono::NaiveDate,
            _to_day: chrono::NaiveDate,
        ) -> crate::error::Result<Vec<crate::domain::CanonicalEvent>> {
            Ok(Vec::new())
        }

        async fn query(
            &self,
            _query: &crate::store::EventQuery,
        ) -> crate::error::Result<Vec<crate::domain::CanonicalEvent>> {
            Ok(Vec::new())
        }

        async fn count(&self) -> crate::error::Result<usize> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn exhausted_write_conflicts_are_counted_as_failed() {
        let adapter = StaticAdapter {
            name: "a".to_string(),
            records: vec![
                json!({"title": "Weinfest", "city": "Wiesbaden", "start": "2024-09-01T18:00:00Z"}),
            ],
        };

        let run = runner(Arc::new(ConflictingStore))
            .run(vec![Arc::new(adapter)])
            .await
            .unwrap();

        assert_eq!(run.normalized_events, 1);
        assert_eq!(run.created_events, 0);
        assert_eq!(run.merged_events, 0);
        assert_eq!(run.failed_events, 1);
        // A per-event failure does not fail the source.
        assert!(run.source_failures.is_empty());
    }
}
