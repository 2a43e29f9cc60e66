use crate::config::Config;
use crate::domain::{CanonicalEvent, IngestOutcome, NormalizedEvent};
use crate::error::{FestcalError, Result};
use crate::fingerprint::Matcher;
use crate::store::CanonicalStore;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

type BucketKey = (String, NaiveDate);

/// Clusters normalized events into canonical events and resolves field
/// conflicts.
///
/// The candidate-lookup-then-upsert sequence is a check-then-act race when
/// two ingestion workers handle sightings of the same real-world event, so
/// each `(city, start day)` bucket is guarded by an async lock for the
/// duration of one ingest decision. Lost races that slip past the lock are
/// caught by the store's revision check and retried.
pub struct Deduplicator {
    matcher: Matcher,
    trust: HashMap<String, u32>,
    date_tolerance_days: i64,
    store_retry_limit: u32,
    bucket_locks: Mutex<HashMap<BucketKey, Arc<Mutex<()>>>>,
}

impl Deduplicator {
    pub fn new(
        matcher: Matcher,
        trust: HashMap<String, u32>,
        date_tolerance_days: i64,
        store_retry_limit: u32,
    ) -> Self {
        Self {
            matcher,
            trust,
            date_tolerance_days,
            store_retry_limit,
            bucket_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let trust = config
            .sources
            .iter()
            .map(|s| (s.name.clone(), s.trust))
            .collect();
        Self::new(
            Matcher::new(
                config.ingest.similarity_threshold,
                config.ingest.date_tolerance_days,
                config.ingest.timezone,
            ),
            trust,
            config.ingest.date_tolerance_days,
            config.ingest.store_retry_limit,
        )
    }

    /// Ingest one normalized event: merge it into an existing canonical
    /// event or create a new one.
    pub async fn ingest(
        &self,
        event: &NormalizedEvent,
        store: &dyn CanonicalStore,
    ) -> Result<IngestOutcome> {
        let bucket = (
            event.city_folded(),
            event.start_day_in(self.matcher.timezone()),
        );
        let lock = self.bucket_lock(&bucket).await;

        let result = {
            let _guard = lock.lock().await;
            let mut attempts = 0;
            loop {
                match self.ingest_locked(event, store).await {
                    Err(FestcalError::StoreConflict { canonical_id })
                        if attempts < self.store_retry_limit =>
                    {
                        attempts += 1;
                        warn!(
                            canonical_id = %canonical_id,
                            attempts,
                            "Store write conflict, retrying merge"
                        );
                    }
                    other => break other,
                }
            }
        };

        drop(lock);
        self.release_bucket_lock(&bucket).await;
        result
    }

    async fn ingest_locked(
        &self,
        event: &NormalizedEvent,
        store: &dyn CanonicalStore,
    ) -> Result<IngestOutcome> {
        let day = event.start_day_in(self.matcher.timezone());
        let from_day = day - Duration::days(self.date_tolerance_days);
        let to_day = day + Duration::days(self.date_tolerance_days);

        let candidates = store
            .find_candidates(&event.city_folded(), from_day, to_day)
            .await?;

        let mut matches: Vec<&CanonicalEvent> = candidates
            .iter()
            .filter(|c| self.matcher.is_duplicate(event, &c.as_normalized()))
            .collect();

        if matches.is_empty() {
            let canonical = CanonicalEvent::from_normalized(event, Utc::now());
            store.upsert(&canonical).await?;
            info!(
                canonical_id = %canonical.canonical_id,
                title = %canonical.title,
                source = %event.source_id,
                "Created canonical event"
            );
            return Ok(IngestOutcome::Created(canonical.canonical_id));
        }

        // Ambiguous cluster: deterministic tie-break on creation order, then
        // canonical id. Non-fatal; flagged for manual review.
        matches.sort_by_key(|c| (c.created_at, c.canonical_id));
        if matches.len() > 1 {
            warn!(
                title = %event.title,
                city = %event.city,
                day = %day,
                candidates = matches.len(),
                chosen = %matches[0].canonical_id,
                "Merge ambiguity: multiple duplicate candidates, merging into earliest-created"
            );
        }

        let target = matches[0];
        let merged = self.merge(target, event, Utc::now());
        store.upsert(&merged).await?;
        debug!(
            canonical_id = %merged.canonical_id,
            source = %event.source_id,
            "Merged sighting into canonical event"
        );
        Ok(IngestOutcome::Merged(merged.canonical_id))
    }

    /// Field-level merge of an incoming sighting into an existing canonical
    /// event. Policy, applied per field independently:
    /// incoming fills empty fields; on conflict the higher-trust source
    /// wins; on a trust tie the longer string wins for `description`, the
    /// range is defensively widened for `start`/`end`, and the stored value
    /// wins otherwise. Provenance always gains the new source.
    fn merge(
        &self,
        existing: &CanonicalEvent,
        incoming: &NormalizedEvent,
        now: DateTime<Utc>,
    ) -> CanonicalEvent {
        let mut merged = existing.clone();
        let incoming_trust = self.trust_for(&incoming.source_id);

        if incoming.title != existing.title
            && incoming_trust > self.field_trust(existing, "title")
        {
            merged.title = incoming.title.clone();
            merged
                .provenance
                .insert("title".to_string(), incoming.source_id.clone());
        }
        if incoming.city != existing.city && incoming_trust > self.field_trust(existing, "city") {
            merged.city = incoming.city.clone();
            merged
                .provenance
                .insert("city".to_string(), incoming.source_id.clone());
        }

        merge_optional_field(
            &mut merged.description,
            incoming.description.as_ref(),
            self.field_trust(existing, "description"),
            incoming_trust,
            TieBreak::Longer,
            "description",
            &incoming.source_id,
            &mut merged.provenance,
        );
        merge_optional_field(
            &mut merged.location,
            incoming.location.as_ref(),
            self.field_trust(existing, "location"),
            incoming_trust,
            TieBreak::KeepExisting,
            "location",
            &incoming.source_id,
            &mut merged.provenance,
        );
        merge_optional_field(
            &mut merged.address,
            incoming.address.as_ref(),
            self.field_trust(existing, "address"),
            incoming_trust,
            TieBreak::KeepExisting,
            "address",
            &incoming.source_id,
            &mut merged.provenance,
        );
        merge_optional_field(
            &mut merged.postal_code,
            incoming.postal_code.as_ref(),
            self.field_trust(existing, "postal_code"),
            incoming_trust,
            TieBreak::KeepExisting,
            "postal_code",
            &incoming.source_id,
            &mut merged.provenance,
        );
        merge_optional_field(
            &mut merged.category,
            incoming.category.as_ref(),
            self.field_trust(existing, "category"),
            incoming_trust,
            TieBreak::KeepExisting,
            "category",
            &incoming.source_id,
            &mut merged.provenance,
        );
        merge_optional_field(
            &mut merged.organizer,
            incoming.organizer.as_ref(),
            self.field_trust(existing, "organizer"),
            incoming_trust,
            TieBreak::KeepExisting,
            "organizer",
            &incoming.source_id,
            &mut merged.provenance,
        );
        merge_optional_field(
            &mut merged.source_url,
            incoming.source_url.as_ref(),
            self.field_trust(existing, "source_url"),
            incoming_trust,
            TieBreak::KeepExisting,
            "source_url",
            &incoming.source_id,
            &mut merged.provenance,
        );
        merge_optional_field(
            &mut merged.image_url,
            incoming.image_url.as_ref(),
            self.field_trust(existing, "image_url"),
            incoming_trust,
            TieBreak::KeepExisting,
            "image_url",
            &incoming.source_id,
            &mut merged.provenance,
        );
        merge_optional_field(
            &mut merged.price,
            incoming.price.as_ref(),
            self.field_trust(existing, "price"),
            incoming_trust,
            TieBreak::KeepExisting,
            "price",
            &incoming.source_id,
            &mut merged.provenance,
        );
        merge_optional_field(
            &mut merged.latitude,
            incoming.latitude.as_ref(),
            self.field_trust(existing, "latitude"),
            incoming_trust,
            TieBreak::KeepExisting,
            "latitude",
            &incoming.source_id,
            &mut merged.provenance,
        );
        merge_optional_field(
            &mut merged.longitude,
            incoming.longitude.as_ref(),
            self.field_trust(existing, "longitude"),
            incoming_trust,
            TieBreak::KeepExisting,
            "longitude",
            &incoming.source_id,
            &mut merged.provenance,
        );

        self.merge_occurrence_window(&mut merged, existing, incoming, incoming_trust);

        // Provenance records every contributing source even when no field
        // value changed.
        merged.sources.insert(incoming.source_id.clone());
        merged.updated_at = now;
        merged
    }

    /// Start/end handling: the higher-trust source wins outright; on a tie
    /// the window is widened to the earliest start and latest end when the
    /// sightings describe the same occurrence with slight drift.
    fn merge_occurrence_window(
        &self,
        merged: &mut CanonicalEvent,
        existing: &CanonicalEvent,
        incoming: &NormalizedEvent,
        incoming_trust: u32,
    ) {
        let start_trust = self.field_trust(existing, "start");
        if incoming.start != existing.start {
            let winner = if incoming_trust > start_trust {
                Some(incoming.start)
            } else if incoming_trust == start_trust {
                Some(existing.start.min(incoming.start))
            } else {
                None
            };
            if let Some(start) = winner {
                if start != existing.start {
                    merged.start = start;
                    merged
                        .provenance
                        .insert("start".to_string(), incoming.source_id.clone());
                }
            }
        }

        let end_trust = self.field_trust(existing, "end");
        match (existing.end, incoming.end) {
            (None, Some(end)) => {
                merged.end = Some(end);
                merged
                    .provenance
                    .insert("end".to_string(), incoming.source_id.clone());
            }
            (Some(current), Some(candidate)) if candidate != current => {
                let winner = if incoming_trust > end_trust {
                    Some(candidate)
                } else if incoming_trust == end_trust {
                    Some(current.max(candidate))
                } else {
                    None
                };
                if let Some(end) = winner {
                    if end != current {
                        merged.end = Some(end);
                        merged
                            .provenance
                            .insert("end".to_string(), incoming.source_id.clone());
                    }
                }
            }
            _ => {}
        }
    }

    fn field_trust(&self, existing: &CanonicalEvent, field: &str) -> u32 {
        existing
            .provenance
            .get(field)
            .and_then(|source| self.trust.get(source))
            .copied()
            .unwrap_or(0)
    }

    fn trust_for(&self, source_id: &str) -> u32 {
        self.trust.get(source_id).copied().unwrap_or(0)
    }

    async fn bucket_lock(&self, bucket: &BucketKey) -> Arc<Mutex<()>> {
        let mut locks = self.bucket_locks.lock().await;
        locks.entry(bucket.clone()).or_default().clone()
    }

    /// Drop the bucket's lock entry once no other worker holds a clone, so
    /// the map does not accumulate one entry per (city, day) ever seen.
    async fn release_bucket_lock(&self, bucket: &BucketKey) {
        let mut locks = self.bucket_locks.lock().await;
        if locks
            .get(bucket)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(bucket);
        }
    }
}

/// Tie-break rule when both sides carry a value at equal trust.
enum TieBreak {
    /// Keep the stored value.
    KeepExisting,
    /// Prefer the longer representation (free-text fields).
    Longer,
}

trait MergeValue: Clone + PartialEq {
    fn longer_than(&self, other: &Self) -> bool;
}

impl MergeValue for String {
    fn longer_than(&self, other: &Self) -> bool {
        self.len() > other.len()
    }
}

impl MergeValue for f64 {
    fn longer_than(&self, _other: &Self) -> bool {
        false
    }
}

#[allow(clippy::too_many_arguments)]
fn merge_optional_field<T: MergeValue>(
    stored: &mut Option<T>,
    incoming: Option<&T>,
    existing_trust: u32,
    incoming_trust: u32,
    tie_break: TieBreak,
    field: &str,
    source_id: &str,
    provenance: &mut std::collections::BTreeMap<String, String>,
) {
    let Some(candidate) = incoming else {
        return;
    };

    let take = match stored.as_ref() {
        None => true,
        Some(current) if current == candidate => false,
        Some(current) => {
            if incoming_trust != existing_trust {
                incoming_trust > existing_trust
            } else {
                match tie_break {
                    TieBreak::KeepExisting => false,
                    TieBreak::Longer => candidate.longer_than(current),
                }
            }
        }
    };

    if take {
        *stored = Some(candidate.clone());
        provenance.insert(field.to_string(), source_id.to_string());
    }
}
