use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Raw field data as produced by a source adapter. Ephemeral; consumed by the
/// normalizer within a single ingestion pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    pub source_id: String,
    pub fields: serde_json::Value,
}

impl RawRecord {
    pub fn new(source_id: impl Into<String>, fields: serde_json::Value) -> Self {
        Self {
            source_id: source_id.into(),
            fields,
        }
    }
}

/// A validated, schema-conformant event produced by the normalizer.
///
/// `start` is always a timezone-aware UTC instant; naive datetimes are
/// resolved against the configured local zone during normalization and do
/// not exist past this point.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NormalizedEvent {
    pub title: String,
    pub description: Option<String>,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub location: Option<String>,
    pub address: Option<String>,
    pub city: String,
    pub postal_code: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub category: Option<String>,
    pub organizer: Option<String>,
    pub source_url: Option<String>,
    pub image_url: Option<String>,
    pub price: Option<String>,
    pub source_id: String,
}

impl NormalizedEvent {
    /// Calendar day of the start in the given zone, used for candidate
    /// bucketing and duplicate gating. Date-only listings resolve to local
    /// midnight, so the UTC day may be one off; the catalog zone day is the
    /// one that identifies the occurrence.
    pub fn start_day_in(&self, timezone: Tz) -> NaiveDate {
        self.start.with_timezone(&timezone).date_naive()
    }

    /// Case-folded city, used for bucketing and matching.
    pub fn city_folded(&self) -> String {
        self.city.to_lowercase()
    }
}

/// The deduplicated, merged representation of one real-world event.
///
/// `canonical_id` is immutable once assigned. `provenance` maps each stored
/// field name to the source that supplied its current value; `sources` lists
/// every source that ever contributed a sighting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub canonical_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub location: Option<String>,
    pub address: Option<String>,
    pub city: String,
    pub postal_code: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub category: Option<String>,
    pub organizer: Option<String>,
    pub source_url: Option<String>,
    pub image_url: Option<String>,
    pub price: Option<String>,
    pub sources: BTreeSet<String>,
    pub provenance: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic concurrency token, bumped by the store on every upsert.
    pub revision: u64,
}

impl CanonicalEvent {
    /// Create a fresh canonical event from the first sighting.
    pub fn from_normalized(event: &NormalizedEvent, now: DateTime<Utc>) -> Self {
        let mut provenance = BTreeMap::new();
        for field in Self::field_names(event) {
            provenance.insert(field.to_string(), event.source_id.clone());
        }
        let mut sources = BTreeSet::new();
        sources.insert(event.source_id.clone());

        Self {
            canonical_id: Uuid::new_v4(),
            title: event.title.clone(),
            description: event.description.clone(),
            start: event.start,
            end: event.end,
            location: event.location.clone(),
            address: event.address.clone(),
            city: event.city.clone(),
            postal_code: event.postal_code.clone(),
            latitude: event.latitude,
            longitude: event.longitude,
            category: event.category.clone(),
            organizer: event.organizer.clone(),
            source_url: event.source_url.clone(),
            image_url: event.image_url.clone(),
            price: event.price.clone(),
            sources,
            provenance,
            created_at: now,
            updated_at: now,
            revision: 0,
        }
    }

    /// Names of the fields the incoming event actually populated.
    fn field_names(event: &NormalizedEvent) -> Vec<&'static str> {
        let mut fields = vec!["title", "start", "city"];
        if event.description.is_some() {
            fields.push("description");
        }
        if event.end.is_some() {
            fields.push("end");
        }
        if event.location.is_some() {
            fields.push("location");
        }
        if event.address.is_some() {
            fields.push("address");
        }
        if event.postal_code.is_some() {
            fields.push("postal_code");
        }
        if event.latitude.is_some() {
            fields.push("latitude");
        }
        if event.longitude.is_some() {
            fields.push("longitude");
        }
        if event.category.is_some() {
            fields.push("category");
        }
        if event.organizer.is_some() {
            fields.push("organizer");
        }
        if event.source_url.is_some() {
            fields.push("source_url");
        }
        if event.image_url.is_some() {
            fields.push("image_url");
        }
        if event.price.is_some() {
            fields.push("price");
        }
        fields
    }

    pub fn start_day_in(&self, timezone: Tz) -> NaiveDate {
        self.start.with_timezone(&timezone).date_naive()
    }

    pub fn city_folded(&self) -> String {
        self.city.to_lowercase()
    }

    /// View of this canonical event as a normalized event, for similarity
    /// comparison against incoming candidates.
    pub fn as_normalized(&self) -> NormalizedEvent {
        NormalizedEvent {
            title: self.title.clone(),
            description: self.description.clone(),
            start: self.start,
            end: self.end,
            location: self.location.clone(),
            address: self.address.clone(),
            city: self.city.clone(),
            postal_code: self.postal_code.clone(),
            latitude: self.latitude,
            longitude: self.longitude,
            category: self.category.clone(),
            organizer: self.organizer.clone(),
            source_url: self.source_url.clone(),
            image_url: self.image_url.clone(),
            price: self.price.clone(),
            source_id: String::new(),
        }
    }
}

/// Outcome of ingesting one normalized event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Created(Uuid),
    Merged(Uuid),
}

impl IngestOutcome {
    pub fn canonical_id(&self) -> Uuid {
        match self {
            IngestOutcome::Created(id) | IngestOutcome::Merged(id) => *id,
        }
    }
}

/// One failed source within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceFailure {
    pub source_id: String,
    pub reason: String,
}

/// Bookkeeping for one pipeline execution. Created at run start, finalized
/// at run end, immutable thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionRun {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub raw_records: usize,
    pub normalized_events: usize,
    pub rejected_records: usize,
    pub created_events: usize,
    pub merged_events: usize,
    /// Events that passed normalization but could not be written, e.g. a
    /// store conflict that survived the retry budget.
    pub failed_events: usize,
    pub source_failures: Vec<SourceFailure>,
}

impl IngestionRun {
    pub fn start(now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: now,
            finished_at: None,
            raw_records: 0,
            normalized_events: 0,
            rejected_records: 0,
            created_events: 0,
            merged_events: 0,
            failed_events: 0,
            source_failures: Vec::new(),
        }
    }

    pub fn finalize(&mut self, now: DateTime<Utc>) {
        self.finished_at = Some(now);
    }

    /// A run is degraded when some sources failed but events still flowed.
    pub fn is_degraded(&self) -> bool {
        !self.source_failures.is_empty()
    }
}
