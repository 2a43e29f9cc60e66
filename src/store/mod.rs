pub mod in_memory;

pub use in_memory::InMemoryStore;

use crate::domain::CanonicalEvent;
use crate::error::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use uuid::Uuid;

/// Filter conjunction for catalog reads. All present filters must hold;
/// the date range is half-open `[start_from, start_until)`.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub city: Option<String>,
    pub category: Option<String>,
    pub start_from: Option<NaiveDate>,
    pub start_until: Option<NaiveDate>,
    pub limit: Option<usize>,
}

/// Durable upsert/query layer keyed by canonical identity.
///
/// A single logical writer (the deduplicator) holds the write side per run;
/// reads may be concurrent with writes but always observe a consistent
/// snapshot. `upsert` enforces optimistic concurrency: the incoming revision
/// must match the stored one or the write is rejected with `StoreConflict`.
#[async_trait]
pub trait CanonicalStore: Send + Sync {
    async fn upsert(&self, event: &CanonicalEvent) -> Result<()>;

    async fn get(&self, canonical_id: Uuid) -> Result<Option<CanonicalEvent>>;

    /// Canonical events sharing the given city (case-folded) with a start
    /// day inside `[from_day, to_day]`, days resolved in the store's catalog
    /// zone. Index-bounded; never a full scan.
    async fn find_candidates(
        &self,
        city: &str,
        from_day: NaiveDate,
        to_day: NaiveDate,
    ) -> Result<Vec<CanonicalEvent>>;

    /// Filtered catalog read, ordered by start ascending then canonical id.
    async fn query(&self, query: &EventQuery) -> Result<Vec<CanonicalEvent>>;

    async fn count(&self) -> Result<usize>;
}
