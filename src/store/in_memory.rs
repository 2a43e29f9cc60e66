use super::{CanonicalStore, EventQuery};
use crate::domain::CanonicalEvent;
use crate::error::{FestcalError, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use chrono_tz::Tz;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;
use uuid::Uuid;

type BucketKey = (String, NaiveDate);

#[derive(Default)]
struct Inner {
    events: HashMap<Uuid, CanonicalEvent>,
    /// (city folded, start day) -> canonical ids, for index-bounded
    /// candidate lookup.
    buckets: HashMap<BucketKey, BTreeSet<Uuid>>,
}

/// In-memory canonical store with optional JSON snapshot persistence.
///
/// One mutex guards both the event map and the bucket index, so every read
/// observes a consistent snapshot and no partially merged record is visible.
/// Bucket days and date filters are resolved in the given catalog zone; it
/// must be the same zone the matcher gates by.
pub struct InMemoryStore {
    inner: Arc<Mutex<Inner>>,
    timezone: Tz,
}

impl InMemoryStore {
    pub fn new(timezone: Tz) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            timezone,
        }
    }

    /// Load a catalog snapshot written by `save`. A missing file yields an
    /// empty store so first runs need no special casing.
    pub fn load(path: impl AsRef<Path>, timezone: Tz) -> Result<Self> {
        let path = path.as_ref();
        let store = Self::new(timezone);
        if !path.exists() {
            return Ok(store);
        }

        let content = std::fs::read_to_string(path)?;
        let events: Vec<CanonicalEvent> = serde_json::from_str(&content)?;
        {
            let mut inner = store.inner.lock().expect("store mutex poisoned");
            for event in events {
                inner
                    .buckets
                    .entry((event.city_folded(), event.start_day_in(timezone)))
                    .or_default()
                    .insert(event.canonical_id);
                inner.events.insert(event.canonical_id, event);
            }
        }
        Ok(store)
    }

    /// Persist the catalog as a JSON snapshot.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<usize> {
        let events = {
            let inner = self.inner.lock().expect("store mutex poisoned");
            let mut events: Vec<CanonicalEvent> = inner.events.values().cloned().collect();
            events.sort_by_key(|e| (e.start, e.canonical_id));
            events
        };

        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&events)?;
        std::fs::write(path, json)?;
        Ok(events.len())
    }
}

#[async_trait]
impl CanonicalStore for InMemoryStore {
    async fn upsert(&self, event: &CanonicalEvent) -> Result<()> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");

        let mut stored = event.clone();
        stored.revision = event.revision + 1;
        if let Some(existing) = inner.events.get(&event.canonical_id) {
            if existing.revision != event.revision {
                return Err(FestcalError::StoreConflict {
                    canonical_id: event.canonical_id,
                });
            }

            // Merge widening can shift the start day; keep the index honest.
            let old_bucket = (existing.city_folded(), existing.start_day_in(self.timezone));
            let new_bucket = (stored.city_folded(), stored.start_day_in(self.timezone));
            if old_bucket != new_bucket {
                if let Some(ids) = inner.buckets.get_mut(&old_bucket) {
                    ids.remove(&event.canonical_id);
                }
            }
        }

        inner
            .buckets
            .entry((stored.city_folded(), stored.start_day_in(self.timezone)))
            .or_default()
            .insert(stored.canonical_id);
        debug!(canonical_id = %stored.canonical_id, revision = stored.revision, "Upserted canonical event");
        inner.events.insert(stored.canonical_id, stored);
        Ok(())
    }

    async fn get(&self, canonical_id: Uuid) -> Result<Option<CanonicalEvent>> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        Ok(inner.events.get(&canonical_id).cloned())
    }

    async fn find_candidates(
        &self,
        city: &str,
        from_day: NaiveDate,
        to_day: NaiveDate,
    ) -> Result<Vec<CanonicalEvent>> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        let city = city.to_lowercase();

        let mut candidates = Vec::new();
        let mut day = from_day;
        while day <= to_day {
            if let Some(ids) = inner.buckets.get(&(city.clone(), day)) {
                for id in ids {
                    if let Some(event) = inner.events.get(id) {
                        candidates.push(event.clone());
                    }
                }
            }
            day = day.succ_opt().ok_or_else(|| FestcalError::Store {
                message: "date overflow while scanning candidate buckets".to_string(),
            })?;
        }

        candidates.sort_by_key(|e| (e.created_at, e.canonical_id));
        Ok(candidates)
    }

    async fn query(&self, query: &EventQuery) -> Result<Vec<CanonicalEvent>> {
        let inner = self.inner.lock().expect("store mutex poisoned");

        let city = query.city.as_ref().map(|c| c.to_lowercase());
        let category = query.category.as_ref().map(|c| c.to_lowercase());

        let mut results: Vec<CanonicalEvent> = inner
            .events
            .values()
            .filter(|e| match &city {
                Some(city) => e.city_folded() == *city,
                None => true,
            })
            .filter(|e| match &category {
                Some(category) => {
                    e.category.as_deref().map(str::to_lowercase).as_deref() == Some(category)
                }
                None => true,
            })
            .filter(|e| match query.start_from {
                Some(from) => e.start_day_in(self.timezone) >= from,
                None => true,
            })
            .filter(|e| match query.start_until {
                Some(until) => e.start_day_in(self.timezone) < until,
                None => true,
            })
            .cloned()
            .collect();

        results.sort_by_key(|e| (e.start, e.canonical_id));
        if let Some(limit) = query.limit {
            results.truncate(limit);
        }
        Ok(results)
    }

    async fn count(&self) -> Result<usize> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        Ok(inner.events.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NormalizedEvent;
    use chrono::{NaiveDateTime, Utc};

    fn canonical(title: &str, start: &str, city: &str, category: Option<&str>) -> CanonicalEvent {
        let normalized = NormalizedEvent {
            title: title.to_string(),
            description: None,
            start: NaiveDateTime::parse_from_str(start, "%Y-%m-%d %H:%M")
                .unwrap()
                .and_utc(),
            end: None,
            location: None,
            address: None,
            city: city.to_string(),
            postal_code: None,
            latitude: None,
            longitude: None,
            category: category.map(str::to_string),
            organizer: None,
            source_url: None,
            image_url: None,
            price: None,
            source_id: "test".to_string(),
        };
        CanonicalEvent::from_normalized(&normalized, Utc::now())
    }

    #[tokio::test]
    async fn candidate_lookup_is_bounded_by_city_and_day() {
        let store = InMemoryStore::new(chrono_tz::UTC);
        let a = canonical("Weinfest", "2024-09-01 18:00", "Wiesbaden", None);
        let b = canonical("Weinfest", "2024-09-05 18:00", "Wiesbaden", None);
        let c = canonical("Weinfest", "2024-09-01 18:00", "Mainz", None);
        store.upsert(&a).await.unwrap();
        store.upsert(&b).await.unwrap();
        store.upsert(&c).await.unwrap();

        let day = a.start_day_in(chrono_tz::UTC);
        let candidates = store
            .find_candidates("wiesbaden", day.pred_opt().unwrap(), day.succ_opt().unwrap())
            .await
            .unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].canonical_id, a.canonical_id);
    }

    #[tokio::test]
    async fn buckets_use_the_catalog_zone_day() {
        let store = InMemoryStore::new(chrono_tz::Europe::Berlin);
        // Dec 23 23:00 UTC is local midnight of Dec 24, the day a date-only
        // listing of the 24th resolves to.
        let event = canonical("Weihnachtsmarkt", "2024-12-23 23:00", "Frankfurt", None);
        store.upsert(&event).await.unwrap();

        let local_day = NaiveDate::from_ymd_opt(2024, 12, 24).unwrap();
        let candidates = store
            .find_candidates("frankfurt", local_day, local_day)
            .await
            .unwrap();
        assert_eq!(candidates.len(), 1);

        let utc_day = NaiveDate::from_ymd_opt(2024, 12, 23).unwrap();
        let misses = store
            .find_candidates("frankfurt", utc_day, utc_day)
            .await
            .unwrap();
        assert!(misses.is_empty());
    }

    #[tokio::test]
    async fn upsert_rejects_stale_revision() {
        let store = InMemoryStore::new(chrono_tz::UTC);
        let event = canonical("Weinfest", "2024-09-01 18:00", "Wiesbaden", None);
        store.upsert(&event).await.unwrap();

        // Stored copy is now revision 1; writing with revision 0 again races.
        let fresh = store.get(event.canonical_id).await.unwrap().unwrap();
        assert_eq!(fresh.revision, 1);
        let err = store.upsert(&event).await.unwrap_err();
        assert!(matches!(err, FestcalError::StoreConflict { .. }));

        store.upsert(&fresh).await.unwrap();
        let bumped = store.get(event.canonical_id).await.unwrap().unwrap();
        assert_eq!(bumped.revision, 2);
    }

    #[tokio::test]
    async fn query_applies_filters_ordering_and_limit() {
        let store = InMemoryStore::new(chrono_tz::UTC);
        let a = canonical("Fest A", "2024-09-02 18:00", "Wiesbaden", Some("Musik"));
        let b = canonical("Fest B", "2024-09-01 18:00", "Wiesbaden", Some("Markt"));
        let c = canonical("Fest C", "2024-09-03 18:00", "Mainz", Some("Musik"));
        for event in [&a, &b, &c] {
            store.upsert(event).await.unwrap();
        }

        let all = store.query(&EventQuery::default()).await.unwrap();
        let titles: Vec<&str> = all.iter().map(|e| e.title.as_str()).collect();
        assert_eq!(titles, vec!["Fest B", "Fest A", "Fest C"]);

        let wiesbaden = store
            .query(&EventQuery {
                city: Some("Wiesbaden".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(wiesbaden.len(), 2);

        let musik = store
            .query(&EventQuery {
                category: Some("musik".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(musik.len(), 2);

        // Half-open range excludes the end date.
        let ranged = store
            .query(&EventQuery {
                start_from: Some(NaiveDate::from_ymd_opt(2024, 9, 1).unwrap()),
                start_until: Some(NaiveDate::from_ymd_opt(2024, 9, 3).unwrap()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(ranged.len(), 2);

        let limited = store
            .query(&EventQuery {
                limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].title, "Fest B");
    }

    #[tokio::test]
    async fn snapshot_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");

        let store = InMemoryStore::new(chrono_tz::UTC);
        let event = canonical("Weinfest", "2024-09-01 18:00", "Wiesbaden", None);
        store.upsert(&event).await.unwrap();
        assert_eq!(store.save(&path).unwrap(), 1);

        let reloaded = InMemoryStore::load(&path, chrono_tz::UTC).unwrap();
        assert_eq!(reloaded.count().await.unwrap(), 1);
        let loaded = reloaded.get(event.canonical_id).await.unwrap().unwrap();
        assert_eq!(loaded.title, "Weinfest");

        // Bucket index is rebuilt on load.
        let day = event.start_day_in(chrono_tz::UTC);
        let candidates = reloaded
            .find_candidates("wiesbaden", day, day)
            .await
            .unwrap();
        assert_eq!(candidates.len(), 1);
    }

    #[tokio::test]
    async fn missing_snapshot_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = InMemoryStore::load(dir.path().join("absent.json"), chrono_tz::UTC).unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
    }
}
