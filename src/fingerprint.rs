use crate::domain::NormalizedEvent;
use chrono::NaiveDate;
use chrono_tz::Tz;
use std::collections::BTreeSet;
use strsim::jaro_winkler;

/// Tokens that carry no identity signal in event titles.
const STOPWORDS: &[&str] = &[
    "der", "die", "das", "den", "dem", "des", "ein", "eine", "im", "in", "am", "an", "auf",
    "und", "mit", "für", "bei", "zum", "zur", "the", "a", "of", "at", "on", "and",
];

/// Weighting of the similarity signals. The title token overlap is the
/// primary signal and must stay at or above 0.5.
const TITLE_WEIGHT: f64 = 0.60;
const LOCATION_WEIGHT: f64 = 0.25;
const CITY_WEIGHT: f64 = 0.15;

/// Derived identity key of a sighting. Recomputed per comparison, never
/// persisted. The start day is resolved in the catalog zone so that a
/// date-only listing (stored as local midnight) and an explicit instant of
/// the same local day carry the same calendar day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub title: String,
    pub title_tokens: BTreeSet<String>,
    pub start_day: NaiveDate,
    pub city: String,
    pub location: Option<String>,
}

impl Fingerprint {
    pub fn of(event: &NormalizedEvent, timezone: Tz) -> Self {
        Self {
            title: event.title.to_lowercase(),
            title_tokens: tokenize(&event.title),
            start_day: event.start_day_in(timezone),
            city: event.city_folded(),
            location: event.location.as_ref().map(|l| l.to_lowercase()),
        }
    }
}

/// Pairwise duplicate scoring between normalized events. Symmetric and
/// deterministic for identical inputs. Must be constructed with the same
/// zone the store buckets by, or candidate lookups and gating disagree.
#[derive(Debug, Clone)]
pub struct Matcher {
    threshold: f64,
    date_tolerance_days: i64,
    timezone: Tz,
}

impl Matcher {
    pub fn new(threshold: f64, date_tolerance_days: i64, timezone: Tz) -> Self {
        Self {
            threshold,
            date_tolerance_days,
            timezone,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Similarity score in [0, 1].
    ///
    /// Start-day equality is a hard gate: differing days force the score to
    /// 0 regardless of title similarity, unless both sightings list the same
    /// location and the days are within the configured tolerance (absorbing
    /// timezone and rounding artifacts).
    pub fn similarity(&self, a: &NormalizedEvent, b: &NormalizedEvent) -> f64 {
        let a = Fingerprint::of(a, self.timezone);
        let b = Fingerprint::of(b, self.timezone);

        if !self.dates_compatible(&a, &b) {
            return 0.0;
        }

        let title_sim = title_similarity(&a, &b);
        let city_sim = jaro_winkler(&a.city, &b.city);
        let location_sim = match (&a.location, &b.location) {
            (Some(la), Some(lb)) => jaro_winkler(la, lb),
            _ => city_sim,
        };

        let score = TITLE_WEIGHT * title_sim + LOCATION_WEIGHT * location_sim + CITY_WEIGHT * city_sim;
        score.clamp(0.0, 1.0)
    }

    pub fn is_duplicate(&self, a: &NormalizedEvent, b: &NormalizedEvent) -> bool {
        self.similarity(a, b) >= self.threshold
    }

    fn dates_compatible(&self, a: &Fingerprint, b: &Fingerprint) -> bool {
        let day_diff = (a.start_day - b.start_day).num_days().abs();
        if day_diff == 0 {
            return true;
        }
        if day_diff > self.date_tolerance_days {
            return false;
        }
        match (&a.location, &b.location) {
            (Some(la), Some(lb)) => la == lb,
            _ => false,
        }
    }
}

/// Case-folded title tokens, split on non-alphanumeric boundaries.
fn tokenize(title: &str) -> BTreeSet<String> {
    title
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Overlap coefficient over filtered title tokens, so a subset title
/// ("Weinfest" vs "Weinfest Wiesbaden") still scores 1.0. Tokens naming
/// either event's city are dropped: sources routinely suffix the city onto
/// titles without it signalling a different event.
fn title_similarity(a: &Fingerprint, b: &Fingerprint) -> f64 {
    let mut noise: BTreeSet<String> = STOPWORDS.iter().map(|s| s.to_string()).collect();
    noise.extend(tokenize(&a.city));
    noise.extend(tokenize(&b.city));

    let tokens_a: BTreeSet<&String> = a.title_tokens.iter().filter(|t| !noise.contains(*t)).collect();
    let tokens_b: BTreeSet<&String> = b.title_tokens.iter().filter(|t| !noise.contains(*t)).collect();

    if tokens_a.is_empty() || tokens_b.is_empty() {
        // A title consisting solely of noise tokens still matches itself.
        return if a.title == b.title { 1.0 } else { 0.0 };
    }

    let intersection = tokens_a.intersection(&tokens_b).count() as f64;
    intersection / tokens_a.len().min(tokens_b.len()) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;

    fn event(title: &str, start: &str, city: &str, location: Option<&str>) -> NormalizedEvent {
        NormalizedEvent {
            title: title.to_string(),
            description: None,
            start: NaiveDateTime::parse_from_str(start, "%Y-%m-%d %H:%M")
                .unwrap()
                .and_utc(),
            end: None,
            location: location.map(str::to_string),
            address: None,
            city: city.to_string(),
            postal_code: None,
            latitude: None,
            longitude: None,
            category: None,
            organizer: None,
            source_url: None,
            image_url: None,
            price: None,
            source_id: "test".to_string(),
        }
    }

    fn matcher() -> Matcher {
        Matcher::new(0.85, 1, chrono_tz::UTC)
    }

    #[test]
    fn similarity_is_symmetric() {
        let a = event("Weinfest", "2024-09-01 18:00", "Wiesbaden", None);
        let b = event("Weinfest Wiesbaden", "2024-09-01 19:00", "Wiesbaden", None);
        let m = matcher();
        assert_eq!(m.similarity(&a, &b), m.similarity(&b, &a));
    }

    #[test]
    fn identical_events_score_one() {
        let a = event("Weinfest", "2024-09-01 18:00", "Wiesbaden", Some("Schlossplatz"));
        let m = matcher();
        assert!((m.similarity(&a, &a) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn city_suffix_in_title_still_matches() {
        let a = event("Weinfest", "2024-09-01 18:00", "Wiesbaden", None);
        let b = event("Weinfest Wiesbaden", "2024-09-01 12:00", "Wiesbaden", None);
        assert!(matcher().is_duplicate(&a, &b));
    }

    #[test]
    fn date_gate_forces_zero_without_shared_location() {
        // More than one day apart, titles identical: never a duplicate.
        let a = event("Weinfest", "2024-09-01 18:00", "Wiesbaden", None);
        let b = event("Weinfest", "2024-09-04 18:00", "Wiesbaden", None);
        assert_eq!(matcher().similarity(&a, &b), 0.0);

        // One day apart but no shared location: still gated.
        let c = event("Weinfest", "2024-09-02 18:00", "Wiesbaden", None);
        assert_eq!(matcher().similarity(&a, &c), 0.0);
    }

    #[test]
    fn one_day_drift_with_shared_location_is_tolerated() {
        let a = event("Weinfest", "2024-09-01 23:30", "Wiesbaden", Some("Schlossplatz"));
        let b = event("Weinfest", "2024-09-02 00:30", "Wiesbaden", Some("Schlossplatz"));
        assert!(matcher().is_duplicate(&a, &b));
    }

    #[test]
    fn day_gate_uses_the_catalog_zone() {
        let berlin = chrono_tz::Europe::Berlin;
        let m = Matcher::new(0.85, 1, berlin);

        // A date-only listing resolves to local midnight of Dec 24, stored
        // as Dec 23 23:00 UTC; an explicit instant falls mid-day Dec 24.
        let a = event("Weihnachtsmarkt", "2024-12-23 23:00", "Frankfurt", None);
        let b = event("Weihnachtsmarkt", "2024-12-24 10:00", "Frankfurt", None);

        let day = NaiveDate::from_ymd_opt(2024, 12, 24).unwrap();
        assert_eq!(Fingerprint::of(&a, berlin).start_day, day);
        assert_eq!(Fingerprint::of(&b, berlin).start_day, day);
        assert!(m.is_duplicate(&a, &b));

        // Gated under a UTC matcher, where the days genuinely differ.
        assert_eq!(matcher().similarity(&a, &b), 0.0);
    }

    #[test]
    fn different_titles_do_not_match() {
        let a = event("Weinfest", "2024-09-01 18:00", "Wiesbaden", None);
        let b = event("Oktoberfest", "2024-09-01 18:00", "Wiesbaden", None);
        assert!(!matcher().is_duplicate(&a, &b));
    }

    #[test]
    fn fingerprint_drops_case_and_punctuation() {
        let a = event("Wein-Fest am Rhein", "2024-09-01 18:00", "Wiesbaden", None);
        let fp = Fingerprint::of(&a, chrono_tz::UTC);
        assert!(fp.title_tokens.contains("wein"));
        assert!(fp.title_tokens.contains("fest"));
        assert!(fp.title_tokens.contains("rhein"));
        assert_eq!(fp.city, "wiesbaden");
    }
}
