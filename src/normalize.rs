use crate::domain::{NormalizedEvent, RawRecord};
use crate::error::ValidationFailure;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").unwrap());
static WS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Datetime layouts accepted from source records, tried in order.
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%d.%m.%Y %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d.%m.%Y"];

const TIME_FORMATS: &[&str] = &["%H:%M:%S", "%H:%M"];

/// Turns raw source records into validated events. Stateless; never touches
/// the store.
pub struct Normalizer {
    timezone: Tz,
}

impl Normalizer {
    pub fn new(timezone: Tz) -> Self {
        Self { timezone }
    }

    /// Normalize one raw record. A listing spanning several dates yields one
    /// event per concrete date, identical in every other field.
    pub fn normalize(
        &self,
        raw: &RawRecord,
    ) -> Result<Vec<NormalizedEvent>, ValidationFailure> {
        let fields = raw
            .fields
            .as_object()
            .ok_or_else(|| ValidationFailure::new("record", "not a field object"))?;

        let title = clean_text(string_field(fields, &["title", "name"]).as_deref())
            .ok_or_else(|| ValidationFailure::new("title", "missing or empty"))?;
        let city = clean_text(string_field(fields, &["city"]).as_deref())
            .ok_or_else(|| ValidationFailure::new("city", "missing or empty"))?;

        let starts = self.parse_starts(fields)?;
        let end = match string_field(fields, &["end_datetime", "end"]) {
            Some(raw_end) => Some(self.parse_instant(&raw_end).ok_or_else(|| {
                ValidationFailure::new("end_datetime", "unparseable_datetime")
            })?),
            None => None,
        };

        let description = clean_text(string_field(fields, &["description"]).as_deref());
        let location = clean_text(string_field(fields, &["location", "venue"]).as_deref());
        let address = clean_text(string_field(fields, &["address"]).as_deref());
        let postal_code = clean_text(string_field(fields, &["postal_code", "zip"]).as_deref());
        let category = clean_text(string_field(fields, &["category"]).as_deref());
        let organizer = clean_text(string_field(fields, &["organizer"]).as_deref());
        let source_url = clean_text(string_field(fields, &["source_url", "url"]).as_deref());
        let image_url = clean_text(string_field(fields, &["image_url"]).as_deref());
        let price = clean_text(string_field(fields, &["price"]).as_deref());
        let latitude = number_field(fields, "latitude");
        let longitude = number_field(fields, "longitude");

        // A shared end on a multi-date listing fixes the duration of the
        // first instance; every instance gets the same span relative to its
        // own start. A negative span fails validation below.
        let shared_duration = match (&starts[..], end) {
            ([first, _, ..], Some(end)) => Some(end - *first),
            _ => None,
        };

        let mut events = Vec::with_capacity(starts.len());
        for start in starts {
            let end = match shared_duration {
                Some(duration) => Some(start + duration),
                None => end,
            };
            if let Some(end) = end {
                if end < start {
                    return Err(ValidationFailure::new(
                        "end_datetime",
                        "end before start",
                    ));
                }
            }

            events.push(NormalizedEvent {
                title: title.clone(),
                description: description.clone(),
                start,
                end,
                location: location.clone(),
                address: address.clone(),
                city: city.clone(),
                postal_code: postal_code.clone(),
                latitude,
                longitude,
                category: category.clone(),
                organizer: organizer.clone(),
                source_url: source_url.clone(),
                image_url: image_url.clone(),
                price: price.clone(),
                source_id: raw.source_id.clone(),
            });
        }

        debug!(
            source = %raw.source_id,
            title = %events[0].title,
            instances = events.len(),
            "Normalized record"
        );
        Ok(events)
    }

    /// Resolve the start instants of a record: either a single start field or
    /// a `dates` array, optionally combined with a shared time-of-day.
    fn parse_starts(
        &self,
        fields: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Vec<DateTime<Utc>>, ValidationFailure> {
        let shared_time = string_field(fields, &["time", "start_time"])
            .as_deref()
            .and_then(parse_time);

        if let Some(dates) = fields.get("dates").and_then(|v| v.as_array()) {
            if dates.is_empty() {
                return Err(ValidationFailure::new("dates", "empty date list"));
            }
            let mut starts = Vec::with_capacity(dates.len());
            for value in dates {
                let text = value.as_str().ok_or_else(|| {
                    ValidationFailure::new("dates", "non-string date entry")
                })?;
                let start = self
                    .parse_instant_with_time(text, shared_time)
                    .ok_or_else(|| ValidationFailure::new("dates", "unparseable_datetime"))?;
                starts.push(start);
            }
            return Ok(starts);
        }

        let raw_start = string_field(fields, &["start_datetime", "start", "date", "datetime"])
            .ok_or_else(|| ValidationFailure::new("start_datetime", "missing"))?;
        let start = self
            .parse_instant_with_time(&raw_start, shared_time)
            .ok_or_else(|| ValidationFailure::new("start_datetime", "unparseable_datetime"))?;
        Ok(vec![start])
    }

    fn parse_instant_with_time(
        &self,
        text: &str,
        shared_time: Option<NaiveTime>,
    ) -> Option<DateTime<Utc>> {
        let trimmed = text.trim();

        // Date-only values take the shared time-of-day when one was given.
        for format in DATE_FORMATS {
            if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
                let time = shared_time.unwrap_or_else(|| NaiveTime::from_hms_opt(0, 0, 0).unwrap());
                return self.local_to_utc(date.and_time(time));
            }
        }

        self.parse_instant(trimmed)
    }

    /// Parse a single datetime string into a UTC instant. Naive values are
    /// interpreted in the configured local zone.
    fn parse_instant(&self, text: &str) -> Option<DateTime<Utc>> {
        let trimmed = text.trim();

        if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
            return Some(dt.with_timezone(&Utc));
        }

        for format in DATETIME_FORMATS {
            if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
                return self.local_to_utc(naive);
            }
        }

        for format in DATE_FORMATS {
            if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
                return self.local_to_utc(date.and_time(NaiveTime::from_hms_opt(0, 0, 0).unwrap()));
            }
        }

        None
    }

    fn local_to_utc(&self, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
        // `latest` covers the fall-back DST hour; a time inside the spring
        // gap has no local representation and is rejected.
        self.timezone
            .from_local_datetime(&naive)
            .latest()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

/// First present string value among the given keys.
fn string_field(
    fields: &serde_json::Map<String, serde_json::Value>,
    keys: &[&str],
) -> Option<String> {
    keys.iter()
        .find_map(|key| fields.get(*key))
        .and_then(|v| match v {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

fn number_field(fields: &serde_json::Map<String, serde_json::Value>, key: &str) -> Option<f64> {
    match fields.get(key)? {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_time(text: &str) -> Option<NaiveTime> {
    let trimmed = text.trim();
    TIME_FORMATS
        .iter()
        .find_map(|format| NaiveTime::parse_from_str(trimmed, format).ok())
}

/// Trim, collapse whitespace, strip markup remnants and decode the handful
/// of HTML entities that survive extraction. Case is preserved.
fn clean_text(value: Option<&str>) -> Option<String> {
    let value = value?;
    let without_tags = TAG_RE.replace_all(value, " ");
    let decoded = without_tags
        .replace("&amp;", "&")
        .replace("&nbsp;", " ")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">");
    let collapsed = WS_RE.replace_all(decoded.trim(), " ").to_string();
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}
