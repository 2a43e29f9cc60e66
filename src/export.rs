use crate::domain::CanonicalEvent;
use crate::error::Result;
use chrono::{DateTime, Utc};
use icalendar::{Calendar, Component, EventLike};
use std::path::Path;
use tracing::info;

const PRODID: &str = "-//festcal//Rhein-Main Events//DE";

/// Serialize canonical events into an iCalendar feed.
///
/// The component UID is derived from the immutable `canonical_id`, never
/// regenerated, so repeated exports of an unchanged catalog are byte-stable
/// apart from the DTSTAMP generation timestamp. All datetimes are emitted as
/// UTC instants; nothing naive can reach this point because every stored
/// datetime is `DateTime<Utc>` by construction.
pub fn export_calendar(events: &[CanonicalEvent], calendar_name: &str) -> String {
    let mut cal = Calendar::new();
    cal.name(calendar_name);

    let mut ordered: Vec<&CanonicalEvent> = events.iter().collect();
    ordered.sort_by_key(|e| (e.start, e.canonical_id));

    for event in ordered {
        cal.push(to_component(event));
    }

    rewrite_prodid(&cal.done().to_string())
}

/// Export a filtered catalog slice to an .ics file. Returns the number of
/// components written.
pub fn export_to_file(
    events: &[CanonicalEvent],
    calendar_name: &str,
    path: impl AsRef<Path>,
) -> Result<usize> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let ics = export_calendar(events, calendar_name);
    std::fs::write(path, ics.as_bytes())?;
    info!(path = %path.display(), events = events.len(), "Wrote calendar feed");
    Ok(events.len())
}

fn to_component(event: &CanonicalEvent) -> icalendar::Event {
    let mut component = icalendar::Event::new();
    component.uid(&format!("{}@festcal", event.canonical_id));
    component.summary(&event.title);
    component.add_property("DTSTART", format_utc(event.start));
    if let Some(end) = event.end {
        component.add_property("DTEND", format_utc(end));
    }

    if let Some(ref description) = event.description {
        component.description(description);
    }

    let mut location_parts = Vec::new();
    if let Some(ref location) = event.location {
        location_parts.push(location.as_str());
    }
    if let Some(ref address) = event.address {
        location_parts.push(address.as_str());
    }
    location_parts.push(event.city.as_str());
    component.location(&location_parts.join(", "));

    if let Some(ref url) = event.source_url {
        component.add_property("URL", url);
    }
    if let Some(ref category) = event.category {
        component.add_property("CATEGORIES", category);
    }
    if let (Some(lat), Some(lon)) = (event.latitude, event.longitude) {
        component.add_property("GEO", format!("{lat};{lon}"));
    }

    component.add_property("CREATED", format_utc(event.created_at));
    component.add_property("LAST-MODIFIED", format_utc(event.updated_at));

    component.done()
}

fn format_utc(instant: DateTime<Utc>) -> String {
    instant.format("%Y%m%dT%H%M%SZ").to_string()
}

/// The icalendar crate stamps its own PRODID; replace it with ours.
fn rewrite_prodid(ics: &str) -> String {
    ics.lines()
        .map(|line| {
            if line.starts_with("PRODID:") {
                format!("PRODID:{PRODID}\r\n")
            } else {
                format!("{line}\r\n")
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NormalizedEvent;
    use chrono::NaiveDateTime;

    fn canonical(title: &str, start: &str, city: &str) -> CanonicalEvent {
        let normalized = NormalizedEvent {
            title: title.to_string(),
            description: Some("Wein und Musik am Rheinufer".to_string()),
            start: NaiveDateTime::parse_from_str(start, "%Y-%m-%d %H:%M")
                .unwrap()
                .and_utc(),
            end: Some(
                NaiveDateTime::parse_from_str(start, "%Y-%m-%d %H:%M")
                    .unwrap()
                    .and_utc()
                    + chrono::Duration::hours(4),
            ),
            location: Some("Schlossplatz".to_string()),
            address: Some("Schlossplatz 1".to_string()),
            city: city.to_string(),
            postal_code: None,
            latitude: Some(50.0825),
            longitude: Some(8.24),
            category: Some("Festival".to_string()),
            organizer: None,
            source_url: Some("https://example.de/weinfest".to_string()),
            image_url: None,
            price: None,
            source_id: "a".to_string(),
        };
        CanonicalEvent::from_normalized(&normalized, Utc::now())
    }

    #[test]
    fn emits_one_component_with_required_fields() {
        let event = canonical("Weinfest", "2024-09-01 16:00", "Wiesbaden");
        let ics = export_calendar(std::slice::from_ref(&event), "Rhein-Main Events");

        assert_eq!(ics.matches("BEGIN:VEVENT").count(), 1);
        assert!(ics.contains(&format!("UID:{}@festcal", event.canonical_id)));
        assert!(ics.contains("SUMMARY:Weinfest"));
        assert!(ics.contains("DTSTART:20240901T160000Z"));
        assert!(ics.contains("DTEND:20240901T200000Z"));
        assert!(ics.contains("URL:https://example.de/weinfest"));
        assert!(ics.contains("CATEGORIES:Festival"));
        assert!(ics.contains("PRODID:-//festcal//Rhein-Main Events//DE"));
        // LOCATION joins location, address and city.
        let location_line = ics
            .lines()
            .find(|l| l.starts_with("LOCATION"))
            .expect("LOCATION present");
        assert!(location_line.contains("Schlossplatz"));
        assert!(location_line.contains("Wiesbaden"));
    }

    #[test]
    fn uid_is_stable_across_exports() {
        let event = canonical("Weinfest", "2024-09-01 16:00", "Wiesbaden");
        let first = export_calendar(std::slice::from_ref(&event), "Events");
        let second = export_calendar(std::slice::from_ref(&event), "Events");

        let uid = |ics: &str| {
            ics.lines()
                .find(|l| l.starts_with("UID:"))
                .map(str::to_string)
        };
        assert_eq!(uid(&first), uid(&second));
        assert!(uid(&first).is_some());
    }

    #[test]
    fn repeated_export_is_byte_stable_modulo_dtstamp() {
        let events = vec![
            canonical("Weinfest", "2024-09-01 16:00", "Wiesbaden"),
            canonical("Konzert", "2024-09-02 18:00", "Mainz"),
        ];
        let strip_dtstamp = |ics: &str| {
            ics.lines()
                .filter(|l| !l.starts_with("DTSTAMP:"))
                .collect::<Vec<_>>()
                .join("\n")
        };

        let first = export_calendar(&events, "Events");
        let second = export_calendar(&events, "Events");
        assert_eq!(strip_dtstamp(&first), strip_dtstamp(&second));
    }

    #[test]
    fn events_are_ordered_by_start_then_id() {
        let early = canonical("Frueh", "2024-09-01 10:00", "Mainz");
        let late = canonical("Spaet", "2024-09-03 10:00", "Mainz");
        let ics = export_calendar(&[late, early], "Events");

        let frueh = ics.find("SUMMARY:Frueh").unwrap();
        let spaet = ics.find("SUMMARY:Spaet").unwrap();
        assert!(frueh < spaet);
    }
}
