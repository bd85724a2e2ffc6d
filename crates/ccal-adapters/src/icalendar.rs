//! iCalendar feeds: VEVENT blocks, with venues from `LOCATION;VVENUE=` links to VVENUE blocks.

use std::collections::HashMap;

use async_trait::async_trait;
use ccal_core::{Candidate, Event, ParsedEvent, RecordId, TagList, Venue};
use ccal_storage::FetchOptions;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use ical::property::Property;
use ical::PropertyParser;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::times::localize;
use crate::{text_or_none, ParseContext, ParserError, SourceParser};

const FORMAT: &str = "iCalendar";
const ACCEPT: &str = "text/calendar, text/x-vcalendar, text/plain;q=0.8, */*;q=0.5";

static CALENDAR_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^webcal://|\.(?:ics|ical|ifb)(?:[?#]|$)").expect("valid calendar url regex")
});

static DURATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([+-])?P(?:(\d+)W)?(?:(\d+)D)?(?:T(?:(\d+)H)?(?:(\d+)M)?(?:(\d+)S)?)?$")
        .expect("valid duration regex")
});

#[derive(Debug, Default)]
pub struct IcalendarParser;

impl IcalendarParser {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SourceParser for IcalendarParser {
    fn label(&self) -> &'static str {
        "iCalendar"
    }

    fn priority(&self) -> u8 {
        10
    }

    fn url_pattern(&self) -> Option<&Regex> {
        Some(&*CALENDAR_URL)
    }

    async fn parse(&self, ctx: &ParseContext<'_>) -> Result<Vec<ParsedEvent>, ParserError> {
        let url = http_url(ctx.url);
        let resp = ctx
            .http
            .get(&url, &FetchOptions::default().accept(ACCEPT))
            .await?;
        let mut parsed = parse_calendar(&resp.text(), &url, ctx.config.timezone, ctx.now)?;
        for record in &mut parsed {
            assign_source(record, ctx.source_id);
        }
        Ok(parsed)
    }
}

/// `webcal:` is plain HTTP under another name.
pub fn http_url(url: &str) -> String {
    match url.get(..9) {
        Some(scheme) if scheme.eq_ignore_ascii_case("webcal://") => format!("http://{}", &url[9..]),
        _ => url.to_string(),
    }
}

pub(crate) fn assign_source(record: &mut ParsedEvent, source_id: Option<RecordId>) {
    record.event.source_id = source_id;
    if let Some(Candidate::Fresh(venue)) = &mut record.venue {
        venue.source_id = source_id;
    }
}

#[derive(Debug)]
struct Component {
    name: String,
    properties: Vec<Property>,
}

impl Component {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_ascii_uppercase(),
            properties: Vec::new(),
        }
    }

    fn get(&self, name: &str) -> Option<&Property> {
        self.properties
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    fn text(&self, name: &str) -> Option<String> {
        self.get(name)
            .and_then(|p| p.value.as_deref())
            .and_then(|v| text_or_none(&unescape(v)))
    }

    /// Multi-line text keeps its line breaks.
    fn long_text(&self, name: &str) -> Option<String> {
        let value = unescape(self.get(name)?.value.as_deref()?);
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }
}

fn param<'a>(prop: &'a Property, name: &str) -> Option<&'a str> {
    prop.params
        .as_ref()?
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .and_then(|(_, values)| values.first())
        .map(|v| v.trim_matches('"'))
}

/// Parses a calendar body into events, dropping those that ended before `now`.
///
/// A body that is not a calendar at all yields no events rather than an error,
/// so the dispatcher can move on to the next parser.
pub fn parse_calendar(
    text: &str,
    url: &str,
    default_tz: Tz,
    now: DateTime<Utc>,
) -> Result<Vec<ParsedEvent>, ParserError> {
    if !text.to_ascii_uppercase().contains("BEGIN:VCALENDAR") {
        return Ok(Vec::new());
    }

    let mut stack: Vec<Component> = Vec::new();
    let mut events = Vec::new();
    let mut venues = HashMap::new();
    let mut calendar_tz = None;

    for prop in PropertyParser::from_reader(text.as_bytes()) {
        let prop = prop.map_err(|err| ParserError::malformed(FORMAT, url, err))?;
        let value = prop.value.as_deref().unwrap_or_default().trim();
        if prop.name.eq_ignore_ascii_case("BEGIN") {
            stack.push(Component::new(value));
        } else if prop.name.eq_ignore_ascii_case("END") {
            let Some(done) = stack.pop() else {
                return Err(ParserError::malformed(FORMAT, url, format!("unbalanced END:{value}")));
            };
            match done.name.as_str() {
                "VEVENT" => events.push(done),
                "VVENUE" => {
                    if let Some(uid) = done.text("UID") {
                        venues.insert(uid, done);
                    }
                }
                "VCALENDAR" => {
                    calendar_tz = done
                        .text("X-WR-TIMEZONE")
                        .and_then(|name| name.parse::<Tz>().ok());
                }
                _ => {}
            }
        } else if let Some(top) = stack.last_mut() {
            top.properties.push(prop);
        }
    }
    if !stack.is_empty() {
        return Err(ParserError::malformed(FORMAT, url, "calendar is truncated"));
    }

    let tz = calendar_tz.unwrap_or(default_tz);
    let mut parsed = Vec::with_capacity(events.len());
    for component in &events {
        let record = event_from_component(component, &venues, tz);
        if record.event.is_old(now) {
            debug!(title = %record.event.title, "skipping past calendar entry");
            continue;
        }
        parsed.push(record);
    }
    Ok(parsed)
}

fn event_from_component(
    component: &Component,
    venues: &HashMap<String, Component>,
    tz: Tz,
) -> ParsedEvent {
    let start = component.get("DTSTART").and_then(|p| property_time(p, tz));
    let end = component
        .get("DTEND")
        .and_then(|p| property_time(p, tz))
        .map(|(end, _)| end)
        .or_else(|| {
            let (start, all_day) = start?;
            match component.get("DURATION").and_then(|p| p.value.as_deref()) {
                Some(text) => parse_duration(text).and_then(|d| start.checked_add_signed(d)),
                None if all_day => start.checked_add_signed(Duration::days(1)),
                None => None,
            }
        });

    let mut event = Event::titled(component.text("SUMMARY").unwrap_or_default());
    event.description = component.long_text("DESCRIPTION");
    event.url = component.text("URL");
    event.start_time = start.map(|(start, _)| start);
    event.end_time = end;
    event.tags = component
        .properties
        .iter()
        .filter(|p| p.name.eq_ignore_ascii_case("CATEGORIES"))
        .filter_map(|p| p.value.as_deref())
        .flat_map(split_list)
        .collect::<TagList>();

    let location = component.get("LOCATION");
    let linked = location
        .and_then(|p| param(p, "VVENUE"))
        .and_then(|uid| venues.get(uid));
    let mut venue = match (linked, component.text("LOCATION")) {
        (Some(block), _) => Some(venue_from_component(block)),
        (None, Some(title)) => Some(Venue::titled(title)),
        (None, None) => None,
    };
    if let (Some(venue), Some((lat, long))) = (&mut venue, component.text("GEO").and_then(|g| parse_geo(&g))) {
        if venue.latitude.is_none() && venue.longitude.is_none() {
            venue.latitude = Some(lat);
            venue.longitude = Some(long);
        }
    }

    let parsed = ParsedEvent::new(event);
    match venue {
        Some(venue) => parsed.with_venue(Candidate::Fresh(venue)),
        None => parsed,
    }
}

fn venue_from_component(block: &Component) -> Venue {
    let mut venue = Venue::titled(block.text("NAME").unwrap_or_default());
    venue.description = block.long_text("DESCRIPTION");
    venue.street_address = block.text("ADDRESS");
    venue.locality = block.text("CITY");
    venue.region = block.text("REGION");
    venue.postal_code = block.text("POSTALCODE");
    venue.country = block.text("COUNTRY");
    venue.url = block.text("URL");
    venue.telephone = block.text("TEL");
    if let Some((lat, long)) = block.text("GEO").and_then(|g| parse_geo(&g)) {
        venue.latitude = Some(lat);
        venue.longitude = Some(long);
    }
    let parts: Vec<&str> = [&venue.street_address, &venue.locality, &venue.region, &venue.postal_code]
        .into_iter()
        .filter_map(|p| p.as_deref())
        .collect();
    if !parts.is_empty() {
        venue.address = Some(parts.join(", "));
    }
    venue
}

pub(crate) fn parse_geo(text: &str) -> Option<(f64, f64)> {
    let (lat, long) = text.split_once(';').or_else(|| text.split_once(','))?;
    Some((lat.trim().parse().ok()?, long.trim().parse().ok()?))
}

/// Returns the instant and whether the value was a bare date.
fn property_time(prop: &Property, default_tz: Tz) -> Option<(DateTime<Utc>, bool)> {
    let value = prop.value.as_deref()?.trim();
    let is_date = param(prop, "VALUE").is_some_and(|v| v.eq_ignore_ascii_case("DATE"))
        || (value.len() == 8 && value.bytes().all(|b| b.is_ascii_digit()));
    let tz = param(prop, "TZID")
        .and_then(|name| name.parse::<Tz>().ok())
        .unwrap_or(default_tz);

    if is_date {
        let date = NaiveDate::parse_from_str(value, "%Y%m%d").ok()?;
        return localize(date.and_hms_opt(0, 0, 0)?, tz).map(|t| (t, true));
    }
    if let Some(utc) = value.strip_suffix('Z').or_else(|| value.strip_suffix('z')) {
        let naive = NaiveDateTime::parse_from_str(utc, "%Y%m%dT%H%M%S").ok()?;
        return Some((Utc.from_utc_datetime(&naive), false));
    }
    let naive = NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M"))
        .ok()?;
    localize(naive, tz).map(|t| (t, false))
}

/// RFC 5545 `dur-value`, e.g. `PT1H30M` or `P1W`. `None` when malformed or out of range.
pub fn parse_duration(text: &str) -> Option<Duration> {
    let caps = DURATION_RE.captures(text.trim())?;
    let part = |i: usize| -> Option<i64> {
        match caps.get(i) {
            Some(m) => m.as_str().parse().ok(),
            None => Some(0),
        }
    };
    let total = Duration::try_weeks(part(2)?)?
        .checked_add(&Duration::try_days(part(3)?)?)?
        .checked_add(&Duration::try_hours(part(4)?)?)?
        .checked_add(&Duration::try_minutes(part(5)?)?)?
        .checked_add(&Duration::try_seconds(part(6)?)?)?;
    Some(if caps.get(1).is_some_and(|m| m.as_str() == "-") {
        -total
    } else {
        total
    })
}

pub(crate) fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') | Some('N') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Splits on commas that are not backslash-escaped, unescaping each item.
fn split_list(value: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    for ch in value.chars() {
        if escaped {
            current.push('\\');
            current.push(ch);
            escaped = false;
        } else if ch == '\\' {
            escaped = true;
        } else if ch == ',' {
            items.push(unescape(&current));
            current.clear();
        } else {
            current.push(ch);
        }
    }
    items.push(unescape(&current));
    items.into_iter().filter(|s| !s.trim().is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::America::Los_Angeles;

    const FEED: &str = include_str!("../../../fixtures/ical/code_sprint.ics");

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2030, 6, 1, 12, 0, 0).single().unwrap()
    }

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).single().unwrap()
    }

    #[test]
    fn webcal_is_rewritten_to_http() {
        assert_eq!(http_url("webcal://example.org/cal.ics"), "http://example.org/cal.ics");
        assert_eq!(http_url("WEBCAL://example.org/x"), "http://example.org/x");
        assert_eq!(http_url("https://example.org/x"), "https://example.org/x");
    }

    #[test]
    fn feed_yields_upcoming_events_with_linked_venue() {
        let parsed = parse_calendar(FEED, "http://example.org/cal.ics", Los_Angeles, now()).unwrap();
        let titles: Vec<_> = parsed.iter().map(|p| p.event.title.as_str()).collect();
        assert_eq!(titles, vec!["Code Sprint", "Rust Study Group", "Board Game Night"]);

        let sprint = &parsed[0];
        // TZID=America/Los_Angeles, PDT in June.
        assert_eq!(sprint.event.start_time, Some(utc(2030, 6, 2, 1, 0)));
        assert_eq!(sprint.event.end_time, Some(utc(2030, 6, 2, 3, 0)));
        assert_eq!(
            sprint.event.description.as_deref(),
            Some("Bring a laptop.\nPizza, drinks; good company.")
        );
        assert!(sprint.event.tags.contains("code"));
        assert!(sprint.event.tags.contains("ruby, rails"));

        let venue = sprint.venue.as_ref().and_then(|v| v.fresh()).unwrap();
        assert_eq!(venue.title, "Hack Space");
        assert_eq!(venue.locality.as_deref(), Some("Portland"));
        assert_eq!(venue.latitude, Some(45.5231));
        assert_eq!(
            venue.address.as_deref(),
            Some("123 SE Main St, Portland, OR, 97214")
        );
    }

    #[test]
    fn durations_and_plain_locations() {
        let parsed = parse_calendar(FEED, "http://example.org/cal.ics", Los_Angeles, now()).unwrap();

        let study = &parsed[1];
        assert_eq!(study.event.start_time, Some(utc(2030, 6, 10, 17, 0)));
        assert_eq!(study.event.end_time, Some(utc(2030, 6, 10, 18, 30)));
        let venue = study.venue.as_ref().and_then(|v| v.fresh()).unwrap();
        assert_eq!(venue.title, "Central Library, Room 2");

        let games = &parsed[2];
        assert!(games.venue.is_none());
        assert_eq!(
            games.event.end_time.zip(games.event.start_time).map(|(e, s)| e - s),
            Some(Duration::days(1))
        );
    }

    #[test]
    fn out_of_range_duration_leaves_end_unset() {
        let feed = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nBEGIN:VEVENT\r\nUID:huge@example.org\r\n\
                    SUMMARY:Forever\r\nDTSTART:20300610T170000Z\r\nDURATION:P999999999D\r\n\
                    END:VEVENT\r\nEND:VCALENDAR\r\n";
        let parsed = parse_calendar(feed, "http://example.org/cal.ics", Los_Angeles, now()).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].event.start_time, Some(utc(2030, 6, 10, 17, 0)));
        assert_eq!(parsed[0].event.end_time, None);
    }

    #[test]
    fn past_entries_are_dropped() {
        let parsed = parse_calendar(FEED, "http://example.org/cal.ics", Los_Angeles, now()).unwrap();
        assert!(parsed.iter().all(|p| p.event.title != "Launch Party (2001)"));

        let later = utc(2031, 1, 1, 0, 0);
        let parsed = parse_calendar(FEED, "http://example.org/cal.ics", Los_Angeles, later).unwrap();
        assert!(parsed.is_empty());
    }

    #[test]
    fn non_calendar_bodies_are_empty_and_truncated_ones_malformed() {
        let html = "<html><body>hello</body></html>";
        assert!(parse_calendar(html, "u", Los_Angeles, now()).unwrap().is_empty());

        let truncated = "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nSUMMARY:x\r\n";
        assert!(matches!(
            parse_calendar(truncated, "u", Los_Angeles, now()),
            Err(ParserError::Malformed { .. })
        ));
    }

    #[test]
    fn durations_parse() {
        assert_eq!(parse_duration("PT1H30M"), Some(Duration::minutes(90)));
        assert_eq!(parse_duration("P1W"), Some(Duration::days(7)));
        assert_eq!(parse_duration("-PT15M"), Some(Duration::minutes(-15)));
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration("P999999999999D"), None);
        assert_eq!(parse_duration("PT99999999999999999999S"), None);
    }

    #[test]
    fn text_unescaping() {
        assert_eq!(unescape(r"a\, b\; c\nd\\e"), "a, b; c\nd\\e");
        assert_eq!(split_list(r"code,ruby\, rails, "), vec!["code", "ruby, rails"]);
    }
}
