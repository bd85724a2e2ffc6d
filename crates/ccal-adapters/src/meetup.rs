//! Meetup event pages, read through the Meetup REST API.

use async_trait::async_trait;
use ccal_core::{Candidate, Event, MachineTag, ParsedEvent, Venue};
use ccal_storage::{FetchOptions, Url};
use chrono::Duration;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::icalendar::assign_source;
use crate::times::from_epoch_millis;
use crate::{text_or_none, ParseContext, ParserError, SourceParser};

const API_BASE: &str = "https://api.meetup.com/2/event";
const AUTH_CODES: &[&str] = &["not_authorized", "auth_fail", "invalid_key", "unauthorized"];

static MEETUP_EVENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:https?://)?(?:www\.)?meetup\.com/([^/?#]+)/events/([^/?#]+)")
        .expect("valid meetup event regex")
});

#[derive(Debug, Default)]
pub struct MeetupParser;

impl MeetupParser {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SourceParser for MeetupParser {
    fn label(&self) -> &'static str {
        "Meetup"
    }

    fn priority(&self) -> u8 {
        1
    }

    fn url_pattern(&self) -> Option<&Regex> {
        Some(&*MEETUP_EVENT)
    }

    async fn parse(&self, ctx: &ParseContext<'_>) -> Result<Vec<ParsedEvent>, ParserError> {
        let Some((_group, event_id)) = event_ref(ctx.url) else {
            return Ok(Vec::new());
        };
        let key = ctx
            .config
            .meetup_api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ParserError::AuthenticationRequired {
                url: ctx.url.to_string(),
            })?;

        let api_url = Url::parse_with_params(
            &format!("{API_BASE}/{event_id}"),
            &[("key", key), ("sign", "true"), ("fields", "event_url,group,venue")],
        )
        .map_err(|err| ParserError::Other(err.into()))?;
        let options = FetchOptions::default()
            .accept("application/json")
            .with_timeout(ctx.config.api_timeout);
        let resp = ctx.http.get(api_url.as_str(), &options).await?;

        let mut parsed = parse_api_event(&resp.body, ctx.url)?;
        for record in &mut parsed {
            assign_source(record, ctx.source_id);
        }
        Ok(parsed)
    }
}

/// `(group urlname, event id)` from an event page URL.
pub fn event_ref(url: &str) -> Option<(&str, &str)> {
    let caps = MEETUP_EVENT.captures(url.trim())?;
    Some((caps.get(1)?.as_str(), caps.get(2)?.as_str()))
}

#[derive(Debug, Deserialize)]
struct ApiEvent {
    id: String,
    name: Option<String>,
    description: Option<String>,
    time: Option<i64>,
    duration: Option<i64>,
    event_url: Option<String>,
    group: Option<ApiGroup>,
    venue: Option<ApiVenue>,
}

#[derive(Debug, Deserialize)]
struct ApiGroup {
    urlname: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiVenue {
    id: Option<i64>,
    name: Option<String>,
    address_1: Option<String>,
    address_2: Option<String>,
    city: Option<String>,
    state: Option<String>,
    zip: Option<String>,
    country: Option<String>,
    lat: Option<f64>,
    lon: Option<f64>,
    phone: Option<String>,
}

/// Epoch-millisecond start plus millisecond duration; a missing or out-of-range duration leaves
/// the end open.
pub fn parse_api_event(body: &[u8], url: &str) -> Result<Vec<ParsedEvent>, ParserError> {
    let value: JsonValue =
        serde_json::from_slice(body).map_err(|err| ParserError::malformed("Meetup", url, err))?;
    if let Some(code) = api_error_code(&value) {
        return Err(if AUTH_CODES.contains(&code.as_str()) {
            ParserError::AuthenticationRequired { url: url.to_string() }
        } else {
            ParserError::NotFound { url: url.to_string() }
        });
    }
    let api: ApiEvent =
        serde_json::from_value(value).map_err(|err| ParserError::malformed("Meetup", url, err))?;

    let mut event = Event::titled(api.name.as_deref().and_then(text_or_none).unwrap_or_default());
    event.description = api.description.filter(|d| !d.trim().is_empty());
    event.start_time = api.time.and_then(from_epoch_millis);
    event.end_time = event
        .start_time
        .zip(api.duration.and_then(Duration::try_milliseconds))
        .and_then(|(start, duration)| start.checked_add_signed(duration));
    event.url = api.event_url.or_else(|| Some(url.to_string()));
    event.tags.add(MachineTag::new("meetup", "event", &api.id).to_string());
    if let Some(urlname) = api.group.and_then(|g| g.urlname) {
        event.tags.add(MachineTag::new("meetup", "group", urlname).to_string());
    }

    let parsed = ParsedEvent::new(event);
    Ok(vec![match api.venue.and_then(venue_from_api) {
        Some(venue) => parsed.with_venue(Candidate::Fresh(venue)),
        None => parsed,
    }])
}

fn api_error_code(value: &JsonValue) -> Option<String> {
    if value.get("problem").is_some() {
        let code = value.get("code").and_then(JsonValue::as_str).unwrap_or("not_found");
        return Some(code.to_string());
    }
    let first = value.get("errors")?.as_array()?.first()?;
    Some(
        first
            .get("code")
            .and_then(JsonValue::as_str)
            .unwrap_or("not_found")
            .to_string(),
    )
}

fn venue_from_api(api: ApiVenue) -> Option<Venue> {
    let title = api.name.as_deref().and_then(text_or_none)?;
    let mut venue = Venue::titled(title);
    venue.street_address = match (api.address_1, api.address_2) {
        (Some(a), Some(b)) if !b.trim().is_empty() => Some(format!("{a}, {b}")),
        (a, _) => a,
    };
    venue.locality = api.city;
    venue.region = api.state.map(|s| s.to_ascii_uppercase());
    venue.postal_code = api.zip;
    venue.country = api.country.map(|c| c.to_ascii_uppercase());
    venue.telephone = api.phone;
    // The API reports 0,0 for venues it never geocoded.
    if api.lat.zip(api.lon).is_some_and(|(lat, lon)| lat != 0.0 || lon != 0.0) {
        venue.latitude = api.lat;
        venue.longitude = api.lon;
    }
    let parts: Vec<&str> = [&venue.street_address, &venue.locality, &venue.region, &venue.postal_code]
        .into_iter()
        .filter_map(|p| p.as_deref())
        .collect();
    if !parts.is_empty() {
        venue.address = Some(parts.join(", "));
    }
    if let Some(id) = api.id {
        venue.tags.add(MachineTag::new("meetup", "venue", id).to_string());
    }
    Some(venue)
}
