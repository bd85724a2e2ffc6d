//! Facebook event pages, read through the Graph API.

use async_trait::async_trait;
use ccal_core::{Candidate, Event, MachineTag, ParsedEvent, Venue};
use ccal_storage::{FetchError, FetchOptions, Url};
use chrono_tz::Tz;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::icalendar::assign_source;
use crate::times::parse_flexible;
use crate::{text_or_none, ParseContext, ParserError, SourceParser};

const GRAPH_BASE: &str = "https://graph.facebook.com/v19.0";
const FIELDS: &str = "id,name,description,start_time,end_time,ticket_uri,place";
/// Graph API code for an invalid or expired access token.
const OAUTH_ERROR_CODE: i64 = 190;

static FACEBOOK_EVENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:https?://)?(?:www\.|m\.)?facebook\.com/events/(\d+)")
        .expect("valid facebook event regex")
});

#[derive(Debug, Default)]
pub struct FacebookParser;

impl FacebookParser {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SourceParser for FacebookParser {
    fn label(&self) -> &'static str {
        "Facebook"
    }

    fn priority(&self) -> u8 {
        0
    }

    fn url_pattern(&self) -> Option<&Regex> {
        Some(&*FACEBOOK_EVENT)
    }

    async fn parse(&self, ctx: &ParseContext<'_>) -> Result<Vec<ParsedEvent>, ParserError> {
        let Some(event_id) = event_id(ctx.url) else {
            return Ok(Vec::new());
        };
        let token = ctx
            .config
            .facebook_access_token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ParserError::AuthenticationRequired {
                url: ctx.url.to_string(),
            })?;

        let api_url = Url::parse_with_params(
            &format!("{GRAPH_BASE}/{event_id}"),
            &[("fields", FIELDS), ("access_token", token)],
        )
        .map_err(|err| ParserError::Other(err.into()))?;
        let options = FetchOptions::default()
            .accept("application/json")
            .with_timeout(ctx.config.api_timeout);

        let resp = match ctx.http.get(api_url.as_str(), &options).await {
            Ok(resp) => resp,
            // Graph answers unknown ids and rejected tokens alike with 400; the error body tells
            // them apart.
            Err(FetchError::HttpStatus {
                status: 400, body, ..
            }) => return Err(graph_rejection(body.as_bytes(), ctx.url)),
            Err(err) => return Err(err.into()),
        };

        let mut parsed = parse_graph_event(&resp.body, ctx.url, ctx.config.timezone)?;
        for record in &mut parsed {
            assign_source(record, ctx.source_id);
        }
        Ok(parsed)
    }
}

fn graph_rejection(body: &[u8], url: &str) -> ParserError {
    match parse_graph_event(body, url, Tz::UTC) {
        Err(err @ ParserError::AuthenticationRequired { .. }) => err,
        _ => ParserError::NotFound {
            url: url.to_string(),
        },
    }
}

pub fn event_id(url: &str) -> Option<&str> {
    FACEBOOK_EVENT
        .captures(url.trim())
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

#[derive(Debug, Deserialize)]
struct GraphEvent {
    id: String,
    name: Option<String>,
    description: Option<String>,
    start_time: Option<String>,
    end_time: Option<String>,
    ticket_uri: Option<String>,
    place: Option<GraphPlace>,
}

#[derive(Debug, Deserialize)]
struct GraphPlace {
    id: Option<String>,
    name: Option<String>,
    location: Option<GraphLocation>,
}

#[derive(Debug, Default, Deserialize)]
struct GraphLocation {
    street: Option<String>,
    city: Option<String>,
    state: Option<String>,
    zip: Option<String>,
    country: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
}

/// Maps a Graph event body onto one parsed event.
///
/// Times without an offset are floating local times and are read in `tz`.
pub fn parse_graph_event(body: &[u8], url: &str, tz: Tz) -> Result<Vec<ParsedEvent>, ParserError> {
    let value: JsonValue =
        serde_json::from_slice(body).map_err(|err| ParserError::malformed("Facebook", url, err))?;
    if let Some(error) = value.get("error") {
        let code = error.get("code").and_then(JsonValue::as_i64);
        return Err(if code == Some(OAUTH_ERROR_CODE) {
            ParserError::AuthenticationRequired { url: url.to_string() }
        } else {
            ParserError::NotFound { url: url.to_string() }
        });
    }
    let graph: GraphEvent =
        serde_json::from_value(value).map_err(|err| ParserError::malformed("Facebook", url, err))?;

    let mut event = Event::titled(graph.name.as_deref().and_then(text_or_none).unwrap_or_default());
    event.description = graph
        .description
        .filter(|d| !d.trim().is_empty())
        .or_else(|| graph.ticket_uri.map(|ticket| format!("Tickets: {ticket}")));
    event.start_time = graph.start_time.as_deref().and_then(|t| parse_flexible(t, tz));
    event.end_time = graph.end_time.as_deref().and_then(|t| parse_flexible(t, tz));
    event.url = Some(format!("https://www.facebook.com/events/{}/", graph.id));
    event.tags.add(MachineTag::new("facebook", "event", &graph.id).to_string());

    let parsed = ParsedEvent::new(event);
    Ok(vec![match graph.place.and_then(venue_from_place) {
        Some(venue) => parsed.with_venue(Candidate::Fresh(venue)),
        None => parsed,
    }])
}

fn venue_from_place(place: GraphPlace) -> Option<Venue> {
    let location = place.location.unwrap_or_default();
    let title = place
        .name
        .as_deref()
        .and_then(text_or_none)
        .or_else(|| location.street.as_deref().and_then(text_or_none))?;

    let mut venue = Venue::titled(title);
    venue.street_address = location.street;
    venue.locality = location.city;
    venue.region = location.state;
    venue.postal_code = location.zip;
    venue.country = location.country;
    venue.latitude = location.latitude;
    venue.longitude = location.longitude;
    let parts: Vec<&str> = [&venue.street_address, &venue.locality, &venue.region, &venue.postal_code]
        .into_iter()
        .filter_map(|p| p.as_deref())
        .collect();
    if !parts.is_empty() {
        venue.address = Some(parts.join(", "));
    }
    if let Some(id) = place.id.as_deref().and_then(text_or_none) {
        venue.tags.add(MachineTag::new("facebook", "venue", id).to_string());
    }
    Some(venue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use chrono_tz::America::Los_Angeles;

    const EVENT_JSON: &str = include_str!("../../../fixtures/facebook/event_1234567890.json");

    #[test]
    fn event_ids_come_from_canonical_urls() {
        assert_eq!(event_id("https://www.facebook.com/events/1234567890/"), Some("1234567890"));
        assert_eq!(event_id("facebook.com/events/42?ref=share"), Some("42"));
        assert_eq!(event_id("https://www.facebook.com/groups/42"), None);
    }

    #[test]
    fn graph_payload_maps_to_event_and_tagged_venue() {
        let url = "https://www.facebook.com/events/1234567890/";
        let parsed = parse_graph_event(EVENT_JSON.as_bytes(), url, Los_Angeles).unwrap();
        assert_eq!(parsed.len(), 1);

        let event = &parsed[0].event;
        assert_eq!(event.title, "Portland Rust Meetup");
        assert_eq!(event.start_time, Utc.with_ymd_and_hms(2030, 6, 5, 2, 0, 0).single());
        // Floating end time, read as Pacific daylight time.
        assert_eq!(event.end_time, Utc.with_ymd_and_hms(2030, 6, 5, 4, 0, 0).single());
        assert!(event.tags.contains("facebook:event=1234567890"));

        let venue = parsed[0].venue.as_ref().and_then(|v| v.fresh()).unwrap();
        assert_eq!(venue.title, "Hack Space");
        assert_eq!(venue.locality.as_deref(), Some("Portland"));
        assert!(venue.tags.contains("facebook:venue=998877"));
    }

    #[test]
    fn graph_errors_are_classified() {
        let url = "https://www.facebook.com/events/1/";
        let missing = br#"{"error":{"message":"Unsupported get request.","code":100}}"#;
        assert!(matches!(
            parse_graph_event(missing, url, Los_Angeles),
            Err(ParserError::NotFound { .. })
        ));
        let expired = br#"{"error":{"message":"Session has expired","code":190}}"#;
        assert!(matches!(
            parse_graph_event(expired, url, Los_Angeles),
            Err(ParserError::AuthenticationRequired { .. })
        ));
        assert!(matches!(
            parse_graph_event(b"<html>", url, Los_Angeles),
            Err(ParserError::Malformed { .. })
        ));
    }

    #[test]
    fn bad_request_bodies_separate_rejected_tokens_from_missing_events() {
        let url = "https://www.facebook.com/events/1/";
        let expired = include_bytes!("../../../fixtures/facebook/oauth_expired.json");
        assert!(matches!(
            graph_rejection(expired, url),
            ParserError::AuthenticationRequired { .. }
        ));
        let unknown = br#"{"error":{"message":"Unsupported get request.","type":"GraphMethodException","code":100}}"#;
        assert!(matches!(graph_rejection(unknown, url), ParserError::NotFound { .. }));
        assert!(matches!(graph_rejection(b"", url), ParserError::NotFound { .. }));
    }
}
