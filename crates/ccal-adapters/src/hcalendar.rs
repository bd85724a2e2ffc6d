//! hCalendar microformats embedded in an HTML page.

use async_trait::async_trait;
use ccal_core::{Candidate, Event, ParsedEvent, TagList, Venue};
use ccal_storage::{FetchOptions, Url};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Selector};

use crate::icalendar::{assign_source, parse_geo};
use crate::times::parse_flexible;
use crate::{text_or_none, ParseContext, ParserError, SourceParser};

fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("valid hCalendar selector")
}

static VEVENT: Lazy<Selector> = Lazy::new(|| selector(".vevent"));
static SUMMARY: Lazy<Selector> = Lazy::new(|| selector(".summary"));
static DESCRIPTION: Lazy<Selector> = Lazy::new(|| selector(".description"));
static DTSTART: Lazy<Selector> = Lazy::new(|| selector(".dtstart"));
static DTEND: Lazy<Selector> = Lazy::new(|| selector(".dtend"));
static URL: Lazy<Selector> = Lazy::new(|| selector(".url"));
static LOCATION: Lazy<Selector> = Lazy::new(|| selector(".location"));
static VCARD: Lazy<Selector> = Lazy::new(|| selector(".vcard"));
static TAGS: Lazy<Selector> = Lazy::new(|| selector(".category, a[rel~=\"tag\"]"));
static VALUE_TITLE: Lazy<Selector> = Lazy::new(|| selector(".value-title[title]"));
static CARD_NAME: Lazy<Selector> = Lazy::new(|| selector(".fn, .org"));
static STREET: Lazy<Selector> = Lazy::new(|| selector(".street-address"));
static LOCALITY: Lazy<Selector> = Lazy::new(|| selector(".locality"));
static REGION: Lazy<Selector> = Lazy::new(|| selector(".region"));
static POSTAL: Lazy<Selector> = Lazy::new(|| selector(".postal-code"));
static COUNTRY: Lazy<Selector> = Lazy::new(|| selector(".country-name"));
static GEO: Lazy<Selector> = Lazy::new(|| selector(".geo"));
static LATITUDE: Lazy<Selector> = Lazy::new(|| selector(".latitude"));
static LONGITUDE: Lazy<Selector> = Lazy::new(|| selector(".longitude"));
static TEL: Lazy<Selector> = Lazy::new(|| selector(".tel"));
static EMAIL: Lazy<Selector> = Lazy::new(|| selector(".email"));

#[derive(Debug, Default)]
pub struct HcalendarParser;

impl HcalendarParser {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SourceParser for HcalendarParser {
    fn label(&self) -> &'static str {
        "hCalendar"
    }

    fn priority(&self) -> u8 {
        20
    }

    async fn parse(&self, ctx: &ParseContext<'_>) -> Result<Vec<ParsedEvent>, ParserError> {
        let resp = ctx
            .http
            .get(ctx.url, &FetchOptions::default().accept("text/html, */*;q=0.5"))
            .await?;
        let mut parsed = extract_events(&resp.text(), &resp.final_url, ctx.config.timezone);
        for record in &mut parsed {
            assign_source(record, ctx.source_id);
        }
        Ok(parsed)
    }
}

/// Every `.vevent` on the page; absent properties simply stay empty.
pub fn extract_events(html: &str, base_url: &str, tz: Tz) -> Vec<ParsedEvent> {
    let document = Html::parse_document(html);
    let base = Url::parse(base_url).ok();
    document
        .select(&VEVENT)
        .map(|node| event_from_node(node, base.as_ref(), tz))
        .collect()
}

fn event_from_node(node: ElementRef<'_>, base: Option<&Url>, tz: Tz) -> ParsedEvent {
    let mut event = Event::titled(first_text(node, &SUMMARY).unwrap_or_default());
    event.description = first_text(node, &DESCRIPTION);
    event.start_time = first_time(node, &DTSTART, tz);
    event.end_time = first_time(node, &DTEND, tz);
    event.url = node
        .select(&URL)
        .find(|el| !inside_location(*el, node))
        .and_then(|el| link_of(el, base));
    event.tags = node
        .select(&TAGS)
        .filter_map(|el| text_or_none(&el.text().collect::<String>()))
        .collect::<TagList>();

    let venue = node.select(&LOCATION).next().and_then(|location| {
        match location
            .select(&VCARD)
            .next()
            .or_else(|| has_class(location, "vcard").then_some(location))
        {
            Some(card) => venue_from_card(card, base),
            None => text_or_none(&location.text().collect::<String>()).map(Venue::titled),
        }
    });

    let parsed = ParsedEvent::new(event);
    match venue {
        Some(venue) => parsed.with_venue(Candidate::Fresh(venue)),
        None => parsed,
    }
}

fn venue_from_card(card: ElementRef<'_>, base: Option<&Url>) -> Option<Venue> {
    let title = first_text(card, &CARD_NAME).or_else(|| text_or_none(&card.text().collect::<String>()))?;
    let mut venue = Venue::titled(title);
    venue.street_address = first_text(card, &STREET);
    venue.locality = first_text(card, &LOCALITY);
    venue.region = first_text(card, &REGION);
    venue.postal_code = first_text(card, &POSTAL);
    venue.country = first_text(card, &COUNTRY);
    venue.telephone = first_text(card, &TEL);
    venue.email = first_text(card, &EMAIL).map(|e| e.trim_start_matches("mailto:").to_string());
    venue.url = card.select(&URL).next().and_then(|el| link_of(el, base));

    let lat = first_value(card, &LATITUDE).and_then(|v| v.parse().ok());
    let long = first_value(card, &LONGITUDE).and_then(|v| v.parse().ok());
    let (lat, long) = match (lat, long) {
        (Some(lat), Some(long)) => (Some(lat), Some(long)),
        _ => first_value(card, &GEO)
            .and_then(|g| parse_geo(&g))
            .map_or((None, None), |(lat, long)| (Some(lat), Some(long))),
    };
    venue.latitude = lat;
    venue.longitude = long;

    let parts: Vec<&str> = [&venue.street_address, &venue.locality, &venue.region, &venue.postal_code]
        .into_iter()
        .filter_map(|p| p.as_deref())
        .collect();
    if !parts.is_empty() {
        venue.address = Some(parts.join(", "));
    }
    Some(venue)
}

fn has_class(el: ElementRef<'_>, class: &str) -> bool {
    el.value().classes().any(|c| c == class)
}

fn inside_location(el: ElementRef<'_>, root: ElementRef<'_>) -> bool {
    el.ancestors()
        .take_while(|n| n.id() != root.id())
        .filter_map(ElementRef::wrap)
        .any(|a| has_class(a, "location"))
}

fn first_text(node: ElementRef<'_>, sel: &Selector) -> Option<String> {
    node.select(sel)
        .next()
        .and_then(|el| text_or_none(&el.text().collect::<String>()))
}

/// Value-class pattern: `.value-title[title]`, `abbr[title]`, `time[datetime]`, then text.
fn value_of(el: ElementRef<'_>) -> Option<String> {
    if let Some(title) = el.select(&VALUE_TITLE).next().and_then(|v| v.value().attr("title")) {
        return text_or_none(title);
    }
    let attr = match el.value().name() {
        "abbr" => el.value().attr("title"),
        "time" => el.value().attr("datetime"),
        _ => None,
    };
    match attr {
        Some(value) => text_or_none(value),
        None => text_or_none(&el.text().collect::<String>()),
    }
}

fn first_value(node: ElementRef<'_>, sel: &Selector) -> Option<String> {
    node.select(sel).next().and_then(value_of)
}

fn first_time(node: ElementRef<'_>, sel: &Selector, tz: Tz) -> Option<DateTime<Utc>> {
    first_value(node, sel).and_then(|v| parse_flexible(&v, tz))
}

fn link_of(el: ElementRef<'_>, base: Option<&Url>) -> Option<String> {
    let href = el.value().attr("href").and_then(text_or_none);
    let Some(href) = href else {
        return text_or_none(&el.text().collect::<String>());
    };
    match base.and_then(|b| b.join(&href).ok()) {
        Some(url) => Some(url.to_string()),
        None => Some(href),
    }
}
