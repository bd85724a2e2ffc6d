//! Duplicate-or-original resolution for freshly parsed records.
//!
//! Repeated imports of the same feed must converge on one canonical row: a parsed
//! record that matches something already stored is replaced by that match's
//! originator. Venues first try a provider machine tag (`meetup:venue=42`) and only
//! then fall back to exact attribute matching.

use std::collections::HashSet;

use ccal_core::{Candidate, Duplicatable, Event, FieldValue, ParsedEvent, RecordId, Venue};
use ccal_storage::{MemoryStore, StoreError};

use crate::ParserError;

type AttributeTuple = Vec<(&'static str, FieldValue)>;

#[derive(Debug, PartialEq, Eq, Hash)]
enum RecordKey {
    Existing(RecordId),
    Fresh(AttributeTuple),
}

/// Stored venue this one should collapse onto, if any.
pub fn matching_venue(store: &MemoryStore, venue: &Venue) -> Result<Option<RecordId>, StoreError> {
    for tag in venue.tags.machine_tags().filter(|t| t.predicate == "venue") {
        if let Some(found) = store.tagged_with::<Venue>(&tag.to_string()).and_then(|v| v.id) {
            return store.originator::<Venue>(found).map(|v| v.id);
        }
    }
    match store.find_exact_duplicates(venue).first() {
        Some(&found) => store.originator::<Venue>(found).map(|v| v.id),
        None => Ok(None),
    }
}

pub fn matching_event(store: &MemoryStore, event: &Event) -> Result<Option<RecordId>, StoreError> {
    match store.find_exact_duplicates(event).first() {
        Some(&found) => store.originator::<Event>(found).map(|e| e.id),
        None => Ok(None),
    }
}

pub fn resolve_venue(store: &MemoryStore, venue: Venue) -> Result<Candidate<Venue>, StoreError> {
    Ok(match matching_venue(store, &venue)? {
        Some(id) => Candidate::Existing(id),
        None => Candidate::Fresh(venue),
    })
}

/// Resolves the venue, then the event against it. An event whose venue is new
/// cannot match a stored event, so it stays fresh.
pub fn resolve_parsed(
    store: &MemoryStore,
    parsed: ParsedEvent,
) -> Result<Candidate<ParsedEvent>, StoreError> {
    let ParsedEvent { mut event, venue } = parsed;
    let venue = match venue {
        Some(Candidate::Fresh(venue)) => Some(resolve_venue(store, venue)?),
        other => other,
    };
    match &venue {
        Some(Candidate::Existing(id)) => event.venue_id = Some(*id),
        Some(Candidate::Fresh(_)) => {
            return Ok(Candidate::Fresh(ParsedEvent { event, venue }));
        }
        None => {}
    }
    Ok(match matching_event(store, &event)? {
        Some(id) => Candidate::Existing(id),
        None => Candidate::Fresh(ParsedEvent { event, venue }),
    })
}

/// Resolves every record and drops in-feed repeats, keeping first-seen order.
pub fn resolve_all(
    store: &MemoryStore,
    parsed: Vec<ParsedEvent>,
) -> Result<Vec<Candidate<ParsedEvent>>, ParserError> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(parsed.len());
    for record in parsed {
        let candidate = resolve_parsed(store, record)?;
        if seen.insert(feed_key(&candidate)) {
            out.push(candidate);
        }
    }
    Ok(out)
}

fn feed_key(candidate: &Candidate<ParsedEvent>) -> (RecordKey, Option<RecordKey>) {
    match candidate {
        Candidate::Existing(id) => (RecordKey::Existing(*id), None),
        Candidate::Fresh(parsed) => {
            let venue = parsed.venue.as_ref().map(|venue| match venue {
                Candidate::Existing(id) => RecordKey::Existing(*id),
                Candidate::Fresh(v) => RecordKey::Fresh(v.comparable_attributes()),
            });
            (RecordKey::Fresh(parsed.event.comparable_attributes()), venue)
        }
    }
}
