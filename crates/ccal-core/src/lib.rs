//! Core record model, field values, and the per-entity schema registry for ccal.

pub mod models;
pub mod schema;
pub mod value;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use models::{Duplicatable, Event, MachineTag, Source, TagList, Venue};
pub use schema::{Association, AssociationKind, EntitySchema, SYSTEM_FIELDS};
pub use value::FieldValue;

pub const CRATE_NAME: &str = "ccal-core";

/// Opaque identity assigned by the store on first insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub u64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RecordId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(RecordId)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Event,
    Venue,
    Source,
}

impl EntityKind {
    pub fn singular(self) -> &'static str {
        match self {
            EntityKind::Event => "event",
            EntityKind::Venue => "venue",
            EntityKind::Source => "source",
        }
    }

    pub fn plural(self) -> &'static str {
        match self {
            EntityKind::Event => "events",
            EntityKind::Venue => "venues",
            EntityKind::Source => "sources",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.singular())
    }
}

impl std::str::FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "event" | "events" => Ok(EntityKind::Event),
            "venue" | "venues" => Ok(EntityKind::Venue),
            "source" | "sources" => Ok(EntityKind::Source),
            other => Err(format!("unknown record kind: {other}")),
        }
    }
}

/// Either a freshly parsed, unsaved record or the originator of a stored match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Candidate<T> {
    Fresh(T),
    Existing(RecordId),
}

impl<T> Candidate<T> {
    pub fn existing_id(&self) -> Option<RecordId> {
        match self {
            Candidate::Existing(id) => Some(*id),
            Candidate::Fresh(_) => None,
        }
    }

    pub fn fresh(&self) -> Option<&T> {
        match self {
            Candidate::Fresh(value) => Some(value),
            Candidate::Existing(_) => None,
        }
    }
}

/// Parser handoff shape: an unsaved event plus its venue, if the payload named one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedEvent {
    pub event: Event,
    pub venue: Option<Candidate<Venue>>,
}

impl ParsedEvent {
    pub fn new(event: Event) -> Self {
        Self { event, venue: None }
    }

    pub fn with_venue(mut self, venue: Candidate<Venue>) -> Self {
        self.venue = Some(venue);
        self
    }
}
