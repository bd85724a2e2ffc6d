//! Duplicatable records: events, venues, and the sources they were imported from.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::schema::{EntitySchema, EVENT_SCHEMA, SOURCE_SCHEMA, VENUE_SCHEMA};
use crate::{EntityKind, FieldValue, RecordId};

/// Free-text labels attached to a record; assignment merges, never overwrites.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagList(BTreeSet<String>);

impl TagList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a trimmed, non-empty tag. Returns whether the list changed.
    pub fn add(&mut self, tag: impl AsRef<str>) -> bool {
        let tag = tag.as_ref().trim();
        if tag.is_empty() {
            return false;
        }
        self.0.insert(tag.to_string())
    }

    pub fn merge(&mut self, other: &TagList) {
        for tag in &other.0 {
            self.0.insert(tag.clone());
        }
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.0.contains(tag)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn machine_tags(&self) -> impl Iterator<Item = MachineTag> + '_ {
        self.iter().filter_map(MachineTag::parse)
    }
}

impl<S: AsRef<str>> FromIterator<S> for TagList {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut list = TagList::new();
        for tag in iter {
            list.add(tag);
        }
        list
    }
}

impl fmt::Display for TagList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.iter().collect::<Vec<_>>().join(", "))
    }
}

/// Structured tag of the form `namespace:predicate=value`, e.g. `meetup:venue=42`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MachineTag {
    pub namespace: String,
    pub predicate: String,
    pub value: String,
}

impl MachineTag {
    pub fn new(namespace: &str, predicate: &str, value: impl fmt::Display) -> Self {
        Self {
            namespace: namespace.to_string(),
            predicate: predicate.to_string(),
            value: value.to_string(),
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        let (namespace, rest) = tag.split_once(':')?;
        let (predicate, value) = rest.split_once('=')?;
        let valid = |s: &str| !s.is_empty() && !s.contains(char::is_whitespace);
        if !valid(namespace) || !valid(predicate) || value.trim().is_empty() {
            return None;
        }
        Some(Self::new(namespace, predicate, value.trim()))
    }
}

impl fmt::Display for MachineTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}={}", self.namespace, self.predicate, self.value)
    }
}

/// A record type that takes part in duplicate finding and squashing.
pub trait Duplicatable: Clone + fmt::Debug + Send + Sync + 'static {
    fn schema() -> &'static EntitySchema;

    fn kind() -> EntityKind {
        Self::schema().kind
    }

    fn id(&self) -> Option<RecordId>;
    fn set_id(&mut self, id: RecordId);
    fn duplicate_of(&self) -> Option<RecordId>;
    fn set_duplicate_of(&mut self, id: Option<RecordId>);
    fn title(&self) -> &str;

    /// Reads a column by name; `None` when the column does not exist.
    fn attribute(&self, field: &str) -> Option<FieldValue>;

    /// Writes a reference column by name; `false` when it is not a reference column.
    fn set_reference(&mut self, field: &str, value: Option<RecordId>) -> bool;

    fn stamp(&mut self, now: DateTime<Utc>);
    fn validate(&self) -> Vec<String>;

    fn tags(&self) -> Option<&TagList> {
        None
    }

    fn tags_mut(&mut self) -> Option<&mut TagList> {
        None
    }

    fn is_resolved_duplicate(&self) -> bool {
        self.duplicate_of().is_some()
    }

    fn comparable_attributes(&self) -> Vec<(&'static str, FieldValue)> {
        Self::schema()
            .comparable_fields()
            .into_iter()
            .map(|field| (field, self.attribute(field).unwrap_or(FieldValue::Null)))
            .collect()
    }
}

fn blank(value: &str) -> bool {
    value.trim().is_empty()
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Event {
    pub id: Option<RecordId>,
    pub title: String,
    pub description: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub url: Option<String>,
    pub venue_id: Option<RecordId>,
    pub source_id: Option<RecordId>,
    pub venue_details: Option<String>,
    pub duplicate_of_id: Option<RecordId>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: TagList,
}

impl Event {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    /// End time, or an hour after the start when the feed gave no end.
    pub fn computed_end(&self) -> Option<DateTime<Utc>> {
        self.end_time
            .or_else(|| self.start_time?.checked_add_signed(Duration::hours(1)))
    }

    pub fn is_old(&self, now: DateTime<Utc>) -> bool {
        self.computed_end().is_some_and(|end| end < now)
    }
}

impl Duplicatable for Event {
    fn schema() -> &'static EntitySchema {
        &EVENT_SCHEMA
    }

    fn id(&self) -> Option<RecordId> {
        self.id
    }

    fn set_id(&mut self, id: RecordId) {
        self.id = Some(id);
    }

    fn duplicate_of(&self) -> Option<RecordId> {
        self.duplicate_of_id
    }

    fn set_duplicate_of(&mut self, id: Option<RecordId>) {
        self.duplicate_of_id = id;
    }

    fn title(&self) -> &str {
        &self.title
    }

    fn attribute(&self, field: &str) -> Option<FieldValue> {
        Some(match field {
            "id" => FieldValue::reference(self.id),
            "title" => FieldValue::Text(self.title.clone()),
            "description" => FieldValue::text(self.description.as_deref()),
            "start_time" => FieldValue::timestamp(self.start_time),
            "end_time" => FieldValue::timestamp(self.end_time),
            "url" => FieldValue::text(self.url.as_deref()),
            "venue_id" => FieldValue::reference(self.venue_id),
            "source_id" => FieldValue::reference(self.source_id),
            "venue_details" => FieldValue::text(self.venue_details.as_deref()),
            "duplicate_of_id" => FieldValue::reference(self.duplicate_of_id),
            "created_at" => FieldValue::timestamp(self.created_at),
            "updated_at" => FieldValue::timestamp(self.updated_at),
            _ => return None,
        })
    }

    fn set_reference(&mut self, field: &str, value: Option<RecordId>) -> bool {
        match field {
            "venue_id" => self.venue_id = value,
            "source_id" => self.source_id = value,
            "duplicate_of_id" => self.duplicate_of_id = value,
            _ => return false,
        }
        true
    }

    fn stamp(&mut self, now: DateTime<Utc>) {
        self.created_at.get_or_insert(now);
        self.updated_at = Some(now);
    }

    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if blank(&self.title) {
            errors.push("title can't be blank".to_string());
        }
        match (self.start_time, self.end_time) {
            (None, _) => errors.push("start_time can't be blank".to_string()),
            (Some(start), Some(end)) if end < start => {
                errors.push("end_time can't be before start_time".to_string())
            }
            _ => {}
        }
        errors
    }

    fn tags(&self) -> Option<&TagList> {
        Some(&self.tags)
    }

    fn tags_mut(&mut self) -> Option<&mut TagList> {
        Some(&mut self.tags)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Venue {
    pub id: Option<RecordId>,
    pub title: String,
    pub description: Option<String>,
    pub address: Option<String>,
    pub street_address: Option<String>,
    pub locality: Option<String>,
    pub region: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub email: Option<String>,
    pub telephone: Option<String>,
    pub url: Option<String>,
    #[serde(default)]
    pub closed: bool,
    #[serde(default)]
    pub wifi: bool,
    pub access_notes: Option<String>,
    pub source_id: Option<RecordId>,
    pub duplicate_of_id: Option<RecordId>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: TagList,
}

impl Venue {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }
}

impl Duplicatable for Venue {
    fn schema() -> &'static EntitySchema {
        &VENUE_SCHEMA
    }

    fn id(&self) -> Option<RecordId> {
        self.id
    }

    fn set_id(&mut self, id: RecordId) {
        self.id = Some(id);
    }

    fn duplicate_of(&self) -> Option<RecordId> {
        self.duplicate_of_id
    }

    fn set_duplicate_of(&mut self, id: Option<RecordId>) {
        self.duplicate_of_id = id;
    }

    fn title(&self) -> &str {
        &self.title
    }

    fn attribute(&self, field: &str) -> Option<FieldValue> {
        Some(match field {
            "id" => FieldValue::reference(self.id),
            "title" => FieldValue::Text(self.title.clone()),
            "description" => FieldValue::text(self.description.as_deref()),
            "address" => FieldValue::text(self.address.as_deref()),
            "street_address" => FieldValue::text(self.street_address.as_deref()),
            "locality" => FieldValue::text(self.locality.as_deref()),
            "region" => FieldValue::text(self.region.as_deref()),
            "postal_code" => FieldValue::text(self.postal_code.as_deref()),
            "country" => FieldValue::text(self.country.as_deref()),
            "latitude" => FieldValue::float(self.latitude),
            "longitude" => FieldValue::float(self.longitude),
            "email" => FieldValue::text(self.email.as_deref()),
            "telephone" => FieldValue::text(self.telephone.as_deref()),
            "url" => FieldValue::text(self.url.as_deref()),
            "closed" => FieldValue::Boolean(self.closed),
            "wifi" => FieldValue::Boolean(self.wifi),
            "access_notes" => FieldValue::text(self.access_notes.as_deref()),
            "source_id" => FieldValue::reference(self.source_id),
            "duplicate_of_id" => FieldValue::reference(self.duplicate_of_id),
            "created_at" => FieldValue::timestamp(self.created_at),
            "updated_at" => FieldValue::timestamp(self.updated_at),
            _ => return None,
        })
    }

    fn set_reference(&mut self, field: &str, value: Option<RecordId>) -> bool {
        match field {
            "source_id" => self.source_id = value,
            "duplicate_of_id" => self.duplicate_of_id = value,
            _ => return false,
        }
        true
    }

    fn stamp(&mut self, now: DateTime<Utc>) {
        self.created_at.get_or_insert(now);
        self.updated_at = Some(now);
    }

    fn validate(&self) -> Vec<String> {
        if blank(&self.title) {
            vec!["title can't be blank".to_string()]
        } else {
            Vec::new()
        }
    }

    fn tags(&self) -> Option<&TagList> {
        Some(&self.tags)
    }

    fn tags_mut(&mut self) -> Option<&mut TagList> {
        Some(&mut self.tags)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Source {
    pub id: Option<RecordId>,
    pub title: String,
    pub url: String,
    pub imported_at: Option<DateTime<Utc>>,
    pub duplicate_of_id: Option<RecordId>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Source {
    pub fn for_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

impl Duplicatable for Source {
    fn schema() -> &'static EntitySchema {
        &SOURCE_SCHEMA
    }

    fn id(&self) -> Option<RecordId> {
        self.id
    }

    fn set_id(&mut self, id: RecordId) {
        self.id = Some(id);
    }

    fn duplicate_of(&self) -> Option<RecordId> {
        self.duplicate_of_id
    }

    fn set_duplicate_of(&mut self, id: Option<RecordId>) {
        self.duplicate_of_id = id;
    }

    fn title(&self) -> &str {
        if blank(&self.title) {
            &self.url
        } else {
            &self.title
        }
    }

    fn attribute(&self, field: &str) -> Option<FieldValue> {
        Some(match field {
            "id" => FieldValue::reference(self.id),
            "title" => FieldValue::Text(self.title.clone()),
            "url" => FieldValue::Text(self.url.clone()),
            "imported_at" => FieldValue::timestamp(self.imported_at),
            "duplicate_of_id" => FieldValue::reference(self.duplicate_of_id),
            "created_at" => FieldValue::timestamp(self.created_at),
            "updated_at" => FieldValue::timestamp(self.updated_at),
            _ => return None,
        })
    }

    fn set_reference(&mut self, field: &str, value: Option<RecordId>) -> bool {
        if field == "duplicate_of_id" {
            self.duplicate_of_id = value;
            true
        } else {
            false
        }
    }

    fn stamp(&mut self, now: DateTime<Utc>) {
        self.created_at.get_or_insert(now);
        self.updated_at = Some(now);
    }

    fn validate(&self) -> Vec<String> {
        if blank(&self.url) {
            vec!["url can't be blank".to_string()]
        } else {
            Vec::new()
        }
    }
}
