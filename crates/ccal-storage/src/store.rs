//! In-memory persistence collaborator: one arena per entity kind, keyed by `RecordId`.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use anyhow::Context;
use ccal_core::{Duplicatable, EntityKind, Event, FieldValue, RecordId, Source, Venue};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{kind} {id} does not exist")]
    Missing { kind: EntityKind, id: RecordId },
    #[error("{kind} {id} is already saved")]
    AlreadySaved { kind: EntityKind, id: RecordId },
    #[error("{kind} has not been saved yet")]
    Unsaved { kind: EntityKind },
    #[error("duplicate chain starting at {kind} {id} loops back on itself")]
    DuplicateCycle { kind: EntityKind, id: RecordId },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryStore {
    next_id: u64,
    #[serde(default)]
    events: BTreeMap<RecordId, Event>,
    #[serde(default)]
    venues: BTreeMap<RecordId, Venue>,
    #[serde(default)]
    sources: BTreeMap<RecordId, Source>,
}

/// Maps a record type onto its arena inside `MemoryStore`.
pub trait Stored: Duplicatable {
    fn table(store: &MemoryStore) -> &BTreeMap<RecordId, Self>;
    fn table_mut(store: &mut MemoryStore) -> &mut BTreeMap<RecordId, Self>;
}

impl Stored for Event {
    fn table(store: &MemoryStore) -> &BTreeMap<RecordId, Self> {
        &store.events
    }

    fn table_mut(store: &mut MemoryStore) -> &mut BTreeMap<RecordId, Self> {
        &mut store.events
    }
}

impl Stored for Venue {
    fn table(store: &MemoryStore) -> &BTreeMap<RecordId, Self> {
        &store.venues
    }

    fn table_mut(store: &mut MemoryStore) -> &mut BTreeMap<RecordId, Self> {
        &mut store.venues
    }
}

impl Stored for Source {
    fn table(store: &MemoryStore) -> &BTreeMap<RecordId, Self> {
        &store.sources
    }

    fn table_mut(store: &mut MemoryStore) -> &mut BTreeMap<RecordId, Self> {
        &mut store.sources
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<T: Stored>(&self, id: RecordId) -> Option<&T> {
        T::table(self).get(&id)
    }

    pub fn fetch<T: Stored>(&self, id: RecordId) -> Result<&T, StoreError> {
        self.get(id).ok_or(StoreError::Missing { kind: T::kind(), id })
    }

    pub fn all<T: Stored>(&self) -> impl Iterator<Item = &T> {
        T::table(self).values()
    }

    pub fn count<T: Stored>(&self) -> usize {
        T::table(self).len()
    }

    /// Records not marked as a duplicate of anything, in id order.
    pub fn non_duplicates<T: Stored>(&self) -> Vec<&T> {
        self.all::<T>().filter(|r| !r.is_resolved_duplicate()).collect()
    }

    pub fn insert<T: Stored>(&mut self, mut record: T) -> Result<RecordId, StoreError> {
        if let Some(id) = record.id() {
            return Err(StoreError::AlreadySaved { kind: T::kind(), id });
        }
        self.next_id += 1;
        let id = RecordId(self.next_id);
        record.set_id(id);
        record.stamp(Utc::now());
        T::table_mut(self).insert(id, record);
        Ok(id)
    }

    pub fn update<T: Stored>(&mut self, mut record: T) -> Result<(), StoreError> {
        let id = record.id().ok_or(StoreError::Unsaved { kind: T::kind() })?;
        let slot = T::table_mut(self)
            .get_mut(&id)
            .ok_or(StoreError::Missing { kind: T::kind(), id })?;
        record.stamp(Utc::now());
        *slot = record;
        Ok(())
    }

    pub fn save<T: Stored>(&mut self, record: T) -> Result<RecordId, StoreError> {
        match record.id() {
            Some(id) => self.update(record).map(|()| id),
            None => self.insert(record),
        }
    }

    /// Non-duplicate records whose named columns all equal the given values.
    pub fn where_eq<T: Stored>(&self, predicates: &[(&str, FieldValue)]) -> Vec<&T> {
        self.all::<T>()
            .filter(|r| !r.is_resolved_duplicate())
            .filter(|r| {
                predicates
                    .iter()
                    .all(|(field, value)| r.attribute(field).as_ref() == Some(value))
            })
            .collect()
    }

    /// Stored records (resolved duplicates included) whose comparable attributes
    /// all equal the candidate's, excluding the candidate itself.
    pub fn find_exact_duplicates<T: Stored>(&self, candidate: &T) -> Vec<RecordId> {
        let wanted = candidate.comparable_attributes();
        self.all::<T>()
            .filter(|r| r.id() != candidate.id())
            .filter(|r| r.comparable_attributes() == wanted)
            .filter_map(|r| r.id())
            .collect()
    }

    pub fn duplicates_of<T: Stored>(&self, id: RecordId) -> Vec<RecordId> {
        self.all::<T>()
            .filter(|r| r.duplicate_of() == Some(id))
            .filter_map(|r| r.id())
            .collect()
    }

    /// Follows `duplicate_of_id` links to the terminal non-duplicate record.
    pub fn originator<T: Stored>(&self, id: RecordId) -> Result<&T, StoreError> {
        let mut visited = HashSet::new();
        let mut current = self.fetch::<T>(id)?;
        while let Some(next) = current.duplicate_of() {
            let here = current.id().unwrap_or(id);
            if !visited.insert(here) {
                return Err(StoreError::DuplicateCycle { kind: T::kind(), id });
            }
            current = self.fetch::<T>(next)?;
        }
        Ok(current)
    }

    pub fn tagged_with<T: Stored>(&self, tag: &str) -> Option<&T> {
        self.all::<T>()
            .find(|r| r.tags().is_some_and(|tags| tags.contains(tag)))
    }

    /// Repoints every `target` row whose `foreign_key` equals `from` to `to`.
    pub fn reassign_foreign_key(
        &mut self,
        target: EntityKind,
        foreign_key: &str,
        from: RecordId,
        to: RecordId,
    ) -> usize {
        match target {
            EntityKind::Event => self.reassign_in::<Event>(foreign_key, from, to),
            EntityKind::Venue => self.reassign_in::<Venue>(foreign_key, from, to),
            EntityKind::Source => self.reassign_in::<Source>(foreign_key, from, to),
        }
    }

    fn reassign_in<T: Stored>(&mut self, foreign_key: &str, from: RecordId, to: RecordId) -> usize {
        let now = Utc::now();
        let mut moved = 0;
        for record in T::table_mut(self).values_mut() {
            if record.attribute(foreign_key) == Some(FieldValue::Reference(from))
                && record.set_reference(foreign_key, Some(to))
            {
                record.stamp(now);
                moved += 1;
            }
        }
        moved
    }

    /// Runs `work` against the store, restoring the prior state if it fails.
    pub fn transaction<R, E, F>(&mut self, work: F) -> Result<R, E>
    where
        F: FnOnce(&mut MemoryStore) -> Result<R, E>,
    {
        let snapshot = self.clone();
        let result = work(self);
        if result.is_err() {
            *self = snapshot;
        }
        result
    }

    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !fs::try_exists(path)
            .await
            .with_context(|| format!("checking store path {}", path.display()))?
        {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Writes the snapshot through a temp file and an atomic rename.
    pub async fn persist(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => std::path::PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating store directory {}", parent.display()))?;

        let bytes = serde_json::to_vec_pretty(self).context("serializing store snapshot")?;
        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp store file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp store file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp store file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp store {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccal_core::TagList;
    use chrono::{DateTime, TimeZone};
    use tempfile::tempdir;

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 20, 12, 0, 0).single().unwrap()
    }

    fn event_at(store: &mut MemoryStore, title: &str, venue: Option<RecordId>) -> RecordId {
        let mut event = Event::titled(title);
        event.start_time = Some(noon());
        event.venue_id = venue;
        store.insert(event).unwrap()
    }

    #[test]
    fn insert_assigns_ids_and_timestamps() {
        let mut store = MemoryStore::new();
        let a = store.insert(Venue::titled("Hack Space")).unwrap();
        let b = store.insert(Event::titled("Code Sprint")).unwrap();
        assert_ne!(a, b);
        let venue = store.fetch::<Venue>(a).unwrap();
        assert!(venue.created_at.is_some());
        assert_eq!(
            store.insert(venue.clone()),
            Err(StoreError::AlreadySaved { kind: EntityKind::Venue, id: a })
        );
    }

    #[test]
    fn originator_follows_chain_and_detects_cycles() {
        let mut store = MemoryStore::new();
        let p = store.insert(Venue::titled("Primary")).unwrap();
        let d1 = store.insert(Venue::titled("Dup one")).unwrap();
        let d2 = store.insert(Venue::titled("Dup two")).unwrap();

        let mut v = store.fetch::<Venue>(d1).unwrap().clone();
        v.duplicate_of_id = Some(p);
        store.update(v).unwrap();
        let mut v = store.fetch::<Venue>(d2).unwrap().clone();
        v.duplicate_of_id = Some(d1);
        store.update(v).unwrap();

        assert_eq!(store.originator::<Venue>(d2).unwrap().title, "Primary");

        let mut v = store.fetch::<Venue>(p).unwrap().clone();
        v.duplicate_of_id = Some(d2);
        store.update(v).unwrap();
        assert!(matches!(
            store.originator::<Venue>(d2),
            Err(StoreError::DuplicateCycle { .. })
        ));
    }

    #[test]
    fn exact_duplicates_ignore_system_and_source_columns() {
        let mut store = MemoryStore::new();
        let mut stored = Venue::titled("Hack Space");
        stored.source_id = Some(RecordId(77));
        stored.wifi = true;
        let id = store.insert(stored).unwrap();

        let candidate = Venue::titled("Hack Space");
        assert_eq!(store.find_exact_duplicates(&candidate), vec![id]);

        let mut different = Venue::titled("Hack Space");
        different.locality = Some("Portland".into());
        assert!(store.find_exact_duplicates(&different).is_empty());
    }

    #[test]
    fn where_eq_skips_resolved_duplicates() {
        let mut store = MemoryStore::new();
        let keep = store.insert(Venue::titled("Hack Space")).unwrap();
        let mut dup = Venue::titled("Hack Space");
        dup.duplicate_of_id = Some(keep);
        store.insert(dup).unwrap();

        let found = store.where_eq::<Venue>(&[("title", FieldValue::Text("Hack Space".into()))]);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, Some(keep));
    }

    #[test]
    fn reassign_moves_only_matching_children() {
        let mut store = MemoryStore::new();
        let a = store.insert(Venue::titled("A")).unwrap();
        let b = store.insert(Venue::titled("B")).unwrap();
        let e1 = event_at(&mut store, "one", Some(a));
        let e2 = event_at(&mut store, "two", Some(b));

        let moved = store.reassign_foreign_key(EntityKind::Event, "venue_id", a, b);
        assert_eq!(moved, 1);
        assert_eq!(store.fetch::<Event>(e1).unwrap().venue_id, Some(b));
        assert_eq!(store.fetch::<Event>(e2).unwrap().venue_id, Some(b));
    }

    #[test]
    fn failed_transaction_rolls_back() {
        let mut store = MemoryStore::new();
        let result: Result<(), StoreError> = store.transaction(|tx| {
            tx.insert(Venue::titled("Temporary"))?;
            Err(StoreError::Unsaved { kind: EntityKind::Venue })
        });
        assert!(result.is_err());
        assert_eq!(store.count::<Venue>(), 0);

        let kept: Result<RecordId, StoreError> =
            store.transaction(|tx| tx.insert(Venue::titled("Kept")));
        assert!(kept.is_ok());
        assert_eq!(store.count::<Venue>(), 1);
    }

    #[test]
    fn tagged_with_finds_machine_tagged_venue() {
        let mut store = MemoryStore::new();
        let mut venue = Venue::titled("Meetup HQ");
        venue.tags = TagList::from_iter(["meetup:venue=42"]);
        let id = store.insert(venue).unwrap();
        assert_eq!(store.tagged_with::<Venue>("meetup:venue=42").and_then(|v| v.id), Some(id));
        assert!(store.tagged_with::<Venue>("meetup:venue=43").is_none());
    }

    #[tokio::test]
    async fn snapshot_round_trips_through_disk() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("calendar.json");

        let empty = MemoryStore::load(&path).await.expect("load missing");
        assert_eq!(empty.count::<Event>(), 0);

        let mut store = MemoryStore::new();
        let venue = store.insert(Venue::titled("Hack Space")).unwrap();
        event_at(&mut store, "Code Sprint", Some(venue));
        store.persist(&path).await.expect("persist");

        let loaded = MemoryStore::load(&path).await.expect("load");
        assert_eq!(loaded.count::<Event>(), 1);
        assert_eq!(loaded.fetch::<Venue>(venue).unwrap().title, "Hack Space");

        let mut loaded = loaded;
        let next = loaded.insert(Venue::titled("Another")).unwrap();
        assert!(next.0 > venue.0);
    }
}
