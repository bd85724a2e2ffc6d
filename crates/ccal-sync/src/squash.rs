//! Squashing duplicates into a primary record.
//!
//! Each duplicate's children are repointed at the primary, its tags are unioned
//! into the primary's, and it is marked `duplicate_of` the primary. Records that
//! were already duplicates of a squashed record are squashed first, so no
//! two-hop chains survive. Duplicates are never deleted.

use std::collections::HashSet;

use ccal_core::{AssociationKind, EntityKind, Event, RecordId, Source, Venue};
use ccal_storage::{MemoryStore, StoreError, Stored};
use thiserror::Error;
use tracing::{debug, info, info_span};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SquashError {
    #[error("A primary {0} must be selected.")]
    MissingPrimary(EntityKind),
    #[error("At least one duplicate {0} must be selected.")]
    MissingDuplicates(EntityKind),
    #[error("The primary {0} could not be squashed into itself.")]
    IntoItself(EntityKind),
    #[error("The primary {0} is itself a duplicate and cannot be squashed into.")]
    PrimaryIsDuplicate(EntityKind),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SquashOutcome {
    pub kind: EntityKind,
    pub primary: RecordId,
    /// Titles of the duplicates the caller selected, in the order given.
    pub titles: Vec<String>,
    /// Every record marked resolved, transitive duplicates included.
    pub squashed: Vec<RecordId>,
}

impl SquashOutcome {
    pub fn message(&self) -> String {
        format!(
            "Squashed duplicate {} {:?} into primary {}.",
            self.kind.plural(),
            self.titles,
            self.primary
        )
    }
}

/// Squashes `duplicates` into `primary` inside one store transaction.
///
/// Preconditions are checked before anything is touched; a failure after that
/// point rolls the store back to its prior state.
pub fn squash<T: Stored>(
    store: &mut MemoryStore,
    primary: Option<RecordId>,
    duplicates: &[RecordId],
) -> Result<SquashOutcome, SquashError> {
    let kind = T::kind();
    let primary = primary.ok_or(SquashError::MissingPrimary(kind))?;
    if duplicates.is_empty() {
        return Err(SquashError::MissingDuplicates(kind));
    }
    if duplicates.contains(&primary) {
        return Err(SquashError::IntoItself(kind));
    }
    if store.fetch::<T>(primary)?.is_resolved_duplicate() {
        return Err(SquashError::PrimaryIsDuplicate(kind));
    }

    let mut selected = Vec::with_capacity(duplicates.len());
    let mut titles = Vec::with_capacity(duplicates.len());
    for &id in duplicates {
        let record = store.fetch::<T>(id)?;
        if !selected.contains(&id) {
            selected.push(id);
            titles.push(record.title().to_string());
        }
    }

    let span = info_span!("squash", kind = %kind, primary = %primary);
    let _guard = span.enter();

    let squashed = store.transaction(|tx| {
        let mut visited = HashSet::from([primary]);
        let mut squashed = Vec::new();
        for &id in &selected {
            squash_one::<T>(tx, primary, id, &mut visited, &mut squashed)?;
        }
        Ok::<_, SquashError>(squashed)
    })?;

    let outcome = SquashOutcome {
        kind,
        primary,
        titles,
        squashed,
    };
    info!(count = outcome.squashed.len(), "{}", outcome.message());
    Ok(outcome)
}

/// Squash for a kind chosen at runtime.
pub fn squash_kind(
    store: &mut MemoryStore,
    kind: EntityKind,
    primary: Option<RecordId>,
    duplicates: &[RecordId],
) -> Result<SquashOutcome, SquashError> {
    match kind {
        EntityKind::Event => squash::<Event>(store, primary, duplicates),
        EntityKind::Venue => squash::<Venue>(store, primary, duplicates),
        EntityKind::Source => squash::<Source>(store, primary, duplicates),
    }
}

fn squash_one<T: Stored>(
    tx: &mut MemoryStore,
    primary: RecordId,
    duplicate: RecordId,
    visited: &mut HashSet<RecordId>,
    squashed: &mut Vec<RecordId>,
) -> Result<(), SquashError> {
    if !visited.insert(duplicate) {
        return Ok(());
    }
    // Duplicates of this duplicate must land on the primary before it is resolved.
    for child in tx.duplicates_of::<T>(duplicate) {
        squash_one::<T>(tx, primary, child, visited, squashed)?;
    }

    let schema = T::schema();
    for association in schema.referencing_associations() {
        if schema.squash_ignores(association.name) {
            continue;
        }
        if let AssociationKind::HasMany { target, foreign_key } = association.kind {
            let moved = tx.reassign_foreign_key(target, foreign_key, duplicate, primary);
            debug!(association = association.name, moved, %duplicate, "reassigned children");
        }
    }

    let mut record = tx.fetch::<T>(duplicate)?.clone();
    let has_tags = schema
        .associations
        .iter()
        .any(|a| a.kind == AssociationKind::Tags);
    if let Some(tags) = record.tags().filter(|t| has_tags && !t.is_empty()) {
        let mut target = tx.fetch::<T>(primary)?.clone();
        if let Some(primary_tags) = target.tags_mut() {
            primary_tags.merge(tags);
        }
        tx.update(target)?;
    }

    record.set_duplicate_of(Some(primary));
    tx.update(record)?;
    squashed.push(duplicate);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccal_core::TagList;

    fn tagged_venue(title: &str, tags: &[&str]) -> Venue {
        let mut venue = Venue::titled(title);
        venue.tags = tags.iter().collect();
        venue
    }

    fn event_at(store: &mut MemoryStore, title: &str, venue: RecordId) -> RecordId {
        let mut event = Event::titled(title);
        event.venue_id = Some(venue);
        store.insert(event).unwrap()
    }

    #[test]
    fn preconditions_fail_closed() {
        let mut store = MemoryStore::new();
        let p = store.insert(Venue::titled("Primary")).unwrap();
        let d = store.insert(Venue::titled("Duplicate")).unwrap();
        let before = store.clone();

        let err = squash::<Venue>(&mut store, None, &[d]).unwrap_err();
        assert_eq!(err.to_string(), "A primary venue must be selected.");
        let err = squash::<Venue>(&mut store, Some(p), &[]).unwrap_err();
        assert_eq!(err.to_string(), "At least one duplicate venue must be selected.");
        let err = squash::<Venue>(&mut store, Some(p), &[d, p]).unwrap_err();
        assert_eq!(err.to_string(), "The primary venue could not be squashed into itself.");
        let err = squash::<Venue>(&mut store, Some(p), &[d, RecordId(99)]).unwrap_err();
        assert!(matches!(err, SquashError::Store(StoreError::Missing { .. })));

        assert_eq!(store.fetch::<Venue>(d).unwrap(), before.fetch::<Venue>(d).unwrap());
        assert!(store.fetch::<Venue>(d).unwrap().duplicate_of_id.is_none());
    }

    #[test]
    fn primary_that_is_a_duplicate_is_refused() {
        let mut store = MemoryStore::new();
        let a = store.insert(Venue::titled("A")).unwrap();
        let b = store.insert(Venue::titled("B")).unwrap();
        let c = store.insert(Venue::titled("C")).unwrap();
        squash::<Venue>(&mut store, Some(a), &[b]).unwrap();

        let err = squash::<Venue>(&mut store, Some(b), &[c]).unwrap_err();
        assert_eq!(err, SquashError::PrimaryIsDuplicate(EntityKind::Venue));
        assert!(store.fetch::<Venue>(c).unwrap().duplicate_of_id.is_none());
    }

    #[test]
    fn children_move_and_tags_union() {
        let mut store = MemoryStore::new();
        let p = store.insert(tagged_venue("Hack Space", &["ruby"])).unwrap();
        let d = store.insert(tagged_venue("Hackspace", &["ruby", "code"])).unwrap();
        let e = event_at(&mut store, "Code Sprint", d);

        let outcome = squash::<Venue>(&mut store, Some(p), &[d]).unwrap();
        assert_eq!(outcome.message(), r#"Squashed duplicate venues ["Hackspace"] into primary 1."#);
        assert_eq!(store.fetch::<Event>(e).unwrap().venue_id, Some(p));
        assert_eq!(
            store.fetch::<Venue>(p).unwrap().tags,
            TagList::from_iter(["code", "ruby"])
        );
        let resolved = store.fetch::<Venue>(d).unwrap();
        assert_eq!(resolved.duplicate_of_id, Some(p));
        assert_eq!(store.originator::<Venue>(d).unwrap().title, "Hack Space");
    }

    #[test]
    fn duplicates_of_duplicates_point_straight_at_primary() {
        let mut store = MemoryStore::new();
        let p = store.insert(Venue::titled("P")).unwrap();
        let d1 = store.insert(Venue::titled("D1")).unwrap();
        let d2 = store.insert(Venue::titled("D2")).unwrap();
        let e2 = event_at(&mut store, "At D2", d2);
        squash::<Venue>(&mut store, Some(d1), &[d2]).unwrap();

        let outcome = squash::<Venue>(&mut store, Some(p), &[d1]).unwrap();
        assert_eq!(outcome.squashed, vec![d2, d1]);
        assert_eq!(outcome.titles, vec!["D1".to_string()]);
        assert_eq!(store.fetch::<Venue>(d2).unwrap().duplicate_of_id, Some(p));
        assert_eq!(store.fetch::<Venue>(d1).unwrap().duplicate_of_id, Some(p));
        assert_eq!(store.fetch::<Event>(e2).unwrap().venue_id, Some(p));
        assert!(store.duplicates_of::<Venue>(d1).is_empty());
    }

    #[test]
    fn source_squash_moves_events_and_venues() {
        let mut store = MemoryStore::new();
        let keep = store.insert(Source::for_url("http://example.org/a.ics")).unwrap();
        let drop = store.insert(Source::for_url("http://example.org/a.ics?x=1")).unwrap();
        let mut venue = Venue::titled("Hack Space");
        venue.source_id = Some(drop);
        let v = store.insert(venue).unwrap();
        let mut event = Event::titled("Code Sprint");
        event.source_id = Some(drop);
        let e = store.insert(event).unwrap();

        let outcome = squash_kind(&mut store, EntityKind::Source, Some(keep), &[drop]).unwrap();
        assert_eq!(outcome.titles, vec!["http://example.org/a.ics?x=1".to_string()]);
        assert_eq!(store.fetch::<Venue>(v).unwrap().source_id, Some(keep));
        assert_eq!(store.fetch::<Event>(e).unwrap().source_id, Some(keep));
    }
}
