use std::path::PathBuf;

use ccal_adapters::{FixtureFetcher, ParserConfig, ParserRegistry};
use ccal_core::{Event, FieldValue, RecordId, Venue};
use ccal_storage::{MemoryStore, StoreError};
use ccal_sync::{
    squash, DuplicateFinder, DuplicateQuery, FieldSelector, FinderStrategy, Importer,
    SourceAttributes, SquashError,
};
use chrono::{TimeZone, Utc};

async fn imported_store() -> MemoryStore {
    let dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .canonicalize()
        .expect("fixtures dir");
    let fetcher = FixtureFetcher::from_dir(dir).expect("routes.json");
    let registry = ParserRegistry::default();
    let config = ParserConfig {
        meetup_api_key: Some("meetup-key".into()),
        ..ParserConfig::default()
    };
    let importer = Importer::new(&registry, &fetcher, &config);
    let now = Utc.with_ymd_and_hms(2030, 5, 1, 0, 0, 0).single().unwrap();

    let mut store = MemoryStore::new();
    for url in [
        "http://calendar.example.org/code_sprint.ics",
        "http://calendar.example.org/events/",
        "https://www.meetup.com/pdx-rust/events/280001234/",
    ] {
        let result = importer.import_at(&mut store, SourceAttributes::new(url), now).await;
        assert!(result.is_success(), "{url}: {}", result.message());
    }
    store
}

fn by_title(title: &str) -> Vec<(&'static str, FieldValue)> {
    vec![("title", FieldValue::Text(title.to_string()))]
}

#[tokio::test]
async fn both_strategies_find_the_same_groups_in_imported_data() {
    let store = imported_store().await;
    for query in ["all", "any", "title", "title,start_time"] {
        let query = DuplicateQuery::parse(query).unwrap();
        let DuplicateQuery::Grouped(selector) = &query else {
            unreachable!()
        };
        let scan = DuplicateFinder::new(FinderStrategy::GroupScan)
            .find::<Event>(&store, selector, &[])
            .unwrap();
        let join = DuplicateFinder::new(FinderStrategy::SelfJoin)
            .find::<Event>(&store, selector, &[])
            .unwrap();
        let summarize = |groups: &[ccal_sync::DuplicateGroup<'_, Event>]| {
            groups
                .iter()
                .map(|g| (g.key.clone(), g.ids()))
                .collect::<Vec<_>>()
        };
        assert_eq!(summarize(&scan), summarize(&join), "{selector:?}");
    }
}

#[tokio::test]
async fn same_titled_events_from_two_feeds_group_and_squash() {
    let mut store = imported_store().await;
    let finder = DuplicateFinder::default();

    let groups: Vec<Vec<RecordId>> = finder
        .find::<Event>(&store, &FieldSelector::Fields(vec!["title".into()]), &[])
        .unwrap()
        .iter()
        .map(|g| g.ids())
        .collect();
    let exact_groups = finder
        .find::<Event>(&store, &FieldSelector::All, &[])
        .unwrap()
        .len();
    assert_eq!(groups.len(), 2, "Code Sprint and Rust Study Group");
    assert!(groups.iter().all(|ids| ids.len() == 2));
    assert_eq!(exact_groups, 0, "feeds disagree on descriptions and end times");

    for ids in &groups {
        let (primary, duplicates) = ids.split_first().unwrap();
        let expected_tags = {
            let mut tags = store.fetch::<Event>(*primary).unwrap().tags.clone();
            for id in duplicates {
                tags.merge(&store.fetch::<Event>(*id).unwrap().tags);
            }
            tags
        };
        let outcome = squash::<Event>(&mut store, Some(*primary), duplicates).unwrap();
        assert!(outcome.message().starts_with("Squashed duplicate events ["));
        assert_eq!(store.fetch::<Event>(*primary).unwrap().tags, expected_tags);
        for id in duplicates {
            let original = store.originator::<Event>(*id).unwrap();
            assert_eq!(original.id, Some(*primary));
        }
    }

    assert!(finder
        .find::<Event>(&store, &FieldSelector::Fields(vec!["title".into()]), &[])
        .unwrap()
        .is_empty());
    assert_eq!(store.non_duplicates::<Event>().len(), 4);
    assert_eq!(store.count::<Event>(), 6);
}

#[tokio::test]
async fn identical_venues_across_feeds_are_stored_once() {
    let store = imported_store().await;
    // The iCalendar and hCalendar feeds describe Hack Space identically; Meetup does not.
    let hack_spaces = store.where_eq::<Venue>(&by_title("Hack Space"));
    assert_eq!(hack_spaces.len(), 2);
    let central = store.where_eq::<Venue>(&by_title("Central Library, Room 2"));
    assert_eq!(central.len(), 1);
}

#[tokio::test]
async fn squashing_venues_moves_their_events() {
    let mut store = imported_store().await;
    let finder = DuplicateFinder::default();

    let groups = finder
        .find::<Venue>(&store, &FieldSelector::Fields(vec!["title".into()]), &by_title("Hack Space"))
        .unwrap();
    assert_eq!(groups.len(), 1);
    let ids = groups[0].ids();
    let (primary, duplicates) = (ids[0], ids[1..].to_vec());

    let moved: Vec<RecordId> = store
        .all::<Event>()
        .filter(|e| e.venue_id.is_some_and(|v| duplicates.contains(&v)))
        .filter_map(|e| e.id)
        .collect();
    assert!(!moved.is_empty());

    squash::<Venue>(&mut store, Some(primary), &duplicates).unwrap();
    for id in moved {
        assert_eq!(store.fetch::<Event>(id).unwrap().venue_id, Some(primary));
    }
    assert!(store
        .all::<Event>()
        .all(|e| e.venue_id.map_or(true, |v| !duplicates.contains(&v))));

    let listing = finder
        .query::<Venue>(&store, &DuplicateQuery::parse("na").unwrap(), &by_title("Hack Space"))
        .unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].ids(), vec![primary]);
}

#[tokio::test]
async fn failed_preconditions_leave_imported_records_untouched() {
    let mut store = imported_store().await;
    let before = store.clone();
    let some_event = store.all::<Event>().next().and_then(|e| e.id).unwrap();

    let err = squash::<Event>(&mut store, None, &[some_event]).unwrap_err();
    assert!(err.to_string().contains("must be selected"));
    let err = squash::<Event>(&mut store, Some(some_event), &[some_event]).unwrap_err();
    assert!(err.to_string().contains("squashed into itself"));

    for event in before.all::<Event>() {
        let id = event.id.unwrap();
        assert_eq!(store.fetch::<Event>(id).unwrap(), event);
    }
}

/// Rewrites a stored venue's own id so it no longer matches its slot, as a hand-edited
/// snapshot might.
fn with_mismatched_venue_id(store: &MemoryStore, slot: RecordId, bogus: RecordId) -> MemoryStore {
    let mut snapshot = serde_json::to_value(store).unwrap();
    snapshot["venues"][slot.0.to_string()]["id"] = serde_json::json!(bogus.0);
    serde_json::from_value(snapshot).unwrap()
}

#[tokio::test]
async fn squash_failing_midway_rolls_back_earlier_duplicates() {
    let mut store = imported_store().await;
    let hack_spaces: Vec<RecordId> = store
        .where_eq::<Venue>(&by_title("Hack Space"))
        .iter()
        .filter_map(|v| v.id)
        .collect();
    let (primary, clean) = (hack_spaces[0], hack_spaces[1]);
    let library = store
        .where_eq::<Venue>(&by_title("Central Library, Room 2"))[0]
        .id
        .unwrap();

    let mut annex = Venue::titled("Library annex");
    annex.duplicate_of_id = Some(library);
    let annex = store.insert(annex).unwrap();
    let mut store = with_mismatched_venue_id(&store, annex, RecordId(9_999));
    let before = store.clone();
    let clean_events = store
        .all::<Event>()
        .filter(|e| e.venue_id == Some(clean))
        .count();
    assert!(clean_events > 0);

    // The clean duplicate is squashed first; the library's broken child fails afterwards.
    let err = squash::<Venue>(&mut store, Some(primary), &[clean, library]).unwrap_err();
    assert!(matches!(err, SquashError::Store(StoreError::Missing { .. })), "{err:?}");

    for venue in before.all::<Venue>() {
        assert_eq!(store.all::<Venue>().find(|v| v.id == venue.id), Some(venue));
    }
    for event in before.all::<Event>() {
        assert_eq!(store.fetch::<Event>(event.id.unwrap()).unwrap(), event);
    }
    assert_eq!(
        store.all::<Event>().filter(|e| e.venue_id == Some(clean)).count(),
        clean_events
    );
    assert!(store.fetch::<Venue>(clean).unwrap().duplicate_of_id.is_none());
}
