//! Duplicate finding over stored records.
//!
//! Candidates are the non-duplicate records of one kind that satisfy an equality
//! scope. Under [`FieldSelector::All`] and [`FieldSelector::Fields`] two records
//! match when every compared column is equal (null equals null). Under
//! [`FieldSelector::Any`] each shared non-blank `(column, value)` pair forms its
//! own group, so one record may sit in several groups.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use ccal_core::{Duplicatable, EntityKind, FieldValue, RecordId};
use ccal_storage::{MemoryStore, Stored};
use thiserror::Error;

pub type GroupKey = Vec<(&'static str, FieldValue)>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FinderError {
    #[error("{kind} has no attribute named `{field}`")]
    UnknownField { kind: EntityKind, field: String },
    #[error("{kind} attribute `{field}` is never compared for duplicates")]
    IgnoredField { kind: EntityKind, field: String },
    #[error("at least one field must be named")]
    NoFields,
    #[error("unknown duplicate strategy `{0}` (expected group-scan or self-join)")]
    UnknownStrategy(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldSelector {
    All,
    Any,
    Fields(Vec<String>),
}

impl FromStr for FieldSelector {
    type Err = FinderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "all" => Ok(FieldSelector::All),
            "any" => Ok(FieldSelector::Any),
            list => {
                let fields: Vec<String> = list
                    .split(',')
                    .map(str::trim)
                    .filter(|f| !f.is_empty())
                    .map(str::to_string)
                    .collect();
                if fields.is_empty() {
                    Err(FinderError::NoFields)
                } else {
                    Ok(FieldSelector::Fields(fields))
                }
            }
        }
    }
}

/// A listing request: everything ungrouped (`na`), or a grouped duplicate search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DuplicateQuery {
    Ungrouped,
    Grouped(FieldSelector),
}

impl DuplicateQuery {
    pub fn parse(text: &str) -> Result<Self, FinderError> {
        match text.trim() {
            "" | "na" => Ok(DuplicateQuery::Ungrouped),
            other => other.parse().map(DuplicateQuery::Grouped),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FinderStrategy {
    /// Hash every candidate by its compared values.
    #[default]
    GroupScan,
    /// Compare candidate pairs `a.id != b.id`, then group the matches.
    SelfJoin,
}

impl FromStr for FinderStrategy {
    type Err = FinderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "group-scan" | "group_scan" => Ok(FinderStrategy::GroupScan),
            "self-join" | "self_join" => Ok(FinderStrategy::SelfJoin),
            other => Err(FinderError::UnknownStrategy(other.to_string())),
        }
    }
}

impl fmt::Display for FinderStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FinderStrategy::GroupScan => "group-scan",
            FinderStrategy::SelfJoin => "self-join",
        })
    }
}

#[derive(Debug, Clone)]
pub struct DuplicateGroup<'a, T> {
    /// Shared values; empty for an ungrouped listing.
    pub key: GroupKey,
    pub records: Vec<&'a T>,
}

impl<T: Duplicatable> DuplicateGroup<'_, T> {
    pub fn ids(&self) -> Vec<RecordId> {
        self.records.iter().filter_map(|r| r.id()).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

enum Policy {
    Every(Vec<&'static str>),
    AnyOf(Vec<&'static str>),
}

type Buckets<'a, T> = BTreeMap<GroupKey, BTreeMap<RecordId, &'a T>>;

#[derive(Debug, Clone, Copy, Default)]
pub struct DuplicateFinder {
    strategy: FinderStrategy,
}

impl DuplicateFinder {
    pub fn new(strategy: FinderStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> FinderStrategy {
        self.strategy
    }

    /// Runs a listing query. `Ungrouped` yields one group of every candidate.
    pub fn query<'a, T: Stored>(
        &self,
        store: &'a MemoryStore,
        query: &DuplicateQuery,
        scope: &[(&str, FieldValue)],
    ) -> Result<Vec<DuplicateGroup<'a, T>>, FinderError> {
        match query {
            DuplicateQuery::Grouped(selector) => self.find(store, selector, scope),
            DuplicateQuery::Ungrouped => {
                let records = candidates::<T>(store, scope)?;
                Ok(if records.is_empty() {
                    Vec::new()
                } else {
                    vec![DuplicateGroup {
                        key: Vec::new(),
                        records,
                    }]
                })
            }
        }
    }

    /// Groups of two or more candidates sharing values under `selector`.
    ///
    /// Records inside a group are in id order; groups are ordered by their first
    /// record, then by key. Both strategies produce the same output.
    pub fn find<'a, T: Stored>(
        &self,
        store: &'a MemoryStore,
        selector: &FieldSelector,
        scope: &[(&str, FieldValue)],
    ) -> Result<Vec<DuplicateGroup<'a, T>>, FinderError> {
        let policy = policy_for::<T>(selector)?;
        let records = candidates::<T>(store, scope)?;
        let buckets = match self.strategy {
            FinderStrategy::GroupScan => group_scan(&records, &policy),
            FinderStrategy::SelfJoin => self_join(&records, &policy),
        };
        Ok(normalize(buckets))
    }
}

fn candidates<'a, T: Stored>(
    store: &'a MemoryStore,
    scope: &[(&str, FieldValue)],
) -> Result<Vec<&'a T>, FinderError> {
    let schema = T::schema();
    if let Some((field, _)) = scope.iter().find(|(f, _)| !schema.has_column(f)) {
        return Err(FinderError::UnknownField {
            kind: T::kind(),
            field: field.to_string(),
        });
    }
    Ok(store.where_eq::<T>(scope))
}

fn policy_for<T: Duplicatable>(selector: &FieldSelector) -> Result<Policy, FinderError> {
    let schema = T::schema();
    match selector {
        FieldSelector::All => Ok(Policy::Every(schema.comparable_fields())),
        FieldSelector::Any => Ok(Policy::AnyOf(schema.comparable_fields())),
        FieldSelector::Fields(names) => {
            let mut fields = Vec::with_capacity(names.len());
            for name in names {
                let Some(column) = schema.columns.iter().copied().find(|c| *c == name.as_str()) else {
                    return Err(FinderError::UnknownField {
                        kind: T::kind(),
                        field: name.clone(),
                    });
                };
                if schema.is_ignored(column) {
                    return Err(FinderError::IgnoredField {
                        kind: T::kind(),
                        field: name.clone(),
                    });
                }
                if !fields.contains(&column) {
                    fields.push(column);
                }
            }
            if fields.is_empty() {
                return Err(FinderError::NoFields);
            }
            Ok(Policy::Every(fields))
        }
    }
}

fn value_of<T: Duplicatable>(record: &T, field: &str) -> FieldValue {
    record.attribute(field).unwrap_or(FieldValue::Null)
}

fn tuple_of<T: Duplicatable>(record: &T, fields: &[&'static str]) -> GroupKey {
    fields.iter().map(|f| (*f, value_of(record, f))).collect()
}

fn add<'a, T: Duplicatable>(buckets: &mut Buckets<'a, T>, key: GroupKey, record: &'a T) {
    if let Some(id) = record.id() {
        buckets.entry(key).or_default().insert(id, record);
    }
}

fn group_scan<'a, T: Duplicatable>(records: &[&'a T], policy: &Policy) -> Buckets<'a, T> {
    let mut buckets = Buckets::new();
    for &record in records {
        match policy {
            Policy::Every(fields) => add(&mut buckets, tuple_of(record, fields), record),
            Policy::AnyOf(fields) => {
                for field in fields {
                    let value = value_of(record, field);
                    if !value.is_blank() {
                        add(&mut buckets, vec![(*field, value)], record);
                    }
                }
            }
        }
    }
    buckets
}

fn self_join<'a, T: Duplicatable>(records: &[&'a T], policy: &Policy) -> Buckets<'a, T> {
    let mut buckets = Buckets::new();
    for &a in records {
        for &b in records {
            if a.id() == b.id() {
                continue;
            }
            match policy {
                Policy::Every(fields) => {
                    let key = tuple_of(a, fields);
                    if key == tuple_of(b, fields) {
                        add(&mut buckets, key.clone(), a);
                        add(&mut buckets, key, b);
                    }
                }
                Policy::AnyOf(fields) => {
                    for field in fields {
                        let value = value_of(a, field);
                        if !value.is_blank() && value == value_of(b, field) {
                            add(&mut buckets, vec![(*field, value.clone())], a);
                            add(&mut buckets, vec![(*field, value)], b);
                        }
                    }
                }
            }
        }
    }
    buckets
}

fn normalize<'a, T>(buckets: Buckets<'a, T>) -> Vec<DuplicateGroup<'a, T>> {
    let mut groups: Vec<(RecordId, DuplicateGroup<'a, T>)> = buckets
        .into_iter()
        .filter(|(_, members)| members.len() > 1)
        .filter_map(|(key, members)| {
            let first = *members.keys().next()?;
            let records = members.into_values().collect();
            Some((first, DuplicateGroup { key, records }))
        })
        .collect();
    groups.sort_by(|(a_first, a), (b_first, b)| a_first.cmp(b_first).then_with(|| a.key.cmp(&b.key)));
    groups.into_iter().map(|(_, group)| group).collect()
}
