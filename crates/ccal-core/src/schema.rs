//! Static per-entity declarations: columns, ignored fields, and associations.

use crate::EntityKind;

/// Columns that never take part in duplicate comparison on any entity.
pub const SYSTEM_FIELDS: &[&str] = &["id", "created_at", "updated_at", "duplicate_of_id", "version"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationKind {
    /// Child rows of `target` point at the owner through `foreign_key`.
    HasMany {
        target: EntityKind,
        foreign_key: &'static str,
    },
    /// Shared free-text labels; merged by union, never repointed.
    Tags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Association {
    pub name: &'static str,
    pub kind: AssociationKind,
}

#[derive(Debug)]
pub struct EntitySchema {
    pub kind: EntityKind,
    pub columns: &'static [&'static str],
    pub ignored_fields: &'static [&'static str],
    pub associations: &'static [Association],
    pub squash_ignored_associations: &'static [&'static str],
}

impl EntitySchema {
    pub fn for_kind(kind: EntityKind) -> &'static EntitySchema {
        match kind {
            EntityKind::Event => &EVENT_SCHEMA,
            EntityKind::Venue => &VENUE_SCHEMA,
            EntityKind::Source => &SOURCE_SCHEMA,
        }
    }

    pub fn has_column(&self, field: &str) -> bool {
        self.columns.contains(&field)
    }

    pub fn is_ignored(&self, field: &str) -> bool {
        SYSTEM_FIELDS.contains(&field) || self.ignored_fields.contains(&field)
    }

    /// Columns compared when looking for duplicates, in declaration order.
    pub fn comparable_fields(&self) -> Vec<&'static str> {
        self.columns
            .iter()
            .copied()
            .filter(|c| !self.is_ignored(c))
            .collect()
    }

    pub fn squash_ignores(&self, association: &str) -> bool {
        self.squash_ignored_associations.contains(&association)
    }

    /// Associations on other entities whose rows point back at this one.
    pub fn referencing_associations(&self) -> impl Iterator<Item = &'static Association> + '_ {
        self.associations
            .iter()
            .filter(|a| matches!(a.kind, AssociationKind::HasMany { .. }))
    }
}

pub static EVENT_SCHEMA: EntitySchema = EntitySchema {
    kind: EntityKind::Event,
    columns: &[
        "id",
        "title",
        "description",
        "start_time",
        "end_time",
        "url",
        "venue_id",
        "source_id",
        "venue_details",
        "duplicate_of_id",
        "created_at",
        "updated_at",
    ],
    ignored_fields: &["source_id"],
    associations: &[Association {
        name: "tags",
        kind: AssociationKind::Tags,
    }],
    squash_ignored_associations: &["tags"],
};

pub static VENUE_SCHEMA: EntitySchema = EntitySchema {
    kind: EntityKind::Venue,
    columns: &[
        "id",
        "title",
        "description",
        "address",
        "street_address",
        "locality",
        "region",
        "postal_code",
        "country",
        "latitude",
        "longitude",
        "email",
        "telephone",
        "url",
        "closed",
        "wifi",
        "access_notes",
        "source_id",
        "duplicate_of_id",
        "created_at",
        "updated_at",
    ],
    ignored_fields: &["source_id", "closed", "wifi", "access_notes"],
    associations: &[
        Association {
            name: "events",
            kind: AssociationKind::HasMany {
                target: EntityKind::Event,
                foreign_key: "venue_id",
            },
        },
        Association {
            name: "tags",
            kind: AssociationKind::Tags,
        },
    ],
    squash_ignored_associations: &["tags"],
};

pub static SOURCE_SCHEMA: EntitySchema = EntitySchema {
    kind: EntityKind::Source,
    columns: &[
        "id",
        "title",
        "url",
        "imported_at",
        "duplicate_of_id",
        "created_at",
        "updated_at",
    ],
    ignored_fields: &["imported_at"],
    associations: &[
        Association {
            name: "events",
            kind: AssociationKind::HasMany {
                target: EntityKind::Event,
                foreign_key: "source_id",
            },
        },
        Association {
            name: "venues",
            kind: AssociationKind::HasMany {
                target: EntityKind::Venue,
                foreign_key: "source_id",
            },
        },
    ],
    squash_ignored_associations: &[],
};
