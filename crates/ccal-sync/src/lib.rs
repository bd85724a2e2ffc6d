//! Duplicate finding, squashing, and the import orchestrator for ccal.

pub mod config;
pub mod finder;
pub mod importer;
pub mod squash;

pub use config::{ImportConfig, SourceEntry, SourceRegistry};
pub use finder::{
    DuplicateFinder, DuplicateGroup, DuplicateQuery, FieldSelector, FinderError, FinderStrategy,
    GroupKey,
};
pub use importer::{validate_url, ImportFailure, ImportResult, Importer, SourceAttributes};
pub use squash::{squash, squash_kind, SquashError, SquashOutcome};

pub const CRATE_NAME: &str = "ccal-sync";
