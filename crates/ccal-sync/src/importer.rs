//! Import orchestration: source bookkeeping, parser dispatch, and persistence.

use ccal_adapters::resolve::{matching_event, matching_venue};
use ccal_adapters::{ParseContext, ParserConfig, ParserError, ParserRegistry};
use ccal_core::{Candidate, Duplicatable, Event, FieldValue, ParsedEvent, RecordId, Source};
use ccal_storage::{Fetch, FetchError, MemoryStore, StoreError, Url};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::SourceRegistry;

const URL_SCHEMES: &[&str] = &["http", "https", "webcal"];

/// User-facing reasons an import produced nothing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ImportFailure {
    #[error("No events found at remote site. Is the event identifier in the URL correct?")]
    NotFound,
    #[error("Couldn't import events, remote site requires authentication.")]
    AuthenticationRequired,
    #[error("Couldn't find IP address for remote site. Is the URL correct?")]
    Dns,
    #[error("Couldn't connect to remote site.")]
    Connect,
    #[error("Timed out while downloading events. The remote site may be slow, try again later.")]
    Timeout,
    #[error("Couldn't download events, remote site may be experiencing connectivity problems.")]
    Download,
    #[error("{}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("Unable to find any upcoming events to import from this source")]
    NoEvents,
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl From<ParserError> for ImportFailure {
    fn from(err: ParserError) -> Self {
        match err {
            ParserError::NotFound { .. } => ImportFailure::NotFound,
            ParserError::AuthenticationRequired { .. } => ImportFailure::AuthenticationRequired,
            ParserError::Transport(fetch) => match fetch {
                FetchError::NotFound { .. } => ImportFailure::NotFound,
                FetchError::AuthenticationRequired { .. } => ImportFailure::AuthenticationRequired,
                FetchError::Dns { .. } => ImportFailure::Dns,
                FetchError::Connect { .. } => ImportFailure::Connect,
                FetchError::Timeout { .. } => ImportFailure::Timeout,
                FetchError::HttpStatus { .. } | FetchError::Request { .. } => ImportFailure::Download,
            },
            other => ImportFailure::Unknown(other.to_string()),
        }
    }
}

impl From<StoreError> for ImportFailure {
    fn from(err: StoreError) -> Self {
        ImportFailure::Unknown(err.to_string())
    }
}

#[derive(Debug, Clone, Default)]
pub struct SourceAttributes {
    pub url: String,
    pub title: Option<String>,
}

impl SourceAttributes {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: None,
        }
    }

    pub fn titled(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct ImportResult {
    pub import_id: Uuid,
    pub url: String,
    pub source_id: Option<RecordId>,
    /// Upcoming events the source now covers, in feed order.
    pub events: Vec<RecordId>,
    pub created_events: usize,
    pub created_venues: usize,
    pub failure: Option<ImportFailure>,
}

impl ImportResult {
    fn failed(import_id: Uuid, url: &str, source_id: Option<RecordId>, failure: ImportFailure) -> Self {
        Self {
            import_id,
            url: url.to_string(),
            source_id,
            events: Vec::new(),
            created_events: 0,
            created_venues: 0,
            failure: Some(failure),
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    pub fn message(&self) -> String {
        match &self.failure {
            Some(failure) => failure.to_string(),
            None => format!(
                "Imported {} entries ({} new events, {} new venues).",
                self.events.len(),
                self.created_events,
                self.created_venues
            ),
        }
    }
}

/// Field-level problems with a source URL; empty when it is importable.
pub fn validate_url(url: &str) -> Vec<String> {
    let mut errors = Source::for_url(url.trim()).validate();
    if errors.is_empty() {
        let valid = Url::parse(url.trim())
            .is_ok_and(|parsed| URL_SCHEMES.contains(&parsed.scheme()) && parsed.has_host());
        if !valid {
            errors.push("url is not a valid http(s) or webcal URL".to_string());
        }
    }
    errors
}

pub struct Importer<'a> {
    registry: &'a ParserRegistry,
    http: &'a dyn Fetch,
    config: &'a ParserConfig,
}

#[derive(Default)]
struct Persisted {
    events: Vec<RecordId>,
    created_events: usize,
    created_venues: usize,
}

impl<'a> Importer<'a> {
    pub fn new(registry: &'a ParserRegistry, http: &'a dyn Fetch, config: &'a ParserConfig) -> Self {
        Self {
            registry,
            http,
            config,
        }
    }

    pub async fn import(&self, store: &mut MemoryStore, attrs: SourceAttributes) -> ImportResult {
        self.import_at(store, attrs, Utc::now()).await
    }

    /// Imports one source as of `now`. Failures are classified onto the result,
    /// never returned as errors.
    pub async fn import_at(
        &self,
        store: &mut MemoryStore,
        attrs: SourceAttributes,
        now: DateTime<Utc>,
    ) -> ImportResult {
        let import_id = Uuid::new_v4();
        let url = attrs.url.trim().to_string();
        let span = info_span!("import", %import_id, url = %url);
        async move {
            let errors = validate_url(&url);
            if !errors.is_empty() {
                let failure = ImportFailure::Validation(errors);
                warn!(message = %failure, "source rejected");
                return ImportResult::failed(import_id, &url, None, failure);
            }

            let mut source = match find_or_build_source(store, &url, attrs.title.as_deref()) {
                Ok(source) => source,
                Err(err) => {
                    let failure = ImportFailure::from(err);
                    warn!(message = %failure, "source lookup failed");
                    return ImportResult::failed(import_id, &url, None, failure);
                }
            };
            let parsed = {
                let ctx = ParseContext {
                    url: &url,
                    http: self.http,
                    store: &*store,
                    config: self.config,
                    now,
                    source_id: source.id,
                };
                self.registry.parse_events(&ctx).await
            };
            let candidates = match parsed {
                Ok(candidates) => candidates,
                Err(err) => {
                    let failure = ImportFailure::from(err);
                    warn!(message = %failure, "import failed");
                    return ImportResult::failed(import_id, &url, source.id, failure);
                }
            };

            source.imported_at = Some(now);
            let outcome = store.transaction(|tx| {
                let source_id = tx.save(source)?;
                persist_candidates(tx, candidates, source_id, now).map(|p| (source_id, p))
            });
            let (source_id, persisted) = match outcome {
                Ok(done) => done,
                Err(err) => {
                    let failure = ImportFailure::from(err);
                    warn!(message = %failure, "import failed while saving");
                    return ImportResult::failed(import_id, &url, None, failure);
                }
            };

            let mut result = ImportResult {
                import_id,
                url: url.clone(),
                source_id: Some(source_id),
                events: persisted.events,
                created_events: persisted.created_events,
                created_venues: persisted.created_venues,
                failure: None,
            };
            if result.events.is_empty() {
                result.failure = Some(ImportFailure::NoEvents);
                warn!(%source_id, "no upcoming events");
            } else {
                info!(
                    %source_id,
                    events = result.events.len(),
                    created_events = result.created_events,
                    created_venues = result.created_venues,
                    "import finished"
                );
            }
            result
        }
        .instrument(span)
        .await
    }

    /// Imports every enabled registry entry, continuing past failures.
    pub async fn import_all(
        &self,
        store: &mut MemoryStore,
        registry: &SourceRegistry,
    ) -> Vec<ImportResult> {
        let mut results = Vec::new();
        for entry in registry.enabled() {
            let attrs = SourceAttributes {
                url: entry.url.clone(),
                title: entry.title.clone(),
            };
            results.push(self.import(store, attrs).await);
        }
        results
    }
}

/// A live source with this URL, else the primary of a squashed one, else a new source.
fn find_or_build_source(
    store: &MemoryStore,
    url: &str,
    title: Option<&str>,
) -> Result<Source, StoreError> {
    let by_url = [("url", FieldValue::Text(url.to_string()))];
    let existing = match store.where_eq::<Source>(&by_url).first() {
        Some(live) => Some((*live).clone()),
        None => match store
            .all::<Source>()
            .find(|s| s.url == url)
            .and_then(|s| s.id)
        {
            Some(id) => Some(store.originator::<Source>(id)?.clone()),
            None => None,
        },
    };
    let mut source = existing.unwrap_or_else(|| Source::for_url(url));
    if let Some(title) = title.map(str::trim).filter(|t| !t.is_empty()) {
        source.title = title.to_string();
    }
    Ok(source)
}

fn persist_candidates(
    tx: &mut MemoryStore,
    candidates: Vec<Candidate<ParsedEvent>>,
    source_id: RecordId,
    now: DateTime<Utc>,
) -> Result<Persisted, StoreError> {
    let mut persisted = Persisted::default();
    for candidate in candidates {
        let id = match candidate {
            Candidate::Existing(id) => {
                if tx.fetch::<Event>(id)?.is_old(now) {
                    continue;
                }
                id
            }
            Candidate::Fresh(ParsedEvent { mut event, venue }) => {
                if event.is_old(now) {
                    continue;
                }
                let problems = event.validate();
                if !problems.is_empty() {
                    debug!(title = %event.title, ?problems, "skipping invalid event");
                    continue;
                }
                event.source_id = Some(source_id);
                match venue {
                    Some(Candidate::Existing(venue_id)) => event.venue_id = Some(venue_id),
                    Some(Candidate::Fresh(mut venue)) if venue.validate().is_empty() => {
                        // An earlier record in this feed may have stored the same venue.
                        let venue_id = match matching_venue(tx, &venue)? {
                            Some(found) => found,
                            None => {
                                venue.source_id = Some(source_id);
                                persisted.created_venues += 1;
                                tx.insert(venue)?
                            }
                        };
                        event.venue_id = Some(venue_id);
                    }
                    Some(Candidate::Fresh(_)) | None => {}
                }
                match matching_event(tx, &event)? {
                    Some(found) => found,
                    None => {
                        persisted.created_events += 1;
                        tx.insert(event)?
                    }
                }
            }
        };
        if !persisted.events.contains(&id) {
            persisted.events.push(id);
        }
    }
    Ok(persisted)
}
