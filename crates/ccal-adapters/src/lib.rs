//! Source parser contracts, the URL-ranked dispatcher, and the format parsers.

pub mod facebook;
pub mod fixtures;
pub mod hcalendar;
pub mod icalendar;
pub mod meetup;
pub mod resolve;
pub mod times;

use std::time::Duration;

use async_trait::async_trait;
use ccal_core::{Candidate, ParsedEvent, RecordId};
use ccal_storage::{Fetch, FetchError, MemoryStore, StoreError};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use regex::Regex;
use thiserror::Error;
use tracing::debug;

pub use facebook::FacebookParser;
pub use fixtures::FixtureFetcher;
pub use hcalendar::HcalendarParser;
pub use icalendar::IcalendarParser;
pub use meetup::MeetupParser;

pub const CRATE_NAME: &str = "ccal-adapters";

#[derive(Debug, Error)]
pub enum ParserError {
    #[error("no events found at {url}")]
    NotFound { url: String },
    #[error("{url} requires authentication")]
    AuthenticationRequired { url: String },
    #[error(transparent)]
    Transport(FetchError),
    #[error("malformed {format} payload from {url}: {message}")]
    Malformed {
        format: &'static str,
        url: String,
        message: String,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<FetchError> for ParserError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::NotFound { url } => ParserError::NotFound { url },
            FetchError::AuthenticationRequired { url, .. } => {
                ParserError::AuthenticationRequired { url }
            }
            other => ParserError::Transport(other),
        }
    }
}

impl ParserError {
    pub fn malformed(format: &'static str, url: &str, message: impl std::fmt::Display) -> Self {
        ParserError::Malformed {
            format,
            url: url.to_string(),
            message: message.to_string(),
        }
    }

    /// Terminal errors stop the fallback chain: the handler confirmed the outcome.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ParserError::NotFound { .. } | ParserError::AuthenticationRequired { .. }
        )
    }

    fn specificity(&self) -> u8 {
        match self {
            ParserError::NotFound { .. } | ParserError::AuthenticationRequired { .. } => 4,
            ParserError::Transport(_) => 3,
            ParserError::Malformed { .. } => 2,
            ParserError::Store(_) | ParserError::Other(_) => 1,
        }
    }
}

/// Credentials and locale handed to every parser; built once at startup.
#[derive(Debug, Clone)]
pub struct ParserConfig {
    pub meetup_api_key: Option<String>,
    pub facebook_access_token: Option<String>,
    pub timezone: Tz,
    pub api_timeout: Duration,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            meetup_api_key: None,
            facebook_access_token: None,
            timezone: chrono_tz::America::Los_Angeles,
            api_timeout: Duration::from_secs(5),
        }
    }
}

pub struct ParseContext<'a> {
    pub url: &'a str,
    pub http: &'a dyn Fetch,
    pub store: &'a MemoryStore,
    pub config: &'a ParserConfig,
    pub now: DateTime<Utc>,
    pub source_id: Option<RecordId>,
}

#[async_trait]
pub trait SourceParser: Send + Sync {
    fn label(&self) -> &'static str;

    /// Lower sorts first among parsers with the same pattern outcome.
    fn priority(&self) -> u8;

    fn url_pattern(&self) -> Option<&Regex> {
        None
    }

    /// Raw, unresolved records in feed order.
    async fn parse(&self, ctx: &ParseContext<'_>) -> Result<Vec<ParsedEvent>, ParserError>;

    /// Parsed records after duplicate-or-original resolution and in-feed dedup.
    async fn to_events(
        &self,
        ctx: &ParseContext<'_>,
    ) -> Result<Vec<Candidate<ParsedEvent>>, ParserError> {
        let parsed = self.parse(ctx).await?;
        resolve::resolve_all(ctx.store, parsed)
    }
}

pub struct ParserRegistry {
    parsers: Vec<Box<dyn SourceParser>>,
}

impl Default for ParserRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(FacebookParser::new()));
        registry.register(Box::new(MeetupParser::new()));
        registry.register(Box::new(IcalendarParser::new()));
        registry.register(Box::new(HcalendarParser::new()));
        registry
    }
}

impl ParserRegistry {
    pub fn empty() -> Self {
        Self {
            parsers: Vec::new(),
        }
    }

    pub fn register(&mut self, parser: Box<dyn SourceParser>) {
        self.parsers.push(parser);
    }

    /// Pattern matches first, then priority, then label.
    pub fn ranked(&self, url: &str) -> Vec<&dyn SourceParser> {
        let mut ranked: Vec<&dyn SourceParser> = self.parsers.iter().map(|p| p.as_ref()).collect();
        ranked.sort_by_key(|parser| {
            let matched = parser.url_pattern().is_some_and(|re| re.is_match(url));
            (!matched, parser.priority(), parser.label())
        });
        ranked
    }

    pub async fn parse_events(
        &self,
        ctx: &ParseContext<'_>,
    ) -> Result<Vec<Candidate<ParsedEvent>>, ParserError> {
        let mut remembered: Option<ParserError> = None;
        for parser in self.ranked(ctx.url) {
            match parser.to_events(ctx).await {
                Ok(events) if !events.is_empty() => {
                    debug!(parser = parser.label(), count = events.len(), "parser produced events");
                    return Ok(events);
                }
                Ok(_) => debug!(parser = parser.label(), "parser found nothing, trying next"),
                Err(err) if err.is_terminal() => {
                    debug!(parser = parser.label(), error = %err, "terminal parser error");
                    return Err(err);
                }
                Err(err) => {
                    debug!(parser = parser.label(), error = %err, "parser failed, trying next");
                    let replace = remembered
                        .as_ref()
                        .map_or(true, |prev| err.specificity() > prev.specificity());
                    if replace {
                        remembered = Some(err);
                    }
                }
            }
        }
        match remembered {
            Some(err) => Err(err),
            None => Ok(Vec::new()),
        }
    }
}

pub(crate) fn text_or_none(value: &str) -> Option<String> {
    let cleaned = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccal_core::Event;
    use once_cell::sync::Lazy;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    enum Outcome {
        Events(usize),
        NotFound,
        Transport,
        Malformed,
    }

    struct StubParser {
        label: &'static str,
        priority: u8,
        pattern: Option<Regex>,
        outcome: Outcome,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SourceParser for StubParser {
        fn label(&self) -> &'static str {
            self.label
        }

        fn priority(&self) -> u8 {
            self.priority
        }

        fn url_pattern(&self) -> Option<&Regex> {
            self.pattern.as_ref()
        }

        async fn parse(&self, ctx: &ParseContext<'_>) -> Result<Vec<ParsedEvent>, ParserError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.outcome {
                Outcome::Events(n) => Ok((0..n)
                    .map(|i| {
                        let mut event = Event::titled(format!("{} {i}", self.label));
                        event.start_time = Some(ctx.now);
                        ParsedEvent::new(event)
                    })
                    .collect()),
                Outcome::NotFound => Err(ParserError::NotFound {
                    url: ctx.url.to_string(),
                }),
                Outcome::Transport => Err(ParserError::Transport(FetchError::Timeout {
                    url: ctx.url.to_string(),
                })),
                Outcome::Malformed => Err(ParserError::malformed("stub", ctx.url, "bad")),
            }
        }
    }

    static SITE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^https?://site\.example/").unwrap());

    fn stub(
        label: &'static str,
        priority: u8,
        site_specific: bool,
        outcome: Outcome,
    ) -> (Box<dyn SourceParser>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let parser = StubParser {
            label,
            priority,
            pattern: site_specific.then(|| SITE.clone()),
            outcome,
            calls: Arc::clone(&calls),
        };
        (Box::new(parser), calls)
    }

    async fn run(registry: &ParserRegistry, url: &str) -> Result<Vec<Candidate<ParsedEvent>>, ParserError> {
        let http = FixtureFetcher::default();
        let store = MemoryStore::new();
        let config = ParserConfig::default();
        let ctx = ParseContext {
            url,
            http: &http,
            store: &store,
            config: &config,
            now: Utc::now(),
            source_id: None,
        };
        registry.parse_events(&ctx).await
    }

    #[test]
    fn matching_pattern_outranks_priority() {
        let mut registry = ParserRegistry::empty();
        let (generic, _) = stub("generic", 0, false, Outcome::Events(1));
        let (site, _) = stub("site", 9, true, Outcome::Events(1));
        registry.register(generic);
        registry.register(site);

        let labels: Vec<_> = registry
            .ranked("https://site.example/e/1")
            .iter()
            .map(|p| p.label())
            .collect();
        assert_eq!(labels, vec!["site", "generic"]);

        let labels: Vec<_> = registry
            .ranked("https://other.example/")
            .iter()
            .map(|p| p.label())
            .collect();
        assert_eq!(labels, vec!["generic", "site"]);
    }

    #[test]
    fn default_registry_puts_site_parsers_before_formats() {
        let registry = ParserRegistry::default();
        let labels: Vec<_> = registry
            .ranked("http://example.org/calendar.ics")
            .iter()
            .map(|p| p.label())
            .collect();
        assert_eq!(labels, vec!["Facebook", "Meetup", "iCalendar", "hCalendar"]);

        let labels: Vec<_> = registry
            .ranked("https://www.meetup.com/pdx-rust/events/12345/")
            .iter()
            .map(|p| p.label())
            .collect();
        assert_eq!(labels[0], "Meetup");
    }

    #[tokio::test]
    async fn not_found_aborts_the_fallback_chain() {
        let mut registry = ParserRegistry::empty();
        let (site, _) = stub("site", 0, true, Outcome::NotFound);
        let (generic, generic_calls) = stub("generic", 1, false, Outcome::Events(2));
        registry.register(site);
        registry.register(generic);

        let result = run(&registry, "https://site.example/e/1").await;
        assert!(matches!(result, Err(ParserError::NotFound { .. })));
        assert_eq!(generic_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_result_falls_through_to_next_parser() {
        let mut registry = ParserRegistry::empty();
        let (site, _) = stub("site", 0, true, Outcome::Events(0));
        let (generic, generic_calls) = stub("generic", 1, false, Outcome::Events(2));
        registry.register(site);
        registry.register(generic);

        let events = run(&registry, "https://site.example/e/1").await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(generic_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_reports_most_specific_error() {
        let mut registry = ParserRegistry::empty();
        let (a, _) = stub("a", 0, false, Outcome::Malformed);
        let (b, _) = stub("b", 1, false, Outcome::Transport);
        let (c, _) = stub("c", 2, false, Outcome::Events(0));
        registry.register(a);
        registry.register(b);
        registry.register(c);

        let result = run(&registry, "https://other.example/").await;
        assert!(matches!(result, Err(ParserError::Transport(_))));

        let mut quiet = ParserRegistry::empty();
        let (only, _) = stub("only", 0, false, Outcome::Events(0));
        quiet.register(only);
        assert!(run(&quiet, "https://other.example/").await.unwrap().is_empty());
    }

    #[test]
    fn fetch_errors_map_onto_parser_taxonomy() {
        let not_found: ParserError = FetchError::NotFound { url: "u".into() }.into();
        assert!(not_found.is_terminal());
        let auth: ParserError = FetchError::AuthenticationRequired {
            status: 401,
            url: "u".into(),
        }
        .into();
        assert!(matches!(auth, ParserError::AuthenticationRequired { .. }));
        let timeout: ParserError = FetchError::Timeout { url: "u".into() }.into();
        assert!(!timeout.is_terminal());
    }
}
