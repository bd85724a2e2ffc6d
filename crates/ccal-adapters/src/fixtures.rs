//! Offline `Fetch` implementation backed by local fixture files.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use ccal_storage::{Fetch, FetchError, FetchOptions, FetchedResponse, StatusCode};

/// What a fixture URL answers with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixtureRoute {
    File(PathBuf),
    Body(String),
    Status(u16),
    /// A status answered with the body of a fixture file.
    StatusFile(u16, PathBuf),
    Timeout,
    Dns,
    Connect,
}

impl FixtureRoute {
    /// Route index values: a relative file path, `status:<code>`, `status:<code>:<path>`,
    /// `timeout`, `dns`, or `connect`.
    fn from_index_value(dir: &Path, value: &str) -> Self {
        match value.trim() {
            "timeout" => FixtureRoute::Timeout,
            "dns" => FixtureRoute::Dns,
            "connect" => FixtureRoute::Connect,
            other => {
                let Some(status) = other.strip_prefix("status:") else {
                    return FixtureRoute::File(dir.join(other));
                };
                let (code, path) = match status.split_once(':') {
                    Some((code, path)) => (code, Some(path)),
                    None => (status, None),
                };
                match (code.parse(), path) {
                    (Ok(code), Some(path)) => FixtureRoute::StatusFile(code, dir.join(path)),
                    (Ok(code), None) => FixtureRoute::Status(code),
                    (Err(_), _) => FixtureRoute::File(dir.join(other)),
                }
            }
        }
    }
}

/// Maps URLs to fixture responses. Lookups try the exact URL, then the URL without
/// its query string, so API routes need not carry credentials.
#[derive(Debug, Clone, Default)]
pub struct FixtureFetcher {
    routes: BTreeMap<String, FixtureRoute>,
}

impl FixtureFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads `routes.json` (`{"<url>": "<relative path or failure>"}`) from `dir`.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let index_path = dir.join("routes.json");
        let data = fs::read_to_string(&index_path)
            .with_context(|| format!("reading {}", index_path.display()))?;
        let index: BTreeMap<String, String> = serde_json::from_str(&data)
            .with_context(|| format!("parsing {}", index_path.display()))?;
        Ok(Self {
            routes: index
                .into_iter()
                .map(|(url, value)| {
                    let route = FixtureRoute::from_index_value(dir, &value);
                    (url, route)
                })
                .collect(),
        })
    }

    pub fn route(mut self, url: impl Into<String>, route: FixtureRoute) -> Self {
        self.routes.insert(url.into(), route);
        self
    }

    pub fn file(self, url: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.route(url, FixtureRoute::File(path.into()))
    }

    pub fn body(self, url: impl Into<String>, body: impl Into<String>) -> Self {
        self.route(url, FixtureRoute::Body(body.into()))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    fn lookup(&self, url: &str) -> Option<&FixtureRoute> {
        self.routes.get(url).or_else(|| {
            let bare = url.split_once('?').map(|(bare, _)| bare)?;
            self.routes.get(bare)
        })
    }
}

#[async_trait]
impl Fetch for FixtureFetcher {
    async fn get(&self, url: &str, _options: &FetchOptions) -> Result<FetchedResponse, FetchError> {
        let Some(route) = self.lookup(url) else {
            return Err(FetchError::NotFound {
                url: url.to_string(),
            });
        };
        let body = match route {
            FixtureRoute::File(path) => fs::read(path).map_err(|err| FetchError::Request {
                url: url.to_string(),
                message: format!("reading fixture {}: {err}", path.display()),
            })?,
            FixtureRoute::Body(text) => text.clone().into_bytes(),
            FixtureRoute::Status(code) => {
                let status = StatusCode::from_u16(*code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                return Err(FetchError::from_status(status, url));
            }
            FixtureRoute::StatusFile(code, path) => {
                let status = StatusCode::from_u16(*code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                let text = fs::read_to_string(path).map_err(|err| FetchError::Request {
                    url: url.to_string(),
                    message: format!("reading fixture {}: {err}", path.display()),
                })?;
                return Err(FetchError::from_status(status, url).with_body(text));
            }
            FixtureRoute::Timeout => {
                return Err(FetchError::Timeout {
                    url: url.to_string(),
                })
            }
            FixtureRoute::Dns => {
                return Err(FetchError::Dns {
                    url: url.to_string(),
                    message: "dns error: failed to lookup address information".to_string(),
                })
            }
            FixtureRoute::Connect => {
                return Err(FetchError::Connect {
                    url: url.to_string(),
                    message: "connection refused".to_string(),
                })
            }
        };
        Ok(FetchedResponse {
            status: StatusCode::OK,
            final_url: url.to_string(),
            body,
        })
    }
}
