//! Environment configuration and the `sources.yaml` registry.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use ccal_adapters::ParserConfig;
use ccal_storage::HttpClientConfig;
use chrono_tz::Tz;
use serde::Deserialize;
use tokio::fs;

use crate::finder::FinderStrategy;

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    #[serde(default)]
    pub sources: Vec<SourceEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceEntry {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl SourceRegistry {
    pub fn parse(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing sources.yaml")
    }

    pub async fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join("sources.yaml");
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceEntry> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[derive(Debug, Clone)]
pub struct ImportConfig {
    pub db_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub api_timeout_secs: u64,
    pub timezone: Tz,
    pub meetup_api_key: Option<String>,
    pub facebook_access_token: Option<String>,
    pub duplicate_strategy: FinderStrategy,
    pub workspace_root: PathBuf,
}

impl ImportConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; unset keys fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let timezone = match non_empty("CCAL_TIMEZONE") {
            Some(name) => name
                .trim()
                .parse::<Tz>()
                .map_err(|err| anyhow::anyhow!("CCAL_TIMEZONE={name}: {err}"))?,
            None => chrono_tz::America::Los_Angeles,
        };
        let duplicate_strategy = match non_empty("CCAL_DUPLICATE_STRATEGY") {
            Some(name) => name
                .parse()
                .map_err(|err| anyhow::anyhow!("CCAL_DUPLICATE_STRATEGY: {err}"))?,
            None => FinderStrategy::default(),
        };
        Ok(Self {
            db_path: non_empty("CCAL_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./calendar.json")),
            user_agent: non_empty("CCAL_USER_AGENT")
                .unwrap_or_else(|| "ccal-importer/0.1".to_string()),
            http_timeout_secs: non_empty("CCAL_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(20),
            api_timeout_secs: non_empty("CCAL_API_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(5),
            timezone,
            meetup_api_key: non_empty("MEETUP_API_KEY"),
            facebook_access_token: non_empty("FACEBOOK_ACCESS_TOKEN"),
            duplicate_strategy,
            workspace_root: non_empty("CCAL_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
        })
    }

    pub fn parser_config(&self) -> ParserConfig {
        ParserConfig {
            meetup_api_key: self.meetup_api_key.clone(),
            facebook_access_token: self.facebook_access_token.clone(),
            timezone: self.timezone,
            api_timeout: Duration::from_secs(self.api_timeout_secs),
        }
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }
}
