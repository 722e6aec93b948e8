use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use chrono::Datelike;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::domain::{InstitutionId, QueryScope, YearRange};
use crate::error::BiblioError;
use crate::openalex::RetryPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "biblio-etl.json";
pub const DEFAULT_INSTITUTION: &str = "I185261750";
pub const DEFAULT_BASE_URL: &str = "https://api.openalex.org";
pub const DEFAULT_START_YEAR: i32 = 2020;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub scope: ScopeEntry,
    #[serde(default)]
    pub api: ApiEntry,
    #[serde(default)]
    pub retry: RetryEntry,
    #[serde(default)]
    pub store: StoreEntry,
    #[serde(default)]
    pub refresh: RefreshEntry,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ScopeEntry {
    #[serde(default)]
    pub institution: Option<String>,
    /// Either `"2020-2026"` or `"2024"`.
    #[serde(default)]
    pub years: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ApiEntry {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub mailto: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub per_page: Option<u32>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RetryEntry {
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub base_delay_ms: Option<u64>,
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct StoreEntry {
    #[serde(default)]
    pub data_dir: Option<String>,
    #[serde(default)]
    pub keep_snapshots: Option<usize>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RefreshEntry {
    #[serde(default)]
    pub full_refresh_after_days: Option<i64>,
    #[serde(default)]
    pub hydrate_geo: Option<bool>,
    #[serde(default)]
    pub top_concepts: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub base_url: String,
    pub mailto: Option<String>,
    pub api_key: Option<String>,
    pub per_page: u32,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub data_dir: Utf8PathBuf,
    pub keep_snapshots: usize,
}

#[derive(Debug, Clone)]
pub struct RefreshSettings {
    pub full_refresh_after_days: i64,
    pub hydrate_geo: bool,
    pub top_concepts: usize,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub scope: QueryScope,
    pub api: ApiSettings,
    pub retry: RetryPolicy,
    pub store: StoreSettings,
    pub refresh: RefreshSettings,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Reads `path`, or `biblio-etl.json` when present, or falls back to the
    /// built-in defaults. Environment overrides apply last.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, BiblioError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        let config = if path.is_none() && !config_path.exists() {
            Config::default()
        } else {
            let content = fs::read_to_string(&config_path)
                .map_err(|_| BiblioError::ConfigRead(config_path.clone()))?;
            serde_json::from_str(&content)
                .map_err(|err| BiblioError::ConfigParse(err.to_string()))?
        };

        let config = apply_env(config, |key| std::env::var(key).ok());
        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, BiblioError> {
        let schema_version = config.schema_version.unwrap_or(1);

        let institution: InstitutionId = config
            .scope
            .institution
            .as_deref()
            .unwrap_or(DEFAULT_INSTITUTION)
            .parse()?;
        let years = match config.scope.years.as_deref() {
            Some(years) => years.parse()?,
            None => YearRange::new(DEFAULT_START_YEAR, current_year().max(DEFAULT_START_YEAR))?,
        };

        let api = ApiSettings {
            base_url: config
                .api
                .base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            mailto: config.api.mailto.filter(|value| !value.trim().is_empty()),
            api_key: config.api.api_key.filter(|value| !value.trim().is_empty()),
            per_page: config.api.per_page.unwrap_or(200).clamp(1, 200),
            timeout_secs: config.api.timeout_secs.unwrap_or(30),
        };

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: config.retry.max_attempts.unwrap_or(defaults.max_attempts).max(1),
            base_delay: config
                .retry
                .base_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.base_delay),
            max_delay: config
                .retry
                .max_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay),
        };

        let data_dir = match config.store.data_dir {
            Some(dir) => Utf8PathBuf::from(dir),
            None => default_data_dir()?,
        };
        let store = StoreSettings {
            data_dir,
            keep_snapshots: config.store.keep_snapshots.unwrap_or(5).max(1),
        };

        let refresh = RefreshSettings {
            full_refresh_after_days: config.refresh.full_refresh_after_days.unwrap_or(7),
            hydrate_geo: config.refresh.hydrate_geo.unwrap_or(true),
            top_concepts: config.refresh.top_concepts.unwrap_or(5),
        };

        Ok(ResolvedConfig {
            schema_version,
            scope: QueryScope::new(institution, years),
            api,
            retry,
            store,
            refresh,
        })
    }
}

/// Applies `OPENALEX_EMAIL`, `OPENALEX_API_KEY` and `BIBLIO_ETL_DATA_DIR`.
pub fn apply_env<F>(mut config: Config, lookup: F) -> Config
where
    F: Fn(&str) -> Option<String>,
{
    let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
    if let Some(email) = non_empty("OPENALEX_EMAIL") {
        config.api.mailto = Some(email.trim().to_string());
    }
    if let Some(key) = non_empty("OPENALEX_API_KEY") {
        config.api.api_key = Some(key.trim().to_string());
    }
    if let Some(dir) = non_empty("BIBLIO_ETL_DATA_DIR") {
        config.store.data_dir = Some(dir.trim().to_string());
    }
    config
}

pub fn default_data_dir() -> Result<Utf8PathBuf, BiblioError> {
    ProjectDirs::from("org", "biblio-etl", "biblio-etl")
        .and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.data_dir().to_path_buf()).ok())
        .ok_or_else(|| BiblioError::Filesystem("unable to resolve data directory".to_string()))
}

fn current_year() -> i32 {
    chrono::Utc::now().year()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_home_institution() {
        let config = Config {
            store: StoreEntry {
                data_dir: Some("/tmp/biblio".to_string()),
                keep_snapshots: None,
            },
            ..Config::default()
        };

        let resolved = ConfigLoader::resolve_config(config).unwrap();
        assert_eq!(resolved.schema_version, 1);
        assert_eq!(resolved.scope.institution.as_str(), DEFAULT_INSTITUTION);
        assert_eq!(resolved.scope.years.from, DEFAULT_START_YEAR);
        assert_eq!(resolved.api.per_page, 200);
        assert_eq!(resolved.store.keep_snapshots, 5);
        assert_eq!(resolved.retry, RetryPolicy::default());
    }
}
