//! Configuration management

use std::path::PathBuf;
use std::time::Duration;

use crate::collaborators::search::QUERY_COUNT;
use crate::db::DbConfig;
use crate::pipeline::executor::{DEFAULT_MAX_RESULTS, DEFAULT_SOURCE_CONCURRENCY};
use crate::pipeline::variables::{default_geo_directory, load_geo_directory, DEFAULT_REGION_CODE};
use crate::pipeline::worker::{
    DEFAULT_POLL_INTERVAL_MS, DEFAULT_STALE_AFTER_SECS, DEFAULT_WORKER_CONCURRENCY,
};
use crate::pipeline::{
    ExecutionModeKind, ExecutorSettings, IdentifierScheme, PipelineSettings, VariableDefaults,
    WorkerSettings,
};

// ============================================================================
// Database Configuration Constants
// ============================================================================

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/autoparser";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 2;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default database idle timeout in seconds (10 minutes).
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 600;

// ============================================================================
// Collaborator Configuration Constants
// ============================================================================

/// Default search endpoint (a local metasearch proxy).
pub const DEFAULT_SEARCH_ENDPOINT: &str = "http://localhost:8080/search";

/// Default extraction endpoint.
pub const DEFAULT_EXTRACTOR_ENDPOINT: &str = "http://localhost:8090/extract";

/// Default search timeout in seconds.
pub const DEFAULT_SEARCH_TIMEOUT_SECS: u64 = 20;

/// Default page fetch timeout in seconds.
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;

/// Default extraction timeout in seconds; model calls are slow.
pub const DEFAULT_EXTRACTION_TIMEOUT_SECS: u64 = 120;

/// Default user agent sent to search and fetched sites.
pub const DEFAULT_USER_AGENT: &str = concat!("autoparser/", env!("CARGO_PKG_VERSION"));

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DbConfig,
    pub pipeline: PipelineConfig,
    pub worker: WorkerConfig,
    pub collaborators: CollaboratorConfig,
}

/// Pipeline behaviour
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub execution_mode: ExecutionModeKind,
    /// Region code used for `msr_geocde` when a run does not resolve one
    pub region_code: String,
    /// JSON `{"<code>": "<name>"}` file; the built-in directory is used when unset
    pub geo_directory_path: Option<PathBuf>,
    pub max_results: usize,
    pub source_concurrency: usize,
}

/// Queue worker settings
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub poll_interval_ms: u64,
    pub concurrency: usize,
    pub stale_after_secs: u64,
}

/// External service endpoints and limits
#[derive(Debug, Clone)]
pub struct CollaboratorConfig {
    pub search_endpoint: String,
    pub extractor_endpoint: String,
    pub extractor_api_key: Option<String>,
    pub search_timeout_secs: u64,
    pub fetch_timeout_secs: u64,
    pub extraction_timeout_secs: u64,
    pub user_agent: String,
}

fn parse_or<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key).and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key).map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self::from_lookup(|key| std::env::var(key).ok())?;
        config.validate()?;

        Ok(config)
    }

    /// Build configuration from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let execution_mode = ExecutionModeKind::resolve(
            lookup("EXECUTION_MODE").as_deref(),
            lookup("LOCAL_SINGLEEXE").as_deref(),
        )
        .map_err(|e| anyhow::anyhow!("EXECUTION_MODE: {}", e))?;

        Ok(Config {
            database: DbConfig {
                url: lookup("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
                max_connections: parse_or(
                    &lookup,
                    "DATABASE_MAX_CONNECTIONS",
                    DEFAULT_DATABASE_MAX_CONNECTIONS,
                ),
                min_connections: parse_or(
                    &lookup,
                    "DATABASE_MIN_CONNECTIONS",
                    DEFAULT_DATABASE_MIN_CONNECTIONS,
                ),
                connect_timeout_secs: parse_or(
                    &lookup,
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                ),
                idle_timeout_secs: Some(parse_or(
                    &lookup,
                    "DATABASE_IDLE_TIMEOUT",
                    DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
                )),
                max_lifetime_secs: lookup("DATABASE_MAX_LIFETIME").and_then(|s| s.parse().ok()),
            },
            pipeline: PipelineConfig {
                execution_mode,
                region_code: non_empty(&lookup, "REGION_DEFAULT_CODE")
                    .unwrap_or_else(|| DEFAULT_REGION_CODE.to_string()),
                geo_directory_path: non_empty(&lookup, "GEO_DIRECTORY_PATH").map(PathBuf::from),
                max_results: parse_or(&lookup, "PIPELINE_MAX_RESULTS", DEFAULT_MAX_RESULTS),
                source_concurrency: parse_or(
                    &lookup,
                    "PIPELINE_SOURCE_CONCURRENCY",
                    DEFAULT_SOURCE_CONCURRENCY,
                ),
            },
            worker: WorkerConfig {
                poll_interval_ms: parse_or(&lookup, "WORKER_POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS),
                concurrency: parse_or(&lookup, "WORKER_CONCURRENCY", DEFAULT_WORKER_CONCURRENCY),
                stale_after_secs: parse_or(&lookup, "WORKER_STALE_AFTER_SECS", DEFAULT_STALE_AFTER_SECS),
            },
            collaborators: CollaboratorConfig {
                search_endpoint: non_empty(&lookup, "SEARCH_ENDPOINT")
                    .unwrap_or_else(|| DEFAULT_SEARCH_ENDPOINT.to_string()),
                extractor_endpoint: non_empty(&lookup, "EXTRACTOR_ENDPOINT")
                    .unwrap_or_else(|| DEFAULT_EXTRACTOR_ENDPOINT.to_string()),
                extractor_api_key: non_empty(&lookup, "EXTRACTOR_API_KEY"),
                search_timeout_secs: parse_or(&lookup, "SEARCH_TIMEOUT", DEFAULT_SEARCH_TIMEOUT_SECS),
                fetch_timeout_secs: parse_or(&lookup, "FETCH_TIMEOUT", DEFAULT_FETCH_TIMEOUT_SECS),
                extraction_timeout_secs: parse_or(
                    &lookup,
                    "EXTRACTION_TIMEOUT",
                    DEFAULT_EXTRACTION_TIMEOUT_SECS,
                ),
                user_agent: non_empty(&lookup, "USER_AGENT")
                    .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            },
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        if self.pipeline.max_results == 0 {
            anyhow::bail!("PIPELINE_MAX_RESULTS must be greater than 0");
        }

        if self.pipeline.source_concurrency == 0 {
            anyhow::bail!("PIPELINE_SOURCE_CONCURRENCY must be greater than 0");
        }

        if self.worker.concurrency == 0 {
            anyhow::bail!("WORKER_CONCURRENCY must be greater than 0");
        }

        // The longest gap between two heartbeats of a live run is one stage call
        let longest_stage = (QUERY_COUNT as u64 * self.collaborators.search_timeout_secs)
            .max(self.collaborators.fetch_timeout_secs)
            .max(self.collaborators.extraction_timeout_secs);
        if self.worker.stale_after_secs <= longest_stage {
            anyhow::bail!(
                "WORKER_STALE_AFTER_SECS ({}) must exceed the longest stage timeout ({}s)",
                self.worker.stale_after_secs,
                longest_stage
            );
        }

        for (name, endpoint) in [
            ("SEARCH_ENDPOINT", &self.collaborators.search_endpoint),
            ("EXTRACTOR_ENDPOINT", &self.collaborators.extractor_endpoint),
        ] {
            url::Url::parse(endpoint)
                .map_err(|e| anyhow::anyhow!("{} '{}' is not a valid URL: {}", name, endpoint, e))?;
        }

        if self.collaborators.extractor_api_key.is_none() {
            tracing::warn!("EXTRACTOR_API_KEY is not set - extraction requests are unauthenticated");
        }

        Ok(())
    }

    /// Pipeline settings, reading the geo directory file if one is configured
    pub fn pipeline_settings(&self) -> anyhow::Result<PipelineSettings> {
        let geo_directory = match self.pipeline.geo_directory_path {
            Some(ref path) => load_geo_directory(path)?,
            None => default_geo_directory(),
        };

        Ok(PipelineSettings {
            executor: ExecutorSettings {
                max_results: self.pipeline.max_results,
                source_concurrency: self.pipeline.source_concurrency,
            },
            defaults: VariableDefaults {
                region_code: self.pipeline.region_code.clone(),
                geo_directory,
                ..VariableDefaults::default()
            },
            scheme: IdentifierScheme::default(),
        })
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            poll_interval: Duration::from_millis(self.worker.poll_interval_ms),
            concurrency: self.worker.concurrency,
            stale_after: Duration::from_secs(self.worker.stale_after_secs),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DbConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                idle_timeout_secs: Some(DEFAULT_DATABASE_IDLE_TIMEOUT_SECS),
                max_lifetime_secs: None,
            },
            pipeline: PipelineConfig {
                execution_mode: ExecutionModeKind::default(),
                region_code: DEFAULT_REGION_CODE.to_string(),
                geo_directory_path: None,
                max_results: DEFAULT_MAX_RESULTS,
                source_concurrency: DEFAULT_SOURCE_CONCURRENCY,
            },
            worker: WorkerConfig {
                poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
                concurrency: DEFAULT_WORKER_CONCURRENCY,
                stale_after_secs: DEFAULT_STALE_AFTER_SECS,
            },
            collaborators: CollaboratorConfig {
                search_endpoint: DEFAULT_SEARCH_ENDPOINT.to_string(),
                extractor_endpoint: DEFAULT_EXTRACTOR_ENDPOINT.to_string(),
                extractor_api_key: None,
                search_timeout_secs: DEFAULT_SEARCH_TIMEOUT_SECS,
                fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
                extraction_timeout_secs: DEFAULT_EXTRACTION_TIMEOUT_SECS,
                user_agent: DEFAULT_USER_AGENT.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.pipeline.execution_mode, ExecutionModeKind::Queued);
        assert_eq!(config.pipeline.max_results, 6);
        assert_eq!(config.pipeline.region_code, "16");
        assert_eq!(config.database.url, DEFAULT_DATABASE_URL);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_legacy_flag_selects_sync_mode() {
        let config = Config::from_lookup(lookup(&[
            ("EXECUTION_MODE", "queued"),
            ("LOCAL_SINGLEEXE", "1"),
        ]))
        .unwrap();
        assert_eq!(config.pipeline.execution_mode, ExecutionModeKind::Sync);
    }

    #[test]
    fn test_unknown_mode_is_rejected() {
        assert!(Config::from_lookup(lookup(&[("EXECUTION_MODE", "celery")])).is_err());
    }

    #[test]
    fn test_overrides_and_unparsable_values() {
        let config = Config::from_lookup(lookup(&[
            ("REGION_DEFAULT_CODE", "77"),
            ("PIPELINE_MAX_RESULTS", "3"),
            ("WORKER_CONCURRENCY", "many"),
            ("EXTRACTOR_API_KEY", "  "),
        ]))
        .unwrap();
        assert_eq!(config.pipeline.region_code, "77");
        assert_eq!(config.pipeline.max_results, 3);
        assert_eq!(config.worker.concurrency, DEFAULT_WORKER_CONCURRENCY);
        assert!(config.collaborators.extractor_api_key.is_none());
    }

    #[test]
    fn test_validate_rejects_bad_pool_and_endpoints() {
        let mut config = Config::default();
        config.database.min_connections = 50;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.collaborators.search_endpoint = "not a url".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pipeline.source_concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_stale_window_must_outlast_a_stage() {
        let mut config = Config::default();
        config.worker.stale_after_secs = DEFAULT_EXTRACTION_TIMEOUT_SECS;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("WORKER_STALE_AFTER_SECS"));

        // Four sequential search queries outlast one extraction call
        let mut config = Config::default();
        config.collaborators.search_timeout_secs = 60;
        config.worker.stale_after_secs = 200;
        assert!(config.validate().is_err());

        config.worker.stale_after_secs = 241;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_pipeline_settings_reads_geo_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("geo.json");
        std::fs::write(&path, r#"{"16": "Республика Татарстан"}"#).unwrap();

        let mut config = Config::default();
        config.pipeline.region_code = "16".to_string();
        config.pipeline.geo_directory_path = Some(path);

        let settings = config.pipeline_settings().unwrap();
        assert_eq!(settings.defaults.region_name(), "Республика Татарстан");
        assert_eq!(settings.executor.max_results, 6);
    }
}
