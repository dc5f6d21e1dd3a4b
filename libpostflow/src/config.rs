//! Configuration management for PostFlow
//!
//! Configuration is a TOML file; every section except `[database]` may be
//! omitted and falls back to the defaults below. Durations are humantime
//! strings such as `"30s"`, `"2days"` or `"500ms"`.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, Result};
use crate::scheduler::Cadence;

pub const DISPATCH_DUE_POSTS: &str = "dispatch_due_posts";
pub const REFRESH_CREDENTIALS: &str = "refresh_credentials";
pub const SYNC_POSTS: &str = "sync_posts";
pub const FETCH_ENGAGEMENT: &str = "fetch_engagement";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub publish: PublishConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub instagram: InstagramConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub lock_path: String,
    /// How long shutdown waits for in-flight jobs before aborting them
    pub shutdown_timeout: String,
    /// Entries override the built-in job of the same name; others keep defaults
    #[serde(deserialize_with = "merge_with_default_jobs")]
    pub jobs: BTreeMap<String, JobConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub cadence: String,
    #[serde(default = "default_true")]
    pub coalesce: bool,
    #[serde(default = "default_misfire_grace")]
    pub misfire_grace: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout: String,
    pub max_attempts: u32,
    pub backoff_base: String,
    pub max_backoff: String,
    /// Wait used when a 429 carries no usable reset header
    pub rate_limit_default_wait: String,
    pub max_rate_limit_wait: String,
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    pub inter_account_delay: String,
    pub request_timeout: String,
    pub container_retries: u32,
    pub container_retry_delay: String,
    pub publish_attempts: u32,
    pub publish_backoff_step: String,
    pub media_probe_timeout: String,
    pub max_image_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub page_size: usize,
    /// Cap on posts fetched per account each sync; unset fetches everything
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_limit: Option<usize>,
    pub instagram_engagement_posts: usize,
    pub status_engagement_posts: usize,
    /// Tokens expiring within this window are refreshed
    pub token_refresh_window: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstagramConfig {
    pub graph_base_url: String,
    pub refresh_url: String,
}

fn default_true() -> bool {
    true
}

fn default_misfire_grace() -> String {
    "30s".to_string()
}

impl JobConfig {
    fn new(cadence: &str) -> Self {
        Self {
            cadence: cadence.to_string(),
            coalesce: true,
            misfire_grace: default_misfire_grace(),
            enabled: true,
        }
    }

    pub fn cadence(&self, name: &str) -> Result<Cadence> {
        self.cadence.parse::<Cadence>().map_err(|reason| {
            ConfigError::InvalidValue {
                field: format!("scheduler.jobs.{}.cadence", name),
                reason,
            }
            .into()
        })
    }

    pub fn misfire_grace(&self, name: &str) -> Result<Duration> {
        parse_duration(&format!("scheduler.jobs.{}.misfire_grace", name), &self.misfire_grace)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let mut jobs = BTreeMap::new();
        jobs.insert(DISPATCH_DUE_POSTS.to_string(), JobConfig::new("every 1m"));
        jobs.insert(REFRESH_CREDENTIALS.to_string(), JobConfig::new("every 6h at :00"));
        jobs.insert(SYNC_POSTS.to_string(), JobConfig::new("hourly at :15"));
        jobs.insert(FETCH_ENGAGEMENT.to_string(), JobConfig::new("hourly at :45"));

        Self {
            lock_path: "/tmp/postflow_scheduler.lock".to_string(),
            shutdown_timeout: "30s".to_string(),
            jobs,
        }
    }
}

fn merge_with_default_jobs<'de, D>(
    deserializer: D,
) -> std::result::Result<BTreeMap<String, JobConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    let overrides = BTreeMap::<String, JobConfig>::deserialize(deserializer)?;
    let mut jobs = SchedulerConfig::default().jobs;
    jobs.extend(overrides);
    Ok(jobs)
}

impl SchedulerConfig {
    pub fn lock_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.lock_path).to_string())
    }

    pub fn shutdown_timeout(&self) -> Result<Duration> {
        parse_duration("scheduler.shutdown_timeout", &self.shutdown_timeout)
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: "30s".to_string(),
            max_attempts: 3,
            backoff_base: "1s".to_string(),
            max_backoff: "30s".to_string(),
            rate_limit_default_wait: "60s".to_string(),
            max_rate_limit_wait: "15m".to_string(),
            user_agent: "PostFlow/1.0 (+https://postflow.photo)".to_string(),
        }
    }
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            inter_account_delay: "1s".to_string(),
            request_timeout: "15s".to_string(),
            container_retries: 2,
            container_retry_delay: "2s".to_string(),
            publish_attempts: 3,
            publish_backoff_step: "2s".to_string(),
            media_probe_timeout: "10s".to_string(),
            max_image_bytes: 8 * 1024 * 1024,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: 40,
            post_limit: None,
            instagram_engagement_posts: 30,
            status_engagement_posts: 50,
            token_refresh_window: "2days".to_string(),
        }
    }
}

impl Default for InstagramConfig {
    fn default() -> Self {
        Self {
            graph_base_url: "https://graph.instagram.com/v22.0".to_string(),
            refresh_url: "https://graph.instagram.com/refresh_access_token".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the default location
    ///
    /// A missing file is not an error; the built-in defaults are used.
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        if !config_path.exists() {
            tracing::info!(
                path = %config_path.display(),
                "No config file found, using defaults"
            );
            return Ok(Self::default_config());
        }
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config = toml::from_str(&content).map_err(ConfigError::ParseError)?;
        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        let database_path = resolve_data_path()
            .map(|dir| dir.join("postflow.db").display().to_string())
            .unwrap_or_else(|_| "~/.local/share/postflow/postflow.db".to_string());

        Self {
            database: DatabaseConfig {
                path: database_path,
            },
            scheduler: SchedulerConfig::default(),
            http: HttpConfig::default(),
            publish: PublishConfig::default(),
            sync: SyncConfig::default(),
            instagram: InstagramConfig::default(),
        }
    }

    /// Check values serde cannot: durations, cadences, numeric bounds
    pub fn validate(&self) -> Result<()> {
        if self.database.path.trim().is_empty() {
            return Err(ConfigError::MissingField("database.path".to_string()).into());
        }

        self.scheduler.shutdown_timeout()?;
        for (name, job) in &self.scheduler.jobs {
            job.cadence(name)?;
            job.misfire_grace(name)?;
        }

        for (field, value) in [
            ("http.timeout", &self.http.timeout),
            ("http.backoff_base", &self.http.backoff_base),
            ("http.max_backoff", &self.http.max_backoff),
            ("http.rate_limit_default_wait", &self.http.rate_limit_default_wait),
            ("http.max_rate_limit_wait", &self.http.max_rate_limit_wait),
            ("publish.inter_account_delay", &self.publish.inter_account_delay),
            ("publish.request_timeout", &self.publish.request_timeout),
            ("publish.container_retry_delay", &self.publish.container_retry_delay),
            ("publish.publish_backoff_step", &self.publish.publish_backoff_step),
            ("publish.media_probe_timeout", &self.publish.media_probe_timeout),
            ("sync.token_refresh_window", &self.sync.token_refresh_window),
        ] {
            parse_duration(field, value)?;
        }

        if self.http.max_attempts == 0 {
            return Err(invalid("http.max_attempts", "must be at least 1"));
        }
        if self.publish.publish_attempts == 0 {
            return Err(invalid("publish.publish_attempts", "must be at least 1"));
        }
        if self.sync.page_size == 0 || self.sync.page_size > 40 {
            return Err(invalid("sync.page_size", "must be between 1 and 40"));
        }

        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> crate::error::PostflowError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

/// Parse a humantime duration, naming the offending field on failure
pub fn parse_duration(field: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value.trim()).map_err(|e| invalid(field, &e.to_string()))
}

/// Resolve the configuration file path following XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("POSTFLOW_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("postflow").join("config.toml"))
}

/// Resolve the data directory path following XDG Base Directory spec
pub fn resolve_data_path() -> Result<PathBuf> {
    let data_dir =
        dirs::data_dir().ok_or_else(|| ConfigError::MissingField("data directory".to_string()))?;

    Ok(data_dir.join("postflow"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PostflowError;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_minimal_config_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [database]
            path = "/tmp/postflow-test.db"
            "#,
        )
        .unwrap();

        assert!(config.validate().is_ok());
        assert_eq!(config.sync.page_size, 40);
        assert_eq!(config.publish.publish_attempts, 3);
        assert_eq!(config.scheduler.jobs.len(), 4);
        assert_eq!(
            config.scheduler.lock_path(),
            PathBuf::from("/tmp/postflow_scheduler.lock")
        );
    }

    #[test]
    fn test_job_overrides() {
        let config: Config = toml::from_str(
            r#"
            [database]
            path = "/tmp/postflow-test.db"

            [scheduler.jobs.sync_posts]
            cadence = "every 30m"
            misfire_grace = "2m"
            "#,
        )
        .unwrap();

        let job = &config.scheduler.jobs[SYNC_POSTS];
        assert!(job.coalesce);
        assert_eq!(job.misfire_grace(SYNC_POSTS).unwrap(), Duration::from_secs(120));
        assert_eq!(
            job.cadence(SYNC_POSTS).unwrap(),
            Cadence::Every(Duration::from_secs(1800))
        );

        // Jobs not mentioned keep their built-in cadence
        assert_eq!(config.scheduler.jobs.len(), 4);
        assert_eq!(config.scheduler.jobs[FETCH_ENGAGEMENT].cadence, "hourly at :45");
    }

    #[test]
    fn test_invalid_duration_names_field() {
        let mut config = Config::default_config();
        config.publish.inter_account_delay = "soon".to_string();

        match config.validate() {
            Err(PostflowError::Config(ConfigError::InvalidValue { field, .. })) => {
                assert_eq!(field, "publish.inter_account_delay");
            }
            other => panic!("Expected InvalidValue, got {:?}", other),
        }
    }

    #[test]
    fn test_page_size_bounds() {
        let mut config = Config::default_config();
        config.sync.page_size = 41;
        assert!(config.validate().is_err());

        config.sync.page_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_cadence_rejected() {
        let mut config = Config::default_config();
        config
            .scheduler
            .jobs
            .insert("broken".to_string(), JobConfig::new("whenever"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_path_parse_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "invalid toml content [[[").unwrap();

        let result = Config::load_from_path(&path);
        assert!(matches!(
            result,
            Err(PostflowError::Config(ConfigError::ParseError(_)))
        ));
    }

    #[test]
    #[serial]
    fn test_load_uses_env_path() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            [database]
            path = "/tmp/from-env.db"
            "#,
        )
        .unwrap();

        std::env::set_var("POSTFLOW_CONFIG", &path);
        let config = Config::load().unwrap();
        std::env::remove_var("POSTFLOW_CONFIG");

        assert_eq!(config.database.path, "/tmp/from-env.db");
    }

    #[test]
    #[serial]
    fn test_load_missing_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        std::env::set_var("POSTFLOW_CONFIG", temp_dir.path().join("absent.toml"));
        let config = Config::load().unwrap();
        std::env::remove_var("POSTFLOW_CONFIG");

        assert!(config.database.path.ends_with("postflow.db"));
    }
}
