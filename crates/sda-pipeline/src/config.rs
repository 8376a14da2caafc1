//! Configuration management
//!
//! Every service reads `config.yaml` from the working directory (or the file
//! named by `$CONFIG_FILE` / `--config`) and then overlays environment
//! variables, mapping a dotted key to an underscored variable:
//! `broker.host` is overridden by `BROKER_HOST`. Keys are single lowercase
//! words per segment so the mapping is unambiguous.
//!
//! The loaded [`Config`] is read-only; services receive it wrapped in an
//! `Arc` through their constructors.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::storage::config::StorageConfig;

// ============================================================================
// Broker Configuration Constants
// ============================================================================

/// Default AMQP port.
pub const DEFAULT_BROKER_PORT: u16 = 5672;

/// Default exchange every stage publishes to.
pub const DEFAULT_EXCHANGE: &str = "sda";

/// Default routing key for `info-error` messages.
pub const DEFAULT_ERROR_ROUTING_KEY: &str = "error";

/// Default consumer prefetch.
pub const DEFAULT_PREFETCH_COUNT: u16 = 2;

/// Default publisher confirm timeout in seconds.
pub const DEFAULT_CONFIRM_TIMEOUT_SECS: u64 = 30;

/// Default number of reconnection attempts before the service gives up.
pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 10;

/// Default pause between reconnection attempts in milliseconds.
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 1000;

/// Default number of consecutive transient failures tolerated.
pub const DEFAULT_MAX_TRANSIENT: u32 = 25;

/// Default delay before a missing-precondition requeue in milliseconds.
pub const DEFAULT_REQUEUE_DELAY_MS: u64 = 1000;

/// Default drain window on shutdown in seconds.
pub const DEFAULT_DRAIN_SECS: u64 = 10;

// ============================================================================
// Database Configuration Constants
// ============================================================================

/// Default PostgreSQL port.
pub const DEFAULT_DATABASE_PORT: u16 = 5432;

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default number of retries on connection-level database failures.
pub const DEFAULT_DATABASE_RETRIES: u32 = 5;

/// Default liveness ping timeout in milliseconds.
pub const DEFAULT_DATABASE_PING_TIMEOUT_MS: u64 = 5;

// ============================================================================
// Server Configuration Constants
// ============================================================================

/// Default sync API host binding.
pub const DEFAULT_SERVER_HOST: &str = "0.0.0.0";

/// Default sync API port.
pub const DEFAULT_SERVER_PORT: u16 = 8080;

/// Errors raised while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Missing configuration section: {0}")]
    Missing(&'static str),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Top level configuration shared by all services
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub broker: BrokerConfig,
    #[serde(default)]
    pub db: DatabaseConfig,
    #[serde(default)]
    pub inbox: Option<StorageConfig>,
    #[serde(default)]
    pub archive: Option<StorageConfig>,
    #[serde(default)]
    pub backup: Option<StorageConfig>,
    #[serde(default)]
    pub c4gh: Option<Crypt4ghConfig>,
    #[serde(default)]
    pub schema: SchemaConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub notify: Option<NotifyConfig>,
    #[serde(default)]
    pub log: LogSection,
}

/// Message broker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub host: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_vhost")]
    pub vhost: String,
    /// Queue this service consumes from
    #[serde(default)]
    pub queue: String,
    #[serde(default = "default_exchange")]
    pub exchange: String,
    /// Overrides the service's default output routing key
    #[serde(default)]
    pub routingkey: Option<String>,
    /// Per-output overrides for stages publishing on several routing keys
    #[serde(default)]
    pub routes: Routes,
    #[serde(default = "default_error_routing_key")]
    pub routingerror: String,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub cacert: Option<PathBuf>,
    /// PKCS#12 client identity for mutual TLS
    #[serde(default)]
    pub clientcert: Option<PathBuf>,
    #[serde(default)]
    pub clientpassword: Option<String>,
    #[serde(default = "default_prefetch")]
    pub prefetchcount: u16,
    /// Concurrent handler tasks
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_confirm_timeout")]
    pub confirmtimeout: u64,
    #[serde(default = "default_reconnect_attempts")]
    pub reconnectattempts: u32,
    #[serde(default = "default_reconnect_delay")]
    pub reconnectdelay: u64,
    #[serde(default = "default_max_transient")]
    pub maxtransient: u32,
    #[serde(default = "default_requeue_delay")]
    pub requeuedelay: u64,
    #[serde(default = "default_drain")]
    pub drainseconds: u64,
}

impl BrokerConfig {
    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmtimeout)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnectdelay)
    }

    pub fn requeue_delay(&self) -> Duration {
        Duration::from_millis(self.requeuedelay)
    }

    pub fn drain_window(&self) -> Duration {
        Duration::from_secs(self.drainseconds)
    }

    /// The output routing key, falling back to the service default
    pub fn routing_key_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.routingkey.as_deref().unwrap_or(default)
    }
}

/// Output routing keys keyed by their default name
///
/// ```yaml
/// broker:
///   routes:
///     accession: stableIDs
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Routes(BTreeMap<String, String>);

impl Routes {
    pub fn with(mut self, default: &str, routing_key: &str) -> Self {
        self.0.insert(default.to_string(), routing_key.to_string());
        self
    }

    /// The routing key an output named `default` is published on
    pub fn resolve<'a>(&'a self, default: &'a str) -> &'a str {
        self.0.get(default).map(String::as_str).unwrap_or(default)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_BROKER_PORT,
            user: String::new(),
            password: String::new(),
            vhost: default_vhost(),
            queue: String::new(),
            exchange: default_exchange(),
            routingkey: None,
            routes: Routes::default(),
            routingerror: default_error_routing_key(),
            ssl: false,
            cacert: None,
            clientcert: None,
            clientpassword: None,
            prefetchcount: DEFAULT_PREFETCH_COUNT,
            workers: default_workers(),
            confirmtimeout: DEFAULT_CONFIRM_TIMEOUT_SECS,
            reconnectattempts: DEFAULT_RECONNECT_ATTEMPTS,
            reconnectdelay: DEFAULT_RECONNECT_DELAY_MS,
            maxtransient: DEFAULT_MAX_TRANSIENT,
            requeuedelay: DEFAULT_REQUEUE_DELAY_MS,
            drainseconds: DEFAULT_DRAIN_SECS,
        }
    }
}

/// Catalogue database settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Full connection URL; takes precedence over the individual fields
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_db_host")]
    pub host: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_db_name")]
    pub database: String,
    #[serde(default = "default_sslmode")]
    pub sslmode: String,
    #[serde(default)]
    pub cacert: Option<PathBuf>,
    #[serde(default = "default_db_max_connections")]
    pub maxconnections: u32,
    #[serde(default = "default_db_connect_timeout")]
    pub connecttimeout: u64,
    #[serde(default = "default_db_retries")]
    pub retries: u32,
    #[serde(default = "default_db_ping_timeout")]
    pub pingtimeout: u64,
}

impl DatabaseConfig {
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.pingtimeout)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: default_db_host(),
            port: DEFAULT_DATABASE_PORT,
            user: String::new(),
            password: String::new(),
            database: default_db_name(),
            sslmode: default_sslmode(),
            cacert: None,
            maxconnections: DEFAULT_DATABASE_MAX_CONNECTIONS,
            connecttimeout: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
            retries: DEFAULT_DATABASE_RETRIES,
            pingtimeout: DEFAULT_DATABASE_PING_TIMEOUT_MS,
        }
    }
}

/// Crypt4GH key material
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Crypt4ghConfig {
    /// Service private key
    pub filepath: PathBuf,
    #[serde(default)]
    pub passphrase: String,
    /// Recipient public key for re-encrypted backup headers
    #[serde(default)]
    pub backuppubkey: Option<PathBuf>,
    /// Backup writes a re-encrypted header in front of the body
    #[serde(default)]
    pub copyheader: bool,
}

/// JSON schema root
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaConfig {
    #[serde(default = "default_schema_path")]
    pub path: PathBuf,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            path: default_schema_path(),
        }
    }
}

/// Sync API HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
    #[serde(default)]
    pub cert: Option<PathBuf>,
    #[serde(default)]
    pub key: Option<PathBuf>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Seconds allowed to read a request
    #[serde(default = "default_read_timeout")]
    pub readtimeout: u64,
    #[serde(default = "default_write_timeout")]
    pub writetimeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: DEFAULT_SERVER_PORT,
            cert: None,
            key: None,
            user: None,
            password: None,
            readtimeout: default_read_timeout(),
            writetimeout: default_write_timeout(),
        }
    }
}

impl ServerConfig {
    /// Upper bound on handling one request, reading and answering
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.readtimeout + self.writetimeout)
    }

    /// Basic credentials, when both halves are configured
    pub fn basic_auth(&self) -> Option<(&str, &str)> {
        match (&self.user, &self.password) {
            (Some(user), Some(password)) => Some((user.as_str(), password.as_str())),
            _ => None,
        }
    }
}

/// SMTP settings for the notify service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    pub from: String,
    #[serde(default = "default_error_subject")]
    pub errorsubject: String,
    #[serde(default = "default_ready_subject")]
    pub readysubject: String,
}

/// Log settings; `LOG_*` variables are honoured on top of these
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogSection {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
}

impl LogSection {
    pub fn to_log_config(&self, service: &str) -> anyhow::Result<sda_common::logging::LogConfig> {
        let mut config = sda_common::logging::LogConfig::for_service(service);
        if let Some(level) = &self.level {
            config.level = level.parse()?;
        }
        if let Some(format) = &self.format {
            config.format = format.parse()?;
        }
        config.with_env_overrides()
    }
}

impl Config {
    /// Locate the configuration file: explicit path, `$CONFIG_FILE`, or
    /// `config.yaml` in the working directory
    pub fn locate(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        std::env::var("CONFIG_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.yaml"))
    }

    /// Load configuration from the file (when present) and the environment
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        dotenvy::dotenv().ok();

        let file = Self::locate(path);
        let mut builder = config::Config::builder();
        if file.exists() {
            builder = builder.add_source(config::File::from(file.as_path()));
        } else {
            tracing::warn!(path = %file.display(), "Configuration file not found, using environment only");
        }

        let config: Config = builder
            .add_source(
                config::Environment::default()
                    .separator("_")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Load from an in-memory YAML document, without environment overlay
    pub fn from_yaml(yaml: &str) -> ConfigResult<Self> {
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.broker.host.is_empty() {
            return Err(ConfigError::Invalid("broker.host cannot be empty".into()));
        }
        if self.broker.prefetchcount == 0 {
            return Err(ConfigError::Invalid("broker.prefetchcount must be greater than 0".into()));
        }
        if self.broker.workers == 0 {
            return Err(ConfigError::Invalid("broker.workers must be greater than 0".into()));
        }

        for (name, storage) in [
            ("inbox", &self.inbox),
            ("archive", &self.archive),
            ("backup", &self.backup),
        ] {
            if let Some(storage) = storage {
                storage
                    .validate()
                    .map_err(|e| ConfigError::Invalid(format!("{name}: {e}")))?;
            }
        }

        if let Some(c4gh) = &self.c4gh {
            if c4gh.copyheader && c4gh.backuppubkey.is_none() {
                return Err(ConfigError::Invalid(
                    "c4gh.copyheader requires c4gh.backuppubkey".into(),
                ));
            }
        }

        if self.server.cert.is_some() != self.server.key.is_some() {
            return Err(ConfigError::Invalid(
                "server.cert and server.key must be set together".into(),
            ));
        }

        Ok(())
    }

    /// Queue to consume from; required by every consuming service
    pub fn require_queue(&self) -> ConfigResult<&str> {
        if self.broker.queue.is_empty() {
            Err(ConfigError::Missing("broker.queue"))
        } else {
            Ok(&self.broker.queue)
        }
    }

    pub fn require_inbox(&self) -> ConfigResult<&StorageConfig> {
        self.inbox.as_ref().ok_or(ConfigError::Missing("inbox"))
    }

    pub fn require_archive(&self) -> ConfigResult<&StorageConfig> {
        self.archive.as_ref().ok_or(ConfigError::Missing("archive"))
    }

    pub fn require_backup(&self) -> ConfigResult<&StorageConfig> {
        self.backup.as_ref().ok_or(ConfigError::Missing("backup"))
    }

    pub fn require_c4gh(&self) -> ConfigResult<&Crypt4ghConfig> {
        self.c4gh.as_ref().ok_or(ConfigError::Missing("c4gh"))
    }

    pub fn require_notify(&self) -> ConfigResult<&NotifyConfig> {
        self.notify.as_ref().ok_or(ConfigError::Missing("notify"))
    }
}

fn default_broker_port() -> u16 {
    DEFAULT_BROKER_PORT
}
fn default_vhost() -> String {
    "/".to_string()
}
fn default_exchange() -> String {
    DEFAULT_EXCHANGE.to_string()
}
fn default_error_routing_key() -> String {
    DEFAULT_ERROR_ROUTING_KEY.to_string()
}
fn default_prefetch() -> u16 {
    DEFAULT_PREFETCH_COUNT
}
fn default_workers() -> usize {
    2
}
fn default_confirm_timeout() -> u64 {
    DEFAULT_CONFIRM_TIMEOUT_SECS
}
fn default_reconnect_attempts() -> u32 {
    DEFAULT_RECONNECT_ATTEMPTS
}
fn default_reconnect_delay() -> u64 {
    DEFAULT_RECONNECT_DELAY_MS
}
fn default_max_transient() -> u32 {
    DEFAULT_MAX_TRANSIENT
}
fn default_requeue_delay() -> u64 {
    DEFAULT_REQUEUE_DELAY_MS
}
fn default_drain() -> u64 {
    DEFAULT_DRAIN_SECS
}
fn default_db_host() -> String {
    "localhost".to_string()
}
fn default_db_port() -> u16 {
    DEFAULT_DATABASE_PORT
}
fn default_db_name() -> String {
    "sda".to_string()
}
fn default_sslmode() -> String {
    "prefer".to_string()
}
fn default_db_max_connections() -> u32 {
    DEFAULT_DATABASE_MAX_CONNECTIONS
}
fn default_db_connect_timeout() -> u64 {
    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS
}
fn default_db_retries() -> u32 {
    DEFAULT_DATABASE_RETRIES
}
fn default_db_ping_timeout() -> u64 {
    DEFAULT_DATABASE_PING_TIMEOUT_MS
}
fn default_schema_path() -> PathBuf {
    PathBuf::from("schemas")
}
fn default_server_host() -> String {
    DEFAULT_SERVER_HOST.to_string()
}
fn default_server_port() -> u16 {
    DEFAULT_SERVER_PORT
}
fn default_read_timeout() -> u64 {
    300
}
fn default_write_timeout() -> u64 {
    20
}
fn default_smtp_port() -> u16 {
    587
}
fn default_error_subject() -> String {
    "Your submission could not be processed".to_string()
}
fn default_ready_subject() -> String {
    "Your submission has been archived".to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::storage::config::StorageConfig;
    use serial_test::serial;

    const MINIMAL: &str = r#"
broker:
  host: mq
  queue: files
archive:
  type: posix
  location: /archive
"#;

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.broker.port, DEFAULT_BROKER_PORT);
        assert_eq!(config.broker.exchange, DEFAULT_EXCHANGE);
        assert_eq!(config.broker.routing_key_or("archived"), "archived");
        assert_eq!(config.db.retries, DEFAULT_DATABASE_RETRIES);
        assert_eq!(config.require_queue().unwrap(), "files");
        assert!(matches!(config.require_archive().unwrap(), StorageConfig::Posix { .. }));
        assert!(matches!(config.require_inbox(), Err(ConfigError::Missing("inbox"))));
    }

    #[test]
    fn test_routes_override_named_outputs() {
        let yaml = "broker:\n  host: mq\n  routes:\n    accession: stableIDs\n";
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.broker.routes.resolve("accession"), "stableIDs");
        assert_eq!(config.broker.routes.resolve("mappings"), "mappings");
        assert_eq!(Config::from_yaml(MINIMAL).unwrap().broker.routes, Routes::default());
    }

    #[test]
    #[serial]
    fn test_route_from_environment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, MINIMAL).unwrap();

        std::env::set_var("BROKER_ROUTES_INGEST", "files");
        let config = Config::load(Some(&path));
        std::env::remove_var("BROKER_ROUTES_INGEST");

        assert_eq!(config.unwrap().broker.routes.resolve("ingest"), "files");
    }

    #[test]
    fn test_copyheader_without_pubkey_is_rejected() {
        let yaml = format!("{MINIMAL}\nc4gh:\n  filepath: /keys/c4gh.sec\n  copyheader: true\n");
        assert!(matches!(Config::from_yaml(&yaml), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_server_tls_requires_both_files() {
        let yaml = format!("{MINIMAL}\nserver:\n  cert: /certs/tls.crt\n");
        assert!(matches!(Config::from_yaml(&yaml), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_prefetch_is_rejected() {
        let yaml = "broker:\n  host: mq\n  prefetchcount: 0\n";
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    #[serial]
    fn test_environment_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, MINIMAL).unwrap();

        std::env::set_var("BROKER_HOST", "rabbit.internal");
        std::env::set_var("BROKER_PREFETCHCOUNT", "7");
        let config = Config::load(Some(&path));
        std::env::remove_var("BROKER_HOST");
        std::env::remove_var("BROKER_PREFETCHCOUNT");

        let config = config.unwrap();
        assert_eq!(config.broker.host, "rabbit.internal");
        assert_eq!(config.broker.prefetchcount, 7);
        assert_eq!(config.broker.queue, "files");
    }

    #[test]
    #[serial]
    fn test_locate_prefers_explicit_then_env() {
        std::env::set_var("CONFIG_FILE", "/etc/sda/config.yaml");
        assert_eq!(Config::locate(None), PathBuf::from("/etc/sda/config.yaml"));
        assert_eq!(
            Config::locate(Some(Path::new("local.yaml"))),
            PathBuf::from("local.yaml")
        );
        std::env::remove_var("CONFIG_FILE");
        assert_eq!(Config::locate(None), PathBuf::from("config.yaml"));
    }
}
