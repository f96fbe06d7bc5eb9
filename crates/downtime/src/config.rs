use std::time::Duration;
use std::{env, fmt, fs, path};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConfigError;
use crate::probe::{MAX_TIMEOUT, MIN_TIMEOUT};

/// Effective settings for both binaries. Built once at start-up and passed
/// down by reference; nothing mutates it afterwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub probe: ProbeConfig,
    pub kafka: KafkaConfig,
    pub redis: RedisConfig,
    pub postgres: PostgresConfig,
    pub sink: SinkConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Sleep between polls when nothing is due
    pub idle_sleep_ms: u64,
    pub reconcile_interval_secs: u64,
    /// Members written per round trip during reconciliation
    pub sync_batch_size: usize,
    pub index_key: String,
    pub watermark_key: String,
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub probe_id: String,
    pub region: String,
    /// Global ceiling on in-flight measurements
    pub concurrency: usize,
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Body stall guard; defaults to the request timeout
    pub response_idle_timeout_ms: Option<u64>,
    pub max_body_bytes: usize,
    pub host_hot_threshold: u32,
    pub host_hot_window_ms: u64,
    pub keep_alive_ms: u64,
    pub max_idle_per_host: usize,
    pub user_agent: String,
    pub shutdown_grace_ms: u64,
    pub publish_retries: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    pub bootstrap_servers: String,
    pub request_topic: String,
    pub result_topic: String,
    pub group_id: String,
    pub auto_offset_reset: String,
    pub security_protocol: Option<String>,
    pub sasl_mechanism: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    pub session_timeout_ms: u64,
    pub message_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    pub pool_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostgresConfig {
    pub url: String,
    pub max_connections: u32,
    pub table: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Append JSON lines here; stdout when unset
    pub log_file: Option<path::PathBuf>,
    /// Also publish records to the result topic
    pub publish_to_broker: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            idle_sleep_ms: 1_000,
            reconcile_interval_secs: 60,
            sync_batch_size: 10,
            index_key: "next_run_at".into(),
            watermark_key: "lastSyncedAt".into(),
            max_backoff_ms: 30_000,
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            probe_id: Uuid::new_v4().to_string(),
            region: "local".into(),
            concurrency: 50,
            request_timeout_ms: 30_000,
            connect_timeout_ms: 5_000,
            response_idle_timeout_ms: None,
            max_body_bytes: 2 * 1024 * 1024,
            host_hot_threshold: 5,
            host_hot_window_ms: 30_000,
            keep_alive_ms: 1_000,
            max_idle_per_host: 10,
            user_agent: "downtime-monitor/1.0".into(),
            shutdown_grace_ms: 10_000,
            publish_retries: 3,
        }
    }
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".into(),
            request_topic: "monitoring.request".into(),
            result_topic: "monitoring.result".into(),
            group_id: "probe-group-1".into(),
            auto_offset_reset: "latest".into(),
            security_protocol: None,
            sasl_mechanism: None,
            sasl_username: None,
            sasl_password: None,
            session_timeout_ms: 30_000,
            message_timeout_ms: 5_000,
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self { url: "redis://127.0.0.1:6379".into(), pool_size: 8 }
    }
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/downtime".into(),
            max_connections: 5,
            table: "configs".into(),
        }
    }
}

impl SchedulerConfig {
    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

impl ProbeConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn response_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.response_idle_timeout_ms.unwrap_or(self.request_timeout_ms))
    }

    pub fn host_hot_window(&self) -> Duration {
        Duration::from_millis(self.host_hot_window_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Used to ensure we are actually reading a toml file
fn normalize_toml_path(path: &path::Path) -> path::PathBuf {
    let mut path = path.to_path_buf();
    if path.extension().map(|ext| ext != "toml").unwrap_or(true) {
        path.set_extension("toml");
    }
    path
}

/// Get default config path ($XDG_CONFIG_HOME/downtime/config.toml or
/// $HOME/.config/...)
fn default_config_path() -> Result<path::PathBuf, ConfigError> {
    let path = if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
        path::PathBuf::from(config_home)
    } else if let Some(home_dir) = env::home_dir() {
        home_dir.join(".config")
    } else {
        return Err(ConfigError::ConfigPathUnavailable);
    };

    Ok(path.join("downtime/config.toml"))
}

fn redact(secret: &Option<String>) -> &'static str {
    if secret.is_some() { "<redacted>" } else { "<unset>" }
}

fn redact_url(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) if parsed.password().is_some() => {
            let _ = parsed.set_password(Some("redacted"));
            parsed.to_string()
        }
        _ => url.to_string(),
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let write_1 = |f: &mut fmt::Formatter<'_>, label: &str, value: &dyn fmt::Display| {
            writeln!(f, "    {label}: {value}")
        };
        let write_title = |f: &mut fmt::Formatter<'_>, label: &str| writeln!(f, "  {label}");
        let optional = |value: &Option<String>| value.clone().unwrap_or_else(|| "<unset>".into());

        writeln!(f, "Current Internal Configuration State:")?;
        write_title(f, "Scheduler")?;
        write_1(f, "Idle Sleep (ms)", &self.scheduler.idle_sleep_ms)?;
        write_1(f, "Reconcile Interval (s)", &self.scheduler.reconcile_interval_secs)?;
        write_1(f, "Sync Batch Size", &self.scheduler.sync_batch_size)?;
        write_1(f, "Index Key", &self.scheduler.index_key)?;
        write_1(f, "Watermark Key", &self.scheduler.watermark_key)?;

        write_title(f, "Probe")?;
        write_1(f, "Probe ID", &self.probe.probe_id)?;
        write_1(f, "Region", &self.probe.region)?;
        write_1(f, "Concurrency", &self.probe.concurrency)?;
        write_1(f, "Request Timeout (ms)", &self.probe.request_timeout_ms)?;
        write_1(f, "Connect Timeout (ms)", &self.probe.connect_timeout_ms)?;
        write_1(f, "Idle Timeout (ms)", &self.probe.response_idle_timeout().as_millis())?;
        write_1(f, "Max Body (bytes)", &self.probe.max_body_bytes)?;
        write_1(f, "Hot Host Threshold", &self.probe.host_hot_threshold)?;
        write_1(f, "Hot Host Window (ms)", &self.probe.host_hot_window_ms)?;

        write_title(f, "Kafka")?;
        write_1(f, "Bootstrap Servers", &self.kafka.bootstrap_servers)?;
        write_1(f, "Request Topic", &self.kafka.request_topic)?;
        write_1(f, "Result Topic", &self.kafka.result_topic)?;
        write_1(f, "Group ID", &self.kafka.group_id)?;
        write_1(f, "Security Protocol", &optional(&self.kafka.security_protocol))?;
        write_1(f, "SASL Mechanism", &optional(&self.kafka.sasl_mechanism))?;
        write_1(f, "SASL Username", &optional(&self.kafka.sasl_username))?;
        write_1(f, "SASL Password", &redact(&self.kafka.sasl_password))?;

        write_title(f, "Redis")?;
        write_1(f, "URL", &redact_url(&self.redis.url))?;

        write_title(f, "Postgres")?;
        write_1(f, "URL", &redact_url(&self.postgres.url))?;
        write_1(f, "Table", &self.postgres.table)?;

        write_title(f, "Sink")?;
        let log_file = self
            .sink
            .log_file
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "<stdout>".into());
        write_1(f, "Log File", &log_file)?;
        write_1(f, "Publish To Broker", &self.sink.publish_to_broker)?;

        Ok(())
    }
}

impl Config {
    /// Generate Config structure from file
    ///
    /// Creates a default config in ~/.config/downtime/config.toml
    ///  or the specified path, with the name config.toml if one does not exist
    ///
    /// ```no_run
    /// let cfg = downtime::Config::from_config(None::<&std::path::Path>)?;
    /// println!("{}", cfg);
    /// # Ok::<(), downtime::error::ConfigError>(())
    /// ```
    pub fn from_config(optional_path: Option<impl AsRef<path::Path>>) -> Result<Self, ConfigError> {
        let config_path: path::PathBuf = if let Some(path) = optional_path {
            normalize_toml_path(path.as_ref())
        } else {
            default_config_path()?
        };

        if config_path.exists() {
            let raw_string = fs::read_to_string(&config_path)
                .map_err(|source| ConfigError::Read { path: config_path.clone(), source })?;
            Ok(toml::from_str(raw_string.as_str())?)
        } else {
            let config = Self::default();
            config.write_config(&config_path)?;
            Ok(config)
        }
    }

    /// Serialize and write a config to a file
    pub fn write_config(&self, path: &path::Path) -> Result<(), ConfigError> {
        let config_str: String = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|source| ConfigError::Write { path: parent.to_path_buf(), source })?;
        }

        fs::write(path, config_str)
            .map_err(|source| ConfigError::Write { path: path.to_path_buf(), source })
    }

    /// File, then process environment, then validation.
    pub fn load(optional_path: Option<impl AsRef<path::Path>>) -> Result<Self, ConfigError> {
        let mut config = Self::from_config(optional_path)?;
        config.apply_env(|key| env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Overlay deployment settings taken from `lookup` (normally the process
    /// environment). Empty values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(url) = get("DATABASE_URL") {
            self.postgres.url = url;
        }
        if let Some(url) = get("REDIS_URL") {
            self.redis.url = url;
        }
        if let Some(servers) = get("BOOTSTRAP_SERVERS") {
            self.kafka.bootstrap_servers = servers;
        }
        if let Some(protocol) = get("SECURITY_PROTOCOL") {
            self.kafka.security_protocol = Some(protocol);
        }
        if let Some(mechanism) = get("SASL_MECHANISM") {
            self.kafka.sasl_mechanism = Some(mechanism);
        }
        if let Some(username) = get("SASL_USERNAME") {
            self.kafka.sasl_username = Some(username);
        }
        if let Some(password) = get("SASL_PASSWORD") {
            self.kafka.sasl_password = Some(password);
        }
        if let Some(region) = get("PROBE_REGION") {
            self.probe.region = region;
        }
        if let Some(probe_id) = get("PROBE_ID") {
            self.probe.probe_id = probe_id;
        }
        if let Some(path) = get("RESULT_LOG_FILE") {
            self.sink.log_file = Some(path::PathBuf::from(path));
        }
    }

    /// Reject settings no component can run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, reason: &str| {
            Err(ConfigError::Invalid { field, reason: reason.to_string() })
        };

        if self.kafka.bootstrap_servers.trim().is_empty() {
            return Err(ConfigError::Missing("kafka.bootstrap_servers"));
        }
        if self.kafka.request_topic.trim().is_empty() {
            return Err(ConfigError::Missing("kafka.request_topic"));
        }
        if self.kafka.group_id.trim().is_empty() {
            return Err(ConfigError::Missing("kafka.group_id"));
        }
        if self.kafka.sasl_mechanism.is_some()
            && (self.kafka.sasl_username.is_none() || self.kafka.sasl_password.is_none())
        {
            return Err(ConfigError::Missing("kafka.sasl_username/kafka.sasl_password"));
        }
        if self.redis.url.trim().is_empty() {
            return Err(ConfigError::Missing("redis.url"));
        }
        if self.postgres.url.trim().is_empty() {
            return Err(ConfigError::Missing("postgres.url"));
        }
        if self.probe.region.trim().is_empty() {
            return Err(ConfigError::Missing("probe.region"));
        }

        if self.scheduler.sync_batch_size == 0 {
            return invalid("scheduler.sync_batch_size", "must be at least 1");
        }
        if self.scheduler.idle_sleep_ms == 0 {
            return invalid("scheduler.idle_sleep_ms", "must be positive");
        }
        if self.probe.concurrency == 0 {
            return invalid("probe.concurrency", "must be at least 1");
        }
        if !(MIN_TIMEOUT..=MAX_TIMEOUT).contains(&self.probe.request_timeout()) {
            let reason = format!("must be between {}ms and {}ms", MIN_TIMEOUT.as_millis(), MAX_TIMEOUT.as_millis());
            return invalid("probe.request_timeout_ms", &reason);
        }
        if self.probe.connect_timeout_ms == 0 {
            return invalid("probe.connect_timeout_ms", "must be positive");
        }
        if self.probe.connect_timeout_ms >= self.probe.request_timeout_ms {
            return invalid("probe.connect_timeout_ms", "must be shorter than the request timeout");
        }
        if self.probe.response_idle_timeout_ms == Some(0) {
            return invalid("probe.response_idle_timeout_ms", "must be positive");
        }
        if self.probe.max_body_bytes == 0 {
            return invalid("probe.max_body_bytes", "must be positive");
        }
        if self.probe.host_hot_threshold == 0 {
            return invalid("probe.host_hot_threshold", "must be at least 1");
        }
        if self.probe.host_hot_window_ms == 0 {
            return invalid("probe.host_hot_window_ms", "must be positive");
        }

        Ok(())
    }
}
