//! Configuration for the orchestration core.
//!
//! Every tunable lives in an explicit struct: one [`BackendConfig`] per
//! remote inference backend plus scheduler, hub and telemetry settings.
//! Configuration is loaded from YAML and/or `GENCORE_*` environment
//! variables and validated before anything starts, so invalid setups fail
//! at initialization instead of at first use.
//!
//! Backend configs are held by a [`BackendRegistry`] as `Arc` snapshots that
//! are swapped atomically on update. A call in progress keeps the snapshot it
//! read; the next attempt picks up the replacement.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::inference::BackendHealth;

/// Name used for the backend created from environment variables alone.
pub const DEFAULT_BACKEND: &str = "default";

/// Serde adapter storing a `Duration` as integer milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

/// Per-backend call policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL of the inference service, e.g. `http://gpu-a:8080`.
    pub base_url: String,
    /// Optional bearer token sent with every request.
    pub api_key: Option<String>,
    /// Overall deadline for a single attempt.
    #[serde(rename = "request_timeout_ms", with = "duration_ms")]
    pub request_timeout: Duration,
    /// Deadline for establishing a connection.
    #[serde(rename = "connect_timeout_ms", with = "duration_ms")]
    pub connect_timeout: Duration,
    /// Time-to-first-byte deadline: sending the request and receiving the
    /// response headers, including the backend's processing time.
    #[serde(rename = "write_timeout_ms", with = "duration_ms")]
    pub write_timeout: Duration,
    /// Deadline for reading the response body.
    #[serde(rename = "read_timeout_ms", with = "duration_ms")]
    pub read_timeout: Duration,
    /// Synchronous attempts before handing off to the local retry queue.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    #[serde(rename = "backoff_base_ms", with = "duration_ms")]
    pub backoff_base: Duration,
    /// Multiplier applied per additional attempt.
    pub backoff_factor: f64,
    /// Upper bound on any single backoff delay.
    #[serde(rename = "backoff_max_ms", with = "duration_ms")]
    pub backoff_max: Duration,
    /// Replays allowed in the local retry queue. Zero disables hand-off.
    pub local_queue_max_retries: u32,
    /// Delay before the first local replay.
    #[serde(rename = "local_queue_retry_delay_ms", with = "duration_ms")]
    pub local_queue_retry_delay: Duration,
    /// Consecutive failures before the backend is considered unhealthy.
    pub failure_threshold: u32,
    /// Consecutive failures before the backend is considered offline.
    pub offline_threshold: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            api_key: None,
            request_timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(120),
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            backoff_factor: 2.0,
            backoff_max: Duration::from_secs(30),
            local_queue_max_retries: 5,
            local_queue_retry_delay: Duration::from_secs(10),
            failure_threshold: 3,
            offline_threshold: 10,
        }
    }
}

impl BackendConfig {
    /// Creates a backend config pointing at `base_url` with default policy.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    /// Sets the number of synchronous attempts.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the backoff base, factor and cap.
    pub fn with_backoff(mut self, base: Duration, factor: f64, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_factor = factor;
        self.backoff_max = max;
        self
    }

    /// Sets the local retry queue ceiling and first replay delay.
    pub fn with_local_queue(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.local_queue_max_retries = max_retries;
        self.local_queue_retry_delay = retry_delay;
        self
    }

    /// Sets all four timeouts at once.
    pub fn with_timeouts(
        mut self,
        connect: Duration,
        write: Duration,
        read: Duration,
        request: Duration,
    ) -> Self {
        self.connect_timeout = connect;
        self.write_timeout = write;
        self.read_timeout = read;
        self.request_timeout = request;
        self
    }

    /// Sets the health downgrade thresholds.
    pub fn with_health_thresholds(mut self, unhealthy: u32, offline: u32) -> Self {
        self.failure_threshold = unhealthy;
        self.offline_threshold = offline;
        self
    }

    /// Sets the bearer token.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Classifies a run of consecutive failures.
    pub fn classify_failures(&self, consecutive_failures: u32) -> BackendHealth {
        if consecutive_failures == 0 {
            BackendHealth::Healthy
        } else if consecutive_failures >= self.offline_threshold {
            BackendHealth::Offline
        } else if consecutive_failures >= self.failure_threshold {
            BackendHealth::Unhealthy
        } else {
            BackendHealth::Degraded
        }
    }

    /// Validates the backend policy.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` naming the backend and field.
    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        let fail = |msg: &str| Err(ConfigError::ValidationFailed(format!("backend '{}': {}", name, msg)));

        if name.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "backend name cannot be empty".to_string(),
            ));
        }

        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return fail("base_url must start with http:// or https://");
        }

        for (field, value) in [
            ("request_timeout", self.request_timeout),
            ("connect_timeout", self.connect_timeout),
            ("write_timeout", self.write_timeout),
            ("read_timeout", self.read_timeout),
        ] {
            if value.is_zero() {
                return fail(&format!("{} must be greater than 0", field));
            }
        }

        if self.max_attempts == 0 {
            return fail("max_attempts must be at least 1");
        }

        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return fail("backoff_factor must be a finite number >= 1.0");
        }

        if self.backoff_max < self.backoff_base {
            return fail("backoff_max cannot be smaller than backoff_base");
        }

        if self.local_queue_max_retries > 0 && self.local_queue_retry_delay.is_zero() {
            return fail("local_queue_retry_delay must be greater than 0 when retries are enabled");
        }

        if self.failure_threshold == 0 {
            return fail("failure_threshold must be at least 1");
        }

        if self.offline_threshold < self.failure_threshold {
            return fail("offline_threshold cannot be smaller than failure_threshold");
        }

        Ok(())
    }
}

/// Scheduler policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Retry-after hint for the first degradation of a job.
    #[serde(rename = "degraded_base_delay_ms", with = "duration_ms")]
    pub degraded_base_delay: Duration,
    /// Multiplier per consecutive degradation.
    pub degraded_backoff_factor: f64,
    /// Cap on the retry-after hint.
    #[serde(rename = "degraded_max_delay_ms", with = "duration_ms")]
    pub degraded_max_delay: Duration,
    /// When set, a batch job waiting longer than this is dispatched ahead of
    /// interactive work. `None` keeps strict priority.
    #[serde(rename = "batch_max_wait_ms", with = "option_duration_ms")]
    pub batch_max_wait: Option<Duration>,
    /// Number of dispatch workers.
    pub worker_count: usize,
    /// Time allowed for workers to drain on shutdown.
    #[serde(rename = "shutdown_timeout_ms", with = "duration_ms")]
    pub shutdown_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            degraded_base_delay: Duration::from_secs(5),
            degraded_backoff_factor: 2.0,
            degraded_max_delay: Duration::from_secs(300),
            batch_max_wait: None,
            worker_count: 4,
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl SchedulerConfig {
    /// Validates the scheduler policy.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.degraded_base_delay.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "degraded_base_delay must be greater than 0".to_string(),
            ));
        }

        if !self.degraded_backoff_factor.is_finite() || self.degraded_backoff_factor < 1.0 {
            return Err(ConfigError::ValidationFailed(
                "degraded_backoff_factor must be a finite number >= 1.0".to_string(),
            ));
        }

        if self.degraded_max_delay < self.degraded_base_delay {
            return Err(ConfigError::ValidationFailed(
                "degraded_max_delay cannot be smaller than degraded_base_delay".to_string(),
            ));
        }

        if matches!(self.batch_max_wait, Some(wait) if wait.is_zero()) {
            return Err(ConfigError::ValidationFailed(
                "batch_max_wait must be greater than 0 when set".to_string(),
            ));
        }

        if self.worker_count == 0 {
            return Err(ConfigError::ValidationFailed(
                "worker_count must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Fan-out hub policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Events buffered per subscriber before it is disconnected.
    pub subscriber_buffer: usize,
    /// Subscriptions without a heartbeat for this long are expired.
    #[serde(rename = "heartbeat_timeout_ms", with = "duration_ms")]
    pub heartbeat_timeout: Duration,
    /// How often stale subscriptions are swept.
    #[serde(rename = "sweep_interval_ms", with = "duration_ms")]
    pub sweep_interval: Duration,
    /// How often a system snapshot is published.
    #[serde(rename = "snapshot_interval_ms", with = "duration_ms")]
    pub snapshot_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 256,
            heartbeat_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(15),
            snapshot_interval: Duration::from_secs(30),
        }
    }
}

impl HubConfig {
    /// Validates the hub policy.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.subscriber_buffer == 0 {
            return Err(ConfigError::ValidationFailed(
                "subscriber_buffer must be greater than 0".to_string(),
            ));
        }

        for (field, value) in [
            ("heartbeat_timeout", self.heartbeat_timeout),
            ("sweep_interval", self.sweep_interval),
            ("snapshot_interval", self.snapshot_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} must be greater than 0",
                    field
                )));
            }
        }

        Ok(())
    }
}

/// Telemetry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Samples kept per rolling window.
    pub window_size: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { window_size: 512 }
    }
}

/// Complete configuration of the orchestration core.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Remote inference backends keyed by name.
    pub backends: BTreeMap<String, BackendConfig>,
    pub scheduler: SchedulerConfig,
    pub hub: HubConfig,
    pub telemetry: TelemetryConfig,
}

impl OrchestratorConfig {
    /// Creates a configuration with a single backend.
    pub fn with_backend(name: impl Into<String>, backend: BackendConfig) -> Self {
        let mut config = Self::default();
        config.backends.insert(name.into(), backend);
        config
    }

    /// Parses configuration from a YAML document and validates it.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file, applies environment overrides
    /// and validates the result.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Self = serde_yaml::from_str(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Creates configuration from environment variables alone.
    ///
    /// # Environment Variables
    ///
    /// - `GENCORE_BACKEND_URL`: URL of the default backend (required)
    /// - `GENCORE_BACKEND_API_KEY`: bearer token for the default backend
    /// - `GENCORE_WORKER_COUNT`: dispatch workers (default: 4)
    /// - `GENCORE_BATCH_MAX_WAIT_MS`: batch aging threshold (default: unset)
    /// - `GENCORE_SUBSCRIBER_BUFFER`: per-subscriber buffer (default: 256)
    /// - `GENCORE_HEARTBEAT_TIMEOUT_MS`: heartbeat expiry (default: 60000)
    /// - `GENCORE_TELEMETRY_WINDOW`: rolling window size (default: 512)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing or invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        let url = std::env::var("GENCORE_BACKEND_URL")
            .map_err(|_| ConfigError::MissingEnvVar("GENCORE_BACKEND_URL".to_string()))?;

        let mut backend = BackendConfig::new(url);
        if let Ok(key) = std::env::var("GENCORE_BACKEND_API_KEY") {
            backend.api_key = Some(key);
        }

        let mut config = Self::with_backend(DEFAULT_BACKEND, backend);
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `GENCORE_*` overrides on top of the current values.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var("GENCORE_WORKER_COUNT") {
            self.scheduler.worker_count = parse_env_value(&val, "GENCORE_WORKER_COUNT")?;
        }

        if let Ok(val) = std::env::var("GENCORE_BATCH_MAX_WAIT_MS") {
            let ms: u64 = parse_env_value(&val, "GENCORE_BATCH_MAX_WAIT_MS")?;
            self.scheduler.batch_max_wait = Some(Duration::from_millis(ms));
        }

        if let Ok(val) = std::env::var("GENCORE_SUBSCRIBER_BUFFER") {
            self.hub.subscriber_buffer = parse_env_value(&val, "GENCORE_SUBSCRIBER_BUFFER")?;
        }

        if let Ok(val) = std::env::var("GENCORE_HEARTBEAT_TIMEOUT_MS") {
            let ms: u64 = parse_env_value(&val, "GENCORE_HEARTBEAT_TIMEOUT_MS")?;
            self.hub.heartbeat_timeout = Duration::from_millis(ms);
        }

        if let Ok(val) = std::env::var("GENCORE_TELEMETRY_WINDOW") {
            self.telemetry.window_size = parse_env_value(&val, "GENCORE_TELEMETRY_WINDOW")?;
        }

        Ok(())
    }

    /// Validates every section.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` for the first invalid value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backends.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "at least one backend must be configured".to_string(),
            ));
        }

        for (name, backend) in &self.backends {
            backend.validate(name)?;
        }

        self.scheduler.validate()?;
        self.hub.validate()?;

        if self.telemetry.window_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "telemetry window_size must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

fn parse_env_value<T: std::str::FromStr>(val: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    val.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

/// Named backend configs, hot-swappable without restart.
#[derive(Debug, Default)]
pub struct BackendRegistry {
    backends: RwLock<HashMap<String, Arc<BackendConfig>>>,
}

impl BackendRegistry {
    /// Builds a registry, validating every entry.
    pub fn new<I>(configs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, BackendConfig)>,
    {
        let mut backends = HashMap::new();
        for (name, config) in configs {
            config.validate(&name)?;
            backends.insert(name, Arc::new(config));
        }
        Ok(Self {
            backends: RwLock::new(backends),
        })
    }

    /// Returns the current config snapshot for a backend.
    pub fn get(&self, name: &str) -> Option<Arc<BackendConfig>> {
        self.backends
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Validates and atomically replaces (or adds) a backend config.
    ///
    /// Returns the previous snapshot, if any.
    pub fn update(
        &self,
        name: &str,
        config: BackendConfig,
    ) -> Result<Option<Arc<BackendConfig>>, ConfigError> {
        config.validate(name)?;
        let previous = self
            .backends
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), Arc::new(config));
        tracing::info!(backend = %name, replaced = previous.is_some(), "Backend configuration updated");
        Ok(previous)
    }

    /// Returns all backend names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .backends
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_with_backend_is_valid() {
        let config = OrchestratorConfig::with_backend("gpu-a", BackendConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_backends_rejected() {
        let config = OrchestratorConfig::default();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("at least one backend"));
    }

    #[test]
    fn test_backend_validation() {
        let bad_url = BackendConfig::new("gpu-a:8080");
        assert!(bad_url.validate("gpu-a").is_err());

        let zero_attempts = BackendConfig::default().with_max_attempts(0);
        assert!(zero_attempts.validate("gpu-a").is_err());

        let shrinking = BackendConfig::default().with_backoff(
            Duration::from_secs(1),
            0.5,
            Duration::from_secs(10),
        );
        assert!(shrinking.validate("gpu-a").is_err());

        let inverted_cap = BackendConfig::default().with_backoff(
            Duration::from_secs(10),
            2.0,
            Duration::from_secs(1),
        );
        assert!(inverted_cap.validate("gpu-a").is_err());

        let bad_thresholds = BackendConfig::default().with_health_thresholds(5, 2);
        assert!(bad_thresholds.validate("gpu-a").is_err());

        let zero_delay = BackendConfig::default().with_local_queue(3, Duration::ZERO);
        assert!(zero_delay.validate("gpu-a").is_err());

        // A zero retry ceiling needs no delay.
        let disabled = BackendConfig::default().with_local_queue(0, Duration::ZERO);
        assert!(disabled.validate("gpu-a").is_ok());
    }

    #[test]
    fn test_classify_failures() {
        let config = BackendConfig::default().with_health_thresholds(3, 6);
        assert_eq!(config.classify_failures(0), BackendHealth::Healthy);
        assert_eq!(config.classify_failures(1), BackendHealth::Degraded);
        assert_eq!(config.classify_failures(3), BackendHealth::Unhealthy);
        assert_eq!(config.classify_failures(5), BackendHealth::Unhealthy);
        assert_eq!(config.classify_failures(6), BackendHealth::Offline);
    }

    #[test]
    fn test_scheduler_validation() {
        let mut config = SchedulerConfig::default();
        assert!(config.validate().is_ok());

        config.worker_count = 0;
        assert!(config.validate().is_err());

        let config = SchedulerConfig {
            batch_max_wait: Some(Duration::ZERO),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_round_trip_uses_milliseconds() {
        let yaml = r#"
backends:
  gpu-a:
    base_url: "http://gpu-a:9000"
    max_attempts: 4
    backoff_base_ms: 250
    backoff_max_ms: 4000
    local_queue_max_retries: 2
    local_queue_retry_delay_ms: 1500
scheduler:
  worker_count: 2
  batch_max_wait_ms: 60000
hub:
  subscriber_buffer: 8
"#;
        let config = OrchestratorConfig::from_yaml_str(yaml).expect("valid yaml");
        let backend = &config.backends["gpu-a"];

        assert_eq!(backend.base_url, "http://gpu-a:9000");
        assert_eq!(backend.max_attempts, 4);
        assert_eq!(backend.backoff_base, Duration::from_millis(250));
        assert_eq!(backend.backoff_max, Duration::from_secs(4));
        assert_eq!(backend.local_queue_retry_delay, Duration::from_millis(1500));
        // Unspecified fields keep their defaults.
        assert_eq!(backend.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.scheduler.worker_count, 2);
        assert_eq!(
            config.scheduler.batch_max_wait,
            Some(Duration::from_secs(60))
        );
        assert_eq!(config.hub.subscriber_buffer, 8);
    }

    #[test]
    fn test_yaml_file_invalid_fails_fast() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            "backends:\n  gpu-a:\n    base_url: \"ftp://nope\"\n"
        )
        .expect("write");

        let result = OrchestratorConfig::from_yaml_file(file.path());
        assert!(matches!(result, Err(ConfigError::ValidationFailed(_))));
    }

    #[test]
    fn test_registry_hot_swap() {
        let registry = BackendRegistry::new(vec![(
            "gpu-a".to_string(),
            BackendConfig::default().with_max_attempts(2),
        )])
        .expect("valid registry");

        let before = registry.get("gpu-a").expect("backend present");
        assert_eq!(before.max_attempts, 2);

        let previous = registry
            .update("gpu-a", BackendConfig::default().with_max_attempts(5))
            .expect("valid update");
        assert_eq!(previous.map(|p| p.max_attempts), Some(2));

        // The old snapshot is untouched; new readers see the replacement.
        assert_eq!(before.max_attempts, 2);
        assert_eq!(registry.get("gpu-a").map(|c| c.max_attempts), Some(5));
    }

    #[test]
    fn test_registry_rejects_invalid_update() {
        let registry =
            BackendRegistry::new(vec![("gpu-a".to_string(), BackendConfig::default())])
                .expect("valid registry");

        let result = registry.update("gpu-a", BackendConfig::default().with_max_attempts(0));
        assert!(result.is_err());
        assert_eq!(registry.get("gpu-a").map(|c| c.max_attempts), Some(3));
        assert_eq!(registry.names(), vec!["gpu-a".to_string()]);
    }

    #[test]
    fn test_parse_env_value() {
        let parsed: usize = parse_env_value(" 8 ", "KEY").expect("parses");
        assert_eq!(parsed, 8);

        let err = parse_env_value::<usize>("eight", "KEY").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
