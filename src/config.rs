//! Configuration for the harvester.

use crate::protocol::ensure_loopback;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration. Read once at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Minutes between interval-driven prompts
    pub interval_minutes: u64,

    /// Whether the adaptive gate consults the decision service
    pub ml_enabled: bool,

    /// Minimum prediction confidence for the gate to act
    pub confidence_threshold: f64,

    /// Sampling tick
    #[serde(with = "duration_serde")]
    pub tick: Duration,

    /// How long a prompt waits for an answer
    #[serde(with = "duration_serde")]
    pub response_deadline: Duration,

    pub app_cache_ttl_ms: u64,
    pub idle_cache_ttl_ms: u64,

    /// Where YES/NO/SNAP datagrams arrive
    pub listen_addr: SocketAddr,

    /// Where SNAP is forwarded when a prompt is raised
    pub notify_addr: Option<SocketAddr>,

    /// Decision service endpoint
    pub inference_addr: SocketAddr,
    pub decision_timeout_ms: u64,

    /// The labeled CSV log
    pub log_path: PathBuf,

    /// Path for storing state and transparency logs
    pub data_path: PathBuf,

    pub services: ServicesConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interval_minutes: 5,
            ml_enabled: false,
            confidence_threshold: 0.98,
            tick: Duration::from_secs(1),
            response_deadline: Duration::from_secs(60),
            app_cache_ttl_ms: 500,
            idle_cache_ttl_ms: 100,
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 45001)),
            notify_addr: None,
            inference_addr: SocketAddr::from(([127, 0, 0, 1], 45002)),
            decision_timeout_ms: 250,
            log_path: std::env::temp_dir().join("HARVEST.CSV"),
            data_path: default_data_dir(),
            services: ServicesConfig::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("nudge-harvester")
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load from `path`, falling back to defaults when it does not exist.
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        let config = if path.exists() {
            let content =
                std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
            serde_json::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &std::path::Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::IoError(e.to_string()))?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("nudge-harvester")
            .join("config.json")
    }

    /// Check ranges and that every endpoint is local-only.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ConfigError::Invalid(format!(
                "confidence_threshold must be within [0, 1], got {}",
                self.confidence_threshold
            )));
        }
        if self.interval_minutes == 0 {
            return Err(ConfigError::Invalid(
                "interval_minutes must be at least 1".to_string(),
            ));
        }
        if self.tick.is_zero() {
            return Err(ConfigError::Invalid("tick must be non-zero".to_string()));
        }
        if self.response_deadline.is_zero() {
            return Err(ConfigError::Invalid(
                "response_deadline must be non-zero".to_string(),
            ));
        }

        let endpoints = [
            ("listen_addr", Some(self.listen_addr)),
            ("notify_addr", self.notify_addr),
            ("inference_addr", Some(self.inference_addr)),
            ("services.trainer_endpoint", self.services.trainer_endpoint),
        ];
        for (name, addr) in endpoints {
            if let Some(addr) = addr {
                ensure_loopback(addr)
                    .map_err(|e| ConfigError::Invalid(format!("{name}: {e}")))?;
            }
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes.saturating_mul(60))
    }

    pub fn app_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.app_cache_ttl_ms)
    }

    pub fn idle_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.idle_cache_ttl_ms)
    }

    pub fn decision_timeout(&self) -> Duration {
        Duration::from_millis(self.decision_timeout_ms)
    }

    /// Where session statistics are persisted.
    pub fn stats_path(&self) -> PathBuf {
        self.data_path.join("session_stats.json")
    }

    /// Ensure all required directories exist.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.data_path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        if let Some(parent) = self.log_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::IoError(e.to_string()))?;
        }
        Ok(())
    }
}

/// Launch settings for the auxiliary services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    /// Directory holding `model_inference.py` and `background_trainer.py`
    pub script_dir: PathBuf,
    pub python: PathBuf,
    pub model_dir: PathBuf,

    #[serde(with = "duration_serde")]
    pub grace_period: Duration,
    #[serde(with = "duration_serde")]
    pub health_interval: Duration,
    #[serde(with = "duration_serde")]
    pub stop_timeout: Duration,

    /// Probe endpoint for the trainer, if it exposes one
    pub trainer_endpoint: Option<SocketAddr>,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            script_dir: data_dir.join("scripts"),
            python: PathBuf::from("python3"),
            model_dir: data_dir.join("model"),
            grace_period: Duration::from_secs(10),
            health_interval: Duration::from_secs(15),
            stop_timeout: Duration::from_secs(5),
            trainer_endpoint: None,
        }
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    IoError(String),
    ParseError(String),
    SerializeError(String),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {e}"),
            ConfigError::ParseError(e) => write!(f, "Parse error: {e}"),
            ConfigError::SerializeError(e) => write!(f, "Serialize error: {e}"),
            ConfigError::Invalid(e) => write!(f, "Invalid configuration: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Serde support for Duration.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_config_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("nudge-config-{}", uuid::Uuid::new_v4()))
            .join("config.json")
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.interval(), Duration::from_secs(300));
        assert!(!config.ml_enabled);
        assert_eq!(config.confidence_threshold, 0.98);
        assert_eq!(config.listen_addr.port(), 45001);
        assert_eq!(config.inference_addr.port(), 45002);
        assert!(config.log_path.ends_with("HARVEST.CSV"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_threshold_range() {
        let mut config = Config::default();
        config.confidence_threshold = 1.0;
        assert!(config.validate().is_ok());
        config.confidence_threshold = 1.01;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        config.confidence_threshold = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_non_loopback_endpoints() {
        let mut config = Config::default();
        config.notify_addr = Some("10.0.0.2:45003".parse().unwrap());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("notify_addr"));

        let mut config = Config::default();
        config.services.trainer_endpoint = Some("0.0.0.0:9000".parse().unwrap());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let config = Config::load_from(&temp_config_path()).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let path = temp_config_path();
        let mut config = Config::default();
        config.interval_minutes = 2;
        config.ml_enabled = true;
        config.response_deadline = Duration::from_secs(30);
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, config);

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let path = temp_config_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, r#"{"ml_enabled": true, "tick": 2}"#).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert!(loaded.ml_enabled);
        assert_eq!(loaded.tick, Duration::from_secs(2));
        assert_eq!(loaded.interval_minutes, 5);

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
