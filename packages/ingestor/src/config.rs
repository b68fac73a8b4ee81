//! Application configuration
//!
//! Layered with the `config` crate: built-in defaults, then `ingestor.toml`
//! (or an explicit file), then `INGESTOR__SECTION__KEY` environment variables.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::bytecode::{IpcConfig, INITIAL_BACKOFF_MS, MAX_BACKOFF_MS, MAX_RECONNECT_ATTEMPTS, REQUEST_TIMEOUT_MS};
use crate::contract::DEFAULT_RESCORE_INTERVAL;
use crate::pipeline::DEFAULT_CONTRACT_CACHE_CAPACITY;
use crate::publisher::DEFAULT_CHANNEL;
use crate::queue::{DEFAULT_POP_TIMEOUT_SECS, DEFAULT_QUEUE_KEY};

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "INGESTOR_CONFIG";

/// Config file looked up in the working directory when none is given
pub const DEFAULT_CONFIG_NAME: &str = "ingestor";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Network tag stamped onto records that arrive without one
    pub network: String,
    pub redis: RedisConfig,
    pub pipeline: PipelineSettings,
    pub classifier: ClassifierConfig,
    pub bytecode: BytecodeConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    /// List the queue consumer pops transactions from
    pub transaction_queue: String,
    /// Pub/sub channel graph updates are published to
    pub graph_channel: String,
    pub pop_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub workers: usize,
    pub channel_capacity: usize,
    /// Contract classifications kept in memory between batches
    pub contract_cache_capacity: usize,
}

impl PipelineSettings {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Full contract re-scoring every N interactions
    pub rescore_interval: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BytecodeConfig {
    pub enabled: bool,
    /// Socket path; the default locations are probed when unset
    #[serde(default)]
    pub ipc_path: Option<String>,
    pub max_reconnect_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub timeout_ms: u64,
}

impl BytecodeConfig {
    pub fn ipc_config(&self, socket_path: String) -> IpcConfig {
        IpcConfig {
            socket_path,
            max_reconnect_attempts: self.max_reconnect_attempts,
            initial_backoff_ms: self.initial_backoff_ms,
            max_backoff_ms: self.max_backoff_ms,
            timeout_ms: self.timeout_ms,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Optional JSON registry seed merged over the built-in registry
    #[serde(default)]
    pub seed_path: Option<PathBuf>,
}

impl AppConfig {
    /// Load configuration
    ///
    /// An explicit `path` (or `INGESTOR_CONFIG`) must exist; otherwise
    /// `ingestor.toml` in the working directory is optional.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from));

        let file = match explicit {
            Some(path) => File::new(&path.to_string_lossy(), FileFormat::Toml).required(true),
            None => File::with_name(DEFAULT_CONFIG_NAME).required(false),
        };

        let config = Self::defaults()?
            .add_source(file)
            .add_source(
                Environment::with_prefix("INGESTOR")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let app_config: AppConfig = config.try_deserialize()?;
        app_config.validate()?;
        Ok(app_config)
    }

    fn defaults() -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        Config::builder()
            .set_default("network", "ethereum")?
            .set_default("redis.url", "redis://127.0.0.1:6379")?
            .set_default("redis.transaction_queue", DEFAULT_QUEUE_KEY)?
            .set_default("redis.graph_channel", DEFAULT_CHANNEL)?
            .set_default("redis.pop_timeout_secs", DEFAULT_POP_TIMEOUT_SECS)?
            .set_default("pipeline.batch_size", 100)?
            .set_default("pipeline.flush_interval_ms", 5000)?
            .set_default("pipeline.workers", 4)?
            .set_default("pipeline.channel_capacity", 1024)?
            .set_default("pipeline.contract_cache_capacity", DEFAULT_CONTRACT_CACHE_CAPACITY as u64)?
            .set_default("classifier.rescore_interval", DEFAULT_RESCORE_INTERVAL)?
            .set_default("bytecode.enabled", false)?
            .set_default("bytecode.max_reconnect_attempts", MAX_RECONNECT_ATTEMPTS as u64)?
            .set_default("bytecode.initial_backoff_ms", INITIAL_BACKOFF_MS)?
            .set_default("bytecode.max_backoff_ms", MAX_BACKOFF_MS)?
            .set_default("bytecode.timeout_ms", REQUEST_TIMEOUT_MS)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("pipeline.batch_size", self.pipeline.batch_size as u64),
            ("pipeline.workers", self.pipeline.workers as u64),
            ("pipeline.flush_interval_ms", self.pipeline.flush_interval_ms),
            ("pipeline.channel_capacity", self.pipeline.channel_capacity as u64),
            ("pipeline.contract_cache_capacity", self.pipeline.contract_cache_capacity as u64),
            ("classifier.rescore_interval", self.classifier.rescore_interval),
        ];
        for (key, value) in checks {
            if value == 0 {
                return Err(ConfigError::Message(format!("{key} must be greater than zero")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio_test::{assert_err, assert_ok};

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_without_file() {
        let config = AppConfig::defaults()
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize::<AppConfig>()
            .unwrap();

        assert_eq!(config.network, "ethereum");
        assert_eq!(config.pipeline.flush_interval(), Duration::from_secs(5));
        assert_eq!(config.classifier.rescore_interval, 100);
        assert_eq!(config.pipeline.contract_cache_capacity, DEFAULT_CONTRACT_CACHE_CAPACITY);
        assert_eq!(config.redis.transaction_queue, DEFAULT_QUEUE_KEY);
        assert!(!config.bytecode.enabled);
        assert!(config.registry.seed_path.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let file = write_config(
            r#"
network = "arbitrum"

[pipeline]
batch_size = 25
workers = 2

[bytecode]
enabled = true
ipc_path = "/tmp/node.ipc"

[registry]
seed_path = "registry.json"
"#,
        );

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.network, "arbitrum");
        assert_eq!(config.pipeline.batch_size, 25);
        assert_eq!(config.pipeline.workers, 2);
        assert_eq!(config.pipeline.flush_interval_ms, 5000);
        assert!(config.bytecode.enabled);
        assert_eq!(config.bytecode.ipc_path.as_deref(), Some("/tmp/node.ipc"));
        assert_eq!(config.registry.seed_path, Some(PathBuf::from("registry.json")));
    }

    #[test]
    fn test_zero_batch_size_is_rejected() {
        let file = write_config("[pipeline]\nbatch_size = 0\n");
        let err = AppConfig::load(Some(file.path())).unwrap_err();
        assert!(err.to_string().contains("pipeline.batch_size"));
    }

    #[test]
    fn test_zero_rescore_interval_is_rejected() {
        let file = write_config("[classifier]\nrescore_interval = 0\n");
        assert_err!(AppConfig::load(Some(file.path())));
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        assert_err!(AppConfig::load(Some(Path::new("/nonexistent/ingestor.toml"))));
    }

    #[test]
    fn test_ipc_config_from_settings() {
        let file = write_config("[bytecode]\ntimeout_ms = 250\n");
        let config = assert_ok!(AppConfig::load(Some(file.path())));
        let ipc = config.bytecode.ipc_config("/tmp/anvil.ipc".to_string());
        assert_eq!(ipc.timeout_ms, 250);
        assert_eq!(ipc.max_reconnect_attempts, MAX_RECONNECT_ATTEMPTS);
    }
}
