//! Configuration structures for ChatServe
//!
//! Configuration is layered: built-in defaults, then an optional YAML file,
//! then `CHATSERVE__`-prefixed environment variables (`__` separates nested
//! keys, e.g. `CHATSERVE__MODEL__PATH`).

use crate::error::{ChatServeError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Environment variable holding the configuration file path
pub const CONFIG_PATH_ENV: &str = "CHATSERVE_CONFIG";

/// Configuration file used when `CHATSERVE_CONFIG` is unset
pub const DEFAULT_CONFIG_PATH: &str = "configs/chatserve.yaml";

/// Top-level configuration for the ChatServe service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server binding address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Model artifacts and placement
    #[serde(default)]
    pub model: ModelConfig,

    /// Generation parameters
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Admission control
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Directory holding `config.json`, `tokenizer.json` and safetensors weights
    #[serde(default = "default_model_path")]
    pub path: PathBuf,

    /// Device placement preference
    #[serde(default)]
    pub device: DevicePreference,

    /// Numeric precision preference
    #[serde(default)]
    pub precision: PrecisionPreference,

    /// Use flash attention kernels (CUDA builds only)
    #[serde(default)]
    pub use_flash_attn: bool,
}

/// Device placement preference
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    /// First available accelerator, falling back to CPU
    #[default]
    Auto,

    /// Always run on CPU
    Cpu,

    /// First CUDA device
    Cuda,

    /// First Metal device
    Metal,
}

/// Numeric precision preference
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PrecisionPreference {
    /// F16 on accelerators, F32 on CPU
    #[default]
    Auto,

    /// Half precision
    F16,

    /// Brain float
    Bf16,

    /// Single precision
    F32,
}

/// Generation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Cap on newly generated tokens per request
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,

    /// Sampling temperature; `None` or zero selects greedy decoding
    #[serde(default)]
    pub temperature: Option<f64>,

    /// Nucleus sampling threshold
    #[serde(default)]
    pub top_p: Option<f64>,

    /// Sampling seed
    #[serde(default = "default_seed")]
    pub seed: u64,
}

/// Admission control configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum concurrent generations (0 = unlimited)
    #[serde(default)]
    pub max_concurrent_requests: usize,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error), overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Expose Prometheus metrics on `/metrics`
    #[serde(default = "default_metrics")]
    pub enable_metrics: bool,
}

/// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_model_path() -> PathBuf {
    PathBuf::from("/content/drive/MyDrive/gemma-2b")
}

fn default_max_new_tokens() -> usize {
    150
}

fn default_seed() -> u64 {
    299792458
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics() -> bool {
    true
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: default_model_path(),
            device: DevicePreference::default(),
            precision: PrecisionPreference::default(),
            use_flash_attn: false,
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: default_max_new_tokens(),
            temperature: None,
            top_p: None,
            seed: default_seed(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 0,
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            enable_metrics: default_metrics(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            model: ModelConfig::default(),
            generation: GenerationConfig::default(),
            limits: LimitsConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from an optional YAML file plus environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_sources(Some(path.as_ref()), false, Self::env_source())
    }

    /// Load configuration from a YAML file that must exist, ignoring the environment
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config = ::config::Config::builder()
            .add_source(::config::File::new(&path.to_string_lossy(), ::config::FileFormat::Yaml))
            .build()?;

        Self::finish(config)
    }

    /// Environment source for `CHATSERVE__*` overrides
    pub fn env_source() -> ::config::Environment {
        ::config::Environment::with_prefix("CHATSERVE")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
    }

    /// Build configuration from a file (optional unless `required`) and an environment source
    pub fn from_sources(
        path: Option<&Path>,
        required: bool,
        env: ::config::Environment,
    ) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                ::config::File::new(&path.to_string_lossy(), ::config::FileFormat::Yaml)
                    .required(required),
            );
        }

        let config = builder.add_source(env).build()?;
        Self::finish(config)
    }

    fn finish(config: ::config::Config) -> Result<Self> {
        let config: ServerConfig = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(ChatServeError::config("port must be non-zero"));
        }

        if self.generation.max_new_tokens == 0 {
            return Err(ChatServeError::config("generation.max_new_tokens must be positive"));
        }

        if let Some(temperature) = self.generation.temperature {
            if !temperature.is_finite() || temperature < 0.0 {
                return Err(ChatServeError::config(format!(
                    "generation.temperature must be non-negative, got {}",
                    temperature
                )));
            }
        }

        if let Some(top_p) = self.generation.top_p {
            if !(top_p > 0.0 && top_p <= 1.0) {
                return Err(ChatServeError::config(format!(
                    "generation.top_p must be in (0, 1], got {}",
                    top_p
                )));
            }
        }

        Ok(())
    }

    /// Get the listener address
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.bind_address, self.port)
            .parse()
            .map_err(|e| ChatServeError::config(format!("Invalid bind address: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn no_env() -> ::config::Environment {
        ServerConfig::env_source().source(Some(HashMap::new()))
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::from_sources(None, false, no_env()).unwrap();

        assert_eq!(config.port, 8000);
        assert_eq!(config.generation.max_new_tokens, 150);
        assert_eq!(config.generation.temperature, None);
        assert_eq!(config.model.device, DevicePreference::Auto);
        assert_eq!(config.model.precision, PrecisionPreference::Auto);
        assert_eq!(config.model.path, PathBuf::from("/content/drive/MyDrive/gemma-2b"));
        assert_eq!(config.limits.max_concurrent_requests, 0);
    }

    #[test]
    fn test_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "port: 9000\nmodel:\n  path: /models/gemma-2b\n  device: cpu\n  precision: bf16\ngeneration:\n  max_new_tokens: 32\n  temperature: 0.7\n"
        )
        .unwrap();

        let config = ServerConfig::from_file(file.path()).unwrap();

        assert_eq!(config.port, 9000);
        assert_eq!(config.model.path, PathBuf::from("/models/gemma-2b"));
        assert_eq!(config.model.device, DevicePreference::Cpu);
        assert_eq!(config.model.precision, PrecisionPreference::Bf16);
        assert_eq!(config.generation.max_new_tokens, 32);
        assert_eq!(config.generation.temperature, Some(0.7));
        assert_eq!(config.generation.seed, 299792458);
    }

    #[test]
    fn test_shipped_config_matches_defaults() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../configs/chatserve.yaml");
        let config = ServerConfig::from_file(path).unwrap();

        assert_eq!(config.port, 8000);
        assert_eq!(config.generation.max_new_tokens, 150);
        assert_eq!(config.generation.temperature, None);
        assert_eq!(config.model.device, DevicePreference::Auto);
    }

    #[test]
    fn test_env_overrides_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "port: 9000\n").unwrap();

        let env = HashMap::from([
            ("CHATSERVE__PORT".to_string(), "9100".to_string()),
            ("CHATSERVE__MODEL__PATH".to_string(), "/srv/model".to_string()),
        ]);

        let config = ServerConfig::from_sources(
            Some(file.path()),
            true,
            ServerConfig::env_source().source(Some(env)),
        )
        .unwrap();

        assert_eq!(config.port, 9100);
        assert_eq!(config.model.path, PathBuf::from("/srv/model"));
    }

    #[test]
    fn test_missing_optional_file() {
        let config =
            ServerConfig::from_sources(Some(Path::new("/nonexistent/chatserve.yaml")), false, no_env());
        assert!(config.is_ok());
    }

    #[test]
    fn test_config_validation_zero_tokens() {
        let mut config = ServerConfig::default();
        config.generation.max_new_tokens = 0;

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_top_p() {
        let mut config = ServerConfig::default();
        config.generation.top_p = Some(1.5);
        assert!(config.validate().is_err());

        config.generation.top_p = Some(0.9);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_socket_addr() {
        let config = ServerConfig::default();
        assert_eq!(config.socket_addr().unwrap().port(), 8000);
    }
}
