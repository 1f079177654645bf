//! pario configuration

use serde::{Deserialize, Serialize};

use crate::storage::IoFormat;

/// Default configuration constants
///
/// The buffer capacities are deployment tuning knobs, not correctness
/// contracts; these are the values used when a config file leaves them out.
pub mod defaults {
    use crate::constants;

    /// Backend aggregation buffer attached to collective-buffered files: 10MB
    pub const BUFFER_SIZE_LIMIT: usize = constants::DEFAULT_BUFFER_SIZE_LIMIT;

    /// Variables held by one buffer node before the chain grows
    pub const MAX_VARS_PER_BUFFER: usize = constants::DEFAULT_MAX_VARS_PER_BUFFER;

    /// Spare buffer nodes created with the pool
    pub const POOL_PREALLOCATE: usize = constants::DEFAULT_POOL_PREALLOCATE;

    /// Default log level
    pub const fn default_log_level() -> &'static str {
        "info"
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PioConfig {
    /// Write buffering
    #[serde(default)]
    pub buffer: BufferConfig,

    /// Available storage backends
    #[serde(default)]
    pub backends: BackendConfig,

    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Buffer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Size in bytes of the aggregation buffer attached to
    /// collective-buffered files (default: 10MB)
    #[serde(default = "default_buffer_size_limit")]
    pub buffer_size_limit: usize,

    /// Capacity of one buffer node in variables (default: 64)
    #[serde(default = "default_max_vars_per_buffer")]
    pub max_vars_per_buffer: usize,

    /// Spare nodes created up front (default: 4)
    #[serde(default = "default_pool_preallocate")]
    pub pool_preallocate: usize,
}

fn default_buffer_size_limit() -> usize {
    defaults::BUFFER_SIZE_LIMIT
}

fn default_max_vars_per_buffer() -> usize {
    defaults::MAX_VARS_PER_BUFFER
}

fn default_pool_preallocate() -> usize {
    defaults::POOL_PREALLOCATE
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            buffer_size_limit: default_buffer_size_limit(),
            max_vars_per_buffer: default_max_vars_per_buffer(),
            pool_preallocate: default_pool_preallocate(),
        }
    }
}

/// Backend capability configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Formats that may be used; others report an unsupported format
    #[serde(default = "default_enabled")]
    pub enabled: Vec<IoFormat>,
}

fn default_enabled() -> Vec<IoFormat> {
    IoFormat::ALL.to_vec()
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    defaults::default_log_level().to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl PioConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("Failed to read config file: {}", e)))?;
        let config: PioConfig = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseError(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file(&self, path: &str) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self).map_err(|e| {
            ConfigError::SerializeError(format!("Failed to serialize config: {}", e))
        })?;
        std::fs::write(path, contents)
            .map_err(|e| ConfigError::WriteError(format!("Failed to write config file: {}", e)))?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer.buffer_size_limit == 0 {
            return Err(ConfigError::ValidationError(
                "Buffer size limit must be positive".to_string(),
            ));
        }

        let max_vars = self.buffer.max_vars_per_buffer;
        if max_vars == 0 || max_vars > crate::constants::MAX_VARS_PER_BUFFER_LIMIT {
            return Err(ConfigError::ValidationError(format!(
                "max_vars_per_buffer must be between 1 and {}",
                crate::constants::MAX_VARS_PER_BUFFER_LIMIT
            )));
        }

        if self.backends.enabled.is_empty() {
            return Err(ConfigError::ValidationError(
                "At least one backend must be enabled".to_string(),
            ));
        }

        match self.logging.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}",
                    self.logging.log_level
                )));
            }
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to serialize config: {0}")]
    SerializeError(String),

    #[error("Failed to write config: {0}")]
    WriteError(String),

    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PioConfig::default();
        assert_eq!(config.buffer.buffer_size_limit, 10 * 1024 * 1024);
        assert_eq!(config.buffer.max_vars_per_buffer, 64);
        assert_eq!(config.backends.enabled.len(), 4);
        assert_eq!(config.logging.log_level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = PioConfig::default();

        config.buffer.buffer_size_limit = 0;
        assert!(config.validate().is_err());
        config.buffer.buffer_size_limit = 1024;

        config.buffer.max_vars_per_buffer = 0;
        assert!(config.validate().is_err());
        config.buffer.max_vars_per_buffer = 65537;
        assert!(config.validate().is_err());
        config.buffer.max_vars_per_buffer = 8;

        config.backends.enabled.clear();
        assert!(config.validate().is_err());
        config.backends.enabled.push(IoFormat::Classic);

        config.logging.log_level = "invalid".to_string();
        assert!(config.validate().is_err());
        config.logging.log_level = "debug".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: PioConfig = toml::from_str(
            r#"
            [backends]
            enabled = ["classic", "collective-buffered"]
            "#,
        )
        .unwrap();
        assert_eq!(
            config.backends.enabled,
            vec![IoFormat::Classic, IoFormat::CollectiveBuffered]
        );
        assert_eq!(config.buffer, BufferConfig::default());
        assert!(toml::from_str::<PioConfig>("[backends]\nenabled = [\"hdf5\"]").is_err());
    }

    #[test]
    fn test_config_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pario.toml");
        let path = path.to_str().unwrap();

        let mut config = PioConfig::default();
        config.buffer.max_vars_per_buffer = 3;
        config.to_file(path).unwrap();
        assert_eq!(PioConfig::from_file(path).unwrap(), config);

        std::fs::write(path, "[buffer]\nbuffer_size_limit = 0\n").unwrap();
        assert!(matches!(
            PioConfig::from_file(path),
            Err(ConfigError::ValidationError(_))
        ));
        assert!(matches!(
            PioConfig::from_file("/nonexistent/pario.toml"),
            Err(ConfigError::ReadError(_))
        ));
    }
}
