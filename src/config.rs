//! Configuration System
//!
//! Hierarchical configuration loading from:
//! - entwine.toml (default configuration)
//! - entwine.local.toml (git-ignored local overrides)
//! - Environment variables (ENTWINE_* prefix)
//!
//! ## Example
//!
//! ```toml
//! # entwine.toml
//! [inference]
//! iters = 20
//! timeout_secs = 120
//! verbose = true
//!
//! [logging]
//! level = "debug"
//! ```
//!
//! Environment variable overrides:
//! ```bash
//! ENTWINE_INFERENCE__ITERS=50
//! ENTWINE_LOGGING__LEVEL=trace
//! ```

use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::inference::InferenceConfig;

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub inference: InferenceSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Inference driver settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceSettings {
    /// Number of full Gibbs sweeps
    #[serde(default = "default_iters")]
    pub iters: usize,

    /// Wall-clock budget in seconds (0 = no timeout)
    #[serde(default)]
    pub timeout_secs: u64,

    /// Report the model score after every sweep
    #[serde(default)]
    pub verbose: bool,

    /// Latent-parameter sub-steps per cluster per hyperparameter pass
    #[serde(default = "default_theta_steps")]
    pub num_theta_steps: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_iters() -> usize {
    10
}
fn default_theta_steps() -> usize {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for InferenceSettings {
    fn default() -> Self {
        InferenceSettings {
            iters: default_iters(),
            timeout_secs: 0,
            verbose: false,
            num_theta_steps: default_theta_steps(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Merges in order:
    /// 1. entwine.toml (base configuration)
    /// 2. entwine.local.toml (local overrides, git-ignored)
    /// 3. Environment variables (ENTWINE_* prefix)
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file("entwine.toml"))
            .merge(Toml::file("entwine.local.toml"))
            .merge(Env::prefixed("ENTWINE_").split("__"))
            .extract()
    }

    /// Load configuration from a specific file path
    pub fn from_file(path: &str) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("ENTWINE_").split("__"))
            .extract()
    }
}

impl InferenceSettings {
    pub fn to_inference_config(&self) -> InferenceConfig {
        InferenceConfig {
            iters: self.iters,
            timeout: (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs)),
            verbose: self.verbose,
            num_theta_steps: self.num_theta_steps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.inference.iters, 10);
        assert_eq!(config.inference.timeout_secs, 0);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        assert!(toml_str.contains("[inference]"));
        assert!(toml_str.contains("[logging]"));
    }

    #[test]
    fn test_to_inference_config() {
        let mut settings = InferenceSettings::default();
        settings.timeout_secs = 30;
        let config = settings.to_inference_config();
        assert_eq!(config.timeout, Some(Duration::from_secs(30)));

        settings.timeout_secs = 0;
        assert_eq!(settings.to_inference_config().timeout, None);
    }
}
