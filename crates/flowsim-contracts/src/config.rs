//! Preview configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FlowsimError, FlowsimResult};

/// Number of aggregated flows a caller is sized to receive.
pub const DEFAULT_RESULT_CHANNEL_CAPACITY: usize = 1000;

/// Settings recognised by the calculator and the pipeline.
///
/// Every field has a default, so an empty TOML document is valid.
///
/// ```rust,ignore
/// use flowsim_contracts::config::PreviewConfig;
///
/// let cfg = PreviewConfig::from_toml_str("calculate_original_action = true")?;
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewConfig {
    /// Always report the recalculated "before" result, even when it disagrees
    /// with the logged outcome.
    pub calculate_original_action: bool,

    /// Treat a missing IP on a managed endpoint as uncertain for CIDR
    /// matches instead of a non-match.
    pub calico_endpoint_net_match_always: bool,

    pub result_channel_capacity: usize,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            calculate_original_action: false,
            calico_endpoint_net_match_always: false,
            result_channel_capacity: DEFAULT_RESULT_CHANNEL_CAPACITY,
        }
    }
}

impl PreviewConfig {
    /// The error channel only ever carries the single terminal error.
    pub const ERROR_CHANNEL_CAPACITY: usize = 1;

    /// Parse `s` as TOML.
    ///
    /// Returns `FlowsimError::ConfigError` if the TOML is malformed or the
    /// result channel capacity is zero.
    pub fn from_toml_str(s: &str) -> FlowsimResult<Self> {
        let config: PreviewConfig = toml::from_str(s).map_err(|e| FlowsimError::ConfigError {
            reason: format!("failed to parse preview config TOML: {}", e),
        })?;
        if config.result_channel_capacity == 0 {
            return Err(FlowsimError::ConfigError {
                reason: "result_channel_capacity must be at least 1".to_string(),
            });
        }
        Ok(config)
    }

    /// Read the file at `path` and parse it as TOML.
    pub fn from_file(path: &Path) -> FlowsimResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| FlowsimError::ConfigError {
            reason: format!("failed to read config file '{}': {}", path.display(), e),
        })?;
        Self::from_toml_str(&contents)
    }
}
