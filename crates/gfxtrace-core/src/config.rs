use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Top-level configuration, loaded from gfxtrace.toml.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GfxtraceConfig {
    #[serde(default)]
    pub capture: CaptureSettings,
    #[serde(default)]
    pub replay: ReplaySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureSettings {
    /// Per-resource parameter updates recorded before diverting to
    /// wholesale refetch. Empirically tuned default; not load-bearing.
    #[serde(default = "default_parameter_threshold")]
    pub parameter_dirty_threshold: u32,
    /// Same policy for data uploads, which tolerate a higher count before
    /// the log-growth trade-off favors a snapshot.
    #[serde(default = "default_upload_threshold")]
    pub upload_dirty_threshold: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplaySettings {
    /// Validate every chunk's referenced IDs during the reading pass,
    /// before any driver call is issued.
    #[serde(default = "default_true")]
    pub validate_references: bool,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            parameter_dirty_threshold: default_parameter_threshold(),
            upload_dirty_threshold: default_upload_threshold(),
        }
    }
}

impl Default for ReplaySettings {
    fn default() -> Self {
        Self {
            validate_references: true,
        }
    }
}

impl GfxtraceConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| CoreError::Config(e.to_string()))
    }

    /// Load configuration from file if it exists, otherwise return defaults.
    pub fn load_or_default(path: &str) -> Self {
        Self::load(path).unwrap_or_default()
    }
}

fn default_parameter_threshold() -> u32 {
    12
}

fn default_upload_threshold() -> u32 {
    60
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_missing_sections() {
        let config: GfxtraceConfig = toml::from_str("").unwrap();
        assert_eq!(config.capture.parameter_dirty_threshold, 12);
        assert_eq!(config.capture.upload_dirty_threshold, 60);
        assert!(config.replay.validate_references);
    }

    #[test]
    fn thresholds_are_tunable() {
        let config: GfxtraceConfig = toml::from_str(
            "[capture]\nparameter_dirty_threshold = 4\n",
        )
        .unwrap();
        assert_eq!(config.capture.parameter_dirty_threshold, 4);
        assert_eq!(config.capture.upload_dirty_threshold, 60);
    }
}
