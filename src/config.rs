use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;

use crate::core_types::{Amount, Volume};
use crate::error::PowerLineError;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    pub enable_tracing: bool,
    /// Node id given to the root position
    #[serde(default = "default_root_node_id")]
    pub root_node_id: String,
    #[serde(default)]
    pub placement: PlacementConfig,
    #[serde(default)]
    pub qualification: QualificationConfig,
    #[serde(default)]
    pub journal: JournalConfig,
    #[serde(default)]
    pub reporting: ReportingConfig,
}

fn default_root_node_id() -> String {
    "ROOT".to_string()
}

/// Placement bounds and retry policy
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct PlacementConfig {
    /// Tree size cap; `None` = unbounded
    pub max_nodes: Option<u64>,
    /// Deepest level a new node may occupy; `None` = unbounded
    pub max_depth: Option<u32>,
    /// Scan-and-claim attempts before `ConcurrentPlacementConflict`
    pub max_attempts: u32,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            max_nodes: None,
            max_depth: None,
            max_attempts: 16,
        }
    }
}

/// Binary cycle rule: `C`, `R` and the per-window cap
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct QualificationConfig {
    /// Matched volume consumed from each leg per cycle (`C`)
    pub cycle_volume: Volume,
    /// Commission paid per cycle (`R`)
    pub commission_per_cycle: Amount,
    /// Cycles granted per window; `None` = uncapped
    pub max_cycles_per_window: Option<u32>,
    /// Window length in seconds
    pub window_secs: u64,
}

impl Default for QualificationConfig {
    fn default() -> Self {
        Self {
            cycle_volume: 500,
            commission_per_cycle: 50,
            max_cycles_per_window: None,
            window_secs: 7 * 24 * 60 * 60,
        }
    }
}

impl QualificationConfig {
    pub fn validate(&self) -> Result<(), PowerLineError> {
        if self.cycle_volume == 0 {
            return Err(PowerLineError::InvalidConfig(
                "cycle_volume must be greater than zero".into(),
            ));
        }
        if self.max_cycles_per_window.is_some() && self.window_secs == 0 {
            return Err(PowerLineError::InvalidConfig(
                "window_secs must be greater than zero when a cycle cap is set".into(),
            ));
        }
        Ok(())
    }
}

/// Journal persistence
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct JournalConfig {
    pub enabled: bool,
    pub data_dir: String,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            data_dir: "./data/powerline".to_string(),
        }
    }
}

/// Thresholds used by the read-side queries
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ReportingConfig {
    /// Leg difference above which a spillover position "needs balancing"
    pub balancing_threshold: Volume,
    /// Default depth for subtree fragments
    pub default_tree_depth: u32,
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            balancing_threshold: 1000,
            default_tree_depth: 5,
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        let config: AppConfig =
            serde_yaml::from_str(&content).context("Failed to parse config yaml")?;
        config.qualification.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let yaml = r#"
log_level: info
log_dir: ./logs
log_file: powerline.log
use_json: false
rotation: daily
enable_tracing: false
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.root_node_id, "ROOT");
        assert_eq!(config.placement, PlacementConfig::default());
        assert_eq!(config.qualification.cycle_volume, 500);
        assert!(!config.journal.enabled);
        assert_eq!(config.reporting.balancing_threshold, 1000);
    }

    #[test]
    fn test_qualification_section() {
        let yaml = r#"
log_level: debug
log_dir: ./logs
log_file: powerline.log
use_json: true
rotation: never
enable_tracing: true
qualification:
  cycle_volume: 250
  commission_per_cycle: 25
  max_cycles_per_window: 10
  window_secs: 86400
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.qualification.cycle_volume, 250);
        assert_eq!(config.qualification.max_cycles_per_window, Some(10));
        assert!(config.qualification.validate().is_ok());
    }

    #[test]
    fn test_zero_cycle_volume_rejected() {
        let config = QualificationConfig {
            cycle_volume: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(PowerLineError::InvalidConfig(_))
        ));
    }
}
