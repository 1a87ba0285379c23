//! Monitor configuration
//!
//! Handles:
//! - Serial port selection
//! - Cloud endpoint and automatic cloud test
//! - Transmission period and auto-start
//! - Per-channel vitals overrides
//!
//! Looked up in `MEDSIM_CONFIG`, then the OS config directory, then falls
//! back to built-in defaults.

use anyhow::{anyhow, bail, Context, Result};
use medsim_link::telemetry::validate_period;
use medsim_link::VitalsTable;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_ENV: &str = "MEDSIM_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub serial: SerialConfig,
    pub cloud: CloudConfig,
    pub telemetry: TelemetryConfig,
    /// Overrides keyed by channel id (`heartRate`, `spO2`, ...)
    pub vitals: BTreeMap<String, ChannelOverride>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    pub endpoint: String,
    /// Send TEST_CLOUD as soon as the device reports ready
    pub test_on_ready: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub interval_ms: u64,
    /// Start transmitting once the whole pathway is ready
    pub auto_start: bool,
    /// Randomise enabled channels before every transmission period
    pub randomize: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelOverride {
    pub enabled: Option<bool>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub current: Option<f64>,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            path: "/dev/ttyACM0".to_string(),
        }
    }
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            test_on_ready: true,
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            auto_start: false,
            randomize: false,
        }
    }
}

impl TelemetryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl MonitorConfig {
    /// Load from `MEDSIM_CONFIG` or the OS config location
    pub async fn load() -> Result<Self> {
        let path = match std::env::var_os(CONFIG_ENV) {
            Some(path) => PathBuf::from(path),
            None => match Self::config_file_path() {
                Ok(path) if path.exists() => path,
                _ => return Ok(Self::default()),
            },
        };
        Self::load_from(&path).await
    }

    pub async fn load_from(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: MonitorConfig = toml::from_str(&content)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Get OS-specific config file path
    pub fn config_file_path() -> Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow!("Could not find config directory"))?;

        path.push("medsim-monitor");
        path.push("config.toml");
        Ok(path)
    }

    pub fn validate(&self) -> Result<()> {
        if self.serial.path.trim().is_empty() {
            bail!("[serial] path must not be empty");
        }
        if self.cloud.test_on_ready && self.cloud.endpoint.trim().is_empty() {
            tracing::warn!("[cloud] test_on_ready is set but no endpoint is configured");
        }
        validate_period(self.telemetry.interval()).context("[telemetry] interval_ms")?;
        self.vitals_table()?;
        Ok(())
    }

    /// Default channel table with the configured overrides applied
    pub fn vitals_table(&self) -> Result<VitalsTable> {
        let mut table = VitalsTable::default();

        for (id, over) in &self.vitals {
            let channel = table
                .get(id)
                .ok_or_else(|| anyhow!("[vitals.{}] unknown channel", id))?;
            let min = over.min.unwrap_or(channel.min());
            let max = over.max.unwrap_or(channel.max());

            table
                .set_bounds(id, min, max)
                .with_context(|| format!("[vitals.{}]", id))?;
            if let Some(current) = over.current {
                table
                    .set_current(id, current)
                    .with_context(|| format!("[vitals.{}]", id))?;
            }
            if let Some(enabled) = over.enabled {
                table.set_enabled(id, enabled)?;
            }
        }

        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_config() {
        let config = MonitorConfig::default();
        assert_eq!(config.telemetry.interval_ms, 1000);
        assert!(config.cloud.test_on_ready);
        assert!(config.validate().is_ok());
        assert_eq!(config.vitals_table().unwrap(), VitalsTable::default());
    }

    #[test]
    fn test_config_file_path() {
        let path = MonitorConfig::config_file_path().unwrap();
        assert!(path.to_string_lossy().contains("medsim-monitor"));
        assert!(path.to_string_lossy().ends_with("config.toml"));
    }

    #[tokio::test]
    async fn test_load_partial_file() {
        let file = write_config(
            r#"
            [serial]
            path = "/dev/ttyUSB1"

            [cloud]
            endpoint = "broker.example.com"

            [telemetry]
            interval_ms = 500
            auto_start = true

            [vitals.glucose]
            enabled = true
            current = 250.0

            [vitals.heartRate]
            min = 50.0
            "#,
        );

        let config = MonitorConfig::load_from(file.path()).await.unwrap();
        assert_eq!(config.serial.path, "/dev/ttyUSB1");
        assert!(config.cloud.test_on_ready);
        assert_eq!(config.telemetry.interval(), Duration::from_millis(500));
        assert!(!config.telemetry.randomize);

        let table = config.vitals_table().unwrap();
        let glucose = table.get("glucose").unwrap();
        assert!(glucose.enabled());
        assert_eq!(glucose.current(), 140.0);
        assert_eq!(table.get("heartRate").unwrap().min(), 50.0);
    }

    #[tokio::test]
    async fn test_invalid_configs_rejected() {
        for content in [
            "[telemetry]\ninterval_ms = 150\n",
            "[serial]\npath = \"\"\n",
            "[vitals.pulse]\nenabled = true\n",
            "[vitals.spO2]\nmin = 99.0\nmax = 90.0\n",
            "[telemetry]\ninterval_ms = \"fast\"\n",
            "[vitals.heartRate]\ncurrent = nan\n",
        ] {
            let file = write_config(content);
            assert!(MonitorConfig::load_from(file.path()).await.is_err(), "{}", content);
        }
    }

    #[tokio::test]
    async fn test_infinite_bound_rejected() {
        let file = write_config("[telemetry]\nrandomize = true\n\n[vitals.heartRate]\nmax = inf\n");
        let err = MonitorConfig::load_from(file.path()).await.unwrap_err();
        let vitals_err = err.downcast_ref::<medsim_link::VitalsError>();
        assert_eq!(vitals_err, Some(&medsim_link::VitalsError::NotFinite));
    }

    #[tokio::test]
    async fn test_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = MonitorConfig::load_from(&dir.path().join("absent.toml")).await;
        assert!(result.is_err());
    }
}
