use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::models::SensorKind;

/// Environment variable consulted when no config path is given on the command line.
pub const CONFIG_ENV: &str = "TELEMETRY_RELAY_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub path: PathBuf,
    pub busy_timeout_ms: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("telemetry.db"),
            busy_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorSettings {
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
    /// Wait for one reply line per record before deleting it.
    pub await_ack: bool,
    pub ack_timeout_ms: u64,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            host: "169.254.72.1".into(),
            port: 65060,
            connect_timeout_ms: 5_000,
            await_ack: true,
            ack_timeout_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub sensor: SensorKind,
    pub idle_delay_ms: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            sensor: SensorKind::Lux,
            idle_delay_ms: 5_000,
        }
    }
}

/// Managed wireless link. Without this section the link is assumed up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WifiSettings {
    pub adapter: String,
    pub ssid: String,
    pub psk: String,
    #[serde(default = "default_tool_timeout_ms")]
    pub tool_timeout_ms: u64,
    #[serde(default = "default_wpa_cli")]
    pub wpa_cli: PathBuf,
    #[serde(default = "default_iwgetid")]
    pub iwgetid: PathBuf,
}

fn default_tool_timeout_ms() -> u64 {
    10_000
}

fn default_wpa_cli() -> PathBuf {
    PathBuf::from("wpa_cli")
}

fn default_iwgetid() -> PathBuf {
    PathBuf::from("iwgetid")
}

impl WifiSettings {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    pub store: StoreSettings,
    pub collector: CollectorSettings,
    pub sync: SyncSettings,
    pub wifi: Option<WifiSettings>,
}

impl RelaySettings {
    /// Reads settings from `path`, or returns the defaults when no path is
    /// given. A file that exists but does not parse is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let settings = match path {
            Some(path) => {
                let contents = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read settings from {}", path.display()))?;
                serde_json::from_str(&contents)
                    .with_context(|| format!("Failed to parse settings in {}", path.display()))?
            }
            None => Self::default(),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.collector.host.trim().is_empty() {
            bail!("collector.host must not be empty");
        }
        if self.collector.port == 0 {
            bail!("collector.port must not be 0");
        }
        if self.sync.idle_delay_ms == 0 {
            bail!("sync.idle_delay_ms must be greater than 0");
        }
        Ok(())
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.store.busy_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.collector.connect_timeout_ms)
    }

    /// `None` when the collector's reply is not awaited.
    pub fn ack_timeout(&self) -> Option<Duration> {
        self.collector
            .await_ack
            .then(|| Duration::from_millis(self.collector.ack_timeout_ms))
    }

    pub fn idle_delay(&self) -> Duration {
        Duration::from_millis(self.sync.idle_delay_ms)
    }
}

/// Config path from the first CLI argument, falling back to [`CONFIG_ENV`].
pub fn config_path(arg: Option<String>) -> Option<PathBuf> {
    arg.or_else(|| std::env::var(CONFIG_ENV).ok())
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_a_file() {
        let settings = RelaySettings::load(None).unwrap();
        assert_eq!(settings, RelaySettings::default());
        assert_eq!(settings.collector.port, 65060);
        assert_eq!(settings.idle_delay(), Duration::from_secs(5));
        assert_eq!(settings.ack_timeout(), Some(Duration::from_secs(1)));
        assert!(settings.wifi.is_none());
    }

    #[test]
    fn partial_file_keeps_remaining_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.json");
        fs::write(
            &path,
            r#"{
                "collector": { "host": "10.0.0.2", "await_ack": false },
                "wifi": { "adapter": "wlan0", "ssid": "field-ap", "psk": "correct horse" }
            }"#,
        )
        .unwrap();

        let settings = RelaySettings::load(Some(&path)).unwrap();
        assert_eq!(settings.collector.host, "10.0.0.2");
        assert_eq!(settings.collector.port, 65060);
        assert_eq!(settings.ack_timeout(), None);
        assert_eq!(settings.store, StoreSettings::default());

        let wifi = settings.wifi.unwrap();
        assert_eq!(wifi.tool_timeout(), Duration::from_secs(10));
        assert_eq!(wifi.wpa_cli, PathBuf::from("wpa_cli"));
    }

    #[test]
    fn unparsable_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(RelaySettings::load(Some(&path)).is_err());
        assert!(RelaySettings::load(Some(&dir.path().join("absent.json"))).is_err());
    }

    #[test]
    fn rejects_unusable_values() {
        let mut settings = RelaySettings::default();
        settings.collector.port = 0;
        assert!(settings.validate().is_err());

        let mut settings = RelaySettings::default();
        settings.sync.idle_delay_ms = 0;
        assert!(settings.validate().is_err());

        let mut settings = RelaySettings::default();
        settings.collector.host = "  ".into();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn cli_argument_wins_over_environment() {
        assert_eq!(
            config_path(Some("relay.json".into())),
            Some(PathBuf::from("relay.json"))
        );
    }
}
