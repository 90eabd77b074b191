use std::{collections::HashSet, path::Path};

use thiserror::Error;

use super::{
    wpa_cli::{quoted, NetworkTool, ToolError},
    Link,
};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

const SYS_CLASS_NET: &str = "/sys/class/net";
const MAX_ADAPTER_LEN: usize = 15;
const MAX_SSID_BYTES: usize = 32;
const MIN_PASSPHRASE_LEN: usize = 8;
const MAX_PASSPHRASE_LEN: usize = 63;
const RAW_PSK_HEX_LEN: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnectivityError {
    #[error("invalid adapter name {0:?}")]
    InvalidAdapter(String),
    #[error("refusing untrusted {field}: {reason}")]
    UntrustedInput {
        field: &'static str,
        reason: &'static str,
    },
}

/// Brings up the association between one adapter and one target SSID.
///
/// Holds no connection state of its own: every call re-queries the network
/// tool, so the OS configuration stays the only source of truth. Connectivity
/// failures are logged and reported as `false`, never as errors.
pub struct ConnectivityManager<T: NetworkTool> {
    tool: T,
    adapter: String,
    target_ssid: String,
    psk: String,
}

impl<T: NetworkTool> ConnectivityManager<T> {
    pub fn new(
        tool: T,
        adapter: impl Into<String>,
        target_ssid: impl Into<String>,
        psk: impl Into<String>,
    ) -> Result<Self, ConnectivityError> {
        let adapter = adapter.into();
        let target_ssid = target_ssid.into();
        let psk = psk.into();

        validate_adapter(&adapter)?;
        validate_ssid(&target_ssid)?;
        validate_psk(&psk)?;

        if let Some(known) = interface_names(Path::new(SYS_CLASS_NET)) {
            if !known.contains(&adapter) {
                log_warn!("Adapter {adapter} is not present under {SYS_CLASS_NET}");
            }
        }

        Ok(Self {
            tool,
            adapter,
            target_ssid,
            psk,
        })
    }

    /// Live association of the adapter; empty when unassociated or when the
    /// query itself fails.
    pub async fn current_ssid(&self) -> String {
        match self.tool.current_ssid(&self.adapter).await {
            Ok(ssid) => ssid,
            Err(err) => {
                log_warn!("Could not read association of {}: {err}", self.adapter);
                String::new()
            }
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.current_ssid().await == self.target_ssid
    }

    /// Id of the configured profile for `ssid`, if any.
    pub async fn find_profile(&self, ssid: &str) -> Result<Option<i32>, ToolError> {
        let profiles = self.tool.list_networks(&self.adapter).await?;
        Ok(profiles
            .into_iter()
            .find(|profile| profile.ssid == ssid)
            .map(|profile| profile.network_id))
    }

    /// Idempotent: when already associated with the target, the existing
    /// profile is found and re-enabled and nothing else changes.
    pub async fn ensure_connection(&self) -> bool {
        let Some(network_id) = self.target_profile().await else {
            return false;
        };

        let current = self.current_ssid().await;
        if !current.is_empty() && current != self.target_ssid {
            self.disable_other(&current).await;
        }

        match self.tool.enable_network(&self.adapter, network_id).await {
            Ok(()) => {
                log_debug!("Enabled network {network_id} ({})", self.target_ssid);
                true
            }
            Err(err) => {
                log_warn!(
                    "Could not enable network {network_id} ({}): {err}",
                    self.target_ssid
                );
                false
            }
        }
    }

    async fn target_profile(&self) -> Option<i32> {
        match self.find_profile(&self.target_ssid).await {
            Ok(Some(network_id)) => Some(network_id),
            Ok(None) => self.create_profile().await,
            Err(err) => {
                log_warn!("Could not list networks on {}: {err}", self.adapter);
                None
            }
        }
    }

    async fn create_profile(&self) -> Option<i32> {
        let network_id = match self.tool.add_network(&self.adapter).await {
            Ok(network_id) => network_id,
            Err(err) => {
                log_warn!("Could not add network on {}: {err}", self.adapter);
                return None;
            }
        };
        log_info!(
            "Created network {network_id} for {} on {}",
            self.target_ssid,
            self.adapter
        );

        if let Err(err) = self.configure(network_id).await {
            log_warn!("Could not configure network {network_id}: {err}");
            if let Err(err) = self.tool.remove_network(&self.adapter, network_id).await {
                log_warn!("Could not remove half-configured network {network_id}: {err}");
            }
            return None;
        }

        Some(network_id)
    }

    async fn configure(&self, network_id: i32) -> Result<(), ToolError> {
        self.tool
            .set_network(&self.adapter, network_id, "ssid", &quoted(&self.target_ssid))
            .await?;
        self.tool
            .set_network(&self.adapter, network_id, "psk", &psk_value(&self.psk))
            .await
    }

    async fn disable_other(&self, current: &str) {
        log_info!("Adapter {} is on {current}, disabling it", self.adapter);
        let outcome = match self.find_profile(current).await {
            Ok(Some(network_id)) => self.tool.disable_network(&self.adapter, network_id).await,
            Ok(None) => {
                log_debug!("No configured profile for {current}");
                return;
            }
            Err(err) => Err(err),
        };
        if let Err(err) = outcome {
            log_warn!("Could not disable network {current}: {err}");
        }
    }
}

impl<T: NetworkTool> Link for ConnectivityManager<T> {
    async fn is_connected(&self) -> bool {
        ConnectivityManager::is_connected(self).await
    }

    async fn ensure_connection(&self) -> bool {
        ConnectivityManager::ensure_connection(self).await
    }
}

fn validate_adapter(adapter: &str) -> Result<(), ConnectivityError> {
    let valid = !adapter.is_empty()
        && adapter.len() <= MAX_ADAPTER_LEN
        && !adapter.starts_with('-')
        && adapter
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid {
        Ok(())
    } else {
        Err(ConnectivityError::InvalidAdapter(adapter.to_string()))
    }
}

fn validate_ssid(ssid: &str) -> Result<(), ConnectivityError> {
    let untrusted = |reason| ConnectivityError::UntrustedInput {
        field: "ssid",
        reason,
    };
    if ssid.is_empty() || ssid.len() > MAX_SSID_BYTES {
        return Err(untrusted("must be 1 to 32 bytes"));
    }
    if has_forbidden_chars(ssid) {
        return Err(untrusted("contains a quote or control character"));
    }
    Ok(())
}

fn validate_psk(psk: &str) -> Result<(), ConnectivityError> {
    let untrusted = |reason| ConnectivityError::UntrustedInput {
        field: "psk",
        reason,
    };
    if has_forbidden_chars(psk) {
        return Err(untrusted("contains a quote or control character"));
    }
    if is_raw_psk(psk) {
        return Ok(());
    }
    let printable = psk.chars().all(|c| c.is_ascii() && !c.is_ascii_control());
    if !printable || !(MIN_PASSPHRASE_LEN..=MAX_PASSPHRASE_LEN).contains(&psk.len()) {
        return Err(untrusted(
            "must be 8 to 63 printable ASCII characters or 64 hex digits",
        ));
    }
    Ok(())
}

fn has_forbidden_chars(value: &str) -> bool {
    value.chars().any(|c| c == '"' || c.is_control())
}

fn is_raw_psk(psk: &str) -> bool {
    psk.len() == RAW_PSK_HEX_LEN && psk.chars().all(|c| c.is_ascii_hexdigit())
}

/// A 64 hex digit key goes to the supplicant unquoted; a passphrase is quoted.
fn psk_value(psk: &str) -> String {
    if is_raw_psk(psk) {
        psk.to_string()
    } else {
        quoted(psk)
    }
}

/// Interface names under `dir`, or `None` when the directory is unreadable
/// (non-Linux hosts, containers without sysfs).
fn interface_names(dir: &Path) -> Option<HashSet<String>> {
    let entries = std::fs::read_dir(dir).ok()?;
    Some(
        entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect(),
    )
}
