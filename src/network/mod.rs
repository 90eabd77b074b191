//! Wireless uplink management.
//!
//! The sync engine only sees the [`Link`] predicate. On Linux the link is a
//! [`ConnectivityManager`] driving `wpa_cli`; deployments without a managed
//! wireless interface use [`AlwaysConnected`].

use std::future::Future;

pub mod manager;
pub mod wpa_cli;

pub use manager::{ConnectivityError, ConnectivityManager};
pub use wpa_cli::{NetworkProfile, NetworkTool, ToolError, WpaCli};

pub trait Link: Send + Sync {
    /// Re-queries the system; nothing is cached between calls.
    fn is_connected(&self) -> impl Future<Output = bool> + Send;

    /// Attempts to bring the link up. Returns false on any failure; callers
    /// retry on their own schedule.
    fn ensure_connection(&self) -> impl Future<Output = bool> + Send;
}

/// Link for wired or unmanaged setups.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysConnected;

impl Link for AlwaysConnected {
    async fn is_connected(&self) -> bool {
        true
    }

    async fn ensure_connection(&self) -> bool {
        true
    }
}
