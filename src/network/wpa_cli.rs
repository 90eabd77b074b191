use std::{
    future::Future,
    io,
    path::{Path, PathBuf},
    process::{Output, Stdio},
    time::Duration,
};

use log::debug;
use thiserror::Error;
use tokio::process::Command;

const SUCCESS_TOKEN: &str = "OK";
const DEFAULT_WPA_CLI: &str = "wpa_cli";
const DEFAULT_IWGETID: &str = "iwgetid";

/// One row of `wpa_cli list_networks`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkProfile {
    pub network_id: i32,
    pub ssid: String,
    pub bssid: Option<String>,
    pub flags: Option<String>,
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("`{command}` did not finish within {timeout:?}")]
    Timeout { command: String, timeout: Duration },
    #[error("`{command}` answered {output:?}")]
    Rejected { command: String, output: String },
    #[error("`{command}` returned unparsable output {output:?}")]
    Unparsable { command: String, output: String },
}

/// Logical operations on the OS network configuration for one adapter.
pub trait NetworkTool: Send + Sync {
    fn list_networks(
        &self,
        adapter: &str,
    ) -> impl Future<Output = Result<Vec<NetworkProfile>, ToolError>> + Send;

    /// Creates an empty profile and returns its id.
    fn add_network(&self, adapter: &str) -> impl Future<Output = Result<i32, ToolError>> + Send;

    /// `value` is passed through verbatim, quoting included.
    fn set_network(
        &self,
        adapter: &str,
        network_id: i32,
        property: &str,
        value: &str,
    ) -> impl Future<Output = Result<(), ToolError>> + Send;

    fn enable_network(
        &self,
        adapter: &str,
        network_id: i32,
    ) -> impl Future<Output = Result<(), ToolError>> + Send;

    fn disable_network(
        &self,
        adapter: &str,
        network_id: i32,
    ) -> impl Future<Output = Result<(), ToolError>> + Send;

    fn remove_network(
        &self,
        adapter: &str,
        network_id: i32,
    ) -> impl Future<Output = Result<(), ToolError>> + Send;

    /// SSID of the live association, empty when not associated.
    fn current_ssid(&self, adapter: &str) -> impl Future<Output = Result<String, ToolError>> + Send;
}

/// `wpa_cli` for profile management and `iwgetid` for the live association.
/// Programs run without a shell and are killed when they exceed the timeout.
#[derive(Debug, Clone)]
pub struct WpaCli {
    wpa_cli: PathBuf,
    iwgetid: PathBuf,
    timeout: Duration,
}

impl WpaCli {
    pub fn new(timeout: Duration) -> Self {
        Self::with_programs(DEFAULT_WPA_CLI, DEFAULT_IWGETID, timeout)
    }

    pub fn with_programs(
        wpa_cli: impl Into<PathBuf>,
        iwgetid: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            wpa_cli: wpa_cli.into(),
            iwgetid: iwgetid.into(),
            timeout,
        }
    }

    async fn run(&self, program: &Path, args: &[&str]) -> Result<Output, ToolError> {
        let command = describe(program, args);
        debug!("Running `{command}`");

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(source)) => Err(ToolError::Spawn {
                program: program.display().to_string(),
                source,
            }),
            Err(_) => Err(ToolError::Timeout {
                command,
                timeout: self.timeout,
            }),
        }
    }

    /// Runs `wpa_cli -i <adapter> <args..>` and returns stdout.
    async fn wpa(&self, adapter: &str, args: &[&str]) -> Result<String, ToolError> {
        let full_args = wpa_args(adapter, args);
        let output = self.run(&self.wpa_cli, &full_args).await?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            return Err(ToolError::Rejected {
                command: describe(&self.wpa_cli, &full_args),
                output: format!("{} {}", output.status, stdout.trim()),
            });
        }
        Ok(stdout)
    }

    async fn expect_ok(&self, adapter: &str, args: &[&str]) -> Result<(), ToolError> {
        let stdout = self.wpa(adapter, args).await?;
        let answer = first_line(&stdout);
        if answer == SUCCESS_TOKEN {
            Ok(())
        } else {
            Err(ToolError::Rejected {
                command: describe(&self.wpa_cli, &wpa_args(adapter, args)),
                output: answer.to_string(),
            })
        }
    }
}

impl NetworkTool for WpaCli {
    async fn list_networks(&self, adapter: &str) -> Result<Vec<NetworkProfile>, ToolError> {
        let stdout = self.wpa(adapter, &["list_networks"]).await?;
        Ok(parse_network_list(&stdout))
    }

    async fn add_network(&self, adapter: &str) -> Result<i32, ToolError> {
        let stdout = self.wpa(adapter, &["add_network"]).await?;
        let answer = first_line(&stdout);
        answer.parse().map_err(|_| ToolError::Unparsable {
            command: describe(&self.wpa_cli, &wpa_args(adapter, &["add_network"])),
            output: answer.to_string(),
        })
    }

    async fn set_network(
        &self,
        adapter: &str,
        network_id: i32,
        property: &str,
        value: &str,
    ) -> Result<(), ToolError> {
        let id = network_id.to_string();
        self.expect_ok(adapter, &["set_network", id.as_str(), property, value])
            .await
    }

    async fn enable_network(&self, adapter: &str, network_id: i32) -> Result<(), ToolError> {
        let id = network_id.to_string();
        self.expect_ok(adapter, &["enable_network", id.as_str()]).await
    }

    async fn disable_network(&self, adapter: &str, network_id: i32) -> Result<(), ToolError> {
        let id = network_id.to_string();
        self.expect_ok(adapter, &["disable_network", id.as_str()]).await
    }

    async fn remove_network(&self, adapter: &str, network_id: i32) -> Result<(), ToolError> {
        let id = network_id.to_string();
        self.expect_ok(adapter, &["remove_network", id.as_str()]).await
    }

    async fn current_ssid(&self, adapter: &str) -> Result<String, ToolError> {
        let output = self.run(&self.iwgetid, &[adapter, "-r"]).await?;
        // iwgetid exits non-zero when the adapter is not associated.
        if !output.status.success() {
            return Ok(String::new());
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .trim_end_matches(['\r', '\n'])
            .to_string())
    }
}

/// Wraps a value in double quotes, as `wpa_cli set_network` expects for
/// string properties.
pub fn quoted(value: &str) -> String {
    format!("\"{value}\"")
}

/// Parses tab-separated `list_networks` output. Lines whose first column is
/// not a network id (the header, interface banners) are skipped.
pub fn parse_network_list(output: &str) -> Vec<NetworkProfile> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() < 3 {
                return None;
            }
            let network_id = fields[0].trim().parse().ok()?;
            let non_empty = |value: &str| (!value.is_empty()).then(|| value.to_string());

            Some(NetworkProfile {
                network_id,
                ssid: fields[1].to_string(),
                bssid: non_empty(fields[2]),
                flags: fields.get(3).and_then(|flags| non_empty(*flags)),
            })
        })
        .collect()
}

fn first_line(output: &str) -> &str {
    output.lines().next().unwrap_or("").trim()
}

fn describe(program: &Path, args: &[&str]) -> String {
    let mut command = program.display().to_string();
    for arg in args {
        command.push(' ');
        command.push_str(arg);
    }
    command
}

fn wpa_args<'a>(adapter: &'a str, args: &[&'a str]) -> Vec<&'a str> {
    let mut full_args = vec!["-i", adapter];
    full_args.extend_from_slice(args);
    full_args
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIST_OUTPUT: &str = "network id / ssid / bssid / flags\n\
        0\thome\tany\t[DISABLED]\n\
        1\tfield-ap\t02:11:22:33:44:55\t[CURRENT]\n\
        2\tspare ssid\tany\n";

    #[test]
    fn parses_list_networks_output() {
        let profiles = parse_network_list(LIST_OUTPUT);
        assert_eq!(profiles.len(), 3);
        assert_eq!(
            profiles[1],
            NetworkProfile {
                network_id: 1,
                ssid: "field-ap".into(),
                bssid: Some("02:11:22:33:44:55".into()),
                flags: Some("[CURRENT]".into()),
            }
        );
        assert_eq!(profiles[2].ssid, "spare ssid");
        assert_eq!(profiles[2].flags, None);
    }

    #[test]
    fn skips_banner_and_short_lines() {
        let output = "Selected interface 'wlan0'\nnetwork id / ssid / bssid / flags\n7\n";
        assert!(parse_network_list(output).is_empty());
    }

    #[test]
    fn quotes_string_properties() {
        assert_eq!(quoted("field-ap"), "\"field-ap\"");
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let tool = WpaCli::with_programs(
            "/nonexistent/wpa_cli",
            "/nonexistent/iwgetid",
            Duration::from_secs(1),
        );
        let err = tool.enable_network("wlan0", 0).await.unwrap_err();
        assert!(matches!(err, ToolError::Spawn { .. }));
    }

    #[cfg(unix)]
    mod scripted {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        fn script(dir: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
            let path = dir.path().join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        #[tokio::test]
        async fn success_token_is_required() {
            let dir = tempfile::tempdir().unwrap();
            let ok = script(&dir, "ok", "echo OK");
            let fail = script(&dir, "fail", "echo FAIL");
            let timeout = Duration::from_secs(5);

            let tool = WpaCli::with_programs(&ok, &ok, timeout);
            tool.enable_network("wlan0", 1).await.unwrap();

            let tool = WpaCli::with_programs(&fail, &fail, timeout);
            let err = tool.enable_network("wlan0", 1).await.unwrap_err();
            assert!(matches!(err, ToolError::Rejected { ref output, .. } if output == "FAIL"));
        }

        #[tokio::test]
        async fn add_network_returns_new_id() {
            let dir = tempfile::tempdir().unwrap();
            let add = script(&dir, "add", "echo 4");
            let tool = WpaCli::with_programs(&add, &add, Duration::from_secs(5));
            assert_eq!(tool.add_network("wlan0").await.unwrap(), 4);
        }

        #[tokio::test]
        async fn unassociated_adapter_reports_empty_ssid() {
            let dir = tempfile::tempdir().unwrap();
            let iwgetid = script(&dir, "iwgetid", "exit 255");
            let tool = WpaCli::with_programs("wpa_cli", &iwgetid, Duration::from_secs(5));
            assert_eq!(tool.current_ssid("wlan0").await.unwrap(), "");
        }

        #[tokio::test]
        async fn slow_tool_times_out() {
            let dir = tempfile::tempdir().unwrap();
            let slow = script(&dir, "slow", "sleep 5");
            let tool = WpaCli::with_programs(&slow, &slow, Duration::from_millis(100));
            let err = tool.list_networks("wlan0").await.unwrap_err();
            assert!(matches!(err, ToolError::Timeout { .. }));
        }
    }
}
