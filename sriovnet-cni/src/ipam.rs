//! Delegation to the configured IPAM plugin.
//!
//! The delegate is a sibling CNI binary located via `CNI_PATH`; it gets the
//! original stdin payload and the inherited invocation environment, and
//! answers with a result object on stdout. Only invoked for kernel-bound
//! attachments that want an address.

use serde::Deserialize;
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

const DEFAULT_CNI_PATH: &str = "/opt/cni/bin";

#[derive(Debug, Error)]
pub enum IpamError {
    #[error("IPAM plugin {plugin} not found in {search_path}")]
    PluginNotFound { plugin: String, search_path: String },

    #[error("failed to execute IPAM plugin {plugin}: {source}")]
    Exec { plugin: String, source: io::Error },

    #[error("IPAM plugin {plugin} failed: {msg}")]
    Failed { plugin: String, msg: String },

    #[error("IPAM plugin {plugin} returned invalid JSON: {source}")]
    Parse {
        plugin: String,
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, IpamError>;

#[derive(Debug, Clone, Deserialize)]
pub struct Ip4Config {
    /// Address in CIDR notation, e.g. `10.56.0.5/24`.
    pub ip: String,
    #[serde(default)]
    pub gateway: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct TypedResult {
    #[serde(default)]
    ip4: Option<Ip4Config>,
}

/// Parsed delegate answer plus the raw object for passthrough printing.
#[derive(Debug, Clone)]
pub struct IpamResult {
    pub raw: serde_json::Value,
    pub ip4: Option<Ip4Config>,
}

fn find_plugin(plugin: &str, cni_path: &str) -> Result<PathBuf> {
    let search_path = if cni_path.is_empty() {
        DEFAULT_CNI_PATH
    } else {
        cni_path
    };
    for dir in search_path.split(':').filter(|d| !d.is_empty()) {
        let candidate = PathBuf::from(dir).join(plugin);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(IpamError::PluginNotFound {
        plugin: plugin.to_string(),
        search_path: search_path.to_string(),
    })
}

async fn exec(plugin: &str, cni_path: &str, command: &str, payload: &[u8]) -> Result<Vec<u8>> {
    let binary = find_plugin(plugin, cni_path)?;
    debug!(plugin, command, binary = %binary.display(), "delegating to IPAM plugin");

    let mut child = Command::new(&binary)
        .env("CNI_COMMAND", command)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::inherit())
        .spawn()
        .map_err(|source| IpamError::Exec {
            plugin: plugin.to_string(),
            source,
        })?;

    let Some(mut stdin) = child.stdin.take() else {
        return Err(IpamError::Exec {
            plugin: plugin.to_string(),
            source: io::Error::other("child stdin unavailable"),
        });
    };
    stdin
        .write_all(payload)
        .await
        .map_err(|source| IpamError::Exec {
            plugin: plugin.to_string(),
            source,
        })?;
    drop(stdin);

    let output = child
        .wait_with_output()
        .await
        .map_err(|source| IpamError::Exec {
            plugin: plugin.to_string(),
            source,
        })?;

    if !output.status.success() {
        // a failing plugin reports a CNI error object on stdout
        let msg = serde_json::from_slice::<serde_json::Value>(&output.stdout)
            .ok()
            .and_then(|v| v.get("msg").and_then(|m| m.as_str()).map(str::to_string))
            .unwrap_or_else(|| String::from_utf8_lossy(&output.stdout).trim().to_string());
        return Err(IpamError::Failed {
            plugin: plugin.to_string(),
            msg,
        });
    }
    Ok(output.stdout)
}

/// Ask the delegate for an address.
pub async fn exec_add(plugin: &str, cni_path: &str, payload: &[u8]) -> Result<IpamResult> {
    let stdout = exec(plugin, cni_path, "ADD", payload).await?;
    let raw: serde_json::Value =
        serde_json::from_slice(&stdout).map_err(|source| IpamError::Parse {
            plugin: plugin.to_string(),
            source,
        })?;
    let typed: TypedResult =
        serde_json::from_value(raw.clone()).map_err(|source| IpamError::Parse {
            plugin: plugin.to_string(),
            source,
        })?;
    Ok(IpamResult {
        raw,
        ip4: typed.ip4,
    })
}

/// Tell the delegate to release whatever it allocated.
pub async fn exec_del(plugin: &str, cni_path: &str, payload: &[u8]) -> Result<()> {
    exec(plugin, cni_path, "DEL", payload).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn missing_plugin_reports_search_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = find_plugin("host-local", dir.path().to_str().unwrap()).unwrap_err();
        assert!(matches!(err, IpamError::PluginNotFound { .. }));
    }

    #[test]
    fn plugin_found_on_second_path_entry() {
        let first = tempfile::TempDir::new().unwrap();
        let second = tempfile::TempDir::new().unwrap();
        let binary = second.path().join("host-local");
        std::fs::write(&binary, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();

        let cni_path = format!(
            "{}:{}",
            first.path().to_str().unwrap(),
            second.path().to_str().unwrap()
        );
        assert_eq!(find_plugin("host-local", &cni_path).unwrap(), binary);
    }

    #[tokio::test]
    async fn failing_plugin_surfaces_its_error_object() {
        let dir = tempfile::TempDir::new().unwrap();
        let binary = dir.path().join("failing-ipam");
        std::fs::write(
            &binary,
            b"#!/bin/sh\ncat >/dev/null\necho '{\"code\": 11, \"msg\": \"pool exhausted\"}'\nexit 1\n",
        )
        .unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();

        let err = exec_add("failing-ipam", dir.path().to_str().unwrap(), b"{}")
            .await
            .unwrap_err();
        match err {
            IpamError::Failed { msg, .. } => assert_eq!(msg, "pool exhausted"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn successful_plugin_result_is_parsed() {
        let dir = tempfile::TempDir::new().unwrap();
        let binary = dir.path().join("static-ipam");
        std::fs::write(
            &binary,
            b"#!/bin/sh\ncat >/dev/null\necho '{\"cniVersion\": \"0.3.1\", \"ip4\": {\"ip\": \"10.56.0.5/24\", \"gateway\": \"10.56.0.1\"}}'\n",
        )
        .unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();

        let result = exec_add("static-ipam", dir.path().to_str().unwrap(), b"{}")
            .await
            .unwrap();
        let ip4 = result.ip4.unwrap();
        assert_eq!(ip4.ip, "10.56.0.5/24");
        assert_eq!(ip4.gateway.as_deref(), Some("10.56.0.1"));
    }
}
