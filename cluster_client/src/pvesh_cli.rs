//! CLI-based hypervisor control-plane client.
//!
//! This module provides a [`ClusterClient`] implementation that uses the
//! `pvesh` CLI binary to talk to a Proxmox VE cluster. All calls request
//! JSON output and parse it with serde.
//!
//! # Requirements
//!
//! - `pvesh` binary must be installed and in PATH
//! - The invoking user needs read access to the cluster API and migrate
//!   permission on the VMs it is asked to move

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

use balancer_shared_types::{NodeName, TaskId, VmId};
use cluster_client_interface::{
    ClientError, ClientResult, ClusterClient, NodeCapacity, TaskState, TaskStatus,
    VmCurrentStatus, VmListing,
};

/// Errors specific to pvesh invocations.
#[derive(Debug, thiserror::Error)]
pub enum PveshError {
    #[error("pvesh binary not found: {0}")]
    BinaryNotFound(String),

    #[error("pvesh command failed: {command} - {message}")]
    CommandFailed { command: String, message: String },

    #[error("Timed out after {0:?} waiting for pvesh")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<PveshError> for ClientError {
    fn from(err: PveshError) -> Self {
        match err {
            PveshError::BinaryNotFound(msg) => ClientError::Unavailable(msg),
            PveshError::Timeout(d) => {
                ClientError::Unavailable(format!("pvesh did not answer within {:?}", d))
            }
            PveshError::CommandFailed { command, message } => {
                let lower = message.to_ascii_lowercase();
                if lower.contains("permission") || lower.contains("403") || lower.contains("401") {
                    ClientError::PermissionDenied(message)
                } else if lower.contains("does not exist") || lower.contains("not found") {
                    ClientError::NotFound(message)
                } else if lower.contains("400") || lower.contains("invalid") {
                    ClientError::InvalidArgument(message)
                } else {
                    ClientError::RemoteError(format!("{}: {}", command, message))
                }
            }
            other => ClientError::RemoteError(other.to_string()),
        }
    }
}

/// Configuration for [`PveshClient`].
#[derive(Debug, Clone)]
pub struct PveshConfig {
    /// Path to the pvesh binary (default: "pvesh").
    pub binary: PathBuf,
    /// Timeout for a single pvesh invocation (default: 30s).
    pub command_timeout: Duration,
}

impl Default for PveshConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("pvesh"),
            command_timeout: Duration::from_secs(30),
        }
    }
}

/// A [`ClusterClient`] backed by the `pvesh` CLI.
pub struct PveshClient {
    config: PveshConfig,
}

impl PveshClient {
    pub fn new() -> Self {
        Self {
            config: PveshConfig::default(),
        }
    }

    pub fn with_config(config: PveshConfig) -> Self {
        Self { config }
    }

    /// Run `pvesh` with the given arguments and return stdout.
    async fn run(&self, args: &[&str]) -> Result<String, PveshError> {
        let rendered = format!("pvesh {}", args.join(" "));
        debug!(command = %rendered, "Invoking pvesh");

        let child = Command::new(&self.config.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    PveshError::BinaryNotFound(self.config.binary.display().to_string())
                } else {
                    PveshError::Io(e)
                }
            })?;

        let output = tokio::time::timeout(self.config.command_timeout, child.wait_with_output())
            .await
            .map_err(|_| PveshError::Timeout(self.config.command_timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(PveshError::CommandFailed {
                command: rendered,
                message: if stderr.is_empty() {
                    format!("exit status {}", output.status)
                } else {
                    stderr
                },
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run a read request and parse the JSON response body.
    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T, PveshError> {
        let stdout = self
            .run(&["get", path, "--output-format", "json"])
            .await?;
        Ok(serde_json::from_str(stdout.trim())?)
    }
}

impl Default for PveshClient {
    fn default() -> Self {
        Self::new()
    }
}

// Wire shapes of the API responses we consume. Fields the rebalancer does
// not read are left out; serde ignores unknown fields by default.

#[derive(Debug, Deserialize)]
struct PveNodeEntry {
    node: NodeName,
}

#[derive(Debug, Default, Deserialize)]
struct PveMemory {
    #[serde(default)]
    total: u64,
}

#[derive(Debug, Default, Deserialize)]
struct PveCpuInfo {
    #[serde(default)]
    cpus: u32,
}

#[derive(Debug, Deserialize)]
struct PveNodeStatus {
    #[serde(default)]
    memory: PveMemory,
    #[serde(default)]
    cpuinfo: PveCpuInfo,
}

#[derive(Debug, Deserialize)]
struct PveVmEntry {
    vmid: VmId,
    name: Option<String>,
    #[serde(default)]
    maxmem: u64,
    cpus: Option<u32>,
    maxcpu: Option<u32>,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct PveVmCurrent {
    name: Option<String>,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct PveHaResource {
    sid: String,
}

#[derive(Debug, Deserialize)]
struct PveTaskStatus {
    status: String,
    exitstatus: Option<String>,
}

#[async_trait]
impl ClusterClient for PveshClient {
    async fn list_nodes(&self) -> ClientResult<Vec<NodeName>> {
        let entries: Vec<PveNodeEntry> = self.get_json("/nodes").await?;
        Ok(entries.into_iter().map(|e| e.node).collect())
    }

    async fn node_status(&self, node: &str) -> ClientResult<NodeCapacity> {
        let status: PveNodeStatus = self.get_json(&format!("/nodes/{}/status", node)).await?;
        Ok(NodeCapacity {
            memory_total: status.memory.total,
            cpu_total: status.cpuinfo.cpus,
        })
    }

    async fn list_vms(&self, node: &str) -> ClientResult<Vec<VmListing>> {
        let entries: Vec<PveVmEntry> = self.get_json(&format!("/nodes/{}/qemu", node)).await?;
        Ok(entries
            .into_iter()
            .map(|e| VmListing {
                vmid: e.vmid,
                name: e.name,
                maxmem: e.maxmem,
                cpus: e.cpus,
                maxcpu: e.maxcpu,
                status: e.status,
            })
            .collect())
    }

    async fn vm_status(&self, node: &str, vmid: VmId) -> ClientResult<VmCurrentStatus> {
        let current: PveVmCurrent = self
            .get_json(&format!("/nodes/{}/qemu/{}/status/current", node, vmid))
            .await?;
        Ok(VmCurrentStatus {
            name: current.name,
            status: current.status,
        })
    }

    async fn list_ha_resources(&self) -> ClientResult<Vec<String>> {
        let resources: Vec<PveHaResource> = self.get_json("/cluster/ha/resources").await?;
        Ok(resources.into_iter().map(|r| r.sid).collect())
    }

    async fn start_migration(
        &self,
        source: &str,
        vmid: VmId,
        target: &str,
        online: bool,
    ) -> ClientResult<TaskId> {
        let path = format!("/nodes/{}/qemu/{}/migrate", source, vmid);
        let online_arg = if online { "1" } else { "0" };
        let stdout = self
            .run(&[
                "create",
                &path,
                "--target",
                target,
                "--online",
                online_arg,
                "--output-format",
                "json",
            ])
            .await
            .map_err(ClientError::from)?;

        // The migrate endpoint returns the task UPID as a JSON string.
        let upid: String =
            serde_json::from_str(stdout.trim()).map_err(|e| ClientError::RemoteError(
                format!("unparseable migration response: {}", e),
            ))?;
        if upid.is_empty() {
            warn!(vmid, source, target, "Migration accepted without a task id");
            return Err(ClientError::RemoteError(
                "empty task id from migrate request".to_string(),
            ));
        }
        Ok(upid)
    }

    async fn task_status(&self, node: &str, task: &TaskId) -> ClientResult<TaskStatus> {
        let status: PveTaskStatus = self
            .get_json(&format!("/nodes/{}/tasks/{}/status", node, task))
            .await?;
        let state = match status.status.as_str() {
            "stopped" => TaskState::Stopped,
            _ => TaskState::Running,
        };
        Ok(TaskStatus {
            state,
            exit_status: status.exitstatus,
        })
    }
}
