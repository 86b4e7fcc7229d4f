use async_trait::async_trait;
use downcast_rs::{impl_downcast, Downcast};
use serde::{Deserialize, Serialize};

use balancer_shared_types::{BalanceError, NodeName, TaskId, VmId};

/// Hardware capacity of a node as reported by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCapacity {
    /// Total installed memory in bytes.
    pub memory_total: u64,
    /// Number of CPUs (threads) the node exposes.
    pub cpu_total: u32,
}

/// One VM as returned by a node's VM listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmListing {
    pub vmid: VmId,
    pub name: Option<String>,
    /// Memory claim in bytes.
    pub maxmem: u64,
    /// Configured vCPU count, when present.
    pub cpus: Option<u32>,
    /// Maximum vCPU count, when present.
    pub maxcpu: Option<u32>,
    /// Runtime status string, e.g. "running" or "stopped".
    pub status: String,
}

impl VmListing {
    /// The vCPU claim this VM contributes to its node's allocation:
    /// `cpus` if present, else `maxcpu`, else 1.
    pub fn vcpu_claim(&self) -> u32 {
        self.cpus.or(self.maxcpu).unwrap_or(1).max(1)
    }
}

/// Richer per-VM identification, queried at migration time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmCurrentStatus {
    pub name: Option<String>,
    pub status: String,
}

/// State of an asynchronous control-plane task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Running,
    Stopped,
}

/// Status of an asynchronous control-plane task. Completion is recognized by
/// `state == Stopped`; success by `exit_status == Some("OK")`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub state: TaskState,
    pub exit_status: Option<String>,
}

impl TaskStatus {
    pub fn is_finished(&self) -> bool {
        self.state == TaskState::Stopped
    }

    pub fn is_ok(&self) -> bool {
        self.is_finished() && self.exit_status.as_deref() == Some("OK")
    }
}

/// Trait for talking to the hypervisor cluster control plane.
///
/// Read operations are idempotent; `start_migration` is not. Implementations
/// must be safe to share across the collector, planner, and supervisor
/// (read-only handle semantics).
#[async_trait]
pub trait ClusterClient: Downcast + Send + Sync {
    /// Names of all cluster members.
    async fn list_nodes(&self) -> ClientResult<Vec<NodeName>>;

    /// Hardware capacity of one node.
    async fn node_status(&self, node: &str) -> ClientResult<NodeCapacity>;

    /// VMs currently assigned to the node.
    async fn list_vms(&self, node: &str) -> ClientResult<Vec<VmListing>>;

    /// Current status of a single VM.
    async fn vm_status(&self, node: &str, vmid: VmId) -> ClientResult<VmCurrentStatus>;

    /// HA-managed resource identifiers, in the form `vm:<id>`.
    async fn list_ha_resources(&self) -> ClientResult<Vec<String>>;

    /// Kick off a migration. Non-blocking; returns an opaque task handle once
    /// the control plane has accepted the request.
    async fn start_migration(
        &self,
        source: &str,
        vmid: VmId,
        target: &str,
        online: bool,
    ) -> ClientResult<TaskId>;

    /// Poll an asynchronous task until it reports `Stopped`.
    async fn task_status(&self, node: &str, task: &TaskId) -> ClientResult<TaskStatus>;
}

impl_downcast!(ClusterClient);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Control plane unavailable: {0}")]
    Unavailable(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Remote error: {0}")]
    RemoteError(String),
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

impl From<ClientError> for BalanceError {
    fn from(err: ClientError) -> Self {
        BalanceError::ClientError(err.to_string())
    }
}
