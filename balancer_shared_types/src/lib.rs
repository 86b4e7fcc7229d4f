use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Node names are the opaque identifiers the cluster control plane hands out
/// (hostnames in practice). They are compared lexicographically wherever the
/// engine needs a deterministic tie-break.
pub type NodeName = String;

/// VM identifiers are integers unique cluster-wide.
pub type VmId = u32;

/// Opaque handle for an asynchronous control-plane task (a UPID string on
/// Proxmox-style clusters).
pub type TaskId = String;

#[derive(Debug, Error)]
pub enum BalanceError {
    #[error("Precondition failed: {0}")]
    Precondition(String),
    #[error("Inventory collection failed for node {node}: {reason}")]
    Collection { node: NodeName, reason: String },
    #[error("Migration of VM {vmid} did not start: {reason}")]
    StartFailed { vmid: VmId, reason: String },
    #[error("Migration of VM {vmid} failed: {exit_status}")]
    MigrationFailed { vmid: VmId, exit_status: String },
    #[error("Migration of VM {vmid} still running after {seconds}s")]
    MigrationTimeout { vmid: VmId, seconds: u64 },
    #[error("Rebalancing pass cancelled")]
    Cancelled,
    #[error("Cluster client error: {0}")]
    ClientError(String),
}

/// Generic result type for rebalancing operations.
pub type Result<T> = std::result::Result<T, BalanceError>;

/// The resource dimension a rebalancing pass equalizes across nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BalanceMode {
    Memory,
    Cpu,
    Count,
}

impl Default for BalanceMode {
    fn default() -> Self {
        BalanceMode::Memory
    }
}

impl std::fmt::Display for BalanceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BalanceMode::Memory => write!(f, "memory"),
            BalanceMode::Cpu => write!(f, "cpu"),
            BalanceMode::Count => write!(f, "count"),
        }
    }
}

/// Runtime status of a VM as reported by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    Running,
    Stopped,
    Paused,
    Other(String),
}

impl VmStatus {
    /// Whether a migration of this VM must be performed online (live).
    pub fn is_running(&self) -> bool {
        matches!(self, VmStatus::Running)
    }
}

impl From<&str> for VmStatus {
    fn from(s: &str) -> Self {
        match s {
            "running" => VmStatus::Running,
            "stopped" => VmStatus::Stopped,
            "paused" => VmStatus::Paused,
            other => VmStatus::Other(other.to_string()),
        }
    }
}

// Represents a physical hypervisor host participating in the cluster.
//
// Allocations are derived exclusively from the set of VMs assigned to the
// node; they track resource claims, not instantaneous usage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: NodeName,
    /// Total memory in bytes. Always > 0 (coerced to 1 if the control plane
    /// reported zero, with `capacity_coerced` set).
    pub memory_total: u64,
    /// Total CPU count. Always >= 1.
    pub cpu_total: u32,
    /// Sum of `maxmem` over VMs assigned to this node, in bytes.
    pub memory_allocated: u64,
    /// Sum of vCPU claims over VMs assigned to this node.
    pub cpu_allocated: u32,
    /// Number of VMs assigned to this node.
    pub vm_count: u32,
    /// The control plane reported zero or missing capacity; such a node is
    /// excluded from source and destination selection.
    pub capacity_coerced: bool,
    /// Inventory collection failed for this node; allocations are zero and
    /// the node is excluded from selection.
    pub degraded: bool,
}

impl Node {
    pub fn new(name: impl Into<NodeName>, memory_total: u64, cpu_total: u32) -> Self {
        let capacity_coerced = memory_total == 0 || cpu_total == 0;
        Self {
            name: name.into(),
            memory_total: memory_total.max(1),
            cpu_total: cpu_total.max(1),
            memory_allocated: 0,
            cpu_allocated: 0,
            vm_count: 0,
            capacity_coerced,
            degraded: false,
        }
    }

    /// Whether the node may participate in migration source/destination
    /// selection.
    pub fn selectable(&self) -> bool {
        !self.capacity_coerced && !self.degraded
    }
}

/// A virtual machine, uniquely identified by an integer id cluster-wide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vm {
    pub vmid: VmId,
    /// Name the operator gave the VM, when the control plane reports one.
    pub name: Option<String>,
    /// The node this VM is currently assigned to.
    pub node: NodeName,
    /// Memory claim in bytes (`maxmem`).
    pub maxmem: u64,
    /// vCPU claim: `cpus` if present, else `maxcpu`, else 1.
    pub vcpus: u32,
    pub status: VmStatus,
    /// Set iff the cluster HA resource list contains `vm:<id>`.
    pub ha_managed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_capacity_is_coerced_and_flagged() {
        let node = Node::new("pve1", 0, 0);
        assert_eq!(node.memory_total, 1);
        assert_eq!(node.cpu_total, 1);
        assert!(node.capacity_coerced);
        assert!(!node.selectable());
    }

    #[test]
    fn healthy_node_is_selectable() {
        let node = Node::new("pve1", 64 << 30, 16);
        assert!(!node.capacity_coerced);
        assert!(node.selectable());
    }

    #[test]
    fn vm_status_parses_known_and_unknown_states() {
        assert_eq!(VmStatus::from("running"), VmStatus::Running);
        assert_eq!(VmStatus::from("stopped"), VmStatus::Stopped);
        assert_eq!(VmStatus::from("paused"), VmStatus::Paused);
        assert_eq!(
            VmStatus::from("suspended"),
            VmStatus::Other("suspended".to_string())
        );
        assert!(VmStatus::Running.is_running());
        assert!(!VmStatus::Stopped.is_running());
    }

    #[test]
    fn balance_mode_display_matches_cli_argument() {
        assert_eq!(BalanceMode::Memory.to_string(), "memory");
        assert_eq!(BalanceMode::Cpu.to_string(), "cpu");
        assert_eq!(BalanceMode::Count.to_string(), "count");
    }
}
