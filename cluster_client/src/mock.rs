//! Mock cluster client for testing and development.
//!
//! This provides an in-memory implementation that simulates a hypervisor
//! cluster without requiring a control plane. Tests can script per-VM
//! migration outcomes (start rejection, task failure, a task that never
//! finishes) and per-node inventory failures, and can inspect call counters
//! and the resulting VM placement.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use balancer_shared_types::{NodeName, TaskId, VmId};
use cluster_client_interface::{
    ClientError, ClientResult, ClusterClient, NodeCapacity, TaskState, TaskStatus,
    VmCurrentStatus, VmListing,
};

#[derive(Debug, Clone)]
struct MockNode {
    capacity: NodeCapacity,
    vms: Vec<VmListing>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskOutcome {
    Succeed,
    Fail,
    Hang,
}

#[derive(Debug, Clone)]
struct MockTask {
    vmid: VmId,
    outcome: TaskOutcome,
    polls: usize,
}

/// Mock cluster client that simulates cluster operations in-memory.
pub struct MockClusterClient {
    nodes: Arc<RwLock<BTreeMap<NodeName, MockNode>>>,
    ha_resources: Arc<RwLock<Vec<String>>>,
    tasks: Arc<RwLock<HashMap<TaskId, MockTask>>>,
    /// VMs whose migration request is rejected outright.
    start_failures: Arc<RwLock<HashSet<VmId>>>,
    /// VMs whose migration task finishes with a non-OK exit status.
    task_failures: Arc<RwLock<HashSet<VmId>>>,
    /// VMs whose migration task never leaves the running state.
    hanging_tasks: Arc<RwLock<HashSet<VmId>>>,
    /// Nodes whose status query fails.
    status_failures: Arc<RwLock<HashSet<NodeName>>>,
    task_seq: AtomicUsize,
    migration_count: AtomicUsize,
    poll_count: AtomicUsize,
}

impl Default for MockClusterClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockClusterClient {
    pub fn new() -> Self {
        Self {
            nodes: Arc::new(RwLock::new(BTreeMap::new())),
            ha_resources: Arc::new(RwLock::new(Vec::new())),
            tasks: Arc::new(RwLock::new(HashMap::new())),
            start_failures: Arc::new(RwLock::new(HashSet::new())),
            task_failures: Arc::new(RwLock::new(HashSet::new())),
            hanging_tasks: Arc::new(RwLock::new(HashSet::new())),
            status_failures: Arc::new(RwLock::new(HashSet::new())),
            task_seq: AtomicUsize::new(0),
            migration_count: AtomicUsize::new(0),
            poll_count: AtomicUsize::new(0),
        }
    }

    /// Add a node with the given hardware capacity (for testing).
    pub async fn add_node(&self, name: &str, memory_total: u64, cpu_total: u32) {
        info!("MockClusterClient: Adding node {}", name);
        self.nodes.write().await.insert(
            name.to_string(),
            MockNode {
                capacity: NodeCapacity {
                    memory_total,
                    cpu_total,
                },
                vms: Vec::new(),
            },
        );
    }

    /// Assign a VM to a node (for testing). The node must already exist.
    pub async fn add_vm(&self, node: &str, vm: VmListing) {
        let mut nodes = self.nodes.write().await;
        let entry = nodes
            .get_mut(node)
            .unwrap_or_else(|| panic!("unknown mock node {}", node));
        entry.vms.push(vm);
    }

    /// Build a VM listing with the common defaults used in tests.
    pub fn test_vm(vmid: VmId, maxmem: u64, status: &str) -> VmListing {
        VmListing {
            vmid,
            name: Some(format!("vm{}", vmid)),
            maxmem,
            cpus: Some(2),
            maxcpu: None,
            status: status.to_string(),
        }
    }

    /// Register a VM with the HA subsystem (for testing).
    pub async fn mark_ha(&self, vmid: VmId) {
        self.ha_resources.write().await.push(format!("vm:{}", vmid));
    }

    /// Reject `start_migration` for this VM.
    pub async fn fail_start(&self, vmid: VmId) {
        self.start_failures.write().await.insert(vmid);
    }

    /// Let this VM's migration task finish with a non-OK exit status.
    pub async fn fail_migration(&self, vmid: VmId) {
        self.task_failures.write().await.insert(vmid);
    }

    /// Let this VM's migration task run forever (drives the timeout path).
    pub async fn hang_migration(&self, vmid: VmId) {
        self.hanging_tasks.write().await.insert(vmid);
    }

    /// Make `node_status` fail for this node.
    pub async fn fail_node_status(&self, node: &str) {
        self.status_failures.write().await.insert(node.to_string());
    }

    /// Number of accepted migration requests (for testing).
    pub fn migration_count(&self) -> usize {
        self.migration_count.load(Ordering::SeqCst)
    }

    /// Number of task status polls served (for testing).
    pub fn poll_count(&self) -> usize {
        self.poll_count.load(Ordering::SeqCst)
    }

    /// The vmids currently assigned to a node, in listing order (for testing).
    pub async fn vms_on(&self, node: &str) -> Vec<VmId> {
        self.nodes
            .read()
            .await
            .get(node)
            .map(|n| n.vms.iter().map(|v| v.vmid).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ClusterClient for MockClusterClient {
    async fn list_nodes(&self) -> ClientResult<Vec<NodeName>> {
        debug!("MockClusterClient: Listing nodes");
        Ok(self.nodes.read().await.keys().cloned().collect())
    }

    async fn node_status(&self, node: &str) -> ClientResult<NodeCapacity> {
        if self.status_failures.read().await.contains(node) {
            return Err(ClientError::Unavailable(format!(
                "status query for {} failed",
                node
            )));
        }
        self.nodes
            .read()
            .await
            .get(node)
            .map(|n| n.capacity)
            .ok_or_else(|| ClientError::NotFound(format!("node {}", node)))
    }

    async fn list_vms(&self, node: &str) -> ClientResult<Vec<VmListing>> {
        self.nodes
            .read()
            .await
            .get(node)
            .map(|n| n.vms.clone())
            .ok_or_else(|| ClientError::NotFound(format!("node {}", node)))
    }

    async fn vm_status(&self, node: &str, vmid: VmId) -> ClientResult<VmCurrentStatus> {
        let nodes = self.nodes.read().await;
        let entry = nodes
            .get(node)
            .ok_or_else(|| ClientError::NotFound(format!("node {}", node)))?;
        entry
            .vms
            .iter()
            .find(|v| v.vmid == vmid)
            .map(|v| VmCurrentStatus {
                name: v.name.clone(),
                status: v.status.clone(),
            })
            .ok_or_else(|| ClientError::NotFound(format!("VM {} on {}", vmid, node)))
    }

    async fn list_ha_resources(&self) -> ClientResult<Vec<String>> {
        Ok(self.ha_resources.read().await.clone())
    }

    async fn start_migration(
        &self,
        source: &str,
        vmid: VmId,
        target: &str,
        online: bool,
    ) -> ClientResult<TaskId> {
        if self.start_failures.read().await.contains(&vmid) {
            return Err(ClientError::RemoteError(format!(
                "migration of VM {} rejected",
                vmid
            )));
        }

        let mut nodes = self.nodes.write().await;
        if !nodes.contains_key(target) {
            return Err(ClientError::InvalidArgument(format!(
                "unknown target node {}",
                target
            )));
        }
        let source_node = nodes
            .get_mut(source)
            .ok_or_else(|| ClientError::NotFound(format!("node {}", source)))?;
        let position = source_node
            .vms
            .iter()
            .position(|v| v.vmid == vmid)
            .ok_or_else(|| ClientError::NotFound(format!("VM {} on {}", vmid, source)))?;

        let outcome = if self.hanging_tasks.read().await.contains(&vmid) {
            TaskOutcome::Hang
        } else if self.task_failures.read().await.contains(&vmid) {
            TaskOutcome::Fail
        } else {
            TaskOutcome::Succeed
        };

        // A successful migration moves the VM as soon as the task is
        // accepted; the engine only re-reads inventory on a fresh pass, so
        // the simplification is not observable from the outside.
        if outcome == TaskOutcome::Succeed {
            let vm = source_node.vms.remove(position);
            nodes
                .get_mut(target)
                .expect("target checked above")
                .vms
                .push(vm);
        }

        let seq = self.task_seq.fetch_add(1, Ordering::SeqCst);
        self.migration_count.fetch_add(1, Ordering::SeqCst);
        let task_id = format!("UPID:{}:{:08X}:qmigrate:{}:", source, seq, vmid);
        info!(
            vmid,
            source, target, online, task = %task_id,
            "MockClusterClient: Migration accepted"
        );
        self.tasks.write().await.insert(
            task_id.clone(),
            MockTask {
                vmid,
                outcome,
                polls: 0,
            },
        );
        Ok(task_id)
    }

    async fn task_status(&self, _node: &str, task: &TaskId) -> ClientResult<TaskStatus> {
        self.poll_count.fetch_add(1, Ordering::SeqCst);
        let mut tasks = self.tasks.write().await;
        let entry = tasks
            .get_mut(task)
            .ok_or_else(|| ClientError::NotFound(format!("task {}", task)))?;
        entry.polls += 1;

        // The first poll sees the task still running so the supervisor's
        // poll loop is exercised; subsequent polls see the terminal state.
        let status = match entry.outcome {
            TaskOutcome::Hang => TaskStatus {
                state: TaskState::Running,
                exit_status: None,
            },
            _ if entry.polls == 1 => TaskStatus {
                state: TaskState::Running,
                exit_status: None,
            },
            TaskOutcome::Succeed => TaskStatus {
                state: TaskState::Stopped,
                exit_status: Some("OK".to_string()),
            },
            TaskOutcome::Fail => TaskStatus {
                state: TaskState::Stopped,
                exit_status: Some(format!("migration of VM {} aborted", entry.vmid)),
            },
        };
        Ok(status)
    }
}
