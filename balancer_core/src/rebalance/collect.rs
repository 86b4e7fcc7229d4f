//! Inventory collection - the read-only first stage of a rebalancing pass.
//!
//! The collector snapshots node capacity, per-node VM allocation, and the HA
//! resource set into an in-memory cluster model. Per-node queries are issued
//! in parallel and merged only after all of them have returned; everything
//! downstream of the merge is strictly single-threaded.
//!
//! # Fault handling
//!
//! - A node whose inventory queries fail is carried in the snapshot with
//!   empty allocations and flagged `degraded`; the pass continues.
//! - A node reporting zero capacity has it coerced to 1 and is flagged
//!   `capacity_coerced`; such nodes never participate in placement.
//! - A VM reported by two nodes (a race with an in-flight migration) is
//!   assigned to the node that reports it last in merge order; the
//!   discrepancy is recorded as a warning.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use balancer_shared_types::{BalanceError, Node, NodeName, Result, Vm, VmId, VmStatus};
use cluster_client_interface::{ClientError, ClusterClient};

use super::plan::Migration;
use super::PassEvent;

/// In-memory model of the cluster at the start of a pass.
///
/// Created once per pass, mutated by [`apply_migration`] after each
/// successful move, and discarded when the pass ends. The cluster totals are
/// conservation-preserving: migrations shift allocation between nodes but
/// never change the sums.
///
/// [`apply_migration`]: ClusterSnapshot::apply_migration
#[derive(Debug, Clone, Serialize)]
pub struct ClusterSnapshot {
    pub nodes: BTreeMap<NodeName, Node>,
    pub vms: BTreeMap<VmId, Vm>,
    /// Sum of `maxmem` over all VMs, in bytes.
    pub memory_allocated: u64,
    /// Sum of vCPU claims over all VMs.
    pub cpu_allocated: u64,
    /// Total number of VMs.
    pub vm_total: u32,
    /// Sum of node memory capacity, in bytes.
    pub memory_capacity: u64,
    /// Sum of node CPU capacity.
    pub cpu_capacity: u64,
}

impl ClusterSnapshot {
    /// Build a snapshot from nodes and deduplicated VMs, deriving per-node
    /// allocations and cluster totals.
    pub fn assemble(
        nodes: impl IntoIterator<Item = Node>,
        vms: impl IntoIterator<Item = Vm>,
    ) -> Self {
        let mut nodes: BTreeMap<NodeName, Node> =
            nodes.into_iter().map(|n| (n.name.clone(), n)).collect();
        let vms: BTreeMap<VmId, Vm> = vms.into_iter().map(|v| (v.vmid, v)).collect();

        for node in nodes.values_mut() {
            node.memory_allocated = 0;
            node.cpu_allocated = 0;
            node.vm_count = 0;
        }
        for vm in vms.values() {
            if let Some(node) = nodes.get_mut(&vm.node) {
                node.memory_allocated += vm.maxmem;
                node.cpu_allocated += vm.vcpus;
                node.vm_count += 1;
            }
        }

        let memory_capacity = nodes.values().map(|n| n.memory_total).sum();
        let cpu_capacity = nodes.values().map(|n| u64::from(n.cpu_total)).sum();
        let memory_allocated = vms.values().map(|v| v.maxmem).sum();
        let cpu_allocated = vms.values().map(|v| u64::from(v.vcpus)).sum();
        let vm_total = vms.len() as u32;

        Self {
            nodes,
            vms,
            memory_allocated,
            cpu_allocated,
            vm_total,
            memory_capacity,
            cpu_capacity,
        }
    }

    /// Apply a successful migration: reassign the VM and shift its claims
    /// from the source node to the target node. Cluster totals are invariant
    /// under this operation.
    pub fn apply_migration(&mut self, migration: &Migration) {
        let Some(vm) = self.vms.get_mut(&migration.vmid) else {
            debug_assert!(false, "migration refers to unknown VM {}", migration.vmid);
            return;
        };
        debug_assert_eq!(vm.node, migration.source);
        vm.node = migration.target.clone();
        let (maxmem, vcpus) = (vm.maxmem, vm.vcpus);

        if let Some(source) = self.nodes.get_mut(&migration.source) {
            source.memory_allocated = source.memory_allocated.saturating_sub(maxmem);
            source.cpu_allocated = source.cpu_allocated.saturating_sub(vcpus);
            source.vm_count = source.vm_count.saturating_sub(1);
        }
        if let Some(target) = self.nodes.get_mut(&migration.target) {
            target.memory_allocated += maxmem;
            target.cpu_allocated += vcpus;
            target.vm_count += 1;
        }
    }

    /// VMs currently assigned to a node, in ascending vmid order.
    pub fn vms_on<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a Vm> {
        self.vms.values().filter(move |v| v.node == node)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

/// Result of inventory collection: the snapshot plus any anomalies observed
/// while building it.
#[derive(Debug)]
pub struct CollectedInventory {
    pub snapshot: ClusterSnapshot,
    pub warnings: Vec<PassEvent>,
}

/// Snapshots the cluster through a [`ClusterClient`].
pub struct Collector {
    client: Arc<dyn ClusterClient>,
}

impl Collector {
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        Self { client }
    }

    /// Collect a [`ClusterSnapshot`].
    ///
    /// # Errors
    ///
    /// Fails with [`BalanceError::Precondition`] when the member list cannot
    /// be read or the cluster has fewer than two nodes. Per-node failures are
    /// recovered locally and reported through `warnings`.
    pub async fn collect(&self) -> Result<CollectedInventory> {
        let node_names = self.client.list_nodes().await.map_err(|e| {
            BalanceError::Precondition(format!("cluster member list unavailable: {}", e))
        })?;
        if node_names.len() < 2 {
            return Err(BalanceError::Precondition(format!(
                "rebalancing needs at least 2 nodes, found {}",
                node_names.len()
            )));
        }

        let mut queries = JoinSet::new();
        for name in node_names {
            let client = Arc::clone(&self.client);
            queries.spawn(async move {
                let inventory = async {
                    let capacity = client.node_status(&name).await?;
                    let vms = client.list_vms(&name).await?;
                    Ok::<_, ClientError>((capacity, vms))
                }
                .await;
                (name, inventory)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = queries.join_next().await {
            let entry = joined
                .map_err(|e| BalanceError::ClientError(format!("inventory task failed: {}", e)))?;
            results.push(entry);
        }
        // Merge in name order so duplicate resolution does not depend on
        // response arrival order.
        results.sort_by(|a, b| a.0.cmp(&b.0));

        let mut warnings = Vec::new();
        let mut nodes = Vec::new();
        let mut vms: BTreeMap<VmId, Vm> = BTreeMap::new();
        for (name, inventory) in results {
            match inventory {
                Err(err) => {
                    warn!(
                        node = %name,
                        error = %err,
                        "Inventory collection failed; carrying node with empty allocations"
                    );
                    let mut node = Node::new(name.clone(), 1, 1);
                    node.degraded = true;
                    warnings.push(PassEvent::NodeDegraded {
                        node: name,
                        reason: err.to_string(),
                    });
                    nodes.push(node);
                }
                Ok((capacity, listings)) => {
                    let node = Node::new(name.clone(), capacity.memory_total, capacity.cpu_total);
                    if node.capacity_coerced {
                        warn!(node = %name, "Node reported zero capacity; excluded from placement");
                        warnings.push(PassEvent::CapacityCoerced { node: name.clone() });
                    }
                    for listing in listings {
                        let vm = Vm {
                            vmid: listing.vmid,
                            name: listing.name.clone(),
                            node: name.clone(),
                            maxmem: listing.maxmem,
                            vcpus: listing.vcpu_claim(),
                            status: VmStatus::from(listing.status.as_str()),
                            ha_managed: false,
                        };
                        if let Some(previous) = vms.insert(listing.vmid, vm) {
                            warn!(
                                vmid = listing.vmid,
                                kept = %name,
                                discarded = %previous.node,
                                "VM reported by two nodes; keeping the later report"
                            );
                            warnings.push(PassEvent::DuplicateVm {
                                vmid: listing.vmid,
                                kept: name.clone(),
                                discarded: previous.node,
                            });
                        }
                    }
                    nodes.push(node);
                }
            }
        }

        match self.client.list_ha_resources().await {
            Ok(sids) => {
                for sid in sids {
                    let Some(id) = sid.strip_prefix("vm:") else {
                        continue;
                    };
                    if let Ok(vmid) = id.parse::<VmId>() {
                        if let Some(vm) = vms.get_mut(&vmid) {
                            vm.ha_managed = true;
                        }
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "HA resource list unavailable; proceeding without HA flags");
                warnings.push(PassEvent::HaListUnavailable {
                    reason: err.to_string(),
                });
            }
        }

        let snapshot = ClusterSnapshot::assemble(nodes, vms.into_values());
        debug!(
            nodes = snapshot.nodes.len(),
            vms = snapshot.vms.len(),
            "Inventory snapshot assembled"
        );
        Ok(CollectedInventory { snapshot, warnings })
    }
}
