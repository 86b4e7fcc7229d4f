//! Balance model - utilization, targets, and imbalance classification.
//!
//! All utilization arithmetic is fixed-point in basis points (x10 000) so
//! scoring and thresholds are exact integers; two implementations of the
//! same snapshot always agree and tests can assert equality. `count` mode
//! uses raw VM counts with no normalization.

use balancer_shared_types::{BalanceMode, Node, Vm};

use super::collect::ClusterSnapshot;

/// Scale factor for fixed-point utilization: 10 000 basis points = 100%.
pub const BASIS_POINTS: i64 = 10_000;

fn ratio_bp(allocated: u64, capacity: u64) -> i64 {
    ((allocated as u128 * BASIS_POINTS as u128) / u128::from(capacity.max(1))) as i64
}

/// Where a node sits relative to the cluster target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadClass {
    Overloaded,
    Underloaded,
    Balanced,
}

impl std::fmt::Display for LoadClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadClass::Overloaded => write!(f, "overloaded"),
            LoadClass::Underloaded => write!(f, "underloaded"),
            LoadClass::Balanced => write!(f, "balanced"),
        }
    }
}

/// Read-only queries over a snapshot for one balance mode.
pub struct BalanceModel<'a> {
    snapshot: &'a ClusterSnapshot,
    mode: BalanceMode,
}

impl<'a> BalanceModel<'a> {
    pub fn new(snapshot: &'a ClusterSnapshot, mode: BalanceMode) -> Self {
        Self { snapshot, mode }
    }

    /// Node utilization: basis points for memory/cpu, raw VM count for count
    /// mode.
    pub fn utilization(&self, node: &Node) -> i64 {
        match self.mode {
            BalanceMode::Memory => ratio_bp(node.memory_allocated, node.memory_total),
            BalanceMode::Cpu => {
                ratio_bp(u64::from(node.cpu_allocated), u64::from(node.cpu_total))
            }
            BalanceMode::Count => i64::from(node.vm_count),
        }
    }

    /// Node utilization with one VM's claims removed.
    pub fn utilization_without(&self, node: &Node, vm: &Vm) -> i64 {
        match self.mode {
            BalanceMode::Memory => ratio_bp(
                node.memory_allocated.saturating_sub(vm.maxmem),
                node.memory_total,
            ),
            BalanceMode::Cpu => ratio_bp(
                u64::from(node.cpu_allocated.saturating_sub(vm.vcpus)),
                u64::from(node.cpu_total),
            ),
            BalanceMode::Count => i64::from(node.vm_count.saturating_sub(1)),
        }
    }

    /// Node utilization with one VM's claims added.
    pub fn utilization_with(&self, node: &Node, vm: &Vm) -> i64 {
        match self.mode {
            BalanceMode::Memory => {
                ratio_bp(node.memory_allocated + vm.maxmem, node.memory_total)
            }
            BalanceMode::Cpu => ratio_bp(
                u64::from(node.cpu_allocated) + u64::from(vm.vcpus),
                u64::from(node.cpu_total),
            ),
            BalanceMode::Count => i64::from(node.vm_count) + 1,
        }
    }

    /// The cluster-wide goal every node is driven toward: cluster utilization
    /// in basis points for memory/cpu, `floor(total VMs / node count)` for
    /// count mode.
    pub fn target(&self) -> i64 {
        match self.mode {
            BalanceMode::Memory => ratio_bp(
                self.snapshot.memory_allocated,
                self.snapshot.memory_capacity,
            ),
            BalanceMode::Cpu => {
                ratio_bp(self.snapshot.cpu_allocated, self.snapshot.cpu_capacity)
            }
            BalanceMode::Count => {
                (self.snapshot.vm_total as usize / self.snapshot.node_count().max(1)) as i64
            }
        }
    }

    /// The band around the target within which a node counts as balanced:
    /// 10% of the target for memory/cpu with a 100 bp floor (so lightly
    /// loaded clusters keep a usable band), a single VM for count mode.
    pub fn threshold(&self) -> i64 {
        match self.mode {
            BalanceMode::Memory | BalanceMode::Cpu => (self.target() / 10).max(100),
            BalanceMode::Count => 1,
        }
    }

    pub fn classify(&self, node: &Node) -> LoadClass {
        let util = self.utilization(node);
        let target = self.target();
        match self.mode {
            BalanceMode::Memory | BalanceMode::Cpu => {
                let threshold = self.threshold();
                if util - target > threshold {
                    LoadClass::Overloaded
                } else if target - util > threshold {
                    LoadClass::Underloaded
                } else {
                    LoadClass::Balanced
                }
            }
            // Any node above the floor(total/nodes) share carries movable
            // mass; the planner's strict-improvement rule keeps remainder
            // VMs from bouncing between nodes once counts differ by one.
            BalanceMode::Count => {
                if util > target {
                    LoadClass::Overloaded
                } else if util < target {
                    LoadClass::Underloaded
                } else {
                    LoadClass::Balanced
                }
            }
        }
    }

    /// True iff at least one selectable node is overloaded.
    pub fn needs_rebalance(&self) -> bool {
        self.snapshot
            .nodes
            .values()
            .any(|n| n.selectable() && self.classify(n) == LoadClass::Overloaded)
    }

    /// Sum of `|utilization - target|` over all nodes; the scalar the
    /// planner drives down.
    pub fn imbalance(&self) -> i64 {
        let target = self.target();
        self.snapshot
            .nodes
            .values()
            .map(|n| (self.utilization(n) - target).abs())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use balancer_shared_types::VmStatus;

    const GIB: u64 = 1 << 30;

    fn vm(vmid: u32, node: &str, maxmem: u64, vcpus: u32) -> Vm {
        Vm {
            vmid,
            name: None,
            node: node.to_string(),
            maxmem,
            vcpus,
            status: VmStatus::Stopped,
            ha_managed: false,
        }
    }

    fn snapshot_two_nodes() -> ClusterSnapshot {
        let nodes = vec![
            Node::new("pve1", 100 * GIB, 10),
            Node::new("pve2", 100 * GIB, 10),
        ];
        let vms = vec![
            vm(100, "pve1", 20 * GIB, 4),
            vm(101, "pve1", 20 * GIB, 4),
            vm(102, "pve1", 20 * GIB, 4),
            vm(103, "pve1", 20 * GIB, 4),
        ];
        ClusterSnapshot::assemble(nodes, vms)
    }

    #[test]
    fn memory_utilization_is_exact_basis_points() {
        let snapshot = snapshot_two_nodes();
        let model = BalanceModel::new(&snapshot, BalanceMode::Memory);
        assert_eq!(model.utilization(&snapshot.nodes["pve1"]), 8_000);
        assert_eq!(model.utilization(&snapshot.nodes["pve2"]), 0);
        assert_eq!(model.target(), 4_000);
        assert_eq!(model.threshold(), 400);
    }

    #[test]
    fn cpu_mode_uses_vcpu_claims() {
        let snapshot = snapshot_two_nodes();
        let model = BalanceModel::new(&snapshot, BalanceMode::Cpu);
        assert_eq!(model.utilization(&snapshot.nodes["pve1"]), 16_000);
        assert_eq!(model.target(), 8_000);
        assert_eq!(model.threshold(), 800);
    }

    #[test]
    fn threshold_has_a_floor_on_lightly_loaded_clusters() {
        let nodes = vec![
            Node::new("pve1", 100 * GIB, 10),
            Node::new("pve2", 100 * GIB, 10),
        ];
        let vms = vec![vm(100, "pve1", GIB, 1)];
        let snapshot = ClusterSnapshot::assemble(nodes, vms);
        let model = BalanceModel::new(&snapshot, BalanceMode::Memory);
        // Target is 50 bp; 10% of that would vanish, the floor keeps 100 bp.
        assert_eq!(model.target(), 50);
        assert_eq!(model.threshold(), 100);
    }

    #[test]
    fn classification_against_the_band() {
        let snapshot = snapshot_two_nodes();
        let model = BalanceModel::new(&snapshot, BalanceMode::Memory);
        assert_eq!(
            model.classify(&snapshot.nodes["pve1"]),
            LoadClass::Overloaded
        );
        assert_eq!(
            model.classify(&snapshot.nodes["pve2"]),
            LoadClass::Underloaded
        );
        assert!(model.needs_rebalance());
    }

    #[test]
    fn even_cluster_is_balanced() {
        let nodes = vec![
            Node::new("pve1", 100 * GIB, 10),
            Node::new("pve2", 100 * GIB, 10),
        ];
        let vms = vec![
            vm(100, "pve1", 50 * GIB, 4),
            vm(101, "pve2", 50 * GIB, 4),
        ];
        let snapshot = ClusterSnapshot::assemble(nodes, vms);
        let model = BalanceModel::new(&snapshot, BalanceMode::Memory);
        assert_eq!(model.classify(&snapshot.nodes["pve1"]), LoadClass::Balanced);
        assert_eq!(model.classify(&snapshot.nodes["pve2"]), LoadClass::Balanced);
        assert!(!model.needs_rebalance());
        assert_eq!(model.imbalance(), 0);
    }

    #[test]
    fn count_mode_targets_the_floor_share() {
        let nodes = vec![
            Node::new("a", 100 * GIB, 10),
            Node::new("b", 100 * GIB, 10),
            Node::new("c", 100 * GIB, 10),
        ];
        let vms: Vec<Vm> = (0..6).map(|i| vm(100 + i, "a", GIB, 1)).collect();
        let snapshot = ClusterSnapshot::assemble(nodes, vms);
        let model = BalanceModel::new(&snapshot, BalanceMode::Count);
        assert_eq!(model.target(), 2);
        assert_eq!(model.threshold(), 1);
        assert_eq!(model.utilization(&snapshot.nodes["a"]), 6);
        assert_eq!(model.classify(&snapshot.nodes["a"]), LoadClass::Overloaded);
        assert_eq!(model.classify(&snapshot.nodes["b"]), LoadClass::Underloaded);
    }

    #[test]
    fn overloaded_coerced_node_does_not_trigger_rebalance() {
        let nodes = vec![Node::new("pve1", 0, 0), Node::new("pve2", 100 * GIB, 10)];
        let vms = vec![vm(100, "pve1", GIB, 1)];
        let snapshot = ClusterSnapshot::assemble(nodes, vms);
        let model = BalanceModel::new(&snapshot, BalanceMode::Memory);
        // The coerced node is wildly over target but never selectable.
        assert!(!model.needs_rebalance());
    }
}
