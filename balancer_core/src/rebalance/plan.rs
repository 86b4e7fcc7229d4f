//! Rebalance planning - greedy selection of (source, destination, VM) moves.
//!
//! Each iteration picks the most loaded overloaded node, the least loaded
//! other node, and the VM whose move brings both nodes closest to the
//! cluster target. Selection is deterministic: ties on utilization break to
//! the lexicographically smallest node name, ties on score to the smallest
//! vmid. A candidate survives only if it strictly improves the combined
//! distance to target and does not push the destination past
//! `target + 2 x threshold`, so every accepted move shrinks the cluster
//! imbalance and the loop cannot oscillate.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::debug;

use balancer_shared_types::{BalanceMode, NodeName, VmId};

use super::collect::ClusterSnapshot;
use super::model::{BalanceModel, LoadClass};

/// Upper bound on migrations attempted in one pass unless overridden.
pub const DEFAULT_MIGRATION_BUDGET: usize = 20;

/// Consecutive supervisor failures after which a pass gives up; persistent
/// failure at this rate points at the cluster, not at candidate choice.
pub const CONSECUTIVE_FAILURE_LIMIT: u32 = 5;

/// One planned move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Migration {
    pub vmid: VmId,
    pub source: NodeName,
    pub target: NodeName,
}

/// Greedy move selector for one pass.
///
/// The planner carries per-pass memory: sources abandoned because no VM on
/// them was eligible, and VMs dropped after a failed migration attempt.
/// Neither is reconsidered within the same pass.
pub struct Planner {
    mode: BalanceMode,
    stuck_sources: BTreeSet<NodeName>,
    dropped_vms: BTreeSet<VmId>,
    consecutive_failures: u32,
}

impl Planner {
    pub fn new(mode: BalanceMode) -> Self {
        Self {
            mode,
            stuck_sources: BTreeSet::new(),
            dropped_vms: BTreeSet::new(),
            consecutive_failures: 0,
        }
    }

    /// The next move to attempt, or `None` when no overloaded node has an
    /// eligible VM.
    pub fn next_move(&mut self, snapshot: &ClusterSnapshot) -> Option<Migration> {
        loop {
            let model = BalanceModel::new(snapshot, self.mode);
            let source = self.select_source(snapshot, &model)?;
            let candidate = self
                .select_destination(snapshot, &model, &source)
                .and_then(|target| {
                    self.best_candidate(snapshot, &model, &source, &target)
                        .map(|vmid| (vmid, target))
                });
            match candidate {
                Some((vmid, target)) => {
                    return Some(Migration {
                        vmid,
                        source,
                        target,
                    })
                }
                None => {
                    debug!(node = %source, "No eligible VM on most loaded node; abandoning it for this pass");
                    self.stuck_sources.insert(source);
                }
            }
        }
    }

    /// Record a successful migration.
    pub fn note_success(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Record a failed migration attempt; the VM is not retried this pass.
    pub fn note_failure(&mut self, vmid: VmId) {
        self.dropped_vms.insert(vmid);
        self.consecutive_failures += 1;
    }

    /// True once consecutive failures indicate systemic trouble.
    pub fn failures_exhausted(&self) -> bool {
        self.consecutive_failures >= CONSECUTIVE_FAILURE_LIMIT
    }

    /// Most loaded overloaded node, skipping abandoned and non-selectable
    /// nodes. Ties break to the smallest name.
    fn select_source(&self, snapshot: &ClusterSnapshot, model: &BalanceModel) -> Option<NodeName> {
        let mut best: Option<(&NodeName, i64)> = None;
        for node in snapshot.nodes.values() {
            if !node.selectable() || self.stuck_sources.contains(&node.name) {
                continue;
            }
            if model.classify(node) != LoadClass::Overloaded {
                continue;
            }
            let util = model.utilization(node);
            if best.map_or(true, |(_, top)| util > top) {
                best = Some((&node.name, util));
            }
        }
        best.map(|(name, _)| name.clone())
    }

    /// Least loaded node other than the source. Ties break to the smallest
    /// name.
    fn select_destination(
        &self,
        snapshot: &ClusterSnapshot,
        model: &BalanceModel,
        source: &str,
    ) -> Option<NodeName> {
        let mut best: Option<(&NodeName, i64)> = None;
        for node in snapshot.nodes.values() {
            if node.name == source || !node.selectable() {
                continue;
            }
            let util = model.utilization(node);
            if best.map_or(true, |(_, low)| util < low) {
                best = Some((&node.name, util));
            }
        }
        best.map(|(name, _)| name.clone())
    }

    /// The VM on the source whose simulated move minimizes
    /// `|new_source - target| + |new_destination - target|`.
    ///
    /// Candidates are rejected when the move would leave the destination
    /// above `target + 2 x threshold` (moving an overload is not balancing)
    /// or would not strictly improve on the pre-move score. Ties break to
    /// the smallest vmid.
    fn best_candidate(
        &self,
        snapshot: &ClusterSnapshot,
        model: &BalanceModel,
        source: &str,
        target_node: &str,
    ) -> Option<VmId> {
        let source_node = snapshot.nodes.get(source)?;
        let dest_node = snapshot.nodes.get(target_node)?;
        let target = model.target();
        let threshold = model.threshold();
        let current_score = (model.utilization(source_node) - target).abs()
            + (model.utilization(dest_node) - target).abs();

        let mut best: Option<(i64, VmId)> = None;
        for vm in snapshot.vms_on(source) {
            if self.dropped_vms.contains(&vm.vmid) {
                continue;
            }
            let new_source = model.utilization_without(source_node, vm);
            let new_dest = model.utilization_with(dest_node, vm);
            if new_dest > target + 2 * threshold {
                continue;
            }
            let score = (new_source - target).abs() + (new_dest - target).abs();
            if score >= current_score {
                continue;
            }
            if best.map_or(true, |(top, _)| score < top) {
                best = Some((score, vm.vmid));
            }
        }
        best.map(|(_, vmid)| vmid)
    }
}

/// Compute the full move sequence for a snapshot without touching the
/// cluster: moves are simulated against a working copy as if every one
/// succeeded. Pure in its inputs - two invocations return identical
/// sequences - and bounded by `max_migrations`.
pub fn plan(
    snapshot: &ClusterSnapshot,
    mode: BalanceMode,
    max_migrations: usize,
) -> Vec<Migration> {
    let mut working = snapshot.clone();
    let mut planner = Planner::new(mode);
    let mut moves = Vec::new();
    while moves.len() < max_migrations {
        let Some(migration) = planner.next_move(&working) else {
            break;
        };
        working.apply_migration(&migration);
        planner.note_success();
        moves.push(migration);
    }
    moves
}

#[cfg(test)]
mod tests {
    use super::*;
    use balancer_shared_types::{Node, Vm, VmStatus};

    const GIB: u64 = 1 << 30;

    fn vm(vmid: u32, node: &str, maxmem: u64) -> Vm {
        Vm {
            vmid,
            name: None,
            node: node.to_string(),
            maxmem,
            vcpus: 2,
            status: VmStatus::Stopped,
            ha_managed: false,
        }
    }

    fn lopsided_pair() -> ClusterSnapshot {
        let nodes = vec![
            Node::new("pve1", 100 * GIB, 16),
            Node::new("pve2", 100 * GIB, 16),
        ];
        let vms = vec![
            vm(100, "pve1", 20 * GIB),
            vm(101, "pve1", 20 * GIB),
            vm(102, "pve1", 20 * GIB),
            vm(103, "pve1", 20 * GIB),
        ];
        ClusterSnapshot::assemble(nodes, vms)
    }

    #[test]
    fn drains_the_overloaded_node_to_the_band() {
        let snapshot = lopsided_pair();
        let moves = plan(&snapshot, BalanceMode::Memory, DEFAULT_MIGRATION_BUDGET);
        assert_eq!(moves.len(), 2);
        for m in &moves {
            assert_eq!(m.source, "pve1");
            assert_eq!(m.target, "pve2");
        }
        // Smallest vmid wins among equally scored candidates.
        assert_eq!(moves[0].vmid, 100);
        assert_eq!(moves[1].vmid, 101);

        let mut working = snapshot.clone();
        for m in &moves {
            working.apply_migration(m);
        }
        let model = BalanceModel::new(&working, BalanceMode::Memory);
        assert!(!model.needs_rebalance());
        assert_eq!(working.nodes["pve1"].memory_allocated, 40 * GIB);
        assert_eq!(working.nodes["pve2"].memory_allocated, 40 * GIB);
    }

    #[test]
    fn planning_is_deterministic() {
        let snapshot = lopsided_pair();
        let first = plan(&snapshot, BalanceMode::Memory, DEFAULT_MIGRATION_BUDGET);
        let second = plan(&snapshot, BalanceMode::Memory, DEFAULT_MIGRATION_BUDGET);
        assert_eq!(first, second);
    }

    #[test]
    fn balanced_cluster_plans_nothing() {
        let nodes = vec![
            Node::new("pve1", 100 * GIB, 16),
            Node::new("pve2", 100 * GIB, 16),
        ];
        let vms = vec![vm(100, "pve1", 50 * GIB), vm(101, "pve2", 50 * GIB)];
        let snapshot = ClusterSnapshot::assemble(nodes, vms);
        assert!(!BalanceModel::new(&snapshot, BalanceMode::Memory).needs_rebalance());
        assert!(plan(&snapshot, BalanceMode::Memory, DEFAULT_MIGRATION_BUDGET).is_empty());
    }

    #[test]
    fn budget_caps_the_move_count() {
        let snapshot = lopsided_pair();
        let moves = plan(&snapshot, BalanceMode::Memory, 1);
        assert_eq!(moves.len(), 1);
    }

    #[test]
    fn destination_guard_rejects_moves_that_overload_the_target() {
        // One 90 GiB VM; the only other node is a 50 GiB box. Moving it
        // would put the destination at 180% - far beyond the band.
        let nodes = vec![
            Node::new("pve1", 100 * GIB, 16),
            Node::new("pve2", 50 * GIB, 16),
        ];
        let vms = vec![vm(100, "pve1", 90 * GIB)];
        let snapshot = ClusterSnapshot::assemble(nodes, vms);
        let model = BalanceModel::new(&snapshot, BalanceMode::Memory);
        assert!(model.needs_rebalance());

        let moves = plan(&snapshot, BalanceMode::Memory, DEFAULT_MIGRATION_BUDGET);
        assert!(moves.is_empty());
    }

    #[test]
    fn guard_holds_across_every_planned_move() {
        let snapshot = lopsided_pair();
        let target = BalanceModel::new(&snapshot, BalanceMode::Memory).target();
        let threshold = BalanceModel::new(&snapshot, BalanceMode::Memory).threshold();

        let mut working = snapshot.clone();
        for m in plan(&snapshot, BalanceMode::Memory, DEFAULT_MIGRATION_BUDGET) {
            working.apply_migration(&m);
            let model = BalanceModel::new(&working, BalanceMode::Memory);
            let dest_util = model.utilization(&working.nodes[&m.target]);
            assert!(dest_util <= target + 2 * threshold);
        }
    }

    #[test]
    fn every_move_shrinks_the_imbalance() {
        let snapshot = lopsided_pair();
        let mut working = snapshot.clone();
        let mut previous = BalanceModel::new(&working, BalanceMode::Memory).imbalance();
        for m in plan(&snapshot, BalanceMode::Memory, DEFAULT_MIGRATION_BUDGET) {
            working.apply_migration(&m);
            let current = BalanceModel::new(&working, BalanceMode::Memory).imbalance();
            assert!(current < previous);
            previous = current;
        }
    }

    #[test]
    fn count_mode_spreads_across_destinations_in_name_order() {
        let nodes = vec![
            Node::new("a", 100 * GIB, 16),
            Node::new("b", 100 * GIB, 16),
            Node::new("c", 100 * GIB, 16),
        ];
        let vms: Vec<Vm> = (0..6).map(|i| vm(100 + i, "a", 4 * GIB)).collect();
        let snapshot = ClusterSnapshot::assemble(nodes, vms);

        let moves = plan(&snapshot, BalanceMode::Count, DEFAULT_MIGRATION_BUDGET);
        let targets: Vec<&str> = moves.iter().map(|m| m.target.as_str()).collect();
        assert_eq!(targets, vec!["b", "c", "b", "c"]);
        assert_eq!(moves.len(), 4);

        let mut working = snapshot.clone();
        for m in &moves {
            working.apply_migration(m);
        }
        assert_eq!(working.nodes["a"].vm_count, 2);
        assert_eq!(working.nodes["b"].vm_count, 2);
        assert_eq!(working.nodes["c"].vm_count, 2);
    }

    #[test]
    fn count_mode_leaves_the_remainder_alone() {
        // Seven VMs over three nodes settle at 3/2/2; shuffling the odd VM
        // around would never improve the score.
        let nodes = vec![
            Node::new("a", 100 * GIB, 16),
            Node::new("b", 100 * GIB, 16),
            Node::new("c", 100 * GIB, 16),
        ];
        let vms: Vec<Vm> = (0..7).map(|i| vm(100 + i, "a", 4 * GIB)).collect();
        let snapshot = ClusterSnapshot::assemble(nodes, vms);

        let moves = plan(&snapshot, BalanceMode::Count, DEFAULT_MIGRATION_BUDGET);
        let mut working = snapshot.clone();
        for m in &moves {
            working.apply_migration(m);
        }
        let mut counts: Vec<u32> = working.nodes.values().map(|n| n.vm_count).collect();
        counts.sort_unstable();
        assert_eq!(counts, vec![2, 2, 3]);
        // And replanning from the settled state is a no-op.
        assert!(plan(&working, BalanceMode::Count, DEFAULT_MIGRATION_BUDGET).is_empty());
    }

    #[test]
    fn dropped_vms_are_not_reselected() {
        let snapshot = lopsided_pair();
        let mut planner = Planner::new(BalanceMode::Memory);
        let first = planner.next_move(&snapshot).unwrap();
        assert_eq!(first.vmid, 100);

        planner.note_failure(first.vmid);
        let second = planner.next_move(&snapshot).unwrap();
        assert_eq!(second.vmid, 101);
    }

    #[test]
    fn consecutive_failures_trip_the_limit() {
        let mut planner = Planner::new(BalanceMode::Memory);
        for vmid in 0..CONSECUTIVE_FAILURE_LIMIT {
            assert!(!planner.failures_exhausted());
            planner.note_failure(vmid);
        }
        assert!(planner.failures_exhausted());

        planner.note_success();
        assert!(!planner.failures_exhausted());
    }

    #[test]
    fn stuck_source_falls_through_to_the_next_overloaded_node() {
        // pve1 holds one immovable 90 GiB VM, pve2 is mildly overloaded with
        // small VMs, pve3 is empty. The planner abandons pve1 and drains
        // pve2 instead.
        let nodes = vec![
            Node::new("pve1", 100 * GIB, 16),
            Node::new("pve2", 100 * GIB, 16),
            Node::new("pve3", 100 * GIB, 16),
        ];
        let mut vms = vec![vm(100, "pve1", 90 * GIB)];
        for i in 0..6 {
            vms.push(vm(200 + i, "pve2", 10 * GIB));
        }
        let snapshot = ClusterSnapshot::assemble(nodes, vms);

        let moves = plan(&snapshot, BalanceMode::Memory, DEFAULT_MIGRATION_BUDGET);
        assert!(!moves.is_empty());
        assert!(moves.iter().all(|m| m.source == "pve2"));
        assert!(moves.iter().all(|m| m.vmid != 100));
    }
}
