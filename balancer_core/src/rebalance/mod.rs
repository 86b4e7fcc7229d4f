//! Rebalancing pass implementation.
//!
//! A pass drives the cluster toward equitable utilization of one resource
//! dimension in four stages:
//!
//! 1. **Collect**: snapshot node capacity, VM allocation, and the HA set
//! 2. **Model**: compute per-node and cluster-wide utilization and decide
//!    whether rebalancing is required
//! 3. **Plan**: greedily pick (source, destination, VM) moves
//! 4. **Migrate**: drive each move through its asynchronous task lifecycle
//!
//! ```text
//! ┌─────────┐      ┌───────┐      ┌──────┐      ┌─────────┐
//! │ Collect │─────▶│ Model │─────▶│ Plan │─────▶│ Migrate │
//! └─────────┘      └───────┘      └──────┘      └────┬────┘
//!                      ▲                             │
//!                      └──────── snapshot update ────┘
//! ```
//!
//! Planning and migration interleave: after every successful migration the
//! snapshot is updated in place so the next planning step sees the new
//! load. Exactly one migration is in flight at a time - concurrent moves
//! from the same source or to the same destination would invalidate the
//! allocation math the scoring depends on. The only parallelism is on the
//! read side, inside collection.
//!
//! # Failure policy
//!
//! Per-VM failures (start rejected, task failed, poll deadline passed) are
//! recovered locally: the VM is dropped from this pass and the loop
//! continues. Only precondition failures escape as errors; everything else
//! lands in the pass summary.

pub mod collect;
pub mod migrate;
pub mod model;
pub mod plan;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use balancer_shared_types::{BalanceMode, NodeName, Result, VmId, VmStatus};
use cluster_client_interface::ClusterClient;

use collect::{CollectedInventory, Collector};
use migrate::{MigrationOutcome, MigrationSupervisor};
use model::BalanceModel;
use plan::{Migration, Planner, DEFAULT_MIGRATION_BUDGET};

/// Something notable that happened during a pass. Events are kept in order
/// and summarized for the operator when the pass ends.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PassEvent {
    /// A migration completed. Utilizations are pre-move values: basis
    /// points in memory/cpu mode, raw VM counts in count mode.
    MigrationSucceeded {
        vmid: VmId,
        source: NodeName,
        target: NodeName,
        source_util: i64,
        target_util: i64,
    },
    MigrationStartFailed {
        vmid: VmId,
        reason: String,
    },
    MigrationFailed {
        vmid: VmId,
        exit_status: String,
    },
    MigrationTimedOut {
        vmid: VmId,
        seconds: u64,
    },
    NodeDegraded {
        node: NodeName,
        reason: String,
    },
    CapacityCoerced {
        node: NodeName,
    },
    DuplicateVm {
        vmid: VmId,
        kept: NodeName,
        discarded: NodeName,
    },
    HaListUnavailable {
        reason: String,
    },
}

/// What one pass did, for the operator and for tests.
#[derive(Debug, Clone, Serialize)]
pub struct PassSummary {
    pub mode: BalanceMode,
    /// The cluster was already inside the band; nothing was attempted.
    pub balanced_at_start: bool,
    /// Successfully applied moves, in order.
    pub migrations: Vec<Migration>,
    pub succeeded: usize,
    pub start_failed: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub cancelled: bool,
    pub events: Vec<PassEvent>,
}

impl PassSummary {
    fn new(mode: BalanceMode, events: Vec<PassEvent>) -> Self {
        Self {
            mode,
            balanced_at_start: false,
            migrations: Vec::new(),
            succeeded: 0,
            start_failed: 0,
            failed: 0,
            timed_out: 0,
            cancelled: false,
            events,
        }
    }

    /// Total failed migration attempts of any kind.
    pub fn failures(&self) -> usize {
        self.start_failed + self.failed + self.timed_out
    }
}

/// One rebalancing pass: collect once, then plan and migrate until the
/// cluster is inside the band, the budget runs out, or failures pile up.
pub struct RebalancePass {
    client: Arc<dyn ClusterClient>,
    mode: BalanceMode,
    max_migrations: usize,
    cancel: Arc<AtomicBool>,
    supervisor: MigrationSupervisor,
}

impl RebalancePass {
    pub fn new(client: Arc<dyn ClusterClient>, mode: BalanceMode) -> Self {
        let supervisor = MigrationSupervisor::new(Arc::clone(&client));
        Self {
            client,
            mode,
            max_migrations: DEFAULT_MIGRATION_BUDGET,
            cancel: Arc::new(AtomicBool::new(false)),
            supervisor,
        }
    }

    pub fn with_budget(mut self, max_migrations: usize) -> Self {
        self.max_migrations = max_migrations;
        self
    }

    pub fn with_supervisor(mut self, supervisor: MigrationSupervisor) -> Self {
        self.supervisor = supervisor;
        self
    }

    /// Flag observed at every iteration boundary; setting it ends the pass
    /// after the in-flight migration settles. The in-flight migration is
    /// never rolled back.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Snapshot the cluster for this pass.
    pub async fn collect(&self) -> Result<CollectedInventory> {
        Collector::new(Arc::clone(&self.client)).collect().await
    }

    /// Run the pass against a collected inventory. The snapshot is owned by
    /// the pass and discarded with it; a later pass re-collects from the
    /// cluster rather than trusting stale state.
    pub async fn run(&self, inventory: CollectedInventory) -> Result<PassSummary> {
        let CollectedInventory {
            mut snapshot,
            warnings,
        } = inventory;
        let mut summary = PassSummary::new(self.mode, warnings);

        if !BalanceModel::new(&snapshot, self.mode).needs_rebalance() {
            info!(mode = %self.mode, "Cluster already balanced");
            summary.balanced_at_start = true;
            return Ok(summary);
        }

        let mut planner = Planner::new(self.mode);
        let mut attempts = 0;
        while attempts < self.max_migrations {
            if self.cancel.load(Ordering::SeqCst) {
                info!("Cancellation requested; ending pass with partial results");
                summary.cancelled = true;
                break;
            }

            let Some(migration) = planner.next_move(&snapshot) else {
                break;
            };
            attempts += 1;

            let (source_util, target_util) = {
                let model = BalanceModel::new(&snapshot, self.mode);
                let util_of = |name: &str| {
                    snapshot
                        .nodes
                        .get(name)
                        .map(|n| model.utilization(n))
                        .unwrap_or_default()
                };
                (util_of(&migration.source), util_of(&migration.target))
            };

            // Re-query the VM at migration time: the collected status may be
            // minutes old and decides whether the move must be live.
            let Some(vm) = snapshot.vms.get(&migration.vmid) else {
                planner.note_failure(migration.vmid);
                continue;
            };
            let ha_managed = vm.ha_managed;
            let (vm_name, online) = match self
                .client
                .vm_status(&migration.source, migration.vmid)
                .await
            {
                Ok(current) => (
                    current.name.or_else(|| vm.name.clone()),
                    VmStatus::from(current.status.as_str()).is_running(),
                ),
                Err(err) => {
                    warn!(
                        vmid = migration.vmid,
                        error = %err,
                        "VM status query failed; using inventory status"
                    );
                    (vm.name.clone(), vm.status.is_running())
                }
            };

            info!(
                vmid = migration.vmid,
                name = vm_name.as_deref().unwrap_or("-"),
                source = %migration.source,
                target = %migration.target,
                source_util,
                target_util,
                online,
                ha_managed,
                "Migrating VM"
            );

            match self.supervisor.execute(&migration, online, ha_managed).await {
                MigrationOutcome::Succeeded => {
                    snapshot.apply_migration(&migration);
                    planner.note_success();
                    summary.succeeded += 1;
                    summary.events.push(PassEvent::MigrationSucceeded {
                        vmid: migration.vmid,
                        source: migration.source.clone(),
                        target: migration.target.clone(),
                        source_util,
                        target_util,
                    });
                    summary.migrations.push(migration);
                }
                MigrationOutcome::StartFailed { reason } => {
                    warn!(vmid = migration.vmid, %reason, "Migration did not start");
                    planner.note_failure(migration.vmid);
                    summary.start_failed += 1;
                    summary.events.push(PassEvent::MigrationStartFailed {
                        vmid: migration.vmid,
                        reason,
                    });
                }
                MigrationOutcome::Failed { exit_status } => {
                    warn!(vmid = migration.vmid, %exit_status, "Migration failed");
                    planner.note_failure(migration.vmid);
                    summary.failed += 1;
                    summary.events.push(PassEvent::MigrationFailed {
                        vmid: migration.vmid,
                        exit_status,
                    });
                }
                MigrationOutcome::TimedOut { after } => {
                    // The task may still finish on the cluster, so the
                    // snapshot keeps its pre-move view and the VM is not
                    // touched again this pass.
                    warn!(
                        vmid = migration.vmid,
                        seconds = after.as_secs(),
                        "Migration still running at deadline; leaving it to the cluster"
                    );
                    planner.note_failure(migration.vmid);
                    summary.timed_out += 1;
                    summary.events.push(PassEvent::MigrationTimedOut {
                        vmid: migration.vmid,
                        seconds: after.as_secs(),
                    });
                }
            }

            if planner.failures_exhausted() {
                warn!("Too many consecutive failures; ending pass");
                break;
            }
        }

        info!(
            mode = %self.mode,
            succeeded = summary.succeeded,
            failed = summary.failures(),
            cancelled = summary.cancelled,
            "Rebalancing pass finished"
        );
        Ok(summary)
    }
}
