//! Migration supervision - driving one live migration to a terminal state.
//!
//! The supervisor issues the migration request and polls the resulting
//! control-plane task until it stops, times out, or never starts:
//!
//! ```text
//!   Requested ──► Submitted ──► Running ──► Completed(OK)     = Succeeded
//!                     │            │   └──► Completed(err)    = Failed
//!                     │            └──► (poll deadline)       = TimedOut
//!                     └──► (no task id)                       = StartFailed
//! ```
//!
//! Exactly one migration is in flight at a time; the caller owns the
//! snapshot and applies the outcome. On a timeout the supervisor does not
//! abort the task - it may still finish on the cluster - so the caller must
//! treat the VM's placement as unknown and leave the snapshot untouched.
//!
//! HA-managed VMs get a longer deadline: HA failover can insert extra
//! orchestration latency between request and task completion.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use cluster_client_interface::ClusterClient;

use super::plan::Migration;

/// Cadence of task status polls.
pub const POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Poll deadline for ordinary VMs.
pub const MIGRATION_TIMEOUT: Duration = Duration::from_secs(120);

/// Poll deadline for HA-managed VMs.
pub const HA_MIGRATION_TIMEOUT: Duration = Duration::from_secs(180);

/// Terminal state of one supervised migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    Succeeded,
    /// The control plane did not yield a task id.
    StartFailed { reason: String },
    /// The task finished with a non-OK exit status.
    Failed { exit_status: String },
    /// The task was still running at the deadline; it may yet succeed
    /// asynchronously, so the VM's placement is unknown.
    TimedOut { after: Duration },
}

/// Issues migration requests and waits for task completion.
pub struct MigrationSupervisor {
    client: Arc<dyn ClusterClient>,
    poll_interval: Duration,
    timeout: Duration,
    ha_timeout: Duration,
}

impl MigrationSupervisor {
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        Self {
            client,
            poll_interval: POLL_INTERVAL,
            timeout: MIGRATION_TIMEOUT,
            ha_timeout: HA_MIGRATION_TIMEOUT,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_timeouts(mut self, timeout: Duration, ha_timeout: Duration) -> Self {
        self.timeout = timeout;
        self.ha_timeout = ha_timeout;
        self
    }

    /// Drive one migration to a terminal state.
    ///
    /// `online` selects a live migration (the VM is running); `ha_managed`
    /// selects the longer poll deadline.
    pub async fn execute(
        &self,
        migration: &Migration,
        online: bool,
        ha_managed: bool,
    ) -> MigrationOutcome {
        let task = match self
            .client
            .start_migration(&migration.source, migration.vmid, &migration.target, online)
            .await
        {
            Ok(task) => task,
            Err(err) => {
                return MigrationOutcome::StartFailed {
                    reason: err.to_string(),
                }
            }
        };
        debug!(
            vmid = migration.vmid,
            task = %task,
            online,
            ha_managed,
            "Migration task submitted"
        );

        let deadline = if ha_managed {
            self.ha_timeout
        } else {
            self.timeout
        };
        let started = tokio::time::Instant::now();
        loop {
            match self.client.task_status(&migration.source, &task).await {
                Ok(status) if status.is_finished() => {
                    if status.is_ok() {
                        info!(vmid = migration.vmid, task = %task, "Migration task completed");
                        return MigrationOutcome::Succeeded;
                    }
                    let exit_status = status
                        .exit_status
                        .unwrap_or_else(|| "unknown".to_string());
                    return MigrationOutcome::Failed { exit_status };
                }
                Ok(_) => {}
                Err(err) => {
                    // Transient poll failures are retried until the deadline.
                    warn!(
                        vmid = migration.vmid,
                        task = %task,
                        error = %err,
                        "Task status poll failed; retrying"
                    );
                }
            }
            if started.elapsed() >= deadline {
                return MigrationOutcome::TimedOut { after: deadline };
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
