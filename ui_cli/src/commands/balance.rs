//! Balance command - inspect the cluster and run one rebalancing pass.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde::Serialize;
use tabled::Tabled;
use tracing::debug;

use balancer_core::{plan, BalanceModel, Migration, PassSummary, RebalancePass};
use balancer_shared_types::{BalanceError, BalanceMode, Node};
use cluster_client::PveshClient;
use cluster_client_interface::ClusterClient;

use crate::error::Result;
use crate::output::{self, print_data, print_item, section};
use crate::OutputFormat;

const GIB: f64 = (1u64 << 30) as f64;

/// Arguments for the balance command.
pub struct BalanceArgs {
    pub mode: BalanceMode,
    pub max_migrations: usize,
    pub dry_run: bool,
    pub yes: bool,
}

/// Display-friendly node for table output.
#[derive(Debug, Serialize, Tabled)]
struct NodeDisplay {
    #[tabled(rename = "Node")]
    name: String,
    #[tabled(rename = "VMs")]
    vms: u32,
    #[tabled(rename = "Memory (GiB)")]
    memory: String,
    #[tabled(rename = "vCPU")]
    cpu: String,
    #[tabled(rename = "Util")]
    util: String,
    #[tabled(rename = "State")]
    state: String,
}

impl NodeDisplay {
    fn from_node(node: &Node, model: &BalanceModel<'_>, mode: BalanceMode) -> Self {
        let state = if node.selectable() {
            model.classify(node).to_string()
        } else {
            "excluded".to_string()
        };
        NodeDisplay {
            name: node.name.clone(),
            vms: node.vm_count,
            memory: format!(
                "{:.1}/{:.1}",
                node.memory_allocated as f64 / GIB,
                node.memory_total as f64 / GIB
            ),
            cpu: format!("{}/{}", node.cpu_allocated, node.cpu_total),
            util: format_util(mode, model.utilization(node)),
            state,
        }
    }
}

/// Display-friendly migration for table output.
#[derive(Debug, Serialize, Tabled)]
struct MigrationDisplay {
    #[tabled(rename = "VM")]
    vmid: u32,
    #[tabled(rename = "From")]
    source: String,
    #[tabled(rename = "To")]
    target: String,
}

impl From<&Migration> for MigrationDisplay {
    fn from(m: &Migration) -> Self {
        MigrationDisplay {
            vmid: m.vmid,
            source: m.source.clone(),
            target: m.target.clone(),
        }
    }
}

fn format_util(mode: BalanceMode, util: i64) -> String {
    match mode {
        BalanceMode::Memory | BalanceMode::Cpu => format!("{:.1}%", util as f64 / 100.0),
        BalanceMode::Count => util.to_string(),
    }
}

/// Execute the balance command. Returns the process exit code.
pub async fn execute(args: BalanceArgs, format: OutputFormat) -> Result<i32> {
    let client: Arc<dyn ClusterClient> = Arc::new(PveshClient::new());
    let pass = RebalancePass::new(Arc::clone(&client), args.mode).with_budget(args.max_migrations);

    // Ctrl-C ends the pass at the next iteration boundary; the in-flight
    // migration is left to finish.
    let cancel = pass.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.store(true, Ordering::SeqCst);
        }
    });

    let inventory = match pass.collect().await {
        Ok(inventory) => inventory,
        Err(BalanceError::Precondition(msg)) => {
            output::error(&msg);
            return Ok(1);
        }
        Err(e) => {
            output::error(&format!("{}", e));
            return Ok(1);
        }
    };

    let needs_rebalance = {
        let model = BalanceModel::new(&inventory.snapshot, args.mode);
        let displays: Vec<NodeDisplay> = inventory
            .snapshot
            .nodes
            .values()
            .map(|n| NodeDisplay::from_node(n, &model, args.mode))
            .collect();
        if matches!(format, OutputFormat::Table) {
            section(&format!("Cluster ({} mode)", args.mode));
            print_data(&displays, format)?;
            output::info(&format!(
                "Target {} per node, threshold ±{}",
                format_util(args.mode, model.target()),
                format_util(args.mode, model.threshold()),
            ));
        }
        model.needs_rebalance()
    };

    if !needs_rebalance {
        output::success("Cluster is already balanced; nothing to do");
        return Ok(0);
    }

    if args.dry_run {
        let moves = plan(&inventory.snapshot, args.mode, args.max_migrations);
        debug!(moves = moves.len(), "Dry-run plan computed");
        section("Planned migrations (dry run)");
        let displays: Vec<MigrationDisplay> = moves.iter().map(Into::into).collect();
        print_data(&displays, format)?;
        return Ok(0);
    }

    if !args.yes {
        let proceed = output::confirm(&format!(
            "Rebalance now ({} mode, at most {} migrations)?",
            args.mode, args.max_migrations
        ))?;
        if !proceed {
            output::warn("Aborted by operator");
            return Ok(2);
        }
    }

    let summary = pass.run(inventory).await?;
    report(&summary, format)?;
    Ok(0)
}

fn report(summary: &PassSummary, format: OutputFormat) -> Result<()> {
    if let Some(serial) = format.serial() {
        return print_item(summary, serial);
    }

    section("Result");
    if !summary.migrations.is_empty() {
        let displays: Vec<MigrationDisplay> = summary.migrations.iter().map(Into::into).collect();
        print_data(&displays, format)?;
    }
    output::success(&format!("{} migration(s) completed", summary.succeeded));
    if summary.start_failed > 0 {
        output::warn(&format!("{} migration(s) did not start", summary.start_failed));
    }
    if summary.failed > 0 {
        output::warn(&format!("{} migration(s) failed", summary.failed));
    }
    if summary.timed_out > 0 {
        output::warn(&format!(
            "{} migration(s) still running at the deadline",
            summary.timed_out
        ));
    }
    if summary.cancelled {
        output::warn("Pass cancelled; partial results above");
    }
    Ok(())
}
