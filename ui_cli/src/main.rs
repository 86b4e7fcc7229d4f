//! vmbalance - rebalance VM load across a hypervisor cluster.
//!
//! Thin shell around the rebalancing engine: argument parsing, the
//! confirmation prompt, and table/JSON/YAML rendering of what the engine
//! did. Exit codes: 0 on a balanced cluster or a completed pass, 1 on
//! precondition failures, 2 when the operator declines the prompt.

mod commands;
mod error;
mod output;

use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use balancer_shared_types::BalanceMode;

/// Cluster rebalancer CLI
#[derive(Parser)]
#[command(name = "vmbalance")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Resource dimension to balance
    #[arg(value_enum, default_value_t = Mode::Memory)]
    mode: Mode,

    /// Maximum number of migrations attempted in one pass
    #[arg(long, default_value_t = balancer_core::DEFAULT_MIGRATION_BUDGET)]
    max_migrations: usize,

    /// Print the planned moves without migrating anything
    #[arg(long)]
    dry_run: bool,

    /// Skip the confirmation prompt
    #[arg(short = 'y', long)]
    yes: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Output format
    #[arg(long, default_value = "table")]
    format: OutputFormat,
}

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
enum Mode {
    #[default]
    Memory,
    Cpu,
    Count,
}

impl From<Mode> for BalanceMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Memory => BalanceMode::Memory,
            Mode::Cpu => BalanceMode::Cpu,
            Mode::Count => BalanceMode::Count,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Yaml,
}

impl OutputFormat {
    /// The serialization this format selects, or `None` for table mode.
    pub fn serial(self) -> Option<output::SerialFormat> {
        match self {
            OutputFormat::Table => None,
            OutputFormat::Json => Some(output::SerialFormat::Json),
            OutputFormat::Yaml => Some(output::SerialFormat::Yaml),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let args = commands::balance::BalanceArgs {
        mode: cli.mode.into(),
        max_migrations: cli.max_migrations,
        dry_run: cli.dry_run,
        yes: cli.yes,
    };
    let code = match commands::balance::execute(args, cli.format).await {
        Ok(code) => code,
        Err(e) => {
            output::error(&format!("{}", e));
            1
        }
    };
    std::process::exit(code);
}
