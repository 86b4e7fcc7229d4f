pub mod rebalance;

// Re-exports
pub use rebalance::collect::{ClusterSnapshot, CollectedInventory, Collector};
pub use rebalance::migrate::{MigrationOutcome, MigrationSupervisor};
pub use rebalance::model::{BalanceModel, LoadClass, BASIS_POINTS};
pub use rebalance::plan::{plan, Migration, Planner, DEFAULT_MIGRATION_BUDGET};
pub use rebalance::{PassEvent, PassSummary, RebalancePass};
