//! CLI error types.

use thiserror::Error;

/// CLI error type.
#[derive(Error, Debug)]
pub enum CliError {
    #[error("Rebalancing failed: {0}")]
    BalanceError(#[from] balancer_shared_types::BalanceError),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml_ng::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CliError>;
