//! Implementations of the [`ClusterClient`] capability.
//!
//! Two clients ship here:
//!
//! - [`PveshClient`] shells out to the hypervisor's `pvesh` CLI and is the
//!   client the `vmbalance` binary uses against a real cluster.
//! - [`MockClusterClient`] simulates a cluster in memory and is the test
//!   double the engine's test suite is built on.
//!
//! [`ClusterClient`]: cluster_client_interface::ClusterClient

pub mod mock;
pub mod pvesh_cli;

pub use mock::MockClusterClient;
pub use pvesh_cli::{PveshClient, PveshConfig};
