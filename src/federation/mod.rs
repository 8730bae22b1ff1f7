//! Layer 1: Federation view
//!
//! The set of clusters currently joined into the multi-cluster, and the
//! gateways used to reach each of them.

pub mod oracle;

pub use oracle::{InMemoryMultiClusterOracle, MultiClusterConfiguration, MultiClusterOracle};
