//! cluster-ip operator: wiring for the convergence controller and probe agents

#![deny(missing_docs)]

/// Controller futures for both process modes
pub mod controller_runner;
/// Startup utilities (CRD install, probe image discovery)
pub mod startup;
