//! Convergent: declarative infrastructure convergence.
//!
//! Modules are parsed into a resource graph, checked against the live
//! system in parallel, and applied where they differ. Remote modules are
//! verified against an OpenPGP keystore.

pub mod cli;
pub mod core;
pub mod graph;
pub mod keystore;
pub mod logging;
pub mod resources;
pub mod transport;
