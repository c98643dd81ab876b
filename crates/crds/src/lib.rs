//! Cluster API CRD Definitions
//!
//! Kubernetes Custom Resource Definitions consumed by the machine controller.

pub mod cluster;
pub mod machine;
pub mod references;

pub use cluster::*;
pub use machine::*;
pub use references::*;
