//! Prints the Machine and Cluster CRDs as a multi-document YAML stream.

use crds::{Cluster, Machine};
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!("---\n{}", serde_yaml::to_string(&Cluster::crd())?);
    print!("---\n{}", serde_yaml::to_string(&Machine::crd())?);
    Ok(())
}
