//! Object Store Client
//!
//! Access layer between the machine controller and the Kubernetes API server.
//! Machines and Clusters are read and written as typed resources; provider
//! records (bootstrap and infrastructure configs) are handled as untyped
//! `DynamicObject`s whose fields are addressed by path.
//!
//! # Example
//!
//! ```no_run
//! use store_client::{KubeStore, ObjectStore, nested_bool};
//! use crds::ObjectReference;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = kube::Client::try_default().await?;
//! let store = KubeStore::new(client);
//!
//! let reference = ObjectReference::new(
//!     "infrastructure.cluster.x-k8s.io/v1alpha3",
//!     "AWSMachine",
//!     "worker-0",
//! );
//! if let Some(record) = store.get_external(&reference, "default").await? {
//!     let ready = nested_bool(&record.data, &["status", "ready"])?.unwrap_or(false);
//!     println!("infrastructure ready: {ready}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
#[path = "trait.rs"]
pub mod store_trait;
pub mod unstructured;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use client::KubeStore;
pub use error::StoreError;
pub use store_trait::ObjectStore;
pub use unstructured::*;
#[cfg(any(test, feature = "test-util"))]
pub use mock::MockObjectStore;

pub use kube::core::DynamicObject;
