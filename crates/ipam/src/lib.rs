//! fixed-ipam allocation engine
//!
//! Assigns, records and reclaims IPv4 addresses out of administrator-defined
//! pools for container and virtual-machine networking. Addresses can be
//! ephemeral (held for one attachment) or fixed (bound to a long-lived
//! VirtualMachine across pod restarts).
//!
//! The durable state lives in three cluster-scoped custom resources (see
//! the `crds` crate): `IPPool` descriptors, one `IPPoolLedger` of used/free
//! slots per pool, and one `IPBinding` owner record per held address. All
//! concurrency control is optimistic: read a snapshot, mutate it locally,
//! submit conditionally, and re-fetch on conflict up to a bounded number of
//! attempts.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ipam::{Allocator, AttachArgs, KubeStore, KubeWorkloads};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = kube::Client::try_default().await?;
//! let allocator = Allocator::new(
//!     Arc::new(KubeStore::new(client.clone())),
//!     Arc::new(KubeWorkloads::new(client)),
//! );
//!
//! let assignment = allocator
//!     .assign(&AttachArgs {
//!         namespace: "default".to_string(),
//!         name: "virt-launcher-vm-a".to_string(),
//!         container_id: "0a1b2c3d".to_string(),
//!     })
//!     .await?;
//! println!(
//!     "{} via {} on vlan {}",
//!     assignment.address, assignment.gateway, assignment.vlan
//! );
//! # Ok(())
//! # }
//! ```

pub mod allocator;
pub mod error;
pub mod identity;
pub mod ledger;
pub mod retry;
pub mod store;
pub mod workload;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

#[cfg(test)]
mod allocator_test;

pub use allocator::{Allocator, DEFAULT_RETRY, IpAssignment};
pub use error::IpamError;
pub use identity::{AttachArgs, BindingOwner, Consumer, PoolSelection};
pub use store::{IpamStore, KubeStore, StoreError};
pub use workload::{KubeWorkloads, OwnerRef, PodInfo, ResourceKind, VmInfo, WorkloadLookup};
