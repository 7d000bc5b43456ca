//! IPPoolLedger CRD
//!
//! The durable allocation record for one IPPool. Named after its pool,
//! materialized lazily the first time the pool is observed without one.
//!
//! The three spec fields partition the pool's usable index space: every
//! index is either free (in `unallocated`), in use (`allocations[i]` set),
//! or was excluded at materialization (`allocations[i]` set, never listed
//! in `unallocated`).

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "ipam.microscaler.io",
    version = "v1alpha1",
    kind = "IPPoolLedger"
)]
#[serde(rename_all = "camelCase")]
pub struct IPPoolLedgerSpec {
    /// The spec.cidr of the IPPool, copied at materialization
    pub cidr: String,

    /// The spec.vlan of the IPPool, copied at materialization
    pub vlan: u32,

    /// One slot per usable address of the CIDR. `null` means the address at
    /// that index is free; `Some(i)` at slot `i` means it is in use (or was
    /// excluded by the pool). The length never changes after creation.
    pub allocations: Vec<Option<u64>>,

    /// Indices currently free, kept sorted ascending so allocation always
    /// takes the numerically lowest free address.
    pub unallocated: Vec<u64>,

    /// Names of the IPBindings currently holding addresses in this pool
    #[serde(default)]
    pub recorders: Vec<String>,
}

impl IPPoolLedgerSpec {
    /// Number of addresses currently free.
    #[must_use]
    pub fn available(&self) -> u64 {
        self.unallocated.len() as u64
    }
}
