//! IPPool CRD
//!
//! Administrator-defined IPv4 address pools the allocator assigns from.
//! Pools are immutable after creation: their ledger's slot array is sized
//! once from the CIDR and never resized, so resizing or re-excluding would
//! require a migration this design does not attempt.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "ipam.microscaler.io",
    version = "v1alpha1",
    kind = "IPPool"
)]
#[serde(rename_all = "camelCase")]
pub struct IPPoolSpec {
    /// Pool CIDR (e.g., "192.168.2.0/24")
    pub cidr: String,

    /// VLAN tag handed back with every assignment. The valid range is 1-4094.
    pub vlan: u32,

    /// Gateway address handed back with every assignment
    pub gateway: String,

    /// Addresses that are permanently unavailable (e.g., reserved for
    /// infrastructure). Applied once, when the ledger is materialized.
    #[serde(default)]
    pub exclude_ips: Vec<String>,
}
