//! IPBinding CRD
//!
//! The durable owner record for allocated addresses: maps each address
//! (plus its pool, gateway and vlan) to the resource currently holding it.
//!
//! The binding's name encodes the allocation kind:
//! - fixed: `k8s-pod-network.{resource-kind}.{namespace}.{name}`
//! - ephemeral: `k8s-pod-network.{container-id}`
//!
//! A fixed binding survives pod restarts and is reclaimed by the GC
//! controller once its owning resource is gone; an ephemeral binding lives
//! for one attachment.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Label value set on every binding under its pool's name, so bindings of
/// one pool can be listed with a single label selector.
pub const POOL_LABEL_VALUE: &str = "ippool";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "ipam.microscaler.io",
    version = "v1alpha1",
    kind = "IPBinding"
)]
#[serde(rename_all = "camelCase")]
pub struct IPBindingSpec {
    /// Addresses held under this binding. Exactly one entry in the current
    /// design; multiple entries are reserved for per-replica bindings of
    /// set-managed workloads.
    pub entries: Vec<BindingEntry>,
}

/// One allocated address and the resource holding it.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BindingEntry {
    /// Name of the IPPool (and its ledger) the address came from
    pub pool: String,

    /// The allocated address
    pub address: String,

    /// Gateway of the pool at allocation time
    pub gateway: String,

    /// Slot index of the address in the pool's ledger
    pub index: u64,

    /// Kind of the holding resource ("pods" or "virtualmachines")
    pub resource_kind: String,

    /// Namespace of the holding resource
    pub namespace: String,

    /// Name of the holding resource
    pub name: String,

    /// VLAN of the pool at allocation time
    pub vlan: u32,

    /// When the entry was soft-released. `null` while the address is live;
    /// set once the owner is gone (or on advisory release) to start the
    /// grace period before the slot is reclaimed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub released_at: Option<DateTime<Utc>>,
}

impl BindingEntry {
    /// Whether the entry has been soft-released.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released_at.is_some()
    }
}

/// Labels stamped on a binding at creation: `{pool}: "ippool"`.
#[must_use]
pub fn binding_labels(pool: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(pool.to_string(), POOL_LABEL_VALUE.to_string())])
}
