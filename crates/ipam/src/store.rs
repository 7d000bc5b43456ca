//! Typed access to the durable IPAM records.
//!
//! The API server exclusively owns the durable copies of pools, ledgers and
//! bindings. Everything here hands out *snapshots*; updates are conditional
//! on the snapshot's `resourceVersion` and fail with [`StoreError::Conflict`]
//! when it went stale, which the retry combinator turns into a fresh
//! fetch-and-reapply cycle.

use async_trait::async_trait;
use kube::Client;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use thiserror::Error;

use crds::{IPBinding, IPPool, IPPoolLedger};

/// Store failures, classified so callers can tell signal from noise.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The object does not exist. Often benign (e.g., a ledger that has not
    /// been materialized yet, or a binding already reclaimed).
    #[error("{0} not found")]
    NotFound(String),

    /// The object's version changed since it was read; the write was
    /// rejected. Always retried against a fresh snapshot, never surfaced raw.
    #[error("stale write to {0}: version conflict")]
    Conflict(String),

    /// Create raced with another writer.
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// Transport or server failure.
    #[error("api error: {0}")]
    Api(String),
}

impl StoreError {
    /// Whether this is the distinguishable absent-object case.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Typed CRUD over the three durable record kinds.
#[async_trait]
pub trait IpamStore: Send + Sync {
    /// Fetch one pool descriptor by name.
    async fn get_pool(&self, name: &str) -> Result<IPPool, StoreError>;

    /// List every pool in the cluster.
    async fn list_pools(&self) -> Result<Vec<IPPool>, StoreError>;

    /// Fetch one pool ledger by name (same name as its pool).
    async fn get_ledger(&self, name: &str) -> Result<IPPoolLedger, StoreError>;

    /// Create a freshly materialized ledger.
    async fn create_ledger(&self, ledger: &IPPoolLedger) -> Result<IPPoolLedger, StoreError>;

    /// Conditionally update a ledger snapshot.
    async fn update_ledger(&self, ledger: &IPPoolLedger) -> Result<IPPoolLedger, StoreError>;

    /// Fetch one binding by its deterministic name.
    async fn get_binding(&self, name: &str) -> Result<IPBinding, StoreError>;

    /// Create a binding for a freshly assigned address.
    async fn create_binding(&self, binding: &IPBinding) -> Result<IPBinding, StoreError>;

    /// Conditionally update a binding snapshot.
    async fn update_binding(&self, binding: &IPBinding) -> Result<IPBinding, StoreError>;

    /// Delete a binding by name.
    async fn delete_binding(&self, name: &str) -> Result<(), StoreError>;

    /// List every binding in the cluster.
    async fn list_bindings(&self) -> Result<Vec<IPBinding>, StoreError>;
}

/// [`IpamStore`] over the Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore {
    pools: Api<IPPool>,
    ledgers: Api<IPPoolLedger>,
    bindings: Api<IPBinding>,
}

impl KubeStore {
    /// Creates a store over cluster-scoped APIs of the given client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            pools: Api::all(client.clone()),
            ledgers: Api::all(client.clone()),
            bindings: Api::all(client),
        }
    }
}

#[async_trait]
impl IpamStore for KubeStore {
    async fn get_pool(&self, name: &str) -> Result<IPPool, StoreError> {
        self.pools
            .get(name)
            .await
            .map_err(|e| map_kube_err(format!("IPPool {name}"), &e))
    }

    async fn list_pools(&self) -> Result<Vec<IPPool>, StoreError> {
        self.pools
            .list(&ListParams::default())
            .await
            .map(|list| list.items)
            .map_err(|e| map_kube_err("IPPool list", &e))
    }

    async fn get_ledger(&self, name: &str) -> Result<IPPoolLedger, StoreError> {
        self.ledgers
            .get(name)
            .await
            .map_err(|e| map_kube_err(format!("IPPoolLedger {name}"), &e))
    }

    async fn create_ledger(&self, ledger: &IPPoolLedger) -> Result<IPPoolLedger, StoreError> {
        let name = object_name(&ledger.metadata, "IPPoolLedger")?;
        self.ledgers
            .create(&PostParams::default(), ledger)
            .await
            .map_err(|e| map_kube_err(format!("IPPoolLedger {name}"), &e))
    }

    async fn update_ledger(&self, ledger: &IPPoolLedger) -> Result<IPPoolLedger, StoreError> {
        let name = object_name(&ledger.metadata, "IPPoolLedger")?;
        self.ledgers
            .replace(&name, &PostParams::default(), ledger)
            .await
            .map_err(|e| map_kube_err(format!("IPPoolLedger {name}"), &e))
    }

    async fn get_binding(&self, name: &str) -> Result<IPBinding, StoreError> {
        self.bindings
            .get(name)
            .await
            .map_err(|e| map_kube_err(format!("IPBinding {name}"), &e))
    }

    async fn create_binding(&self, binding: &IPBinding) -> Result<IPBinding, StoreError> {
        let name = object_name(&binding.metadata, "IPBinding")?;
        self.bindings
            .create(&PostParams::default(), binding)
            .await
            .map_err(|e| map_kube_err(format!("IPBinding {name}"), &e))
    }

    async fn update_binding(&self, binding: &IPBinding) -> Result<IPBinding, StoreError> {
        let name = object_name(&binding.metadata, "IPBinding")?;
        self.bindings
            .replace(&name, &PostParams::default(), binding)
            .await
            .map_err(|e| map_kube_err(format!("IPBinding {name}"), &e))
    }

    async fn delete_binding(&self, name: &str) -> Result<(), StoreError> {
        self.bindings
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| map_kube_err(format!("IPBinding {name}"), &e))
    }

    async fn list_bindings(&self) -> Result<Vec<IPBinding>, StoreError> {
        self.bindings
            .list(&ListParams::default())
            .await
            .map(|list| list.items)
            .map_err(|e| map_kube_err("IPBinding list", &e))
    }
}

/// Maps an API server error onto the store taxonomy.
pub(crate) fn map_kube_err(what: impl Into<String>, err: &kube::Error) -> StoreError {
    let what = what.into();
    match err {
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(what),
        kube::Error::Api(ae) if ae.reason == "AlreadyExists" => StoreError::AlreadyExists(what),
        kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict(what),
        _ => StoreError::Api(format!("{what}: {err}")),
    }
}

fn object_name(
    metadata: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta,
    kind: &str,
) -> Result<String, StoreError> {
    metadata
        .name
        .clone()
        .ok_or_else(|| StoreError::Api(format!("{kind} has no metadata.name")))
}
