//! In-memory mocks of the store and the liveness collaborators.
//!
//! [`MockStore`] enforces the same optimistic-concurrency contract as the
//! API server: every stored object carries a `resourceVersion`, updates
//! with a stale version fail with [`StoreError::Conflict`], and creates of
//! existing names fail with [`StoreError::AlreadyExists`]. Tests can also
//! inject a number of artificial failures to drive the retry paths.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crds::{IPBinding, IPPool, IPPoolLedger};

use crate::store::{IpamStore, StoreError};
use crate::workload::{OwnerRef, PodInfo, VmInfo, WorkloadLookup};

/// In-memory [`IpamStore`] with API-server-like version semantics.
#[derive(Clone, Default)]
pub struct MockStore {
    pools: Arc<Mutex<HashMap<String, IPPool>>>,
    ledgers: Arc<Mutex<HashMap<String, IPPoolLedger>>>,
    bindings: Arc<Mutex<HashMap<String, IPBinding>>>,
    // Counter for generating resource versions
    next_version: Arc<Mutex<u64>>,
    // Failure injection counters
    ledger_update_conflicts: Arc<Mutex<u32>>,
    binding_create_errors: Arc<Mutex<u32>>,
    binding_delete_errors: Arc<Mutex<u32>>,
}

impl MockStore {
    /// Creates an empty mock store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pool to the mock store (for test setup).
    pub fn add_pool(&self, pool: IPPool) {
        let name = required_name(&pool.metadata);
        self.pools.lock().unwrap().insert(name, pool);
    }

    /// Add a ledger to the mock store (for test setup); stamps a version.
    pub fn add_ledger(&self, mut ledger: IPPoolLedger) {
        let name = required_name(&ledger.metadata);
        ledger.metadata.resource_version = Some(self.next_version());
        self.ledgers.lock().unwrap().insert(name, ledger);
    }

    /// Add a binding to the mock store (for test setup); stamps a version.
    pub fn add_binding(&self, mut binding: IPBinding) {
        let name = required_name(&binding.metadata);
        binding.metadata.resource_version = Some(self.next_version());
        self.bindings.lock().unwrap().insert(name, binding);
    }

    /// Current copy of a ledger, if present (for assertions).
    #[must_use]
    pub fn ledger(&self, name: &str) -> Option<IPPoolLedger> {
        self.ledgers.lock().unwrap().get(name).cloned()
    }

    /// Current copy of a binding, if present (for assertions).
    #[must_use]
    pub fn binding(&self, name: &str) -> Option<IPBinding> {
        self.bindings.lock().unwrap().get(name).cloned()
    }

    /// Make the next `n` ledger updates fail with a version conflict.
    pub fn inject_ledger_update_conflicts(&self, n: u32) {
        *self.ledger_update_conflicts.lock().unwrap() = n;
    }

    /// Make the next `n` binding creates fail with a transient api error.
    pub fn inject_binding_create_errors(&self, n: u32) {
        *self.binding_create_errors.lock().unwrap() = n;
    }

    /// Make the next `n` binding deletes fail with a transient api error.
    pub fn inject_binding_delete_errors(&self, n: u32) {
        *self.binding_delete_errors.lock().unwrap() = n;
    }

    fn next_version(&self) -> String {
        let mut version = self.next_version.lock().unwrap();
        *version += 1;
        version.to_string()
    }

    fn take_injected(counter: &Mutex<u32>) -> bool {
        let mut remaining = counter.lock().unwrap();
        if *remaining > 0 {
            *remaining -= 1;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl IpamStore for MockStore {
    async fn get_pool(&self, name: &str) -> Result<IPPool, StoreError> {
        self.pools
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("IPPool {name}")))
    }

    async fn list_pools(&self) -> Result<Vec<IPPool>, StoreError> {
        let mut pools: Vec<IPPool> = self.pools.lock().unwrap().values().cloned().collect();
        pools.sort_by_key(|p| p.metadata.name.clone());
        Ok(pools)
    }

    async fn get_ledger(&self, name: &str) -> Result<IPPoolLedger, StoreError> {
        self.ledgers
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("IPPoolLedger {name}")))
    }

    async fn create_ledger(&self, ledger: &IPPoolLedger) -> Result<IPPoolLedger, StoreError> {
        let name = required_name(&ledger.metadata);
        let mut ledgers = self.ledgers.lock().unwrap();
        if ledgers.contains_key(&name) {
            return Err(StoreError::AlreadyExists(format!("IPPoolLedger {name}")));
        }
        let mut stored = ledger.clone();
        stored.metadata.resource_version = Some(self.next_version());
        ledgers.insert(name, stored.clone());
        Ok(stored)
    }

    async fn update_ledger(&self, ledger: &IPPoolLedger) -> Result<IPPoolLedger, StoreError> {
        let name = required_name(&ledger.metadata);
        if Self::take_injected(&self.ledger_update_conflicts) {
            return Err(StoreError::Conflict(format!("IPPoolLedger {name}")));
        }
        let mut ledgers = self.ledgers.lock().unwrap();
        let current = ledgers
            .get(&name)
            .ok_or_else(|| StoreError::NotFound(format!("IPPoolLedger {name}")))?;
        if current.metadata.resource_version != ledger.metadata.resource_version {
            return Err(StoreError::Conflict(format!("IPPoolLedger {name}")));
        }
        let mut stored = ledger.clone();
        stored.metadata.resource_version = Some(self.next_version());
        ledgers.insert(name, stored.clone());
        Ok(stored)
    }

    async fn get_binding(&self, name: &str) -> Result<IPBinding, StoreError> {
        self.bindings
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("IPBinding {name}")))
    }

    async fn create_binding(&self, binding: &IPBinding) -> Result<IPBinding, StoreError> {
        let name = required_name(&binding.metadata);
        if Self::take_injected(&self.binding_create_errors) {
            return Err(StoreError::Api(format!("IPBinding {name}: injected failure")));
        }
        let mut bindings = self.bindings.lock().unwrap();
        if bindings.contains_key(&name) {
            return Err(StoreError::AlreadyExists(format!("IPBinding {name}")));
        }
        let mut stored = binding.clone();
        stored.metadata.resource_version = Some(self.next_version());
        bindings.insert(name, stored.clone());
        Ok(stored)
    }

    async fn update_binding(&self, binding: &IPBinding) -> Result<IPBinding, StoreError> {
        let name = required_name(&binding.metadata);
        let mut bindings = self.bindings.lock().unwrap();
        let current = bindings
            .get(&name)
            .ok_or_else(|| StoreError::NotFound(format!("IPBinding {name}")))?;
        if current.metadata.resource_version != binding.metadata.resource_version {
            return Err(StoreError::Conflict(format!("IPBinding {name}")));
        }
        let mut stored = binding.clone();
        stored.metadata.resource_version = Some(self.next_version());
        bindings.insert(name, stored.clone());
        Ok(stored)
    }

    async fn delete_binding(&self, name: &str) -> Result<(), StoreError> {
        if Self::take_injected(&self.binding_delete_errors) {
            return Err(StoreError::Api(format!("IPBinding {name}: injected failure")));
        }
        self.bindings
            .lock()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("IPBinding {name}")))
    }

    async fn list_bindings(&self) -> Result<Vec<IPBinding>, StoreError> {
        let mut bindings: Vec<IPBinding> =
            self.bindings.lock().unwrap().values().cloned().collect();
        bindings.sort_by_key(|b| b.metadata.name.clone());
        Ok(bindings)
    }
}

/// In-memory [`WorkloadLookup`].
///
/// A VMI is modeled as its owner slot: present means the VMI exists (with
/// or without an owner reference), absent means looking it up fails with
/// [`StoreError::NotFound`].
#[derive(Clone, Default)]
pub struct MockWorkloads {
    pods: Arc<Mutex<HashMap<(String, String), PodInfo>>>,
    vms: Arc<Mutex<HashMap<(String, String), VmInfo>>>,
    vmis: Arc<Mutex<HashMap<(String, String), Option<OwnerRef>>>>,
}

impl MockWorkloads {
    /// Creates an empty mock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pod (for test setup).
    pub fn add_pod(&self, pod: PodInfo) {
        let key = (pod.namespace.clone(), pod.name.clone());
        self.pods.lock().unwrap().insert(key, pod);
    }

    /// Remove a pod, as if it was deleted.
    pub fn remove_pod(&self, namespace: &str, name: &str) {
        self.pods
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()));
    }

    /// Add a virtual machine (for test setup).
    pub fn add_vm(&self, vm: VmInfo) {
        let key = (vm.namespace.clone(), vm.name.clone());
        self.vms.lock().unwrap().insert(key, vm);
    }

    /// Remove a virtual machine, as if it was deleted.
    pub fn remove_vm(&self, namespace: &str, name: &str) {
        self.vms
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()));
    }

    /// Add a VMI with its optional owner reference (for test setup).
    pub fn add_vmi(&self, namespace: &str, name: &str, owner: Option<OwnerRef>) {
        self.vmis
            .lock()
            .unwrap()
            .insert((namespace.to_string(), name.to_string()), owner);
    }
}

#[async_trait]
impl WorkloadLookup for MockWorkloads {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<PodInfo, StoreError> {
        self.pods
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("Pod {namespace}/{name}")))
    }

    async fn get_vmi_owner(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<OwnerRef>, StoreError> {
        self.vmis
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| {
                StoreError::NotFound(format!("VirtualMachineInstance {namespace}/{name}"))
            })
    }

    async fn get_vm(&self, namespace: &str, name: &str) -> Result<VmInfo, StoreError> {
        self.vms
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("VirtualMachine {namespace}/{name}")))
    }
}

fn required_name(metadata: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> String {
    metadata
        .name
        .clone()
        .unwrap_or_else(|| panic!("mock store objects must carry metadata.name"))
}
