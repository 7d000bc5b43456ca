//! The assignment and release engine.
//!
//! One allocator call serves one attach or detach request. All coordination
//! between concurrent callers goes through the store's conditional updates:
//! the allocator holds no in-process shared state, and a stale snapshot is
//! always thrown away and re-fetched rather than patched up.
//!
//! Ordering of the two durable writes on assignment is load-bearing: the
//! ledger slot is taken first, and the binding is created only after that
//! update stuck. A crash in between leaves a slot charged to a binding
//! name that does not exist yet, which the GC controller can see and
//! repair; the reverse order could hand one address to two owners.

use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{debug, error, info, warn};

use crds::{BindingEntry, IPBinding, IPBindingSpec, IPPool, IPPoolLedger, binding_labels};
use ipcidr::Cidr;

use crate::error::IpamError;
use crate::identity::{self, AttachArgs, Consumer, PoolSelection};
use crate::ledger;
use crate::retry::with_retry;
use crate::store::{IpamStore, StoreError};
use crate::workload::{OwnerRef, PodInfo, ResourceKind, WorkloadLookup};

/// Default bound for every optimistic retry loop.
pub const DEFAULT_RETRY: u32 = 10;

/// What an attach request gets back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpAssignment {
    /// The assigned address.
    pub address: String,
    /// Gateway of the pool the address came from.
    pub gateway: String,
    /// VLAN of the pool the address came from.
    pub vlan: u32,
}

/// The assignment/release engine.
///
/// Carries its collaborators explicitly; construct one per process and
/// share it, or build one per request, both are fine - it holds no mutable
/// state.
#[derive(Clone)]
pub struct Allocator {
    store: Arc<dyn IpamStore>,
    workloads: Arc<dyn WorkloadLookup>,
    retry: u32,
}

impl Allocator {
    /// Creates an allocator with the default retry bound.
    #[must_use]
    pub fn new(store: Arc<dyn IpamStore>, workloads: Arc<dyn WorkloadLookup>) -> Self {
        Self {
            store,
            workloads,
            retry: DEFAULT_RETRY,
        }
    }

    /// Overrides the retry bound.
    #[must_use]
    pub fn with_retry_bound(mut self, retry: u32) -> Self {
        self.retry = retry;
        self
    }

    /// Assigns an address for an attach request.
    ///
    /// Fixed consumers whose binding already exists get their recorded
    /// address back (validated against the request); everyone else gets a
    /// fresh slot out of the requested pools.
    pub async fn assign(&self, args: &AttachArgs) -> Result<IpAssignment, IpamError> {
        let consumer = identity::resolve(self.workloads.as_ref(), args).await?;
        let pools = self.requested_pools(&consumer).await?;

        if consumer.fixed {
            match self.store.get_binding(&consumer.binding_name).await {
                Ok(binding) => {
                    info!(binding = %consumer.binding_name, "reusing existing fixed binding");
                    return self.rebind(binding, &consumer, &pools).await;
                }
                Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.assign_fresh(&consumer, &pools).await
    }

    /// Releases the address held for a detach request.
    ///
    /// Fixed releases are advisory: they mark the binding released and
    /// leave actual reclamation to the GC controller. Ephemeral releases
    /// return the slot and delete the binding, deferring to the GC
    /// controller only when the ledger cannot be updated in time.
    pub async fn release(&self, args: &AttachArgs) -> Result<(), IpamError> {
        let pod = self.workloads.get_pod(&args.namespace, &args.name).await?;
        match identity::fixed_owner(self.workloads.as_ref(), &pod).await? {
            Some(owner) => self.release_fixed(&pod, &owner).await,
            None => self.release_ephemeral(&args.container_id).await,
        }
    }

    async fn requested_pools(&self, consumer: &Consumer) -> Result<Vec<IPPool>, IpamError> {
        match &consumer.pools {
            PoolSelection::Named(names) => {
                let mut pools = Vec::with_capacity(names.len());
                for name in names {
                    pools.push(self.store.get_pool(name).await?);
                }
                Ok(pools)
            }
            PoolSelection::All => {
                let pools = self.store.list_pools().await?;
                if pools.is_empty() {
                    return Err(IpamError::PoolExhausted(
                        "no IPPool exists in the cluster".to_string(),
                    ));
                }
                Ok(pools)
            }
        }
    }

    /// Reuse path for a fixed consumer whose binding survived.
    async fn rebind(
        &self,
        binding: IPBinding,
        consumer: &Consumer,
        pools: &[IPPool],
    ) -> Result<IpAssignment, IpamError> {
        let name = consumer.binding_name.clone();
        with_retry(self.retry, "rebind fixed binding", |attempt| {
            self.rebind_once(
                &name,
                (attempt == 1).then(|| binding.clone()),
                consumer,
                pools,
            )
        })
        .await
    }

    async fn rebind_once(
        &self,
        name: &str,
        cached: Option<IPBinding>,
        consumer: &Consumer,
        pools: &[IPPool],
    ) -> Result<IpAssignment, IpamError> {
        let mut binding = match cached {
            Some(binding) => binding,
            None => self.store.get_binding(name).await?,
        };
        let entry = binding
            .spec
            .entries
            .first_mut()
            .ok_or_else(|| IpamError::Divergence(format!("IPBinding {name} has no entries")))?;

        // validate before touching anything; a conflicting request must
        // not mutate the record
        if let Some(requested) = consumer.address {
            if entry.address != requested.to_string() {
                return Err(IpamError::AllocationConflict(format!(
                    "IPBinding {name} holds {}, but {requested} was requested",
                    entry.address
                )));
            }
        } else if !pools
            .iter()
            .any(|p| p.metadata.name.as_deref() == Some(entry.pool.as_str()))
        {
            return Err(IpamError::AllocationConflict(format!(
                "IPBinding {name} draws from pool {}, which is not in the requested set",
                entry.pool
            )));
        }

        entry.released_at = None;
        let assignment = IpAssignment {
            address: entry.address.clone(),
            gateway: entry.gateway.clone(),
            vlan: entry.vlan,
        };
        self.store.update_binding(&binding).await?;
        info!(binding = name, address = %assignment.address, "fixed binding back in use");
        Ok(assignment)
    }

    async fn assign_fresh(
        &self,
        consumer: &Consumer,
        pools: &[IPPool],
    ) -> Result<IpAssignment, IpamError> {
        let (pool, index, address) = with_retry(self.retry, "commit ledger assignment", |_| {
            self.commit_slot(consumer, pools)
        })
        .await?;
        let pool_name = pool_name(&pool)?.to_string();

        // the slot is durably charged to the binding name; only now does
        // the binding itself come into existence
        let binding = new_binding(consumer, &pool, &pool_name, index, address);
        with_retry(self.retry, "create binding", |_| {
            self.create_binding_once(&binding)
        })
        .await?;

        info!(
            binding = %consumer.binding_name,
            pool = %pool_name,
            index,
            address = %address,
            "assigned address"
        );
        Ok(IpAssignment {
            address: address.to_string(),
            gateway: pool.spec.gateway.clone(),
            vlan: pool.spec.vlan,
        })
    }

    /// One attempt at taking a slot: select, mutate a fresh ledger
    /// snapshot, submit. A version conflict throws the whole selection
    /// away; the next attempt starts from a re-fetched ledger.
    async fn commit_slot(
        &self,
        consumer: &Consumer,
        pools: &[IPPool],
    ) -> Result<(IPPool, u64, Ipv4Addr), IpamError> {
        if let Some(address) = consumer.address {
            let pool = pools
                .iter()
                .find(|p| Cidr::parse(&p.spec.cidr).is_ok_and(|c| c.contains(address)))
                .ok_or_else(|| {
                    IpamError::AddressUnavailable(format!(
                        "{address} is not covered by the requested pools"
                    ))
                })?;
            let name = pool_name(pool)?.to_string();
            let cidr = Cidr::parse(&pool.spec.cidr)?;
            let index = cidr
                .index_of(address)
                .map_err(|e| IpamError::AddressUnavailable(e.to_string()))?;

            let mut snapshot = self.fetch_or_materialize(pool, &name).await?;
            if snapshot.spec.unallocated.binary_search(&index).is_err() {
                return Err(IpamError::AddressUnavailable(format!(
                    "{address} in pool {name} is already in use or excluded"
                )));
            }
            ledger::assign_slot(&mut snapshot.spec, index, &consumer.binding_name)?;
            self.store.update_ledger(&snapshot).await?;
            return Ok((pool.clone(), index, address));
        }

        for pool in pools {
            let name = pool_name(pool)?.to_string();
            let mut snapshot = self.fetch_or_materialize(pool, &name).await?;
            let Some(index) = ledger::first_free(&snapshot.spec) else {
                debug!(pool = %name, "pool has no free addresses, trying next");
                continue;
            };
            let cidr = Cidr::parse(&pool.spec.cidr)?;
            let address = cidr.address_at(index)?;
            ledger::assign_slot(&mut snapshot.spec, index, &consumer.binding_name)?;
            self.store.update_ledger(&snapshot).await?;
            return Ok((pool.clone(), index, address));
        }
        Err(IpamError::PoolExhausted(
            "no free addresses in the requested pools".to_string(),
        ))
    }

    /// Fetches a pool's ledger, deriving and creating it on first use.
    /// Losing the creation race falls back to the winner's copy.
    async fn fetch_or_materialize(
        &self,
        pool: &IPPool,
        name: &str,
    ) -> Result<IPPoolLedger, IpamError> {
        match self.store.get_ledger(name).await {
            Ok(snapshot) => Ok(snapshot),
            Err(StoreError::NotFound(_)) => {
                info!(pool = name, "materializing ledger on first use");
                let fresh = ledger::materialize(pool)?;
                match self.store.create_ledger(&fresh).await {
                    Ok(created) => Ok(created),
                    Err(StoreError::AlreadyExists(_)) => {
                        self.store.get_ledger(name).await.map_err(Into::into)
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn create_binding_once(&self, binding: &IPBinding) -> Result<(), IpamError> {
        match self.store.create_binding(binding).await {
            Ok(_) => Ok(()),
            Err(StoreError::AlreadyExists(_)) => {
                let name = binding.metadata.name.as_deref().unwrap_or_default();
                error!(
                    binding = name,
                    "binding already exists but its ledger slot was just assigned"
                );
                Err(IpamError::Divergence(format!(
                    "IPBinding {name} already exists while its ledger slot was just assigned; \
                     operator intervention required"
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Advisory release of a fixed address: mark released, reclaim never.
    ///
    /// Every failure past the owner lookup is logged and swallowed. The
    /// orchestration may be about to recreate the VM's pod, and deleting
    /// the binding here would hand its address away in the meantime; the
    /// GC controller owns actual reclamation.
    async fn release_fixed(&self, pod: &PodInfo, owner: &OwnerRef) -> Result<(), IpamError> {
        let vm = match self.workloads.get_vm(&pod.namespace, &owner.name).await {
            Ok(vm) => vm,
            Err(StoreError::NotFound(_)) => {
                warn!(
                    namespace = %pod.namespace,
                    vm = %owner.name,
                    "owning VirtualMachine is gone; reclamation left to the GC controller"
                );
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let binding_name =
            identity::fixed_binding_name(ResourceKind::VirtualMachines, &vm.namespace, &vm.name);
        let mut binding = match self.store.get_binding(&binding_name).await {
            Ok(binding) => binding,
            Err(e) => {
                warn!(binding = %binding_name, error = %e, "could not fetch fixed binding on release; GC will reconcile");
                return Ok(());
            }
        };

        let now = Utc::now();
        for entry in binding.spec.entries.iter_mut().filter(|e| e.name == vm.name) {
            entry.released_at = Some(now);
        }
        match self.store.update_binding(&binding).await {
            Ok(_) => info!(binding = %binding_name, "marked fixed binding released"),
            Err(e) => {
                warn!(binding = %binding_name, error = %e, "could not mark fixed binding released; GC will reconcile");
            }
        }
        Ok(())
    }

    async fn release_ephemeral(&self, container_id: &str) -> Result<(), IpamError> {
        let binding_name = identity::ephemeral_binding_name(container_id);
        let binding = match self.store.get_binding(&binding_name).await {
            Ok(binding) => binding,
            Err(StoreError::NotFound(_)) => return Err(IpamError::RecordNotFound(binding_name)),
            Err(e) => return Err(e.into()),
        };
        let entry = binding
            .spec
            .entries
            .first()
            .ok_or_else(|| IpamError::Divergence(format!("IPBinding {binding_name} has no entries")))?;
        let pool = entry.pool.clone();
        let index = entry.index;

        let returned = with_retry(self.retry, "return ledger slot", |_| {
            self.release_slot_once(&pool, index, &binding_name)
        })
        .await;
        if let Err(e) = returned {
            // the caller is never blocked on cleanup; the GC controller
            // will find the binding and finish the job
            warn!(
                binding = %binding_name,
                pool = %pool,
                error = %e,
                "could not return slot to the ledger; leaving cleanup to the GC controller"
            );
            return Ok(());
        }

        with_retry(self.retry, "delete binding", |_| {
            self.delete_binding_once(&binding_name)
        })
        .await?;
        info!(binding = %binding_name, pool = %pool, index, "released ephemeral address");
        Ok(())
    }

    async fn release_slot_once(
        &self,
        pool: &str,
        index: u64,
        recorder: &str,
    ) -> Result<(), IpamError> {
        let mut snapshot = self.store.get_ledger(pool).await?;
        ledger::release_slot(&mut snapshot.spec, index, recorder)?;
        self.store.update_ledger(&snapshot).await?;
        Ok(())
    }

    async fn delete_binding_once(&self, name: &str) -> Result<(), IpamError> {
        match self.store.delete_binding(name).await {
            Ok(()) | Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn pool_name(pool: &IPPool) -> Result<&str, IpamError> {
    pool.metadata
        .name
        .as_deref()
        .ok_or_else(|| IpamError::InvalidConfig("IPPool has no metadata.name".to_string()))
}

fn new_binding(
    consumer: &Consumer,
    pool: &IPPool,
    pool_name: &str,
    index: u64,
    address: Ipv4Addr,
) -> IPBinding {
    IPBinding {
        metadata: ObjectMeta {
            name: Some(consumer.binding_name.clone()),
            labels: Some(binding_labels(pool_name)),
            ..ObjectMeta::default()
        },
        spec: IPBindingSpec {
            entries: vec![BindingEntry {
                pool: pool_name.to_string(),
                address: address.to_string(),
                gateway: pool.spec.gateway.clone(),
                index,
                resource_kind: consumer.kind.as_str().to_string(),
                namespace: consumer.namespace.clone(),
                name: consumer.name.clone(),
                vlan: pool.spec.vlan,
                released_at: None,
            }],
        },
    }
}
