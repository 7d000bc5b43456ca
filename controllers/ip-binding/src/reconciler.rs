//! The per-binding garbage collection state machine.
//!
//! For every IPBinding, on each watch event and once per resync interval:
//!
//! - owner exists            -> no-op, check again next cycle
//! - owner gone, fixed,
//!   not yet released        -> stamp `released_at`, start the grace period
//! - owner gone, grace over
//!   (or ephemeral)          -> return the slot to the ledger, delete the
//!                              binding
//!
//! Reclamation tolerates racing the allocator: every mutation is
//! conditional, every retry re-fetches, and a binding missing from the
//! ledger's `recorders` means the ledger half was already done by someone
//! (or a previous crashed pass), so only the delete remains.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crds::IPBinding;
use ipam::identity::{self, BindingOwner};
use ipam::ledger;
use ipam::retry::with_retry;
use ipam::store::{IpamStore, StoreError};
use ipam::workload::{ResourceKind, WorkloadLookup};
use ipam::IpamError;

use crate::backoff::FibonacciBackoff;
use crate::error::ControllerError;

/// Backoff state for one binding.
#[derive(Debug)]
struct BackoffState {
    backoff: FibonacciBackoff,
    error_count: u32,
}

impl BackoffState {
    fn new() -> Self {
        Self {
            backoff: FibonacciBackoff::new(5, 300),
            error_count: 0,
        }
    }
}

/// Reconciles IPBinding records against the liveness of their owners.
pub struct GcReconciler {
    store: Arc<dyn IpamStore>,
    workloads: Arc<dyn WorkloadLookup>,
    /// How long a soft-released fixed binding is left alone before its
    /// slot is reclaimed.
    grace: chrono::Duration,
    retry: u32,
    /// Error tracking per binding name
    backoff_states: Mutex<HashMap<String, BackoffState>>,
}

impl GcReconciler {
    /// Creates a reconciler over the given collaborators.
    pub fn new(
        store: Arc<dyn IpamStore>,
        workloads: Arc<dyn WorkloadLookup>,
        grace: chrono::Duration,
        retry: u32,
    ) -> Self {
        Self {
            store,
            workloads,
            grace,
            retry,
            backoff_states: Mutex::new(HashMap::new()),
        }
    }

    /// Reconciles one binding now.
    pub async fn reconcile(&self, binding: &IPBinding) -> Result<(), ControllerError> {
        self.reconcile_at(binding, Utc::now()).await
    }

    /// Reconciles one binding as of the given instant.
    ///
    /// Time is a parameter so the grace-period transitions are testable
    /// without waiting them out.
    pub async fn reconcile_at(
        &self,
        binding: &IPBinding,
        now: DateTime<Utc>,
    ) -> Result<(), ControllerError> {
        let name = binding
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| ControllerError::InvalidRecord("IPBinding has no metadata.name".to_string()))?;
        if binding.spec.entries.is_empty() {
            return Err(ControllerError::InvalidRecord(format!(
                "IPBinding {name} has no entries"
            )));
        }

        let owner = identity::binding_owner(binding).map_err(ControllerError::Ipam)?;
        let kind = ResourceKind::parse(&owner.resource_kind).ok_or_else(|| {
            ControllerError::Ipam(IpamError::UnsupportedKind(owner.resource_kind.clone()))
        })?;

        if kind
            .exists(self.workloads.as_ref(), &owner.namespace, &owner.name)
            .await
            .map_err(IpamError::Store)?
        {
            debug!(binding = name, "owning resource still exists, waiting for next sync");
            return Ok(());
        }

        if owner.fixed {
            if binding.spec.entries.iter().any(|e| !e.is_released()) {
                self.mark_released(binding, now).await?;
                info!(binding = name, "owner is gone, marked released and started grace period");
                return Ok(());
            }
            if !self.grace_elapsed(binding, now) {
                debug!(binding = name, "grace period still running");
                return Ok(());
            }
        }

        self.reclaim(binding, name, kind, &owner).await
    }

    fn grace_elapsed(&self, binding: &IPBinding, now: DateTime<Utc>) -> bool {
        binding.spec.entries.iter().all(|entry| match entry.released_at {
            Some(at) => now - at >= self.grace,
            None => false,
        })
    }

    async fn mark_released(
        &self,
        binding: &IPBinding,
        now: DateTime<Utc>,
    ) -> Result<(), ControllerError> {
        let mut copy = binding.clone();
        for entry in &mut copy.spec.entries {
            entry.released_at = Some(now);
        }
        self.store
            .update_binding(&copy)
            .await
            .map_err(|e| ControllerError::Ipam(e.into()))?;
        Ok(())
    }

    async fn reclaim(
        &self,
        binding: &IPBinding,
        name: &str,
        kind: ResourceKind,
        owner: &BindingOwner,
    ) -> Result<(), ControllerError> {
        let entry = binding.spec.entries.first().ok_or_else(|| {
            ControllerError::InvalidRecord(format!("IPBinding {name} has no entries"))
        })?;
        let pool = entry.pool.clone();
        let index = entry.index;

        let finished = with_retry(self.retry, "return ledger slot", |_| {
            self.reclaim_once(&pool, index, name, kind, owner)
        })
        .await
        .map_err(ControllerError::Ipam)?;
        if !finished {
            info!(
                binding = name,
                "owning resource reappeared during reclamation, leaving binding in place"
            );
            return Ok(());
        }

        with_retry(self.retry, "delete binding", |_| self.delete_binding_once(name))
            .await
            .map_err(ControllerError::Ipam)?;
        info!(binding = name, pool = %pool, index, "reclaimed address and deleted binding");
        Ok(())
    }

    /// One reclamation attempt. `Ok(false)` means the owner came back and
    /// nothing must be reclaimed.
    async fn reclaim_once(
        &self,
        pool: &str,
        index: u64,
        binding_name: &str,
        kind: ResourceKind,
        owner: &BindingOwner,
    ) -> Result<bool, IpamError> {
        // re-check right before touching the ledger: a recreated owner
        // keeps its address
        if kind
            .exists(self.workloads.as_ref(), &owner.namespace, &owner.name)
            .await?
        {
            return Ok(false);
        }

        let mut snapshot = self.store.get_ledger(pool).await?;
        if !snapshot.spec.recorders.iter().any(|r| r == binding_name) {
            // ledger half already done, binding outlived its deletion;
            // touching the ledger again could free a re-assigned slot
            warn!(
                binding = binding_name,
                pool, "binding not in ledger recorders, skipping ledger update"
            );
            return Ok(true);
        }
        ledger::release_slot(&mut snapshot.spec, index, binding_name)?;
        self.store.update_ledger(&snapshot).await?;
        Ok(true)
    }

    async fn delete_binding_once(&self, name: &str) -> Result<(), IpamError> {
        match self.store.delete_binding(name).await {
            Ok(()) | Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// One pass over every binding in the cluster.
    ///
    /// Run once at startup before the watch loop takes over, so records
    /// orphaned while the controller was down are not left waiting for an
    /// unrelated event. Per-record failures are logged and skipped; one
    /// bad record never halts collection for the others.
    pub async fn sweep(&self) -> Result<(), ControllerError> {
        let bindings = self.store.list_bindings().await.map_err(IpamError::Store)?;
        info!(count = bindings.len(), "sweeping existing bindings");
        for binding in &bindings {
            let name = binding.metadata.name.as_deref().unwrap_or("<unnamed>");
            if let Err(e) = self.reconcile(binding).await {
                warn!(binding = name, error = %e, "sweep failed for binding, continuing");
            }
        }
        Ok(())
    }

    /// Next backoff for a failing binding, advancing its sequence.
    pub fn backoff_for(&self, binding_name: &str) -> (u64, u32) {
        match self.backoff_states.lock() {
            Ok(mut states) => {
                let state = states
                    .entry(binding_name.to_string())
                    .or_insert_with(BackoffState::new);
                state.error_count += 1;
                (state.backoff.next_seconds(), state.error_count)
            }
            Err(e) => {
                warn!("failed to lock backoff states: {e}, using default backoff");
                (60, 0)
            }
        }
    }

    /// Forget a binding's error history after a successful pass.
    pub fn reset_backoff(&self, binding_name: &str) {
        if let Ok(mut states) = self.backoff_states.lock() {
            states.remove(binding_name);
        }
    }
}
