//! IPBinding watch loop.
//!
//! Uses `kube_runtime::Controller`, which handles reconnection and
//! dedup/queueing. A successful pass requeues the binding after the resync
//! interval, which is what turns the reconciler into a periodic sweep: a
//! binding whose owner is alive today is re-checked once per interval
//! until the owner disappears. Failures requeue on a per-binding Fibonacci
//! backoff; one bad record never stalls the others.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::Api;
use kube_runtime::{Controller, controller::Action, watcher};
use tracing::{error, info};

use crds::IPBinding;

use crate::error::ControllerError;
use crate::reconciler::GcReconciler;

/// Watches IPBinding resources and drives the GC reconciler.
pub struct Watcher {
    reconciler: Arc<GcReconciler>,
    binding_api: Api<IPBinding>,
    resync: Duration,
}

impl Watcher {
    /// Creates a new watcher instance.
    pub fn new(reconciler: Arc<GcReconciler>, binding_api: Api<IPBinding>, resync: Duration) -> Self {
        Self {
            reconciler,
            binding_api,
            resync,
        }
    }

    /// Runs the watch loop until the stream ends.
    pub async fn watch_bindings(self) -> Result<(), ControllerError> {
        info!("Starting IPBinding watcher");

        let resync = self.resync;
        let reconcile = move |binding: Arc<IPBinding>, ctx: Arc<GcReconciler>| async move {
            let key = binding.metadata.name.clone().unwrap_or_default();
            match ctx.reconcile(&binding).await {
                Ok(()) => {
                    ctx.reset_backoff(&key);
                    Ok(Action::requeue(resync))
                }
                Err(e) => Err(e),
            }
        };

        let error_policy =
            |binding: Arc<IPBinding>, err: &ControllerError, ctx: Arc<GcReconciler>| {
                let key = binding.metadata.name.clone().unwrap_or_default();
                let (backoff_seconds, error_count) = ctx.backoff_for(&key);
                error!(
                    binding = %key,
                    error = %err,
                    error_count,
                    "reconciliation failed, requeueing in {backoff_seconds}s"
                );
                Action::requeue(Duration::from_secs(backoff_seconds))
            };

        Controller::new(self.binding_api.clone(), watcher::Config::default())
            .run(reconcile, error_policy, self.reconciler.clone())
            .for_each(|result| async move {
                if let Err(e) = result {
                    error!("IPBinding controller error: {e}");
                }
            })
            .await;

        Ok(())
    }
}
