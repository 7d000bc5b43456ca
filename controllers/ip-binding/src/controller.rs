//! Main controller implementation.
//!
//! Builds the Kubernetes client, the store and workload collaborators and
//! the GC reconciler, then supervises the watch task.

use std::sync::Arc;
use std::time::Duration;

use kube::{Api, Client};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crds::IPBinding;
use ipam::{KubeStore, KubeWorkloads};

use crate::error::ControllerError;
use crate::reconciler::GcReconciler;
use crate::watcher::Watcher;

/// Runtime configuration of the GC controller.
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// How often live bindings are re-checked.
    pub resync: Duration,
    /// Grace period between soft release and reclamation of fixed bindings.
    pub grace: chrono::Duration,
    /// Bound for the optimistic retry loops.
    pub retry: u32,
}

/// Main controller for IPBinding garbage collection.
pub struct Controller {
    binding_watcher: JoinHandle<Result<(), ControllerError>>,
}

impl Controller {
    /// Creates a new controller instance.
    pub async fn new(config: GcConfig) -> Result<Self, ControllerError> {
        info!("Initializing IPBinding GC Controller");

        // Create Kubernetes client and the collaborators around it
        let kube_client = Client::try_default().await?;
        let store = Arc::new(KubeStore::new(kube_client.clone()));
        let workloads = Arc::new(KubeWorkloads::new(kube_client.clone()));

        let reconciler = Arc::new(GcReconciler::new(
            store,
            workloads,
            config.grace,
            config.retry,
        ));

        // catch up on records orphaned while the controller was down
        info!("Running startup sweep over existing bindings");
        if let Err(e) = reconciler.sweep().await {
            warn!("startup sweep failed: {e}; the watch loop will catch up");
        }

        let binding_api: Api<IPBinding> = Api::all(kube_client);
        let watcher = Watcher::new(reconciler, binding_api, config.resync);

        // Start the watcher in a background task
        let binding_watcher = tokio::spawn(async move { watcher.watch_bindings().await });

        Ok(Self { binding_watcher })
    }

    /// Runs the controller until shutdown.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("IPBinding GC Controller running");

        match (&mut self.binding_watcher).await {
            Ok(result) => result,
            Err(e) => Err(ControllerError::Watch(format!(
                "IPBinding watcher panicked: {e}"
            ))),
        }
    }
}
