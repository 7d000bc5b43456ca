//! Controller-specific error types.

use thiserror::Error;

use ipam::IpamError;
use kube::Error as KubeError;

/// Errors that can occur in the GC controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Allocation engine error (store, ledger, identity)
    #[error(transparent)]
    Ipam(#[from] IpamError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A binding that cannot be reconciled as written
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}
