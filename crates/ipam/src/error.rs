//! Allocation engine errors.
//!
//! The taxonomy separates transient store failures (retried internally with
//! a fresh fetch) from logical failures (surfaced to the caller untouched).

use thiserror::Error;

use crate::store::StoreError;
use ipcidr::CidrError;

/// Errors surfaced by the allocator and the reclamation paths.
#[derive(Debug, Error)]
pub enum IpamError {
    /// Backing store failure (not-found, stale write, transport)
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// CIDR parsing or index arithmetic failure
    #[error(transparent)]
    Cidr(#[from] CidrError),

    /// Malformed pool, annotation or record metadata
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An existing fixed binding contradicts the allocation request
    #[error("allocation conflict: {0}")]
    AllocationConflict(String),

    /// The explicitly requested address is taken, excluded or uncovered
    #[error("address unavailable: {0}")]
    AddressUnavailable(String),

    /// No requested pool has a free address
    #[error("pool exhausted: {0}")]
    PoolExhausted(String),

    /// Release was asked for an address nothing is holding
    #[error("binding not found: {0}")]
    RecordNotFound(String),

    /// A binding names a resource kind no liveness check exists for
    #[error("unsupported resource kind: {0}")]
    UnsupportedKind(String),

    /// Ledger and binding disagree; requires the GC controller or an
    /// operator to repair
    #[error("ledger and binding diverged: {0}")]
    Divergence(String),

    /// The bounded retry loop ran out of attempts
    #[error("{what}: gave up after {attempts} attempts")]
    RetryExhausted {
        /// What was being retried.
        what: String,
        /// The configured attempt bound.
        attempts: u32,
    },
}

impl IpamError {
    /// Whether another attempt against freshly fetched state can succeed.
    ///
    /// Only stale writes and transport-level store failures qualify;
    /// logical errors propagate immediately.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IpamError::Store(StoreError::Conflict(_)) | IpamError::Store(StoreError::Api(_))
        )
    }
}
