//! fixed-ipam CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the fixed-ipam allocator and
//! controllers. All three resources are cluster-scoped: pools span
//! namespaces, and binding names already encode the owning namespace.

pub mod ip_binding;
pub mod ip_pool;
pub mod ip_pool_ledger;

pub use ip_binding::*;
pub use ip_pool::*;
pub use ip_pool_ledger::*;
