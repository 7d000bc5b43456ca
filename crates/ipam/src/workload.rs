//! Liveness collaborators: lookups for the resources that hold addresses.
//!
//! The allocator and the GC controller never thread raw kind strings
//! around; [`ResourceKind`] is parsed once at the boundary and dispatched
//! as a capability from there on.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::Client;
use kube::api::{Api, ApiResource, DynamicObject};
use kube::core::GroupVersionKind;

use crate::store::{StoreError, map_kube_err};

/// Kind of a pod's (or VMI's) owner as recorded in its owner references.
pub const KIND_VIRTUAL_MACHINE_INSTANCE: &str = "VirtualMachineInstance";
/// Kind of a VMI's owner for a long-lived virtual machine.
pub const KIND_VIRTUAL_MACHINE: &str = "VirtualMachine";

/// Resource token persisted in binding names and entries for pods.
pub const RESOURCES_POD: &str = "pods";
/// Resource token persisted in binding names and entries for VMs.
pub const RESOURCES_VIRTUAL_MACHINE: &str = "virtualmachines";

/// First owner reference of a workload object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerRef {
    /// Kind of the owner (e.g., "VirtualMachineInstance").
    pub kind: String,
    /// Name of the owner, in the same namespace as the owned object.
    pub name: String,
}

/// The slice of a pod the allocator needs.
#[derive(Debug, Clone)]
pub struct PodInfo {
    /// Namespace of the pod.
    pub namespace: String,
    /// Name of the pod.
    pub name: String,
    /// The pod's annotations.
    pub annotations: BTreeMap<String, String>,
    /// The pod's first owner reference, if it has one.
    pub owner: Option<OwnerRef>,
}

/// The slice of a virtual machine the allocator needs.
#[derive(Debug, Clone)]
pub struct VmInfo {
    /// Namespace of the VM.
    pub namespace: String,
    /// Name of the VM.
    pub name: String,
    /// The VM's annotations.
    pub annotations: BTreeMap<String, String>,
}

/// Lookup-by-namespaced-name per supported resource kind.
///
/// `get_*` must fail with [`StoreError::NotFound`] when the object is
/// absent, so callers can tell "gone" from "broken".
#[async_trait]
pub trait WorkloadLookup: Send + Sync {
    /// Fetch a pod.
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<PodInfo, StoreError>;

    /// One hop up a VirtualMachineInstance's owner chain.
    async fn get_vmi_owner(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<OwnerRef>, StoreError>;

    /// Fetch a virtual machine.
    async fn get_vm(&self, namespace: &str, name: &str) -> Result<VmInfo, StoreError>;
}

/// The resource kinds that can hold an address.
///
/// Parsed from the kind string persisted in binding names and entries; an
/// unrecognized string is a per-record configuration error at the parse
/// site, never a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// A pod holds the address for one attachment (ephemeral).
    Pods,
    /// A virtual machine holds the address for its lifetime (fixed).
    VirtualMachines,
}

impl ResourceKind {
    /// Parses the persisted kind token.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            RESOURCES_POD => Some(ResourceKind::Pods),
            RESOURCES_VIRTUAL_MACHINE => Some(ResourceKind::VirtualMachines),
            _ => None,
        }
    }

    /// The persisted kind token.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Pods => RESOURCES_POD,
            ResourceKind::VirtualMachines => RESOURCES_VIRTUAL_MACHINE,
        }
    }

    /// Whether the named resource of this kind still exists.
    pub async fn exists(
        self,
        workloads: &dyn WorkloadLookup,
        namespace: &str,
        name: &str,
    ) -> Result<bool, StoreError> {
        let found = match self {
            ResourceKind::Pods => workloads.get_pod(namespace, name).await.map(|_| ()),
            ResourceKind::VirtualMachines => workloads.get_vm(namespace, name).await.map(|_| ()),
        };
        match found {
            Ok(()) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// [`WorkloadLookup`] over the Kubernetes API server.
///
/// Pods go through the typed core API; KubeVirt objects go through dynamic
/// APIs so the controllers carry no KubeVirt client dependency.
#[derive(Clone)]
pub struct KubeWorkloads {
    client: Client,
}

impl KubeWorkloads {
    /// Creates the lookup over the given client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn kubevirt_api(&self, namespace: &str, kind: &str) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk("kubevirt.io", "v1", kind);
        let resource = ApiResource::from_gvk(&gvk);
        Api::namespaced_with(self.client.clone(), namespace, &resource)
    }
}

#[async_trait]
impl WorkloadLookup for KubeWorkloads {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<PodInfo, StoreError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pod = api
            .get(name)
            .await
            .map_err(|e| map_kube_err(format!("Pod {namespace}/{name}"), &e))?;
        Ok(PodInfo {
            namespace: namespace.to_string(),
            name: name.to_string(),
            annotations: pod.metadata.annotations.unwrap_or_default(),
            owner: first_owner(pod.metadata.owner_references.as_deref()),
        })
    }

    async fn get_vmi_owner(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<OwnerRef>, StoreError> {
        let vmi = self
            .kubevirt_api(namespace, KIND_VIRTUAL_MACHINE_INSTANCE)
            .get(name)
            .await
            .map_err(|e| {
                map_kube_err(format!("VirtualMachineInstance {namespace}/{name}"), &e)
            })?;
        Ok(first_owner(vmi.metadata.owner_references.as_deref()))
    }

    async fn get_vm(&self, namespace: &str, name: &str) -> Result<VmInfo, StoreError> {
        let vm = self
            .kubevirt_api(namespace, KIND_VIRTUAL_MACHINE)
            .get(name)
            .await
            .map_err(|e| map_kube_err(format!("VirtualMachine {namespace}/{name}"), &e))?;
        Ok(VmInfo {
            namespace: namespace.to_string(),
            name: name.to_string(),
            annotations: vm.metadata.annotations.unwrap_or_default(),
        })
    }
}

fn first_owner(
    refs: Option<&[k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference]>,
) -> Option<OwnerRef> {
    refs?.first().map(|r| OwnerRef {
        kind: r.kind.clone(),
        name: r.name.clone(),
    })
}
