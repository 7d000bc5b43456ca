//! Consumer identity: who is asking for an address, and under what name
//! the binding is recorded.
//!
//! Binding names are deterministic so that allocator and GC controller can
//! find each other's records without any shared state:
//! - fixed:     `k8s-pod-network.{resource-kind}.{namespace}.{name}`
//! - ephemeral: `k8s-pod-network.{container-id}`
//!
//! Fixed names therefore require the resource name itself to be free of
//! dots, which Kubernetes object names of the supported kinds are in
//! practice.

use std::net::Ipv4Addr;

use crds::IPBinding;

use crate::error::IpamError;
use crate::workload::{
    KIND_VIRTUAL_MACHINE, KIND_VIRTUAL_MACHINE_INSTANCE, OwnerRef, PodInfo, ResourceKind,
    WorkloadLookup,
};

/// Prefix every binding name starts with.
pub const BINDING_NAME_PREFIX: &str = "k8s-pod-network";
/// Separator between binding name segments.
pub const BINDING_NAME_SEPARATOR: &str = ".";

/// Annotation naming the pools to draw from, comma-separated.
pub const POOL_ANNOTATION: &str = "ipam.microscaler.io/ip-pools";
/// Annotation requesting one specific address out of the named pools.
pub const ADDRESS_ANNOTATION: &str = "ipam.microscaler.io/ip-address";

/// Attach/detach arguments handed over by the plugin harness.
#[derive(Debug, Clone)]
pub struct AttachArgs {
    /// Namespace of the pod being attached.
    pub namespace: String,
    /// Name of the pod being attached.
    pub name: String,
    /// Infra container id of the attachment.
    pub container_id: String,
}

/// Which pools an allocation may draw from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolSelection {
    /// The pools named in the annotation, in annotation order.
    Named(Vec<String>),
    /// Every pool known to the cluster.
    All,
}

/// A fully resolved allocation consumer.
#[derive(Debug, Clone)]
pub struct Consumer {
    /// Deterministic name of the consumer's binding.
    pub binding_name: String,
    /// Kind of the resource that will hold the address.
    pub kind: ResourceKind,
    /// Namespace of the holding resource.
    pub namespace: String,
    /// Name of the holding resource.
    pub name: String,
    /// Whether the address is bound for the resource's lifetime.
    pub fixed: bool,
    /// Pools the allocation may draw from.
    pub pools: PoolSelection,
    /// Explicitly requested address, if any.
    pub address: Option<Ipv4Addr>,
}

/// Binding name for a fixed allocation.
#[must_use]
pub fn fixed_binding_name(kind: ResourceKind, namespace: &str, name: &str) -> String {
    [BINDING_NAME_PREFIX, kind.as_str(), namespace, name].join(BINDING_NAME_SEPARATOR)
}

/// Binding name for an ephemeral allocation.
#[must_use]
pub fn ephemeral_binding_name(container_id: &str) -> String {
    [BINDING_NAME_PREFIX, container_id].join(BINDING_NAME_SEPARATOR)
}

/// Walks the pod's owner chain one hop to decide fixed-ness.
///
/// A pod owned by a `VirtualMachineInstance` that is in turn owned by a
/// `VirtualMachine` gets a fixed address bound to the VM. A VMI without a
/// VM owner can launch a pod on its own; that pod, set-managed pods, and
/// bare pods are all ephemeral.
pub async fn fixed_owner(
    workloads: &dyn WorkloadLookup,
    pod: &PodInfo,
) -> Result<Option<OwnerRef>, IpamError> {
    let Some(owner) = &pod.owner else {
        return Ok(None);
    };
    if owner.kind != KIND_VIRTUAL_MACHINE_INSTANCE {
        return Ok(None);
    }
    let vmi_owner = workloads.get_vmi_owner(&pod.namespace, &owner.name).await?;
    Ok(vmi_owner.filter(|o| o.kind == KIND_VIRTUAL_MACHINE))
}

/// Resolves attach arguments into a [`Consumer`].
///
/// Fixed consumers read their allocation hints from the VM's annotations
/// and must name their pools; ephemeral consumers read the pod's
/// annotations and fall back to every pool in the cluster. An explicit
/// address is only honored together with an explicit pool set.
pub async fn resolve(
    workloads: &dyn WorkloadLookup,
    args: &AttachArgs,
) -> Result<Consumer, IpamError> {
    let pod = workloads.get_pod(&args.namespace, &args.name).await?;

    if let Some(owner) = fixed_owner(workloads, &pod).await? {
        let vm = workloads.get_vm(&pod.namespace, &owner.name).await?;
        let pool_names = vm.annotations.get(POOL_ANNOTATION).ok_or_else(|| {
            IpamError::InvalidConfig(format!(
                "VirtualMachine {}/{} has no {POOL_ANNOTATION} annotation",
                vm.namespace, vm.name
            ))
        })?;
        let pools = parse_pool_names(pool_names)?;
        let address = parse_address_annotation(vm.annotations.get(ADDRESS_ANNOTATION))?;
        return Ok(Consumer {
            binding_name: fixed_binding_name(
                ResourceKind::VirtualMachines,
                &vm.namespace,
                &vm.name,
            ),
            kind: ResourceKind::VirtualMachines,
            namespace: vm.namespace,
            name: vm.name,
            fixed: true,
            pools: PoolSelection::Named(pools),
            address,
        });
    }

    let (pools, address) = match pod.annotations.get(POOL_ANNOTATION) {
        Some(pool_names) => (
            PoolSelection::Named(parse_pool_names(pool_names)?),
            parse_address_annotation(pod.annotations.get(ADDRESS_ANNOTATION))?,
        ),
        None => (PoolSelection::All, None),
    };
    Ok(Consumer {
        binding_name: ephemeral_binding_name(&args.container_id),
        kind: ResourceKind::Pods,
        namespace: pod.namespace,
        name: pod.name,
        fixed: false,
        pools,
        address,
    })
}

/// The resource a binding records as holding its address.
///
/// Inverse of the name derivation: the GC controller recovers the owner
/// from the binding alone, without the pod that created it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingOwner {
    /// Whether the binding is the fixed form.
    pub fixed: bool,
    /// Raw kind token; parse with [`ResourceKind::parse`] at the boundary.
    pub resource_kind: String,
    /// Namespace of the holding resource.
    pub namespace: String,
    /// Name of the holding resource.
    pub name: String,
}

/// Recovers the owning resource from a binding.
///
/// A name with four or more segments is the fixed form and carries the
/// owner in the name itself; anything shorter is ephemeral and the owner
/// is read from the first entry.
pub fn binding_owner(binding: &IPBinding) -> Result<BindingOwner, IpamError> {
    let name = binding
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| IpamError::InvalidConfig("IPBinding has no metadata.name".to_string()))?;
    let segments: Vec<&str> = name.split(BINDING_NAME_SEPARATOR).collect();
    if segments.len() >= 4 {
        return Ok(BindingOwner {
            fixed: true,
            resource_kind: segments[1].to_string(),
            namespace: segments[2].to_string(),
            name: segments[3].to_string(),
        });
    }
    let entry = binding
        .spec
        .entries
        .first()
        .ok_or_else(|| IpamError::Divergence(format!("IPBinding {name} has no entries")))?;
    Ok(BindingOwner {
        fixed: false,
        resource_kind: entry.resource_kind.clone(),
        namespace: entry.namespace.clone(),
        name: entry.name.clone(),
    })
}

fn parse_pool_names(raw: &str) -> Result<Vec<String>, IpamError> {
    let names: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(String::from)
        .collect();
    if names.is_empty() {
        return Err(IpamError::InvalidConfig(format!(
            "annotation {POOL_ANNOTATION} names no pools: {raw:?}"
        )));
    }
    Ok(names)
}

fn parse_address_annotation(raw: Option<&String>) -> Result<Option<Ipv4Addr>, IpamError> {
    match raw {
        None => Ok(None),
        Some(s) => s.trim().parse().map(Some).map_err(|_| {
            IpamError::InvalidConfig(format!(
                "annotation {ADDRESS_ANNOTATION} is not an IPv4 address: {s:?}"
            ))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::{BindingEntry, IPBindingSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn binding(name: &str, entries: Vec<BindingEntry>) -> IPBinding {
        IPBinding {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..ObjectMeta::default()
            },
            spec: IPBindingSpec { entries },
        }
    }

    fn entry(kind: &str, namespace: &str, name: &str) -> BindingEntry {
        BindingEntry {
            pool: "pool-a".to_string(),
            address: "192.168.2.1".to_string(),
            gateway: "192.168.2.254".to_string(),
            index: 0,
            resource_kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            vlan: 100,
            released_at: None,
        }
    }

    #[test]
    fn test_binding_name_formats() {
        assert_eq!(
            fixed_binding_name(ResourceKind::VirtualMachines, "default", "vm-a"),
            "k8s-pod-network.virtualmachines.default.vm-a"
        );
        assert_eq!(
            ephemeral_binding_name("0a1b2c3d"),
            "k8s-pod-network.0a1b2c3d"
        );
    }

    #[test]
    fn test_binding_owner_round_trips_fixed_name() {
        let name = fixed_binding_name(ResourceKind::VirtualMachines, "prod", "db-vm");
        let owner = binding_owner(&binding(&name, vec![])).unwrap();
        assert!(owner.fixed);
        assert_eq!(owner.resource_kind, "virtualmachines");
        assert_eq!(owner.namespace, "prod");
        assert_eq!(owner.name, "db-vm");
    }

    #[test]
    fn test_binding_owner_reads_ephemeral_owner_from_entry() {
        let name = ephemeral_binding_name("0a1b2c3d");
        let owner =
            binding_owner(&binding(&name, vec![entry("pods", "default", "web-0")])).unwrap();
        assert!(!owner.fixed);
        assert_eq!(owner.resource_kind, "pods");
        assert_eq!(owner.namespace, "default");
        assert_eq!(owner.name, "web-0");
    }

    #[test]
    fn test_binding_owner_needs_an_entry_for_ephemeral_names() {
        let name = ephemeral_binding_name("0a1b2c3d");
        assert!(matches!(
            binding_owner(&binding(&name, vec![])),
            Err(IpamError::Divergence(_))
        ));
    }

    #[test]
    fn test_parse_pool_names_trims_and_rejects_empty() {
        assert_eq!(
            parse_pool_names("pool-a, pool-b ,pool-c").unwrap(),
            vec!["pool-a", "pool-b", "pool-c"]
        );
        assert!(parse_pool_names(" , ").is_err());
    }

    #[test]
    fn test_parse_address_annotation() {
        assert_eq!(
            parse_address_annotation(Some(&"192.168.2.9".to_string())).unwrap(),
            Some("192.168.2.9".parse().unwrap())
        );
        assert_eq!(parse_address_annotation(None).unwrap(), None);
        assert!(parse_address_annotation(Some(&"not-an-ip".to_string())).is_err());
    }
}
