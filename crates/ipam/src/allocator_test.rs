//! Unit tests for the allocator against the mock store.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crds::{BindingEntry, IPBinding, IPBindingSpec, IPPool, IPPoolSpec};

use crate::allocator::Allocator;
use crate::error::IpamError;
use crate::identity::{ADDRESS_ANNOTATION, POOL_ANNOTATION, ephemeral_binding_name};
use crate::ledger;
use crate::mock::{MockStore, MockWorkloads};
use crate::workload::{OwnerRef, PodInfo, VmInfo};

const FIXED_BINDING: &str = "k8s-pod-network.virtualmachines.default.vm-a";

fn pool(name: &str, cidr: &str, excludes: &[&str]) -> IPPool {
    IPPool {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..ObjectMeta::default()
        },
        spec: IPPoolSpec {
            cidr: cidr.to_string(),
            vlan: 100,
            gateway: "192.168.2.254".to_string(),
            exclude_ips: excludes.iter().map(|s| (*s).to_string()).collect(),
        },
    }
}

fn annotations(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
    entries
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

fn plain_pod(namespace: &str, name: &str, annotations: BTreeMap<String, String>) -> PodInfo {
    PodInfo {
        namespace: namespace.to_string(),
        name: name.to_string(),
        annotations,
        owner: None,
    }
}

fn args(namespace: &str, name: &str, container_id: &str) -> crate::identity::AttachArgs {
    crate::identity::AttachArgs {
        namespace: namespace.to_string(),
        name: name.to_string(),
        container_id: container_id.to_string(),
    }
}

fn harness() -> (MockStore, MockWorkloads, Allocator) {
    let store = MockStore::new();
    let workloads = MockWorkloads::new();
    let allocator = Allocator::new(Arc::new(store.clone()), Arc::new(workloads.clone()));
    (store, workloads, allocator)
}

/// Wires up a virt-launcher pod owned by a VMI owned by vm-a, and the VM
/// itself with the given annotations. Returns the attach args of the pod.
fn add_fixed_vm(
    workloads: &MockWorkloads,
    vm_annotations: BTreeMap<String, String>,
) -> crate::identity::AttachArgs {
    workloads.add_pod(PodInfo {
        namespace: "default".to_string(),
        name: "virt-launcher-vm-a".to_string(),
        annotations: BTreeMap::new(),
        owner: Some(OwnerRef {
            kind: "VirtualMachineInstance".to_string(),
            name: "vm-a".to_string(),
        }),
    });
    workloads.add_vmi(
        "default",
        "vm-a",
        Some(OwnerRef {
            kind: "VirtualMachine".to_string(),
            name: "vm-a".to_string(),
        }),
    );
    workloads.add_vm(VmInfo {
        namespace: "default".to_string(),
        name: "vm-a".to_string(),
        annotations: vm_annotations,
    });
    args("default", "virt-launcher-vm-a", "fixed-cid-1")
}

fn fixed_binding_entry(address: &str, index: u64) -> BindingEntry {
    BindingEntry {
        pool: "pool-a".to_string(),
        address: address.to_string(),
        gateway: "192.168.2.254".to_string(),
        index,
        resource_kind: "virtualmachines".to_string(),
        namespace: "default".to_string(),
        name: "vm-a".to_string(),
        vlan: 100,
        released_at: Some(Utc::now()),
    }
}

fn binding(name: &str, entries: Vec<BindingEntry>) -> IPBinding {
    IPBinding {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..ObjectMeta::default()
        },
        spec: IPBindingSpec { entries },
    }
}

#[tokio::test]
async fn test_ephemeral_assign_takes_lowest_free_address() {
    let (store, workloads, allocator) = harness();
    store.add_pool(pool("pool-a", "192.168.2.0/24", &[]));
    workloads.add_pod(plain_pod("default", "web-0", BTreeMap::new()));

    let assignment = allocator.assign(&args("default", "web-0", "cid-1")).await.unwrap();
    assert_eq!(assignment.address, "192.168.2.1");
    assert_eq!(assignment.gateway, "192.168.2.254");
    assert_eq!(assignment.vlan, 100);

    // ledger was materialized lazily and the slot charged to the binding
    let snapshot = store.ledger("pool-a").unwrap();
    assert_eq!(snapshot.spec.allocations[0], Some(0));
    assert!(!snapshot.spec.unallocated.contains(&0));
    assert_eq!(snapshot.spec.recorders, vec![ephemeral_binding_name("cid-1")]);

    let record = store.binding(&ephemeral_binding_name("cid-1")).unwrap();
    let entry = &record.spec.entries[0];
    assert_eq!(entry.address, "192.168.2.1");
    assert_eq!(entry.index, 0);
    assert_eq!(entry.resource_kind, "pods");
    assert_eq!(entry.name, "web-0");
    assert!(entry.released_at.is_none());
}

#[tokio::test]
async fn test_ephemeral_assign_skips_excluded_addresses() {
    let (store, workloads, allocator) = harness();
    store.add_pool(pool("pool-a", "192.168.2.0/24", &["192.168.2.1", "192.168.2.2"]));
    workloads.add_pod(plain_pod("default", "web-0", BTreeMap::new()));

    let assignment = allocator.assign(&args("default", "web-0", "cid-1")).await.unwrap();
    assert_eq!(assignment.address, "192.168.2.3");
}

#[tokio::test]
async fn test_assign_without_any_pool_is_exhausted() {
    let (_store, workloads, allocator) = harness();
    workloads.add_pod(plain_pod("default", "web-0", BTreeMap::new()));

    let err = allocator.assign(&args("default", "web-0", "cid-1")).await.unwrap_err();
    assert!(matches!(err, IpamError::PoolExhausted(_)));
}

#[tokio::test]
async fn test_assign_scans_pools_in_annotation_order() {
    let (store, workloads, allocator) = harness();
    // pool-b is listed first but has every usable address excluded
    store.add_pool(pool("pool-b", "10.0.0.0/30", &["10.0.0.1", "10.0.0.2"]));
    store.add_pool(pool("pool-a", "192.168.2.0/24", &[]));
    workloads.add_pod(plain_pod(
        "default",
        "web-0",
        annotations(&[(POOL_ANNOTATION, "pool-b,pool-a")]),
    ));

    let assignment = allocator.assign(&args("default", "web-0", "cid-1")).await.unwrap();
    assert_eq!(assignment.address, "192.168.2.1");
}

#[tokio::test]
async fn test_pool_exhaustion_surfaces() {
    let (store, workloads, allocator) = harness();
    store.add_pool(pool("pool-a", "10.0.0.0/30", &[]));
    for id in ["cid-1", "cid-2"] {
        let name = format!("web-{id}");
        workloads.add_pod(plain_pod("default", &name, BTreeMap::new()));
        allocator.assign(&args("default", &name, id)).await.unwrap();
    }
    workloads.add_pod(plain_pod("default", "web-late", BTreeMap::new()));

    let err = allocator
        .assign(&args("default", "web-late", "cid-3"))
        .await
        .unwrap_err();
    assert!(matches!(err, IpamError::PoolExhausted(_)));
}

#[tokio::test]
async fn test_explicit_assign_of_taken_address_fails_without_mutation() {
    let (store, workloads, allocator) = harness();
    store.add_pool(pool("pool-a", "192.168.2.0/24", &[]));

    workloads.add_pod(plain_pod(
        "default",
        "web-0",
        annotations(&[(POOL_ANNOTATION, "pool-a"), (ADDRESS_ANNOTATION, "192.168.2.5")]),
    ));
    allocator.assign(&args("default", "web-0", "cid-1")).await.unwrap();
    let before = store.ledger("pool-a").unwrap();

    workloads.add_pod(plain_pod(
        "default",
        "web-1",
        annotations(&[(POOL_ANNOTATION, "pool-a"), (ADDRESS_ANNOTATION, "192.168.2.5")]),
    ));
    let err = allocator.assign(&args("default", "web-1", "cid-2")).await.unwrap_err();
    assert!(matches!(err, IpamError::AddressUnavailable(_)));

    let after = store.ledger("pool-a").unwrap();
    assert_eq!(after.spec.unallocated, before.spec.unallocated);
    assert_eq!(after.spec.recorders, before.spec.recorders);
    assert!(store.binding(&ephemeral_binding_name("cid-2")).is_none());
}

#[tokio::test]
async fn test_explicit_assign_needs_a_covering_pool() {
    let (store, workloads, allocator) = harness();
    store.add_pool(pool("pool-a", "192.168.2.0/24", &[]));
    workloads.add_pod(plain_pod(
        "default",
        "web-0",
        annotations(&[(POOL_ANNOTATION, "pool-a"), (ADDRESS_ANNOTATION, "10.9.9.9")]),
    ));

    let err = allocator.assign(&args("default", "web-0", "cid-1")).await.unwrap_err();
    assert!(matches!(err, IpamError::AddressUnavailable(_)));
}

#[tokio::test]
async fn test_explicit_assign_rejects_network_address() {
    let (store, workloads, allocator) = harness();
    store.add_pool(pool("pool-a", "192.168.2.0/24", &[]));
    workloads.add_pod(plain_pod(
        "default",
        "web-0",
        annotations(&[(POOL_ANNOTATION, "pool-a"), (ADDRESS_ANNOTATION, "192.168.2.0")]),
    ));

    let err = allocator.assign(&args("default", "web-0", "cid-1")).await.unwrap_err();
    assert!(matches!(err, IpamError::AddressUnavailable(_)));
}

#[tokio::test]
async fn test_fixed_assign_creates_deterministically_named_binding() {
    let (store, workloads, allocator) = harness();
    store.add_pool(pool("pool-a", "192.168.2.0/24", &[]));
    let attach = add_fixed_vm(&workloads, annotations(&[(POOL_ANNOTATION, "pool-a")]));

    let assignment = allocator.assign(&attach).await.unwrap();
    assert_eq!(assignment.address, "192.168.2.1");

    let record = store.binding(FIXED_BINDING).unwrap();
    let entry = &record.spec.entries[0];
    assert_eq!(entry.resource_kind, "virtualmachines");
    assert_eq!(entry.namespace, "default");
    assert_eq!(entry.name, "vm-a");
    assert_eq!(
        store.ledger("pool-a").unwrap().spec.recorders,
        vec![FIXED_BINDING.to_string()]
    );
}

#[tokio::test]
async fn test_fixed_assign_requires_pool_annotation() {
    let (store, workloads, allocator) = harness();
    store.add_pool(pool("pool-a", "192.168.2.0/24", &[]));
    let attach = add_fixed_vm(&workloads, BTreeMap::new());

    let err = allocator.assign(&attach).await.unwrap_err();
    assert!(matches!(err, IpamError::InvalidConfig(_)));
}

#[tokio::test]
async fn test_fixed_assign_reuses_surviving_binding() {
    let (store, workloads, allocator) = harness();
    let p = pool("pool-a", "192.168.2.0/24", &[]);
    store.add_pool(p.clone());
    let attach = add_fixed_vm(&workloads, annotations(&[(POOL_ANNOTATION, "pool-a")]));

    // the VM restarted: its binding survived with the slot still charged
    let mut materialized = ledger::materialize(&p).unwrap();
    ledger::assign_slot(&mut materialized.spec, 8, FIXED_BINDING).unwrap();
    store.add_ledger(materialized);
    store.add_binding(binding(FIXED_BINDING, vec![fixed_binding_entry("192.168.2.9", 8)]));
    let ledger_before = store.ledger("pool-a").unwrap();

    let assignment = allocator.assign(&attach).await.unwrap();
    assert_eq!(assignment.address, "192.168.2.9");

    let record = store.binding(FIXED_BINDING).unwrap();
    assert!(record.spec.entries[0].released_at.is_none());
    // the reuse path never touches the ledger
    let ledger_after = store.ledger("pool-a").unwrap();
    assert_eq!(ledger_after.spec.unallocated, ledger_before.spec.unallocated);
    assert_eq!(ledger_after.spec.recorders, ledger_before.spec.recorders);
}

#[tokio::test]
async fn test_fixed_reuse_conflicts_on_address_mismatch() {
    let (store, workloads, allocator) = harness();
    store.add_pool(pool("pool-a", "192.168.2.0/24", &[]));
    let attach = add_fixed_vm(
        &workloads,
        annotations(&[(POOL_ANNOTATION, "pool-a"), (ADDRESS_ANNOTATION, "192.168.2.20")]),
    );
    store.add_binding(binding(FIXED_BINDING, vec![fixed_binding_entry("192.168.2.9", 8)]));

    let err = allocator.assign(&attach).await.unwrap_err();
    assert!(matches!(err, IpamError::AllocationConflict(_)));
    // no mutation on conflict
    let record = store.binding(FIXED_BINDING).unwrap();
    assert!(record.spec.entries[0].released_at.is_some());
}

#[tokio::test]
async fn test_fixed_reuse_conflicts_on_pool_mismatch() {
    let (store, workloads, allocator) = harness();
    store.add_pool(pool("pool-b", "10.0.0.0/24", &[]));
    let attach = add_fixed_vm(&workloads, annotations(&[(POOL_ANNOTATION, "pool-b")]));
    store.add_binding(binding(FIXED_BINDING, vec![fixed_binding_entry("192.168.2.9", 8)]));

    let err = allocator.assign(&attach).await.unwrap_err();
    assert!(matches!(err, IpamError::AllocationConflict(_)));
}

#[tokio::test]
async fn test_assign_retries_through_ledger_conflicts() {
    let (store, workloads, allocator) = harness();
    store.add_pool(pool("pool-a", "192.168.2.0/24", &[]));
    workloads.add_pod(plain_pod("default", "web-0", BTreeMap::new()));
    store.inject_ledger_update_conflicts(2);

    let assignment = allocator.assign(&args("default", "web-0", "cid-1")).await.unwrap();
    assert_eq!(assignment.address, "192.168.2.1");
}

#[tokio::test]
async fn test_assign_reports_retry_exhaustion() {
    let (store, workloads, _) = harness();
    let allocator =
        Allocator::new(Arc::new(store.clone()), Arc::new(workloads.clone())).with_retry_bound(3);
    store.add_pool(pool("pool-a", "192.168.2.0/24", &[]));
    workloads.add_pod(plain_pod("default", "web-0", BTreeMap::new()));
    store.inject_ledger_update_conflicts(3);

    let err = allocator.assign(&args("default", "web-0", "cid-1")).await.unwrap_err();
    assert!(matches!(err, IpamError::RetryExhausted { attempts: 3, .. }));
}

#[tokio::test]
async fn test_assign_rides_out_transient_binding_create_failures() {
    let (store, workloads, allocator) = harness();
    store.add_pool(pool("pool-a", "192.168.2.0/24", &[]));
    workloads.add_pod(plain_pod("default", "web-0", BTreeMap::new()));
    store.inject_binding_create_errors(2);

    allocator.assign(&args("default", "web-0", "cid-1")).await.unwrap();
    assert!(store.binding(&ephemeral_binding_name("cid-1")).is_some());
}

#[tokio::test]
async fn test_preexisting_binding_after_ledger_update_is_divergence() {
    let (store, workloads, allocator) = harness();
    store.add_pool(pool("pool-a", "192.168.2.0/24", &[]));
    workloads.add_pod(plain_pod("default", "web-0", BTreeMap::new()));
    // an ephemeral binding under this attachment's name already exists
    store.add_binding(binding(
        &ephemeral_binding_name("cid-1"),
        vec![fixed_binding_entry("192.168.2.7", 6)],
    ));

    let err = allocator.assign(&args("default", "web-0", "cid-1")).await.unwrap_err();
    assert!(matches!(err, IpamError::Divergence(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_assigns_fill_the_pool_exactly() {
    let (store, workloads, allocator) = harness();
    // /29 has 6 usable addresses; issue exactly 6 concurrent requests
    store.add_pool(pool("pool-a", "10.0.0.0/29", &[]));

    let mut handles = Vec::new();
    for i in 0..6 {
        let allocator = allocator.clone();
        let workloads = workloads.clone();
        handles.push(tokio::spawn(async move {
            let name = format!("web-{i}");
            let cid = format!("cid-{i}");
            workloads.add_pod(plain_pod("default", &name, BTreeMap::new()));
            allocator.assign(&args("default", &name, &cid)).await
        }));
    }

    let mut addresses = Vec::new();
    for handle in handles {
        addresses.push(handle.await.unwrap().unwrap().address);
    }
    addresses.sort();
    addresses.dedup();
    assert_eq!(addresses.len(), 6, "every request must get a distinct address");
    assert!(store.ledger("pool-a").unwrap().spec.unallocated.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_explicit_requests_have_one_winner() {
    let (store, workloads, allocator) = harness();
    store.add_pool(pool("pool-a", "192.168.2.0/24", &[]));

    let mut handles = Vec::new();
    for i in 0..2 {
        let allocator = allocator.clone();
        let workloads = workloads.clone();
        handles.push(tokio::spawn(async move {
            let name = format!("web-{i}");
            let cid = format!("cid-{i}");
            workloads.add_pod(plain_pod(
                "default",
                &name,
                annotations(&[(POOL_ANNOTATION, "pool-a"), (ADDRESS_ANNOTATION, "192.168.2.5")]),
            ));
            allocator.assign(&args("default", &name, &cid)).await
        }));
    }

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap());
    }
    let winners = outcomes.iter().filter(|o| o.is_ok()).count();
    assert_eq!(winners, 1, "exactly one request may win the address");
    let loser = outcomes.into_iter().find(|o| o.is_err()).unwrap().unwrap_err();
    assert!(matches!(loser, IpamError::AddressUnavailable(_)));
}

#[tokio::test]
async fn test_ephemeral_release_restores_the_ledger() {
    let (store, workloads, allocator) = harness();
    store.add_pool(pool("pool-a", "192.168.2.0/24", &[]));
    workloads.add_pod(plain_pod("default", "web-0", BTreeMap::new()));
    allocator.assign(&args("default", "web-0", "cid-1")).await.unwrap();

    allocator.release(&args("default", "web-0", "cid-1")).await.unwrap();

    let snapshot = store.ledger("pool-a").unwrap();
    assert!(snapshot.spec.unallocated.contains(&0));
    assert_eq!(snapshot.spec.allocations[0], None);
    assert!(snapshot.spec.recorders.is_empty());
    assert!(store.binding(&ephemeral_binding_name("cid-1")).is_none());
}

#[tokio::test]
async fn test_ephemeral_release_without_binding_fails() {
    let (_store, workloads, allocator) = harness();
    workloads.add_pod(plain_pod("default", "web-0", BTreeMap::new()));

    let err = allocator.release(&args("default", "web-0", "cid-1")).await.unwrap_err();
    assert!(matches!(err, IpamError::RecordNotFound(_)));
}

#[tokio::test]
async fn test_ephemeral_release_defers_to_gc_when_ledger_stays_contended() {
    let (store, workloads, allocator) = harness();
    store.add_pool(pool("pool-a", "192.168.2.0/24", &[]));
    workloads.add_pod(plain_pod("default", "web-0", BTreeMap::new()));
    allocator.assign(&args("default", "web-0", "cid-1")).await.unwrap();

    store.inject_ledger_update_conflicts(100);
    allocator.release(&args("default", "web-0", "cid-1")).await.unwrap();

    // nothing was cleaned up; the GC controller picks it up from here
    assert!(store.binding(&ephemeral_binding_name("cid-1")).is_some());
    assert_eq!(store.ledger("pool-a").unwrap().spec.allocations[0], Some(0));
}

#[tokio::test]
async fn test_ephemeral_release_surfaces_exhausted_binding_delete() {
    let (store, workloads, _) = harness();
    let allocator =
        Allocator::new(Arc::new(store.clone()), Arc::new(workloads.clone())).with_retry_bound(3);
    store.add_pool(pool("pool-a", "192.168.2.0/24", &[]));
    workloads.add_pod(plain_pod("default", "web-0", BTreeMap::new()));
    allocator.assign(&args("default", "web-0", "cid-1")).await.unwrap();

    store.inject_binding_delete_errors(3);
    let err = allocator.release(&args("default", "web-0", "cid-1")).await.unwrap_err();
    assert!(matches!(err, IpamError::RetryExhausted { .. }));

    // the slot went back to the ledger before the delete failed
    assert!(store.ledger("pool-a").unwrap().spec.unallocated.contains(&0));
    assert!(store.binding(&ephemeral_binding_name("cid-1")).is_some());
}

#[tokio::test]
async fn test_fixed_release_marks_but_never_reclaims() {
    let (store, workloads, allocator) = harness();
    store.add_pool(pool("pool-a", "192.168.2.0/24", &[]));
    let attach = add_fixed_vm(&workloads, annotations(&[(POOL_ANNOTATION, "pool-a")]));
    allocator.assign(&attach).await.unwrap();

    allocator.release(&attach).await.unwrap();

    let record = store.binding(FIXED_BINDING).unwrap();
    assert!(record.spec.entries[0].released_at.is_some());
    // slot stays charged until the GC controller reclaims it
    assert_eq!(store.ledger("pool-a").unwrap().spec.allocations[0], Some(0));
}

#[tokio::test]
async fn test_fixed_release_is_soft_when_vm_is_gone() {
    let (store, workloads, allocator) = harness();
    store.add_pool(pool("pool-a", "192.168.2.0/24", &[]));
    let attach = add_fixed_vm(&workloads, annotations(&[(POOL_ANNOTATION, "pool-a")]));
    allocator.assign(&attach).await.unwrap();

    workloads.remove_vm("default", "vm-a");
    allocator.release(&attach).await.unwrap();

    // untouched: with the VM gone, release is entirely the GC's business
    let record = store.binding(FIXED_BINDING).unwrap();
    assert!(record.spec.entries[0].released_at.is_none());
}

#[tokio::test]
async fn test_fixed_release_swallows_missing_binding() {
    let (_store, workloads, allocator) = harness();
    let attach = add_fixed_vm(&workloads, annotations(&[(POOL_ANNOTATION, "pool-a")]));

    allocator.release(&attach).await.unwrap();
}
