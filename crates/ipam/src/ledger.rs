//! Pool ledger materialization and slot arithmetic.
//!
//! The ledger partitions a pool's usable index space: every index is free
//! (listed in `unallocated`), in use (`allocations[i]` set), or was
//! excluded at materialization (`allocations[i]` set and never listed).
//! `unallocated` stays sorted ascending, so the head of the list is always
//! the numerically lowest free address.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crds::{IPPool, IPPoolLedger, IPPoolLedgerSpec};
use ipcidr::Cidr;

use crate::error::IpamError;

/// Derives the ledger for a pool that does not have one yet.
///
/// Deterministic: the same pool spec always yields the same ledger.
/// Excluded addresses are pre-marked in use; excludes naming the network
/// or broadcast address, or addresses outside the prefix, are ignored
/// since those are unusable regardless.
pub fn materialize(pool: &IPPool) -> Result<IPPoolLedger, IpamError> {
    let name = pool
        .metadata
        .name
        .clone()
        .ok_or_else(|| IpamError::InvalidConfig("IPPool has no metadata.name".to_string()))?;
    let cidr = Cidr::parse(&pool.spec.cidr)?;
    let usable = usize::try_from(cidr.usable_count()).map_err(|_| {
        IpamError::InvalidConfig(format!(
            "pool {name} covers {} addresses, too many to materialize",
            cidr.usable_count()
        ))
    })?;

    let mut excluded = BTreeSet::new();
    for raw in &pool.spec.exclude_ips {
        let addr: Ipv4Addr = raw.trim().parse().map_err(|_| {
            IpamError::InvalidConfig(format!("pool {name} excludes invalid address {raw:?}"))
        })?;
        if let Ok(index) = cidr.index_of(addr) {
            excluded.insert(index);
        }
    }

    let mut allocations = vec![None; usable];
    let mut unallocated = Vec::with_capacity(usable - excluded.len());
    for index in 0..usable as u64 {
        if excluded.contains(&index) {
            allocations[index as usize] = Some(index);
        } else {
            unallocated.push(index);
        }
    }

    Ok(IPPoolLedger {
        metadata: ObjectMeta {
            name: Some(name),
            ..ObjectMeta::default()
        },
        spec: IPPoolLedgerSpec {
            cidr: pool.spec.cidr.clone(),
            vlan: pool.spec.vlan,
            allocations,
            unallocated,
            recorders: Vec::new(),
        },
    })
}

/// Lowest free index of the ledger, if any.
#[must_use]
pub fn first_free(spec: &IPPoolLedgerSpec) -> Option<u64> {
    spec.unallocated.first().copied()
}

/// Moves `index` from the free list into the used slots and records the
/// binding name.
///
/// Fails with [`IpamError::AddressUnavailable`] when the index is not free,
/// leaving the ledger untouched.
pub fn assign_slot(
    spec: &mut IPPoolLedgerSpec,
    index: u64,
    recorder: &str,
) -> Result<(), IpamError> {
    let slot = slot_of(spec, index)?;
    let position = spec.unallocated.binary_search(&index).map_err(|_| {
        IpamError::AddressUnavailable(format!("slot {index} is not free in the ledger"))
    })?;
    spec.unallocated.remove(position);
    spec.allocations[slot] = Some(index);
    if !spec.recorders.iter().any(|r| r == recorder) {
        spec.recorders.push(recorder.to_string());
    }
    Ok(())
}

/// Returns `index` to the free list and drops the binding name.
///
/// Idempotent: releasing an already-free slot changes nothing.
pub fn release_slot(
    spec: &mut IPPoolLedgerSpec,
    index: u64,
    recorder: &str,
) -> Result<(), IpamError> {
    let slot = slot_of(spec, index)?;
    if let Err(position) = spec.unallocated.binary_search(&index) {
        spec.unallocated.insert(position, index);
    }
    spec.allocations[slot] = None;
    spec.recorders.retain(|r| r != recorder);
    Ok(())
}

fn slot_of(spec: &IPPoolLedgerSpec, index: u64) -> Result<usize, IpamError> {
    usize::try_from(index)
        .ok()
        .filter(|i| *i < spec.allocations.len())
        .ok_or_else(|| {
            IpamError::Divergence(format!(
                "slot {index} is outside the ledger of {} slots",
                spec.allocations.len()
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pool(cidr: &str, excludes: &[&str]) -> IPPool {
        IPPool {
            metadata: ObjectMeta {
                name: Some("pool-a".to_string()),
                ..ObjectMeta::default()
            },
            spec: crds::IPPoolSpec {
                cidr: cidr.to_string(),
                vlan: 100,
                gateway: "192.168.2.254".to_string(),
                exclude_ips: excludes.iter().map(|s| (*s).to_string()).collect(),
            },
        }
    }

    /// Every index must be exactly one of free, used or excluded.
    fn assert_partitioned(spec: &IPPoolLedgerSpec) {
        for (i, slot) in spec.allocations.iter().enumerate() {
            let free = spec.unallocated.binary_search(&(i as u64)).is_ok();
            match slot {
                Some(marker) => {
                    assert_eq!(*marker, i as u64, "used slot must self-reference");
                    assert!(!free, "index {i} is both used and free");
                }
                None => assert!(free, "index {i} is neither used nor free"),
            }
        }
    }

    #[test]
    fn test_materialize_full_24() {
        let ledger = materialize(&pool("192.168.2.0/24", &[])).unwrap();
        assert_eq!(ledger.metadata.name.as_deref(), Some("pool-a"));
        assert_eq!(ledger.spec.allocations.len(), 254);
        assert_eq!(ledger.spec.unallocated.len(), 254);
        assert!(ledger.spec.recorders.is_empty());
        assert_partitioned(&ledger.spec);
    }

    #[test]
    fn test_materialize_applies_excludes() {
        // .2 and .3 are indices 1 and 2; network and broadcast are ignored
        let excludes = ["192.168.2.0", "192.168.2.2", "192.168.2.3", "192.168.2.255"];
        let ledger = materialize(&pool("192.168.2.0/24", &excludes)).unwrap();
        assert_eq!(ledger.spec.available(), 252);
        assert_eq!(ledger.spec.allocations[1], Some(1));
        assert_eq!(ledger.spec.allocations[2], Some(2));
        assert!(!ledger.spec.unallocated.contains(&1));
        assert!(!ledger.spec.unallocated.contains(&2));
        assert_partitioned(&ledger.spec);
    }

    #[test]
    fn test_materialize_is_deterministic() {
        let p = pool("10.0.4.0/22", &["10.0.4.10", "10.0.5.1"]);
        let first = materialize(&p).unwrap();
        let second = materialize(&p).unwrap();
        assert_eq!(first.spec.allocations, second.spec.allocations);
        assert_eq!(first.spec.unallocated, second.spec.unallocated);
    }

    #[test]
    fn test_materialize_rejects_bad_input() {
        assert!(matches!(
            materialize(&pool("not-a-cidr", &[])),
            Err(IpamError::Cidr(_))
        ));
        assert!(matches!(
            materialize(&pool("192.168.2.0/24", &["bogus"])),
            Err(IpamError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_assign_then_release_restores_the_ledger() {
        let ledger = materialize(&pool("192.168.2.0/24", &["192.168.2.2"])).unwrap();
        let mut spec = ledger.spec.clone();

        assign_slot(&mut spec, 4, "k8s-pod-network.c1").unwrap();
        assert_eq!(spec.allocations[4], Some(4));
        assert!(!spec.unallocated.contains(&4));
        assert_eq!(spec.recorders, vec!["k8s-pod-network.c1"]);
        assert_partitioned(&spec);

        release_slot(&mut spec, 4, "k8s-pod-network.c1").unwrap();
        assert_eq!(spec.allocations, ledger.spec.allocations);
        assert_eq!(spec.unallocated, ledger.spec.unallocated);
        assert!(spec.recorders.is_empty());
    }

    #[test]
    fn test_assign_taken_slot_fails_without_mutation() {
        let mut spec = materialize(&pool("192.168.2.0/24", &[])).unwrap().spec;
        assign_slot(&mut spec, 7, "k8s-pod-network.c1").unwrap();
        let before = spec.clone();

        let err = assign_slot(&mut spec, 7, "k8s-pod-network.c2").unwrap_err();
        assert!(matches!(err, IpamError::AddressUnavailable(_)));
        assert_eq!(spec.allocations, before.allocations);
        assert_eq!(spec.unallocated, before.unallocated);
        assert_eq!(spec.recorders, before.recorders);
    }

    #[test]
    fn test_assign_excluded_slot_fails() {
        let mut spec = materialize(&pool("192.168.2.0/24", &["192.168.2.2"]))
            .unwrap()
            .spec;
        assert!(matches!(
            assign_slot(&mut spec, 1, "k8s-pod-network.c1"),
            Err(IpamError::AddressUnavailable(_))
        ));
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut spec = materialize(&pool("192.168.2.0/24", &[])).unwrap().spec;
        assign_slot(&mut spec, 3, "k8s-pod-network.c1").unwrap();
        release_slot(&mut spec, 3, "k8s-pod-network.c1").unwrap();
        let after_first = spec.clone();
        release_slot(&mut spec, 3, "k8s-pod-network.c1").unwrap();
        assert_eq!(spec.unallocated, after_first.unallocated);
        assert_eq!(spec.allocations, after_first.allocations);
    }

    #[test]
    fn test_first_free_is_the_lowest_index() {
        let mut spec = materialize(&pool("192.168.2.0/24", &["192.168.2.1"])).unwrap().spec;
        // index 0 is excluded, so the lowest free index is 1
        assert_eq!(first_free(&spec), Some(1));
        assign_slot(&mut spec, 1, "k8s-pod-network.c1").unwrap();
        assert_eq!(first_free(&spec), Some(2));
    }

    #[test]
    fn test_out_of_range_slot_is_divergence() {
        let mut spec = materialize(&pool("192.168.2.0/30", &[])).unwrap().spec;
        assert!(matches!(
            assign_slot(&mut spec, 99, "k8s-pod-network.c1"),
            Err(IpamError::Divergence(_))
        ));
        assert!(matches!(
            release_slot(&mut spec, 99, "k8s-pod-network.c1"),
            Err(IpamError::Divergence(_))
        ));
    }
}
