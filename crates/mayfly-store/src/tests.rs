//! Tests for the `StateStore` trait.
//!
//! Written against the trait so they can run against any backend; the etcd
//! implementation needs a live cluster, so the suite drives `MemoryStore`,
//! which shares its event semantics.

use super::*;
use chrono::{Duration as ChronoDuration, Utc};
use mayfly_common::{Allocation, AllocationState, InterfaceInfo, Lease, MacAddr};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

fn create_test_store() -> Arc<dyn StateStore> {
    Arc::new(MemoryStore::new())
}

fn test_allocation(hostname: &str) -> Allocation {
    Allocation::new(hostname)
}

fn test_interface(mac: &str) -> InterfaceInfo {
    InterfaceInfo {
        index: 7,
        mtu: 1500,
        name: "vf-test00".to_string(),
        hardware_addr: mac.parse().unwrap(),
        flags: 0,
    }
}

fn test_lease(ip: Ipv4Addr, ttl_secs: i64) -> Lease {
    Lease {
        fixed_address: ip,
        netmask: Ipv4Addr::new(255, 255, 255, 0),
        expire: Utc::now() + ChronoDuration::seconds(ttl_secs),
        server_id: Some(Ipv4Addr::new(10, 0, 0, 1)),
        renew: None,
        rebind: None,
    }
}

fn bound_allocation(hostname: &str, ip: Ipv4Addr, mac: &str, ttl_secs: i64) -> Allocation {
    let mut allocation = test_allocation(hostname);
    allocation.state = AllocationState::Bound;
    allocation.lease = Some(test_lease(ip, ttl_secs));
    allocation.interface = Some(test_interface(mac));
    allocation
}

// ============================================================================
// Allocation CRUD
// ============================================================================

#[tokio::test]
async fn test_put_and_get() {
    let store = create_test_store();
    let allocation = test_allocation("web.prod");

    store.put(&allocation).await.unwrap();

    let retrieved = store.get(allocation.id).await.unwrap();
    assert_eq!(retrieved, allocation);
}

#[tokio::test]
async fn test_get_not_found() {
    let store = create_test_store();
    let result = store.get(uuid::Uuid::new_v4()).await;
    assert!(matches!(result, Err(StoreError::NotFound(_))));
}

#[tokio::test]
async fn test_allocations_lists_everything() {
    let store = create_test_store();
    for i in 0..3 {
        store.put(&test_allocation(&format!("svc-{i}"))).await.unwrap();
    }
    assert_eq!(store.allocations().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_get_by_ip_via_index() {
    let store = create_test_store();
    let ip = Ipv4Addr::new(10, 0, 0, 17);
    let allocation = bound_allocation("web.prod", ip, "aa:bb:cc:dd:ee:01", 3600);

    store.put(&allocation).await.unwrap();
    store.index_ip(ip, allocation.id).await.unwrap();

    let found = store.get_by_ip(ip).await.unwrap();
    assert_eq!(found.id, allocation.id);
}

#[tokio::test]
async fn test_get_by_ip_without_index_row() {
    let store = create_test_store();
    let result = store.get_by_ip(Ipv4Addr::new(10, 0, 0, 17)).await;
    assert!(matches!(result, Err(StoreError::NotFound(_))));
}

#[tokio::test]
async fn test_get_by_ip_tolerates_stale_index_row() {
    // A deleted-then-recreated allocation can leave lookup/<ip> pointing at
    // a record that no longer exists; readers see NotFound, not a crash.
    let store = create_test_store();
    let ip = Ipv4Addr::new(10, 0, 0, 17);
    store.index_ip(ip, uuid::Uuid::new_v4()).await.unwrap();

    let result = store.get_by_ip(ip).await;
    assert!(matches!(result, Err(StoreError::NotFound(_))));
}

#[tokio::test]
async fn test_remove_deletes_record_and_index() {
    let store = create_test_store();
    let ip = Ipv4Addr::new(10, 0, 0, 17);
    let allocation = bound_allocation("web.prod", ip, "aa:bb:cc:dd:ee:01", 3600);

    store.put(&allocation).await.unwrap();
    store.index_ip(ip, allocation.id).await.unwrap();
    store.remove(&allocation).await.unwrap();

    assert!(matches!(
        store.get(allocation.id).await,
        Err(StoreError::NotFound(_))
    ));
    assert!(matches!(
        store.get_by_ip(ip).await,
        Err(StoreError::NotFound(_))
    ));
}

// ============================================================================
// TTL behavior
// ============================================================================

#[tokio::test]
async fn test_leased_record_expires_with_the_lease() {
    let store = create_test_store();
    let mut watch = store.watch_allocations().await.unwrap();
    let allocation = bound_allocation(
        "web.prod",
        Ipv4Addr::new(10, 0, 0, 17),
        "aa:bb:cc:dd:ee:01",
        1,
    );

    store.put(&allocation).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert!(matches!(
        store.get(allocation.id).await,
        Err(StoreError::NotFound(_))
    ));

    // The implicit delete still fires a Deleted event carrying the record.
    let created = watch.recv().await.unwrap();
    assert!(matches!(created, AllocationEvent::Created(_)));
    let deleted = watch.recv().await.unwrap();
    match deleted {
        AllocationEvent::Deleted(a) => assert_eq!(a.id, allocation.id),
        other => panic!("expected Deleted, got {other:?}"),
    }
}

#[tokio::test]
async fn test_rewrite_supersedes_pending_expiry() {
    let store = create_test_store();
    let mut allocation = bound_allocation(
        "web.prod",
        Ipv4Addr::new(10, 0, 0, 17),
        "aa:bb:cc:dd:ee:01",
        1,
    );
    store.put(&allocation).await.unwrap();

    // Renewal arrives before the old expiry.
    allocation.lease.as_mut().unwrap().expire = Utc::now() + ChronoDuration::seconds(3600);
    store.put(&allocation).await.unwrap();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(store.get(allocation.id).await.is_ok());
}

// ============================================================================
// Watches
// ============================================================================

#[tokio::test]
async fn test_watch_sees_create_modify_delete_in_order() {
    let store = create_test_store();
    let mut watch = store.watch_allocations().await.unwrap();

    let mut allocation = test_allocation("web.prod");
    store.put(&allocation).await.unwrap();
    allocation.state = AllocationState::Bound;
    store.put(&allocation).await.unwrap();
    store.remove(&allocation).await.unwrap();

    match watch.recv().await.unwrap() {
        AllocationEvent::Created(a) => assert_eq!(a.state, AllocationState::Unbound),
        other => panic!("expected Created, got {other:?}"),
    }
    match watch.recv().await.unwrap() {
        AllocationEvent::Modified(a) => assert_eq!(a.state, AllocationState::Bound),
        other => panic!("expected Modified, got {other:?}"),
    }
    match watch.recv().await.unwrap() {
        // Deletes deliver the previous value.
        AllocationEvent::Deleted(a) => assert_eq!(a.id, allocation.id),
        other => panic!("expected Deleted, got {other:?}"),
    }
}

#[tokio::test]
async fn test_per_id_watch_filters_other_keys() {
    let store = create_test_store();
    let target = test_allocation("target");
    let noise = test_allocation("noise");

    let mut watch = store.watch_allocation(target.id).await.unwrap();
    store.put(&noise).await.unwrap();
    store.put(&target).await.unwrap();

    match watch.recv().await.unwrap() {
        AllocationEvent::Created(a) => assert_eq!(a.id, target.id),
        other => panic!("expected Created for target, got {other:?}"),
    }
}

#[tokio::test]
async fn test_watch_cancel_ends_the_feed() {
    let store = create_test_store();
    let watch = store.watch_allocations().await.unwrap();
    watch.cancel();

    // The feed task is gone; subsequent writes go nowhere and don't block.
    store.put(&test_allocation("web.prod")).await.unwrap();
}

// ============================================================================
// MAC pool
// ============================================================================

fn mac(s: &str) -> MacAddr {
    MacAddr::from_str(s).unwrap()
}

#[tokio::test]
async fn test_mac_pool_put_list_remove() {
    let store = create_test_store();
    store.put_mac(mac("aa:bb:cc:dd:ee:02")).await.unwrap();
    store.put_mac(mac("aa:bb:cc:dd:ee:01")).await.unwrap();

    assert_eq!(
        store.mac_pool().await.unwrap(),
        vec!["aa:bb:cc:dd:ee:01", "aa:bb:cc:dd:ee:02"]
    );

    store.remove_mac(mac("aa:bb:cc:dd:ee:01")).await.unwrap();
    // Idempotent: removing an absent member succeeds.
    store.remove_mac(mac("aa:bb:cc:dd:ee:01")).await.unwrap();
    assert_eq!(store.mac_pool().await.unwrap(), vec!["aa:bb:cc:dd:ee:02"]);
}

#[tokio::test]
async fn test_put_mac_rejects_nil() {
    let store = create_test_store();
    let result = store.put_mac(MacAddr::new([0; 6])).await;
    assert!(matches!(result, Err(StoreError::InvalidData(_))));
}

#[tokio::test]
async fn test_put_mac_rejects_macs_held_by_allocations() {
    let store = create_test_store();
    let allocation = bound_allocation(
        "web.prod",
        Ipv4Addr::new(10, 0, 0, 17),
        "aa:bb:cc:dd:ee:01",
        3600,
    );
    store.put(&allocation).await.unwrap();

    let result = store.put_mac(mac("aa:bb:cc:dd:ee:01")).await;
    assert!(matches!(result, Err(StoreError::InvalidData(_))));
    assert!(store.mac_pool().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_pop_mac_empties_the_pool() {
    let store = create_test_store();
    store.put_mac(mac("aa:bb:cc:dd:ee:01")).await.unwrap();

    let popped = store.pop_mac().await.unwrap();
    assert_eq!(popped, mac("aa:bb:cc:dd:ee:01"));
    assert!(matches!(store.pop_mac().await, Err(StoreError::Exhausted)));
}

#[tokio::test]
async fn test_concurrent_pop_of_one_element_has_one_winner() {
    let store = create_test_store();
    store.put_mac(mac("aa:bb:cc:dd:ee:01")).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move { store.pop_mac().await }));
    }

    let mut wins = 0;
    let mut exhausted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(m) => {
                assert_eq!(m, mac("aa:bb:cc:dd:ee:01"));
                wins += 1;
            }
            Err(StoreError::Exhausted) => exhausted += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(wins, 1);
    assert_eq!(exhausted, 7);
}

#[tokio::test]
async fn test_mac_pool_watch_distinguishes_push_and_pop() {
    let store = create_test_store();
    let mut watch = store.watch_mac_pool().await.unwrap();

    store.put_mac(mac("aa:bb:cc:dd:ee:01")).await.unwrap();
    // Re-park of an existing member is not a push.
    store.put_mac(mac("aa:bb:cc:dd:ee:01")).await.unwrap();
    store.pop_mac().await.unwrap();

    assert_eq!(
        watch.recv().await.unwrap(),
        MacPoolEvent::Pushed(mac("aa:bb:cc:dd:ee:01"))
    );
    assert_eq!(
        watch.recv().await.unwrap(),
        MacPoolEvent::Popped(mac("aa:bb:cc:dd:ee:01"))
    );
}

// ============================================================================
// IndexMaintainer
// ============================================================================

#[tokio::test]
async fn test_index_maintainer_converges_lookup_rows() {
    let store = create_test_store();
    let maintainer = IndexMaintainer::spawn(store.clone()).await.unwrap();

    let ip = Ipv4Addr::new(10, 0, 0, 17);
    let allocation = bound_allocation("web.prod", ip, "aa:bb:cc:dd:ee:01", 3600);
    store.put(&allocation).await.unwrap();

    // Eventual: allow the maintainer one round.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.get_by_ip(ip).await.unwrap().id, allocation.id);

    maintainer.stop();
}

#[tokio::test]
async fn test_index_maintainer_unindexes_ttl_expired_records() {
    let store = create_test_store();
    let maintainer = IndexMaintainer::spawn(store.clone()).await.unwrap();

    let ip = Ipv4Addr::new(10, 0, 0, 17);
    let allocation = bound_allocation("web.prod", ip, "aa:bb:cc:dd:ee:01", 1);
    store.put(&allocation).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(store.get_by_ip(ip).await.is_ok());

    // The record self-expires; no explicit delete was ever issued, yet the
    // index row goes away too.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(matches!(
        store.get_by_ip(ip).await,
        Err(StoreError::NotFound(_))
    ));

    maintainer.stop();
}

// ============================================================================
// Pool/allocation disjointness under a random workload
// ============================================================================

#[tokio::test]
async fn test_macs_are_pooled_xor_allocated() {
    use rand::prelude::*;

    let store = create_test_store();
    let universe: Vec<MacAddr> = (1..=6u8)
        .map(|i| MacAddr::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, i]))
        .collect();
    for m in &universe {
        store.put_mac(*m).await.unwrap();
    }

    let mut rng = StdRng::seed_from_u64(7);
    let mut held: Vec<Allocation> = Vec::new();

    for round in 0..100 {
        if rng.gen_bool(0.5) {
            // Claim: pop a MAC and bind it to a new allocation.
            match store.pop_mac().await {
                Ok(m) => {
                    let ip = Ipv4Addr::new(10, 0, 0, 100 + (round % 100) as u8);
                    let allocation =
                        bound_allocation(&format!("svc-{round}"), ip, &m.to_string(), 3600);
                    store.put(&allocation).await.unwrap();
                    held.push(allocation);
                }
                Err(StoreError::Exhausted) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        } else if !held.is_empty() {
            // Release: remove the allocation, park its MAC.
            let allocation = held.swap_remove(rng.gen_range(0..held.len()));
            store.remove(&allocation).await.unwrap();
            let m = allocation.interface.as_ref().unwrap().hardware_addr;
            store.put_mac(m).await.unwrap();
        }

        // Invariant: every known MAC is pooled xor referenced by exactly one
        // allocation; never both, never neither.
        let pooled: BTreeSet<String> = store.mac_pool().await.unwrap().into_iter().collect();
        let allocated: Vec<String> = store
            .allocations()
            .await
            .unwrap()
            .iter()
            .filter_map(|a| a.interface.as_ref().map(|i| i.hardware_addr.to_string()))
            .collect();
        let allocated_set: BTreeSet<String> = allocated.iter().cloned().collect();
        assert_eq!(allocated.len(), allocated_set.len(), "duplicate MAC claim");
        assert!(pooled.is_disjoint(&allocated_set));
        assert_eq!(pooled.len() + allocated_set.len(), universe.len());
    }
}
