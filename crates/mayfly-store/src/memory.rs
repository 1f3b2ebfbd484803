//! In-memory storage backend.
//!
//! Used by tests and standalone deployments. Event semantics match the etcd
//! backend: every watch sees `Created (Modified)* Deleted?` per key in write
//! order, deletes carry the previous value, and a leased record vanishes on
//! its own when the TTL runs out.

use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::warn;
use uuid::Uuid;

use mayfly_common::{Allocation, MacAddr};

use crate::{
    mac_in_use, AllocationEvent, AllocationWatch, MacPoolEvent, MacPoolWatch, Result, StateStore,
    StoreError, Watch, EVENT_QUEUE_DEPTH,
};

const BROADCAST_DEPTH: usize = 256;

pub struct MemoryStore {
    inner: Arc<Inner>,
}

struct Inner {
    allocations: RwLock<HashMap<Uuid, Allocation>>,
    lookup: RwLock<HashMap<Ipv4Addr, Uuid>>,
    macs: RwLock<BTreeSet<String>>,

    /// Write generation per allocation key. An expiry task only fires if the
    /// record has not been rewritten since the task was armed, mirroring how
    /// a fresh etcd put supersedes the old lease.
    generations: RwLock<HashMap<Uuid, u64>>,
    next_generation: AtomicU64,

    allocation_events: broadcast::Sender<AllocationEvent>,
    mac_events: broadcast::Sender<MacPoolEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (allocation_events, _) = broadcast::channel(BROADCAST_DEPTH);
        let (mac_events, _) = broadcast::channel(BROADCAST_DEPTH);
        Self {
            inner: Arc::new(Inner {
                allocations: RwLock::new(HashMap::new()),
                lookup: RwLock::new(HashMap::new()),
                macs: RwLock::new(BTreeSet::new()),
                generations: RwLock::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
                allocation_events,
                mac_events,
            }),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn write_lock<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
        lock.write()
            .map_err(|e| StoreError::Lock(format!("write lock poisoned: {e}")))
    }

    fn read_lock<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
        lock.read()
            .map_err(|e| StoreError::Lock(format!("read lock poisoned: {e}")))
    }

    fn emit(&self, event: AllocationEvent) {
        // A send error only means nobody is watching.
        let _ = self.allocation_events.send(event);
    }

    fn emit_mac(&self, event: MacPoolEvent) {
        let _ = self.mac_events.send(event);
    }
}

/// Fan a broadcast subscription out into a bounded per-watch queue. The
/// returned watch's cancel guard stops the forwarder task.
fn forward<E, F>(mut source: broadcast::Receiver<E>, filter: F) -> Watch<E>
where
    E: Clone + Send + 'static,
    F: Fn(&E) -> bool + Send + 'static,
{
    let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut cancel_rx => return,
                event = source.recv() => match event {
                    Ok(event) => {
                        if filter(&event) && tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "watch consumer lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        }
    });
    Watch::new(rx, cancel_tx)
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn put(&self, allocation: &Allocation) -> Result<()> {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let previous = {
            let mut allocations = Inner::write_lock(&self.inner.allocations)?;
            let mut generations = Inner::write_lock(&self.inner.generations)?;
            generations.insert(allocation.id, generation);
            allocations.insert(allocation.id, allocation.clone())
        };

        match previous {
            None => self.inner.emit(AllocationEvent::Created(allocation.clone())),
            Some(_) => self.inner.emit(AllocationEvent::Modified(allocation.clone())),
        }

        if let Some(lease) = &allocation.lease {
            let ttl = lease.ttl_seconds(Utc::now());
            let inner = Arc::clone(&self.inner);
            let id = allocation.id;
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(ttl as u64)).await;
                let expired = {
                    let Ok(mut allocations) = inner.allocations.write() else {
                        return;
                    };
                    let Ok(mut generations) = inner.generations.write() else {
                        return;
                    };
                    if generations.get(&id) != Some(&generation) {
                        // Rewritten since this task was armed.
                        return;
                    }
                    generations.remove(&id);
                    allocations.remove(&id)
                };
                if let Some(previous) = expired {
                    inner.emit(AllocationEvent::Deleted(previous));
                }
            });
        }
        Ok(())
    }

    async fn remove(&self, allocation: &Allocation) -> Result<()> {
        let previous = {
            let mut allocations = Inner::write_lock(&self.inner.allocations)?;
            let mut generations = Inner::write_lock(&self.inner.generations)?;
            generations.remove(&allocation.id);
            allocations.remove(&allocation.id)
        };
        if let Some(lease) = &allocation.lease {
            let mut lookup = Inner::write_lock(&self.inner.lookup)?;
            lookup.remove(&lease.fixed_address);
        }
        if let Some(previous) = previous {
            self.inner.emit(AllocationEvent::Deleted(previous));
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Allocation> {
        let allocations = Inner::read_lock(&self.inner.allocations)?;
        allocations
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn get_by_ip(&self, ip: Ipv4Addr) -> Result<Allocation> {
        let id = {
            let lookup = Inner::read_lock(&self.inner.lookup)?;
            lookup
                .get(&ip)
                .copied()
                .ok_or_else(|| StoreError::NotFound(ip.to_string()))?
        };
        self.get(id).await
    }

    async fn allocations(&self) -> Result<Vec<Allocation>> {
        let allocations = Inner::read_lock(&self.inner.allocations)?;
        Ok(allocations.values().cloned().collect())
    }

    async fn watch_allocations(&self) -> Result<AllocationWatch> {
        Ok(forward(self.inner.allocation_events.subscribe(), |_| true))
    }

    async fn watch_allocation(&self, id: Uuid) -> Result<AllocationWatch> {
        Ok(forward(
            self.inner.allocation_events.subscribe(),
            move |event: &AllocationEvent| event.allocation().id == id,
        ))
    }

    async fn index_ip(&self, ip: Ipv4Addr, id: Uuid) -> Result<()> {
        let mut lookup = Inner::write_lock(&self.inner.lookup)?;
        lookup.insert(ip, id);
        Ok(())
    }

    async fn unindex_ip(&self, ip: Ipv4Addr) -> Result<()> {
        let mut lookup = Inner::write_lock(&self.inner.lookup)?;
        lookup.remove(&ip);
        Ok(())
    }

    async fn mac_pool(&self) -> Result<Vec<String>> {
        let macs = Inner::read_lock(&self.inner.macs)?;
        Ok(macs.iter().cloned().collect())
    }

    async fn put_mac(&self, mac: MacAddr) -> Result<()> {
        if mac.is_nil() {
            return Err(StoreError::InvalidData("nil MAC".to_string()));
        }
        let allocations = self.allocations().await?;
        if let Some(id) = mac_in_use(&allocations, mac) {
            return Err(StoreError::InvalidData(format!(
                "MAC {mac} already in use by allocation {id}"
            )));
        }

        let inserted = {
            let mut macs = Inner::write_lock(&self.inner.macs)?;
            macs.insert(mac.to_string())
        };
        if inserted {
            self.inner.emit_mac(MacPoolEvent::Pushed(mac));
        }
        Ok(())
    }

    async fn remove_mac(&self, mac: MacAddr) -> Result<()> {
        let removed = {
            let mut macs = Inner::write_lock(&self.inner.macs)?;
            macs.remove(&mac.to_string())
        };
        if removed {
            self.inner.emit_mac(MacPoolEvent::Popped(mac));
        }
        Ok(())
    }

    async fn pop_mac(&self) -> Result<MacAddr> {
        let taken = {
            let mut macs = Inner::write_lock(&self.inner.macs)?;
            macs.pop_first()
        };
        let Some(taken) = taken else {
            return Err(StoreError::Exhausted);
        };
        let mac = MacAddr::from_str(&taken).map_err(|e| StoreError::Decode(e.to_string()))?;
        self.inner.emit_mac(MacPoolEvent::Popped(mac));
        Ok(mac)
    }

    async fn watch_mac_pool(&self) -> Result<MacPoolWatch> {
        Ok(forward(self.inner.mac_events.subscribe(), |_| true))
    }
}
