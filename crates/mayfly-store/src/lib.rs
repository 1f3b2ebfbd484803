//! State storage for mayfly.
//!
//! Backend-agnostic storage layer with:
//! - the [`StateStore`] trait: allocations, the IP→id lookup index, and the
//!   MAC pool, plus change feeds over all of them
//! - [`EtcdStore`]: the production etcd v3 backend
//! - [`MemoryStore`]: an in-process backend with identical event semantics,
//!   used by tests and standalone deployments
//! - [`IndexMaintainer`]: the background subscriber that keeps the
//!   IP→id index converged
//!
//! The KV store is the only cross-process synchronization primitive in the
//! system; there is no distributed lock. Watch consumers must be idempotent
//! and treat a stream interruption as "unknown, re-read".

mod etcd;
mod index;
mod memory;
#[cfg(test)]
mod tests;

pub use etcd::EtcdStore;
pub use index::IndexMaintainer;
pub use memory::MemoryStore;

use async_trait::async_trait;
use std::net::Ipv4Addr;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use mayfly_common::{Allocation, MacAddr};

/// Fixed namespace under which every key lives. Part of the durable layout;
/// never changed across versions.
pub const KEY_PREFIX: &str = "/mayfly/address-pool";

/// Depth of the per-subscriber event queues. A consumer that falls this far
/// behind has lost the stream and must re-read.
const EVENT_QUEUE_DEPTH: usize = 64;

/// Errors from storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("MAC pool exhausted")]
    Exhausted,

    #[error("request timed out")]
    Timeout,

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("lock error: {0}")]
    Lock(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A change observed on the allocations prefix. `Deleted` carries the
/// previous value (the KV retains it), so consumers can tear down resources
/// for records that no longer exist.
#[derive(Debug, Clone)]
pub enum AllocationEvent {
    Created(Allocation),
    Modified(Allocation),
    Deleted(Allocation),
}

impl AllocationEvent {
    pub fn allocation(&self) -> &Allocation {
        match self {
            AllocationEvent::Created(a)
            | AllocationEvent::Modified(a)
            | AllocationEvent::Deleted(a) => a,
        }
    }
}

/// A change observed on the MAC pool. Push/pop is approximated from
/// create/delete events; a controller observing its own writes must handle
/// these reentrantly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacPoolEvent {
    Pushed(MacAddr),
    Popped(MacAddr),
}

/// A live watch subscription: a bounded event queue plus a cancel guard.
/// Dropping the watch (or calling [`Watch::cancel`]) stops the feed task
/// deterministically.
pub struct Watch<E> {
    events: mpsc::Receiver<E>,
    _cancel: oneshot::Sender<()>,
}

impl<E> Watch<E> {
    pub(crate) fn new(events: mpsc::Receiver<E>, cancel: oneshot::Sender<()>) -> Self {
        Self {
            events,
            _cancel: cancel,
        }
    }

    /// Receive the next event; `None` once the feed has ended.
    pub async fn recv(&mut self) -> Option<E> {
        self.events.recv().await
    }

    /// Stop the feed task. Equivalent to dropping the watch.
    pub fn cancel(self) {}
}

pub type AllocationWatch = Watch<AllocationEvent>;
pub type MacPoolWatch = Watch<MacPoolEvent>;

/// The persistence contract shared by every backend.
///
/// Writers split by role: the API front creates and removes allocations, the
/// controller drives every lifecycle transition in between. All methods are
/// async for the network-backed etcd implementation.
#[async_trait]
pub trait StateStore: Send + Sync {
    // === Allocations ===

    /// Persist an allocation. A record carrying a lease is written with a
    /// TTL of `max(1, expire - now)` seconds so it self-deletes when the
    /// lease would have expired; without a lease it is written plainly.
    async fn put(&self, allocation: &Allocation) -> Result<()>;

    /// Delete the primary record and, if a lease is attached, its
    /// `lookup/<ip>` index row.
    async fn remove(&self, allocation: &Allocation) -> Result<()>;

    /// Fetch by id. `NotFound` when absent.
    async fn get(&self, id: Uuid) -> Result<Allocation>;

    /// Two-step fetch through the `lookup/<ip>` index. `NotFound` when
    /// either leg is missing; a stale index row therefore surfaces as
    /// `NotFound`, not as an error.
    async fn get_by_ip(&self, ip: Ipv4Addr) -> Result<Allocation>;

    /// All current allocations. Records that fail to decode are logged and
    /// skipped so one bad write cannot wedge convergence.
    async fn allocations(&self) -> Result<Vec<Allocation>>;

    /// Tail the allocations prefix.
    async fn watch_allocations(&self) -> Result<AllocationWatch>;

    /// Tail a single allocation key. Arm the watch *before* the first write
    /// to the key or the create event can be missed.
    async fn watch_allocation(&self, id: Uuid) -> Result<AllocationWatch>;

    // === IP→id index ===

    async fn index_ip(&self, ip: Ipv4Addr, id: Uuid) -> Result<()>;

    async fn unindex_ip(&self, ip: Ipv4Addr) -> Result<()>;

    // === MAC pool ===

    /// Parked MACs in canonical textual form, sorted.
    async fn mac_pool(&self) -> Result<Vec<String>>;

    /// Park a MAC. Refused for the nil address and for a MAC currently
    /// referenced by an allocation's interface; that check scans allocations
    /// and is advisory only — no transaction guards it against a concurrent
    /// claim.
    async fn put_mac(&self, mac: MacAddr) -> Result<()>;

    /// Unpark a MAC. Idempotent: removing an absent member succeeds.
    async fn remove_mac(&self, mac: MacAddr) -> Result<()>;

    /// Atomically take any one member. Exactly one concurrent caller wins a
    /// given MAC; an empty pool yields `Exhausted`.
    async fn pop_mac(&self) -> Result<MacAddr>;

    /// Tail the MAC pool prefix.
    async fn watch_mac_pool(&self) -> Result<MacPoolWatch>;
}

pub(crate) fn allocation_key(id: Uuid) -> String {
    format!("{KEY_PREFIX}/allocations/{id}")
}

pub(crate) fn allocations_prefix() -> String {
    format!("{KEY_PREFIX}/allocations/")
}

pub(crate) fn lookup_key(ip: Ipv4Addr) -> String {
    format!("{KEY_PREFIX}/lookup/{ip}")
}

pub(crate) fn mac_key(mac: MacAddr) -> String {
    format!("{KEY_PREFIX}/macs/{mac}")
}

pub(crate) fn macs_prefix() -> String {
    format!("{KEY_PREFIX}/macs/")
}

/// The advisory in-use check backing `put_mac`.
pub(crate) fn mac_in_use(allocations: &[Allocation], mac: MacAddr) -> Option<Uuid> {
    allocations
        .iter()
        .find(|a| {
            a.interface
                .as_ref()
                .map(|i| i.hardware_addr == mac)
                .unwrap_or(false)
        })
        .map(|a| a.id)
}
