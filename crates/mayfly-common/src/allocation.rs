//! The Allocation entity and its durable serialization contract.
//!
//! Allocations are persisted as JSON in the KV store and read back by every
//! other process, so the field names below are a frozen wire format. The
//! interface's hardware address crosses the boundary in the canonical
//! textual MAC form; a record whose MAC does not parse is a decode error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::{Error, MacAddr};
use std::net::Ipv4Addr;

/// Lifecycle state of an allocation.
///
/// Persisted as the bare integer, so the discriminants are part of the wire
/// format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum AllocationState {
    /// Request received, no lease obtained yet.
    Unbound = 0,
    /// A DHCP client holds a lease for this allocation.
    Bound = 1,
    /// The controller failed to recover this allocation; reaped on the next
    /// convergence pass.
    Stale = 2,
    /// Gracefully stopped; resurrected on the next controller start.
    Stopped = 3,
}

impl AllocationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationState::Unbound => "unbound",
            AllocationState::Bound => "bound",
            AllocationState::Stale => "stale",
            AllocationState::Stopped => "stopped",
        }
    }
}

impl From<AllocationState> for u8 {
    fn from(state: AllocationState) -> u8 {
        state as u8
    }
}

impl TryFrom<u8> for AllocationState {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Error> {
        match value {
            0 => Ok(AllocationState::Unbound),
            1 => Ok(AllocationState::Bound),
            2 => Ok(AllocationState::Stale),
            3 => Ok(AllocationState::Stopped),
            other => Err(Error::InvalidState(other)),
        }
    }
}

/// A DHCP lease as granted by the upstream server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    #[serde(rename = "FixedAddress")]
    pub fixed_address: Ipv4Addr,

    #[serde(rename = "Netmask")]
    pub netmask: Ipv4Addr,

    /// Absolute expiry of the lease. The persisted allocation record carries
    /// a TTL mirroring this instant.
    #[serde(rename = "Expire")]
    pub expire: DateTime<Utc>,

    #[serde(rename = "ServerID", default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<Ipv4Addr>,

    #[serde(rename = "Renew", default, skip_serializing_if = "Option::is_none")]
    pub renew: Option<DateTime<Utc>>,

    #[serde(rename = "Rebind", default, skip_serializing_if = "Option::is_none")]
    pub rebind: Option<DateTime<Utc>>,
}

impl Lease {
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expire <= now
    }

    /// Remaining lifetime in whole seconds, clamped to at least one so a
    /// lease on the edge of expiry still produces a valid KV TTL.
    pub fn ttl_seconds(&self, now: DateTime<Utc>) -> i64 {
        (self.expire - now).num_seconds().max(1)
    }
}

/// Descriptor of the network interface an allocation is bound to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceInfo {
    #[serde(rename = "Index")]
    pub index: u32,

    #[serde(rename = "MTU")]
    pub mtu: u32,

    #[serde(rename = "Name")]
    pub name: String,

    /// MAC drawn from the pool (or kernel-assigned for dynamic interfaces).
    #[serde(rename = "HardwareAddr")]
    pub hardware_addr: MacAddr,

    /// Raw kernel link flags at the time the descriptor was taken.
    #[serde(rename = "Flags")]
    pub flags: u32,
}

/// The central entity: binds a caller-named service to a DHCP lease and the
/// virtual interface holding it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    #[serde(rename = "ID")]
    pub id: Uuid,

    /// DNS-style name announced on DHCP DISCOVER.
    #[serde(rename = "Hostname")]
    pub hostname: String,

    #[serde(rename = "State")]
    pub state: AllocationState,

    /// Present iff the allocation has ever successfully bound.
    #[serde(rename = "Lease", default)]
    pub lease: Option<Lease>,

    /// Present once the controller has claimed or created a device.
    #[serde(rename = "Interface", default)]
    pub interface: Option<InterfaceInfo>,
}

impl Allocation {
    /// A fresh record: new v4 id, unbound, no lease, no interface. IDs are
    /// assigned once and never reused.
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            hostname: hostname.into(),
            state: AllocationState::Unbound,
            lease: None,
            interface: None,
        }
    }
}

/// Translate a `namespace/name` service identifier into the hostname
/// announced upstream: `name.namespace`. Bare names pass through; anything
/// with more than one slash is truncated to its first two segments.
pub fn service_hostname(service: &str) -> String {
    let parts: Vec<&str> = service.split('/').collect();
    if parts.len() < 2 {
        return parts[0].to_string();
    }
    if parts.len() > 2 {
        warn!(service = %service, "malformed service identifier, hostname will be truncated");
    }
    format!("{}.{}", parts[1], parts[0])
}
