//! Shared data model for mayfly.
//!
//! The central entity is the [`Allocation`]: a long-lived record binding a
//! caller-named service to a DHCP lease and the virtual interface holding
//! it. Everything here serializes to the durable JSON form persisted in the
//! KV store, so the wire names are frozen.

pub mod allocation;
pub mod error;
pub mod mac;

pub use allocation::{
    service_hostname, Allocation, AllocationState, InterfaceInfo, Lease,
};
pub use error::Error;
pub use mac::MacAddr;
