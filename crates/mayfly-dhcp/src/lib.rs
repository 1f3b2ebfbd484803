//! DHCP client lifecycle and device management.
//!
//! Three seams live here, one per piece of the outside world:
//!
//! - [`DhcpClientFactory`] / [`RawDhcpClient`]: the per-interface DHCP
//!   client. The production shell ([`UdpClientFactory`]) speaks
//!   DISCOVER/OFFER/REQUEST/ACK over a broadcast socket bound to the
//!   device; tests plug in [`StaticLeaseFactory`].
//! - [`LinkLayer`]: the kernel link layer. The production shell
//!   ([`NetlinkLinkLayer`]) drives rtnetlink; tests plug in
//!   [`MemoryLinkLayer`].
//! - [`LeaseBinder`]: the piece the controller actually talks to — a
//!   bounded-wait first-bind handshake, a duplicate-lease guard, and
//!   renewal forwarding onto the controller's channel.
//!
//! The binder keeps no durable state; re-driving it after a restart is the
//! controller's job.

pub mod binder;
pub mod client;
pub mod device;
pub mod error;
pub mod netlink;

pub use binder::{LeaseBinder, LeaseRenewed};
pub use client::{DhcpClientFactory, RawDhcpClient, StaticLeaseFactory, UdpClientFactory};
pub use device::DeviceManager;
pub use error::{DhcpError, Result};
pub use netlink::{LinkLayer, MemoryLinkLayer, NetlinkLinkLayer};
