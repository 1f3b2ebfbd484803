//! The kernel link layer boundary.
//!
//! Virtual interfaces are MAC-VLAN children in bridge mode, parented to the
//! physical uplink, so a single link can carry one DHCP client per pooled
//! MAC. [`NetlinkLinkLayer`] is the production rtnetlink shell;
//! [`MemoryLinkLayer`] fabricates the same behavior for tests and dry runs.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::TryStreamExt;
use netlink_packet_route::link::nlas::Nla;
use netlink_packet_route::LinkMessage;
use rtnetlink::Handle;
use tracing::{debug, info};

use mayfly_common::{InterfaceInfo, MacAddr};

use crate::error::{DhcpError, Result};

/// Kernel uapi value for bridge-mode MAC-VLAN.
const MACVLAN_MODE_BRIDGE: u32 = 4;

/// What the system needs from the kernel link layer.
#[async_trait]
pub trait LinkLayer: Send + Sync {
    /// Create a bridge-mode MAC-VLAN child parented to the uplink, bring it
    /// up, and return its descriptor with the kernel-assigned index, MTU and
    /// actually-installed MAC. `None` leaves MAC generation to the kernel.
    async fn create_macvlan(&self, name: &str, mac: Option<MacAddr>) -> Result<InterfaceInfo>;

    /// Delete a link by name. Idempotent to "already absent".
    async fn delete_link(&self, name: &str) -> Result<()>;

    /// Resolve a link by name.
    async fn link_info(&self, name: &str) -> Result<InterfaceInfo>;

    /// Install `ip/netmask` on the named link.
    async fn add_address(&self, name: &str, ip: Ipv4Addr, netmask: Ipv4Addr) -> Result<()>;
}

pub(crate) fn prefix_len(netmask: Ipv4Addr) -> u8 {
    u32::from(netmask).count_ones() as u8
}

// ============================================================================
// rtnetlink shell
// ============================================================================

pub struct NetlinkLinkLayer {
    handle: Handle,
    uplink: String,
}

impl NetlinkLinkLayer {
    /// Open a netlink socket for link management on `uplink`.
    pub fn new(uplink: impl Into<String>) -> Result<Self> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);
        Ok(Self {
            handle,
            uplink: uplink.into(),
        })
    }

    async fn find_link(&self, name: &str) -> Result<LinkMessage> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match links.try_next().await {
            Ok(Some(message)) => Ok(message),
            Ok(None) => Err(DhcpError::InterfaceNotFound(name.to_string())),
            Err(e) => {
                debug!(link = %name, error = %e, "link lookup failed");
                Err(DhcpError::InterfaceNotFound(name.to_string()))
            }
        }
    }
}

fn describe(name: &str, message: &LinkMessage) -> InterfaceInfo {
    let mut mtu = 0;
    let mut hardware_addr = MacAddr::new([0; 6]);
    for nla in &message.nlas {
        match nla {
            Nla::Mtu(value) => mtu = *value,
            Nla::Address(bytes) if bytes.len() == 6 => {
                let mut octets = [0u8; 6];
                octets.copy_from_slice(bytes);
                hardware_addr = MacAddr::new(octets);
            }
            _ => {}
        }
    }
    InterfaceInfo {
        index: message.header.index,
        mtu,
        name: name.to_string(),
        hardware_addr,
        flags: message.header.flags,
    }
}

#[async_trait]
impl LinkLayer for NetlinkLinkLayer {
    async fn create_macvlan(&self, name: &str, mac: Option<MacAddr>) -> Result<InterfaceInfo> {
        let parent = self.find_link(&self.uplink).await?;

        let mut request = self.handle.link().add().macvlan(
            name.to_string(),
            parent.header.index,
            MACVLAN_MODE_BRIDGE,
        );
        if let Some(mac) = mac {
            request
                .message_mut()
                .nlas
                .push(Nla::Address(mac.octets().to_vec()));
        }
        request
            .execute()
            .await
            .map_err(|e| DhcpError::Link(format!("could not add {name}: {e}")))?;

        let created = self.find_link(name).await?;
        self.handle
            .link()
            .set(created.header.index)
            .up()
            .execute()
            .await
            .map_err(|e| DhcpError::Link(format!("could not bring {name} up: {e}")))?;

        info!(link = %name, parent = %self.uplink, "created MAC-VLAN device");
        // Re-read for the post-up flags.
        self.link_info(name).await
    }

    async fn delete_link(&self, name: &str) -> Result<()> {
        let link = match self.find_link(name).await {
            Ok(link) => link,
            Err(_) => {
                debug!(link = %name, "link already absent");
                return Ok(());
            }
        };
        self.handle
            .link()
            .del(link.header.index)
            .execute()
            .await
            .map_err(|e| DhcpError::Link(format!("could not delete {name}: {e}")))?;
        info!(link = %name, "deleted device");
        Ok(())
    }

    async fn link_info(&self, name: &str) -> Result<InterfaceInfo> {
        let message = self.find_link(name).await?;
        Ok(describe(name, &message))
    }

    async fn add_address(&self, name: &str, ip: Ipv4Addr, netmask: Ipv4Addr) -> Result<()> {
        let link = self.find_link(name).await?;
        self.handle
            .address()
            .add(link.header.index, IpAddr::V4(ip), prefix_len(netmask))
            .execute()
            .await
            .map_err(|e| DhcpError::Link(format!("could not add {ip} to {name}: {e}")))?;
        Ok(())
    }
}

// ============================================================================
// In-memory shell for tests and dry runs
// ============================================================================

/// Fabricated link layer: tracks created devices, assigns indexes and
/// locally-administered MACs the way the kernel would.
pub struct MemoryLinkLayer {
    links: Mutex<HashMap<String, InterfaceInfo>>,
    addresses: Mutex<Vec<(String, Ipv4Addr, Ipv4Addr)>>,
    next_index: AtomicU32,
}

impl MemoryLinkLayer {
    /// A fresh layer with only the named uplink present.
    pub fn new(uplink: &str) -> Self {
        let mut links = HashMap::new();
        links.insert(
            uplink.to_string(),
            InterfaceInfo {
                index: 1,
                mtu: 1500,
                name: uplink.to_string(),
                hardware_addr: MacAddr::new([0x02, 0x00, 0x5e, 0x00, 0x00, 0x01]),
                flags: 1,
            },
        );
        Self {
            links: Mutex::new(links),
            addresses: Mutex::new(Vec::new()),
            next_index: AtomicU32::new(2),
        }
    }

    /// Names of every link currently present.
    pub fn link_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .links
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Addresses installed on the named link.
    pub fn addresses(&self, name: &str) -> Vec<Ipv4Addr> {
        self.addresses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(link, _, _)| link == name)
            .map(|(_, ip, _)| *ip)
            .collect()
    }
}

#[async_trait]
impl LinkLayer for MemoryLinkLayer {
    async fn create_macvlan(&self, name: &str, mac: Option<MacAddr>) -> Result<InterfaceInfo> {
        let mut links = self.links.lock().unwrap_or_else(|e| e.into_inner());
        if links.contains_key(name) {
            return Err(DhcpError::Link(format!("{name}: file exists")));
        }
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        let hardware_addr = mac.unwrap_or(MacAddr::new([
            0x02,
            0x00,
            0x5e,
            0x00,
            (index >> 8) as u8,
            index as u8,
        ]));
        let iface = InterfaceInfo {
            index,
            mtu: 1500,
            name: name.to_string(),
            hardware_addr,
            flags: 1,
        };
        links.insert(name.to_string(), iface.clone());
        Ok(iface)
    }

    async fn delete_link(&self, name: &str) -> Result<()> {
        let mut links = self.links.lock().unwrap_or_else(|e| e.into_inner());
        links.remove(name);
        Ok(())
    }

    async fn link_info(&self, name: &str) -> Result<InterfaceInfo> {
        let links = self.links.lock().unwrap_or_else(|e| e.into_inner());
        links
            .get(name)
            .cloned()
            .ok_or_else(|| DhcpError::InterfaceNotFound(name.to_string()))
    }

    async fn add_address(&self, name: &str, ip: Ipv4Addr, netmask: Ipv4Addr) -> Result<()> {
        {
            let links = self.links.lock().unwrap_or_else(|e| e.into_inner());
            if !links.contains_key(name) {
                return Err(DhcpError::InterfaceNotFound(name.to_string()));
            }
        }
        self.addresses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((name.to_string(), ip, netmask));
        Ok(())
    }
}
