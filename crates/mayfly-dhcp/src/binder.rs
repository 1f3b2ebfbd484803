//! Binding allocations to DHCP clients.
//!
//! One client per bound IP. The first lease resolves a bounded wait; every
//! later one is forwarded as a [`LeaseRenewed`] message so the controller
//! can persist the refreshed expiry — the client never calls back into the
//! controller directly.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use mayfly_common::{Allocation, InterfaceInfo, Lease};

use crate::client::{DhcpClientFactory, RawDhcpClient};
use crate::error::{DhcpError, Result};
use crate::netlink::LinkLayer;

/// Posted onto the controller's renewal channel each time a bound client
/// refreshes its lease.
#[derive(Debug, Clone)]
pub struct LeaseRenewed {
    pub id: Uuid,
    pub lease: Lease,
}

/// Manages the DHCP clients for one uplink.
pub struct LeaseBinder {
    factory: Arc<dyn DhcpClientFactory>,
    link: Arc<dyn LinkLayer>,
    uplink: String,
    timeout: Duration,
    assign_interfaces: bool,
    clients: Mutex<HashMap<Ipv4Addr, Arc<dyn RawDhcpClient>>>,
}

impl LeaseBinder {
    pub fn new(
        factory: Arc<dyn DhcpClientFactory>,
        link: Arc<dyn LinkLayer>,
        uplink: impl Into<String>,
        timeout: Duration,
        assign_interfaces: bool,
    ) -> Self {
        Self {
            factory,
            link,
            uplink: uplink.into(),
            timeout,
            assign_interfaces,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Create a client on `iface` announcing the allocation's hostname and
    /// wait for its first lease, up to the configured timeout. On success
    /// the client is recorded under the leased address and keeps running;
    /// renewals flow onto `renewals` tagged with the allocation id.
    pub async fn bind(
        &self,
        allocation: &Allocation,
        iface: &InterfaceInfo,
        renewals: mpsc::Sender<LeaseRenewed>,
    ) -> Result<Lease> {
        let (lease_tx, mut lease_rx) = mpsc::channel(8);
        let client = self
            .factory
            .create(iface, &allocation.hostname, lease_tx)
            .await?;
        client.start().await?;

        let lease = match tokio::time::timeout(self.timeout, lease_rx.recv()).await {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                client.stop().await;
                return Err(DhcpError::BindFailed(
                    "client ended before delivering a lease".to_string(),
                ));
            }
            Err(_) => {
                warn!(
                    iface = %iface.name,
                    hostname = %allocation.hostname,
                    "timeout binding to interface"
                );
                client.stop().await;
                return Err(DhcpError::BindTimeout(iface.name.clone()));
            }
        };

        // Guard against two controllers racing onto the same IP: the first
        // client to record the address wins, the newcomer is torn down.
        let duplicate = {
            let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
            if clients.contains_key(&lease.fixed_address) {
                true
            } else {
                clients.insert(lease.fixed_address, Arc::clone(&client));
                false
            }
        };
        if duplicate {
            client.stop().await;
            return Err(DhcpError::DuplicateLease(lease.fixed_address));
        }

        if self.assign_interfaces {
            if let Err(e) = self
                .link
                .add_address(&self.uplink, lease.fixed_address, lease.netmask)
                .await
            {
                warn!(
                    ip = %lease.fixed_address,
                    uplink = %self.uplink,
                    error = %e,
                    "could not assign leased address to uplink"
                );
            } else {
                info!(ip = %lease.fixed_address, uplink = %self.uplink, "assigned address to uplink");
            }
        }

        let id = allocation.id;
        tokio::spawn(async move {
            while let Some(lease) = lease_rx.recv().await {
                if renewals.send(LeaseRenewed { id, lease }).await.is_err() {
                    return;
                }
            }
        });

        Ok(lease)
    }

    /// Stop the client keeping `ip` alive. A no-op for unknown addresses.
    pub async fn stop(&self, ip: Ipv4Addr) {
        let client = {
            let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
            clients.remove(&ip)
        };
        match client {
            Some(client) => {
                client.stop().await;
                info!(ip = %ip, "stopped DHCP client");
            }
            None => debug!(ip = %ip, "no DHCP client to stop"),
        }
    }

    /// Whether a client in this process currently holds `ip`.
    pub fn has_client(&self, ip: Ipv4Addr) -> bool {
        self.clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&ip)
    }

    /// The configured uplink, resolved by name.
    pub async fn interface(&self) -> Result<InterfaceInfo> {
        self.link.link_info(&self.uplink).await
    }
}
