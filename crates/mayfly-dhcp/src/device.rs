//! Virtual device management.

use std::sync::Arc;

use tracing::info;

use mayfly_common::{InterfaceInfo, MacAddr};

use crate::error::Result;
use crate::netlink::LinkLayer;

/// Creates and destroys the MAC-VLAN children the controller claims for
/// allocations.
pub struct DeviceManager {
    link: Arc<dyn LinkLayer>,
}

impl DeviceManager {
    pub fn new(link: Arc<dyn LinkLayer>) -> Self {
        Self { link }
    }

    /// Mint a bridge-mode child device. A `None` MAC leaves the kernel to
    /// generate a random one (dynamic interfaces only).
    pub async fn create_device(
        &self,
        name: &str,
        mac: Option<MacAddr>,
    ) -> Result<InterfaceInfo> {
        let iface = self.link.create_macvlan(name, mac).await?;
        info!(
            link = %iface.name,
            mac = %iface.hardware_addr,
            index = iface.index,
            "device ready"
        );
        Ok(iface)
    }

    /// Delete the device backing `iface`. Idempotent to "already absent".
    pub async fn remove_device(&self, iface: &InterfaceInfo) -> Result<()> {
        self.link.delete_link(&iface.name).await
    }
}
