//! The reconciliation controller.
//!
//! One instance owns the convergence of one uplink: it walks every persisted
//! allocation once at startup, then tails the change feed. Real-world
//! resources — DHCP clients, MAC-VLAN devices, pool MACs — are driven toward
//! whatever the store says. The store is the only cross-process contract;
//! client and device bookkeeping is per-process.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use mayfly_common::{Allocation, AllocationState, MacAddr};
use mayfly_dhcp::{DeviceManager, LeaseBinder, LeaseRenewed};
use mayfly_store::{AllocationEvent, StateStore, StoreError};

/// Depth of the renewal channel between DHCP clients and the controller's
/// serial persistence loop.
const RENEWAL_QUEUE_DEPTH: usize = 64;

pub struct Controller {
    store: Arc<dyn StateStore>,
    binder: Arc<LeaseBinder>,
    devices: Arc<DeviceManager>,
    manage_interfaces: bool,
    dynamic_interfaces: bool,
    renew_tx: mpsc::Sender<LeaseRenewed>,
    renew_rx: Mutex<Option<mpsc::Receiver<LeaseRenewed>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Controller {
    pub fn new(
        store: Arc<dyn StateStore>,
        binder: Arc<LeaseBinder>,
        devices: Arc<DeviceManager>,
        manage_interfaces: bool,
        dynamic_interfaces: bool,
    ) -> Arc<Self> {
        let (renew_tx, renew_rx) = mpsc::channel(RENEWAL_QUEUE_DEPTH);
        Arc::new(Self {
            store,
            binder,
            devices,
            manage_interfaces,
            dynamic_interfaces,
            renew_tx,
            renew_rx: Mutex::new(Some(renew_rx)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Converge once, then follow the change feed. Idempotent: a second
    /// call on a running controller does nothing.
    pub async fn start(self: &Arc<Self>) -> Result<(), StoreError> {
        let Some(mut renew_rx) = self
            .renew_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            return Ok(());
        };

        self.converge().await?;

        let mut watch = self.store.watch_allocations().await?;
        let controller = Arc::clone(self);
        let watch_task = tokio::spawn(async move {
            while let Some(event) = watch.recv().await {
                match event {
                    AllocationEvent::Created(allocation) => {
                        if allocation.state != AllocationState::Unbound {
                            debug!(
                                id = %allocation.id,
                                state = allocation.state.as_str(),
                                "created allocation not unbound, ignoring"
                            );
                            continue;
                        }
                        controller.process_unbound(allocation).await;
                    }
                    AllocationEvent::Deleted(mut allocation) => {
                        // The record is already gone (explicit release or
                        // TTL expiry); release its resources.
                        controller.reap(&mut allocation).await;
                    }
                    AllocationEvent::Modified(_) => {}
                }
            }
        });

        // Renewals arrive from client callback tasks and are persisted
        // serially here, never from inside the clients themselves.
        let controller = Arc::clone(self);
        let renew_task = tokio::spawn(async move {
            while let Some(LeaseRenewed { id, lease }) = renew_rx.recv().await {
                match controller.store.get(id).await {
                    Ok(mut allocation) => {
                        allocation.lease = Some(lease);
                        if let Err(e) = controller.store.put(&allocation).await {
                            warn!(id = %id, error = %e, "error persisting renewed lease");
                        }
                    }
                    Err(StoreError::NotFound(_)) => {
                        debug!(id = %id, "dropping renewal for unknown allocation");
                    }
                    Err(e) => {
                        warn!(id = %id, error = %e, "error loading allocation for renewal");
                    }
                }
            }
        });

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.push(watch_task);
        tasks.push(renew_task);
        Ok(())
    }

    /// One full reconciliation pass over every persisted allocation.
    pub async fn converge(&self) -> Result<(), StoreError> {
        let allocations = self.store.allocations().await?;
        for allocation in allocations {
            match allocation.state {
                AllocationState::Unbound => self.process_unbound(allocation).await,
                AllocationState::Stopped => self.process_stopped(allocation).await,
                AllocationState::Stale => {
                    info!(id = %allocation.id, "removing stale allocation");
                    let mut allocation = allocation;
                    self.reap(&mut allocation).await;
                    if let Err(e) = self.store.remove(&allocation).await {
                        warn!(id = %allocation.id, error = %e, "error removing stale allocation");
                    }
                }
                AllocationState::Bound => {
                    // A bound record with no live client means the process
                    // that served it died uncleanly; recover it exactly like
                    // a stopped one.
                    let live = allocation
                        .lease
                        .as_ref()
                        .map(|lease| self.binder.has_client(lease.fixed_address))
                        .unwrap_or(false);
                    if !live {
                        info!(id = %allocation.id, "bound allocation has no live client, recovering");
                        self.process_stopped(allocation).await;
                    }
                }
            }
        }
        Ok(())
    }

    /// Drain: stop every client and device, demote bound allocations to
    /// Stopped so a later start can resurrect the same addresses.
    pub async fn stop(&self) {
        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        for task in tasks {
            task.abort();
        }

        let allocations = match self.store.allocations().await {
            Ok(allocations) => allocations,
            Err(e) => {
                warn!(error = %e, "could not read allocations for drain");
                return;
            }
        };
        for mut allocation in allocations {
            if allocation.state != AllocationState::Bound {
                continue;
            }
            if let Some(lease) = &allocation.lease {
                self.binder.stop(lease.fixed_address).await;
            }
            if self.manage_interfaces {
                if let Some(iface) = &allocation.interface {
                    if let Err(e) = self.devices.remove_device(iface).await {
                        warn!(device = %iface.name, error = %e, "error removing device during drain");
                    }
                }
            }
            allocation.state = AllocationState::Stopped;
            if let Err(e) = self.store.put(&allocation).await {
                warn!(id = %allocation.id, error = %e, "error persisting stopped allocation");
            }
        }
    }

    /// Claim resources for a fresh allocation and bind it.
    async fn process_unbound(&self, mut allocation: Allocation) {
        let mut popped: Option<MacAddr> = None;
        let iface = if self.manage_interfaces {
            let name = format!("vf-{}", random_suffix(6));
            let mac = match self.store.pop_mac().await {
                Ok(mac) => {
                    popped = Some(mac);
                    Some(mac)
                }
                // Exhaustion is not retried here; the allocation stays
                // Unbound for a later convergence pass.
                Err(StoreError::Exhausted) if self.dynamic_interfaces => None,
                Err(StoreError::Exhausted) => {
                    warn!(id = %allocation.id, "no MAC available, leaving allocation for a later pass");
                    return;
                }
                Err(e) => {
                    warn!(id = %allocation.id, error = %e, "could not draw a MAC from the pool");
                    return;
                }
            };
            match self.devices.create_device(&name, mac).await {
                Ok(iface) => iface,
                Err(e) => {
                    warn!(id = %allocation.id, device = %name, error = %e, "could not create device");
                    self.return_mac(&allocation, popped).await;
                    return;
                }
            }
        } else {
            match self.binder.interface().await {
                Ok(iface) => iface,
                Err(e) => {
                    warn!(id = %allocation.id, error = %e, "could not access uplink");
                    return;
                }
            }
        };

        match self
            .binder
            .bind(&allocation, &iface, self.renew_tx.clone())
            .await
        {
            Ok(lease) => {
                info!(
                    id = %allocation.id,
                    iface = %iface.name,
                    ip = %lease.fixed_address,
                    hostname = %allocation.hostname,
                    "allocation bound"
                );
                allocation.lease = Some(lease);
                allocation.interface = Some(iface);
                allocation.state = AllocationState::Bound;
                if let Err(e) = self.store.put(&allocation).await {
                    warn!(id = %allocation.id, error = %e, "error persisting bound allocation");
                }
            }
            Err(e) => {
                warn!(id = %allocation.id, iface = %iface.name, error = %e, "could not bind allocation");
                self.return_mac(&allocation, popped).await;
                if self.manage_interfaces {
                    if let Err(e) = self.devices.remove_device(&iface).await {
                        warn!(device = %iface.name, error = %e, "error removing device after failed bind");
                    }
                }
                // Delete the record so the requester's timeout fires.
                if let Err(e) = self.store.remove(&allocation).await {
                    warn!(id = %allocation.id, error = %e, "error removing unbindable allocation");
                }
            }
        }
    }

    /// Resurrect a gracefully stopped allocation: same device name, same
    /// MAC, so upstream re-issues the same address.
    async fn process_stopped(&self, mut allocation: Allocation) {
        if let Some(lease) = &allocation.lease {
            if lease.expired(Utc::now()) {
                warn!(
                    id = %allocation.id,
                    ip = %lease.fixed_address,
                    "lease already expired, reaping"
                );
                self.reap(&mut allocation).await;
                if let Err(e) = self.store.remove(&allocation).await {
                    warn!(id = %allocation.id, error = %e, "error removing expired allocation");
                }
                return;
            }
        }

        let iface = if self.manage_interfaces {
            let Some(remembered) = allocation.interface.clone() else {
                warn!(id = %allocation.id, "stopped allocation has no interface record, reaping");
                self.reap(&mut allocation).await;
                if let Err(e) = self.store.remove(&allocation).await {
                    warn!(id = %allocation.id, error = %e, "error removing unrecoverable allocation");
                }
                return;
            };
            // Clear whatever an unclean exit left behind, then recreate.
            let _ = self.devices.remove_device(&remembered).await;
            match self
                .devices
                .create_device(&remembered.name, Some(remembered.hardware_addr))
                .await
            {
                Ok(iface) => iface,
                Err(e) => {
                    warn!(
                        id = %allocation.id,
                        device = %remembered.name,
                        error = %e,
                        "could not recreate device, leaving allocation for a later pass"
                    );
                    return;
                }
            }
        } else {
            match self.binder.interface().await {
                Ok(iface) => iface,
                Err(e) => {
                    warn!(id = %allocation.id, error = %e, "could not access uplink");
                    return;
                }
            }
        };

        allocation.interface = Some(iface.clone());
        match self
            .binder
            .bind(&allocation, &iface, self.renew_tx.clone())
            .await
        {
            Ok(lease) => {
                // The MAC may have been parked during the shutdown of an
                // earlier process.
                if let Err(e) = self.store.remove_mac(iface.hardware_addr).await {
                    warn!(mac = %iface.hardware_addr, error = %e, "error unparking resurrected MAC");
                }
                info!(
                    id = %allocation.id,
                    ip = %lease.fixed_address,
                    iface = %iface.name,
                    "allocation resurrected"
                );
                allocation.lease = Some(lease);
                allocation.state = AllocationState::Bound;
                if let Err(e) = self.store.put(&allocation).await {
                    warn!(id = %allocation.id, error = %e, "error persisting resurrected allocation");
                }
            }
            Err(e) => {
                warn!(
                    id = %allocation.id,
                    error = %e,
                    "could not rebind stopped allocation, will retry on a later convergence"
                );
                if self.manage_interfaces {
                    let _ = self.devices.remove_device(&iface).await;
                }
            }
        }
    }

    /// Release an allocation's resources: stop its client, park its MAC,
    /// remove its device. Mutates the in-memory record to Stale; whether
    /// that is persisted or the record removed is the caller's decision.
    async fn reap(&self, allocation: &mut Allocation) {
        if let Some(lease) = &allocation.lease {
            info!(ip = %lease.fixed_address, "stopping DHCP client");
            self.binder.stop(lease.fixed_address).await;
        }
        if self.manage_interfaces {
            if let Some(iface) = &allocation.interface {
                if let Err(e) = self.store.put_mac(iface.hardware_addr).await {
                    warn!(mac = %iface.hardware_addr, error = %e, "could not return MAC to the pool");
                }
                if let Err(e) = self.devices.remove_device(iface).await {
                    warn!(device = %iface.name, error = %e, "could not remove device");
                }
            }
        }
        allocation.state = AllocationState::Stale;
    }

    /// Push a popped MAC back unless the allocation's own interface record
    /// already carries it — in that case the delete path recovers it.
    async fn return_mac(&self, allocation: &Allocation, popped: Option<MacAddr>) {
        let Some(mac) = popped else { return };
        let recorded = allocation
            .interface
            .as_ref()
            .map(|iface| iface.hardware_addr == mac)
            .unwrap_or(false);
        if recorded {
            return;
        }
        if let Err(e) = self.store.put_mac(mac).await {
            warn!(mac = %mac, error = %e, "could not return MAC to the pool");
        }
    }
}

fn random_suffix(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
