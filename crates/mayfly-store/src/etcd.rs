//! etcd v3 storage backend.
//!
//! Key layout (durable, observable by other KV clients):
//!
//! ```text
//! <prefix>/allocations/<uuid>  -> allocation JSON
//! <prefix>/lookup/<a.b.c.d>    -> uuid string
//! <prefix>/macs/<mac>          -> lowercase colon-hex MAC
//! ```
//!
//! Leased allocations are written under an etcd lease whose TTL mirrors the
//! DHCP lease expiry, so the record self-deletes when the address would have
//! been reclaimed upstream anyway.

use std::future::Future;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use etcd_client::{
    Client, ConnectOptions, DeleteOptions, Event, EventType, GetOptions, PutOptions, WatchOptions,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use mayfly_common::{Allocation, MacAddr};

use crate::{
    allocation_key, allocations_prefix, lookup_key, mac_in_use, mac_key, macs_prefix,
    AllocationEvent, AllocationWatch, MacPoolEvent, MacPoolWatch, Result, StateStore, StoreError,
    Watch, EVENT_QUEUE_DEPTH,
};

pub struct EtcdStore {
    client: Client,
    request_timeout: Duration,
}

impl EtcdStore {
    /// Connect to the etcd cluster. Failure here is fatal to callers: the KV
    /// is the single source of truth and nothing works without it.
    pub async fn connect(
        endpoints: &[String],
        dial_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self> {
        let options = ConnectOptions::new().with_connect_timeout(dial_timeout);
        let client = Client::connect(endpoints, Some(options))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            request_timeout,
        })
    }

    /// Run one etcd call under the configured request timeout.
    async fn request<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, etcd_client::Error>>,
    {
        match tokio::time::timeout(self.request_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(StoreError::Unavailable(e.to_string())),
            Err(_) => Err(StoreError::Timeout),
        }
    }

    async fn watch_key(&self, key: String, prefix: bool) -> Result<AllocationWatch> {
        let mut options = WatchOptions::new().with_prev_key();
        if prefix {
            options = options.with_prefix();
        }
        let mut watch_client = self.client.watch_client();
        let (mut watcher, mut stream) = self
            .request(watch_client.watch(key, Some(options)))
            .await?;

        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut cancel_rx => {
                        let _ = watcher.cancel().await;
                        return;
                    }
                    message = stream.message() => match message {
                        Ok(Some(response)) => {
                            for event in response.events() {
                                let Some(event) = decode_allocation_event(event) else {
                                    continue;
                                };
                                if tx.send(event).await.is_err() {
                                    let _ = watcher.cancel().await;
                                    return;
                                }
                            }
                        }
                        Ok(None) => return,
                        Err(e) => {
                            warn!(error = %e, "allocation watch stream failed");
                            return;
                        }
                    }
                }
            }
        });

        Ok(Watch::new(rx, cancel_tx))
    }
}

#[async_trait]
impl StateStore for EtcdStore {
    async fn put(&self, allocation: &Allocation) -> Result<()> {
        let value =
            serde_json::to_vec(allocation).map_err(|e| StoreError::Decode(e.to_string()))?;
        let key = allocation_key(allocation.id);
        let mut kv = self.client.kv_client();

        let options = match &allocation.lease {
            Some(lease) => {
                // Propagate the DHCP expiry onto the record itself.
                let ttl = lease.ttl_seconds(Utc::now());
                let mut lease_client = self.client.lease_client();
                let grant = self.request(lease_client.grant(ttl, None)).await?;
                Some(PutOptions::new().with_lease(grant.id()))
            }
            None => None,
        };
        self.request(kv.put(key, value, options)).await?;
        Ok(())
    }

    async fn remove(&self, allocation: &Allocation) -> Result<()> {
        let mut kv = self.client.kv_client();
        self.request(kv.delete(allocation_key(allocation.id), None))
            .await?;
        if let Some(lease) = &allocation.lease {
            self.request(kv.delete(lookup_key(lease.fixed_address), None))
                .await?;
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Allocation> {
        let mut kv = self.client.kv_client();
        let response = self.request(kv.get(allocation_key(id), None)).await?;
        let Some(entry) = response.kvs().first() else {
            return Err(StoreError::NotFound(id.to_string()));
        };
        serde_json::from_slice(entry.value()).map_err(|e| StoreError::Decode(e.to_string()))
    }

    async fn get_by_ip(&self, ip: Ipv4Addr) -> Result<Allocation> {
        let mut kv = self.client.kv_client();
        let response = self.request(kv.get(lookup_key(ip), None)).await?;
        let Some(entry) = response.kvs().first() else {
            return Err(StoreError::NotFound(ip.to_string()));
        };
        let id = entry
            .value_str()
            .ok()
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| StoreError::Decode(format!("bad id in index row for {ip}")))?;
        self.get(id).await
    }

    async fn allocations(&self) -> Result<Vec<Allocation>> {
        let mut kv = self.client.kv_client();
        let options = GetOptions::new().with_prefix();
        let response = self
            .request(kv.get(allocations_prefix(), Some(options)))
            .await?;

        let mut allocations = Vec::with_capacity(response.kvs().len());
        for entry in response.kvs() {
            match serde_json::from_slice::<Allocation>(entry.value()) {
                Ok(allocation) => allocations.push(allocation),
                Err(e) => {
                    warn!(
                        key = %String::from_utf8_lossy(entry.key()),
                        error = %e,
                        "skipping undecodable allocation record"
                    );
                }
            }
        }
        Ok(allocations)
    }

    async fn watch_allocations(&self) -> Result<AllocationWatch> {
        self.watch_key(allocations_prefix(), true).await
    }

    async fn watch_allocation(&self, id: Uuid) -> Result<AllocationWatch> {
        self.watch_key(allocation_key(id), false).await
    }

    async fn index_ip(&self, ip: Ipv4Addr, id: Uuid) -> Result<()> {
        let mut kv = self.client.kv_client();
        self.request(kv.put(lookup_key(ip), id.to_string(), None))
            .await?;
        Ok(())
    }

    async fn unindex_ip(&self, ip: Ipv4Addr) -> Result<()> {
        let mut kv = self.client.kv_client();
        self.request(kv.delete(lookup_key(ip), None)).await?;
        Ok(())
    }

    async fn mac_pool(&self) -> Result<Vec<String>> {
        let mut kv = self.client.kv_client();
        let options = GetOptions::new().with_prefix();
        let response = self.request(kv.get(macs_prefix(), Some(options))).await?;
        let mut macs: Vec<String> = response
            .kvs()
            .iter()
            .filter_map(|entry| entry.value_str().ok().map(str::to_string))
            .collect();
        macs.sort();
        Ok(macs)
    }

    async fn put_mac(&self, mac: MacAddr) -> Result<()> {
        if mac.is_nil() {
            return Err(StoreError::InvalidData("nil MAC".to_string()));
        }
        // Advisory only: nothing guards this scan against a concurrent
        // claim; a lost race parks a MAC that will simply fail to produce a
        // second lease upstream.
        let allocations = self.allocations().await?;
        if let Some(id) = mac_in_use(&allocations, mac) {
            return Err(StoreError::InvalidData(format!(
                "MAC {mac} already in use by allocation {id}"
            )));
        }

        let mut kv = self.client.kv_client();
        self.request(kv.put(mac_key(mac), mac.to_string(), None))
            .await?;
        Ok(())
    }

    async fn remove_mac(&self, mac: MacAddr) -> Result<()> {
        let mut kv = self.client.kv_client();
        self.request(kv.delete(mac_key(mac), None)).await?;
        Ok(())
    }

    async fn pop_mac(&self) -> Result<MacAddr> {
        let mut kv = self.client.kv_client();
        let options = GetOptions::new().with_prefix().with_keys_only();
        let response = self.request(kv.get(macs_prefix(), Some(options))).await?;

        // Arbitrate through the delete: whoever observes deleted > 0 owns
        // the value, so two concurrent pops can never return the same MAC.
        for entry in response.kvs() {
            let Ok(key) = entry.key_str() else { continue };
            let deleted = self
                .request(kv.delete(key, Some(DeleteOptions::new().with_prev_key())))
                .await?;
            if deleted.deleted() == 0 {
                // Lost the race for this member; try the next one.
                continue;
            }
            let Some(prev) = deleted.prev_kvs().first() else {
                continue;
            };
            let value = prev
                .value_str()
                .map_err(|e| StoreError::Decode(e.to_string()))?;
            return MacAddr::from_str(value)
                .map_err(|e| StoreError::Decode(e.to_string()));
        }
        Err(StoreError::Exhausted)
    }

    async fn watch_mac_pool(&self) -> Result<MacPoolWatch> {
        let options = WatchOptions::new().with_prefix().with_prev_key();
        let mut watch_client = self.client.watch_client();
        let (mut watcher, mut stream) = self
            .request(watch_client.watch(macs_prefix(), Some(options)))
            .await?;

        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut cancel_rx => {
                        let _ = watcher.cancel().await;
                        return;
                    }
                    message = stream.message() => match message {
                        Ok(Some(response)) => {
                            for event in response.events() {
                                let Some(event) = decode_mac_event(event) else {
                                    continue;
                                };
                                if tx.send(event).await.is_err() {
                                    let _ = watcher.cancel().await;
                                    return;
                                }
                            }
                        }
                        Ok(None) => return,
                        Err(e) => {
                            warn!(error = %e, "MAC pool watch stream failed");
                            return;
                        }
                    }
                }
            }
        });

        Ok(Watch::new(rx, cancel_tx))
    }
}

/// Decode a raw etcd event on the allocations prefix. A record that fails to
/// decode is logged and dropped; one malformed write must not halt the
/// watcher.
fn decode_allocation_event(event: &Event) -> Option<AllocationEvent> {
    match event.event_type() {
        EventType::Put => {
            let kv = event.kv()?;
            match serde_json::from_slice::<Allocation>(kv.value()) {
                Ok(allocation) => {
                    if kv.version() == 1 {
                        Some(AllocationEvent::Created(allocation))
                    } else {
                        Some(AllocationEvent::Modified(allocation))
                    }
                }
                Err(e) => {
                    warn!(error = %e, "skipping undecodable allocation event");
                    None
                }
            }
        }
        EventType::Delete => {
            let prev = event.prev_kv()?;
            match serde_json::from_slice::<Allocation>(prev.value()) {
                Ok(allocation) => Some(AllocationEvent::Deleted(allocation)),
                Err(e) => {
                    warn!(error = %e, "skipping undecodable allocation delete event");
                    None
                }
            }
        }
    }
}

/// Decode a raw etcd event on the MAC pool prefix: creates are pushes,
/// deletes are pops. Re-puts of an existing member are ignored.
fn decode_mac_event(event: &Event) -> Option<MacPoolEvent> {
    let parse = |kv: &etcd_client::KeyValue| -> Option<MacAddr> {
        let key = kv.key_str().ok()?;
        let mac = key.strip_prefix(&macs_prefix())?;
        match MacAddr::from_str(mac) {
            Ok(mac) => Some(mac),
            Err(_) => {
                debug!(key = %key, "ignoring non-MAC key under the pool prefix");
                None
            }
        }
    };
    match event.event_type() {
        EventType::Put => {
            let kv = event.kv()?;
            if kv.version() == 1 {
                Some(MacPoolEvent::Pushed(parse(kv)?))
            } else {
                None
            }
        }
        EventType::Delete => Some(MacPoolEvent::Popped(parse(event.prev_kv()?)?)),
    }
}
