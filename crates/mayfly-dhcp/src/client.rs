//! The raw DHCP client boundary.
//!
//! A client is created per interface, announces a hostname, and posts every
//! lease it obtains — the first bind and each subsequent renewal — into the
//! channel handed to it at creation. Whoever owns the receiving end decides
//! what a "first" lease means; the client itself has no such notion.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use dhcproto::decoder::Decoder;
use dhcproto::encoder::Encoder;
use dhcproto::v4::{DhcpOption, Flags, HType, Message, MessageType, Opcode, OptionCode};
use dhcproto::{Decodable, Encodable};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use mayfly_common::{InterfaceInfo, Lease, MacAddr};

use crate::error::{DhcpError, Result};

const DHCP_SERVER_PORT: u16 = 67;
const DHCP_CLIENT_PORT: u16 = 68;

/// How long to wait for a single OFFER/ACK before resending.
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(4);

/// Backoff between failed solicitation rounds.
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// A running per-interface DHCP client.
#[async_trait]
pub trait RawDhcpClient: Send + Sync {
    /// Begin soliciting. Leases are posted to the channel passed at
    /// creation; the client keeps renewing until stopped.
    async fn start(&self) -> Result<()>;

    /// Stop soliciting and renewing. Idempotent.
    async fn stop(&self);
}

/// Creates clients for interfaces. The seam tests use to stand in an
/// upstream DHCP server.
#[async_trait]
pub trait DhcpClientFactory: Send + Sync {
    async fn create(
        &self,
        iface: &InterfaceInfo,
        hostname: &str,
        leases: mpsc::Sender<Lease>,
    ) -> Result<Arc<dyn RawDhcpClient>>;
}

// ============================================================================
// Production shell: broadcast UDP client
// ============================================================================

/// Factory for [`UdpDhcpClient`]s: one broadcast socket per client, bound to
/// the interface so the kernel sources frames from its MAC.
pub struct UdpClientFactory;

impl UdpClientFactory {
    pub fn new() -> Self {
        Self
    }
}

impl Default for UdpClientFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DhcpClientFactory for UdpClientFactory {
    async fn create(
        &self,
        iface: &InterfaceInfo,
        hostname: &str,
        leases: mpsc::Sender<Lease>,
    ) -> Result<Arc<dyn RawDhcpClient>> {
        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(UdpDhcpClient {
            iface: iface.clone(),
            hostname: hostname.to_string(),
            leases,
            shutdown,
        }))
    }
}

struct UdpDhcpClient {
    iface: InterfaceInfo,
    hostname: String,
    leases: mpsc::Sender<Lease>,
    shutdown: watch::Sender<bool>,
}

#[async_trait]
impl RawDhcpClient for UdpDhcpClient {
    async fn start(&self) -> Result<()> {
        let socket = bind_client_socket(&self.iface.name)?;
        let socket = UdpSocket::from_std(socket)?;

        let iface = self.iface.clone();
        let hostname = self.hostname.clone();
        let leases = self.leases.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = solicit(socket, iface, hostname, leases) => {}
                _ = async {
                    while shutdown.changed().await.is_ok() {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                } => {}
            }
        });
        Ok(())
    }

    async fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// A UDP socket bound to the DHCP client port on one device, broadcast
/// enabled.
fn bind_client_socket(device: &str) -> std::io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    #[cfg(target_os = "linux")]
    socket.bind_device(Some(device.as_bytes()))?;
    socket.set_nonblocking(true)?;
    let bind: SocketAddr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DHCP_CLIENT_PORT).into();
    socket.bind(&bind.into())?;
    Ok(socket.into())
}

/// The client state machine: obtain a lease, post it, sleep until renewal,
/// renew or fall back to a fresh discovery. Runs until the task is dropped.
async fn solicit(
    socket: UdpSocket,
    iface: InterfaceInfo,
    hostname: String,
    leases: mpsc::Sender<Lease>,
) {
    let mac = iface.hardware_addr;
    let mut current: Option<Lease> = None;
    loop {
        let attempt = match &current {
            None => discover(&socket, mac, &hostname).await,
            Some(lease) => renew(&socket, mac, &hostname, lease).await,
        };
        let lease = match attempt {
            Ok(lease) => lease,
            Err(e) => {
                debug!(iface = %iface.name, error = %e, "DHCP exchange failed, backing off");
                current = None;
                tokio::time::sleep(RETRY_INTERVAL).await;
                continue;
            }
        };

        let renew_at = lease.renew.unwrap_or(lease.expire);
        if leases.send(lease.clone()).await.is_err() {
            // Nobody is listening anymore.
            return;
        }
        current = Some(lease);

        let wait = (renew_at - Utc::now()).num_seconds().max(1) as u64;
        tokio::time::sleep(Duration::from_secs(wait)).await;
    }
}

async fn discover(socket: &UdpSocket, mac: MacAddr, hostname: &str) -> Result<Lease> {
    let xid: u32 = rand::random();
    let message = base_request(xid, mac, hostname, MessageType::Discover);
    send(socket, &message).await?;

    let offer = receive(socket, xid, MessageType::Offer).await?;
    let offered = offer.yiaddr();
    let server_id = option_ipv4(&offer, OptionCode::ServerIdentifier);

    let mut request = base_request(xid, mac, hostname, MessageType::Request);
    request
        .opts_mut()
        .insert(DhcpOption::RequestedIpAddress(offered));
    if let Some(server) = server_id {
        request
            .opts_mut()
            .insert(DhcpOption::ServerIdentifier(server));
    }
    send(socket, &request).await?;

    let ack = receive(socket, xid, MessageType::Ack).await?;
    Ok(lease_from_ack(&ack))
}

/// Re-request the address we already hold.
async fn renew(
    socket: &UdpSocket,
    mac: MacAddr,
    hostname: &str,
    lease: &Lease,
) -> Result<Lease> {
    let xid: u32 = rand::random();
    let mut request = base_request(xid, mac, hostname, MessageType::Request);
    request
        .opts_mut()
        .insert(DhcpOption::RequestedIpAddress(lease.fixed_address));
    if let Some(server) = lease.server_id {
        request
            .opts_mut()
            .insert(DhcpOption::ServerIdentifier(server));
    }
    send(socket, &request).await?;

    let ack = receive(socket, xid, MessageType::Ack).await?;
    Ok(lease_from_ack(&ack))
}

fn base_request(xid: u32, mac: MacAddr, hostname: &str, kind: MessageType) -> Message {
    let mut message = Message::default();
    message.set_opcode(Opcode::BootRequest);
    message.set_htype(HType::Eth);
    message.set_xid(xid);
    message.set_flags(Flags::default().set_broadcast());
    message.set_chaddr(mac.as_bytes());
    message.opts_mut().insert(DhcpOption::MessageType(kind));
    if !hostname.is_empty() {
        message
            .opts_mut()
            .insert(DhcpOption::Hostname(hostname.to_string()));
    }
    message
        .opts_mut()
        .insert(DhcpOption::ParameterRequestList(vec![
            OptionCode::SubnetMask,
            OptionCode::Router,
            OptionCode::DomainNameServer,
            OptionCode::AddressLeaseTime,
        ]));
    message
}

async fn send(socket: &UdpSocket, message: &Message) -> Result<()> {
    let mut buf = Vec::new();
    message
        .encode(&mut Encoder::new(&mut buf))
        .map_err(|e| DhcpError::BindFailed(format!("encode: {e}")))?;
    socket
        .send_to(&buf, (Ipv4Addr::BROADCAST, DHCP_SERVER_PORT))
        .await?;
    Ok(())
}

/// Wait for a reply of the expected type matching our transaction id,
/// discarding unrelated traffic on the port.
async fn receive(socket: &UdpSocket, xid: u32, expected: MessageType) -> Result<Message> {
    let mut buf = vec![0u8; 1500];
    let deadline = tokio::time::Instant::now() + EXCHANGE_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(DhcpError::BindFailed(format!("no {expected:?} received")));
        }
        let (len, _peer) = tokio::time::timeout(remaining, socket.recv_from(&mut buf))
            .await
            .map_err(|_| DhcpError::BindFailed(format!("no {expected:?} received")))??;

        let Ok(message) = Message::decode(&mut Decoder::new(&buf[..len])) else {
            continue;
        };
        if message.opcode() != Opcode::BootReply || message.xid() != xid {
            continue;
        }
        match message.opts().get(OptionCode::MessageType) {
            Some(DhcpOption::MessageType(kind)) if *kind == expected => return Ok(message),
            Some(DhcpOption::MessageType(MessageType::Nak)) => {
                return Err(DhcpError::BindFailed("NAK from server".to_string()));
            }
            _ => continue,
        }
    }
}

fn option_ipv4(message: &Message, code: OptionCode) -> Option<Ipv4Addr> {
    match message.opts().get(code) {
        Some(DhcpOption::ServerIdentifier(addr)) => Some(*addr),
        Some(DhcpOption::SubnetMask(addr)) => Some(*addr),
        _ => None,
    }
}

fn lease_from_ack(ack: &Message) -> Lease {
    let now = Utc::now();
    let lease_secs = match ack.opts().get(OptionCode::AddressLeaseTime) {
        Some(DhcpOption::AddressLeaseTime(secs)) => *secs as i64,
        _ => 3600,
    };
    Lease {
        fixed_address: ack.yiaddr(),
        netmask: option_ipv4(ack, OptionCode::SubnetMask)
            .unwrap_or(Ipv4Addr::new(255, 255, 255, 0)),
        expire: now + ChronoDuration::seconds(lease_secs),
        server_id: option_ipv4(ack, OptionCode::ServerIdentifier),
        // T1/T2 per convention: renew at half life, rebind at 7/8.
        renew: Some(now + ChronoDuration::seconds(lease_secs / 2)),
        rebind: Some(now + ChronoDuration::seconds(lease_secs * 7 / 8)),
    }
}

// ============================================================================
// Static shell for tests and dry runs
// ============================================================================

/// A factory that hands out leases from a fixed address pool, remembering
/// MAC→address so the same client gets the same address back — the behavior
/// resurrections rely on upstream. An exhausted pool simply never answers,
/// which exercises bind timeouts.
pub struct StaticLeaseFactory {
    inner: Arc<StaticPool>,
}

struct StaticPool {
    available: Mutex<Vec<Ipv4Addr>>,
    by_mac: Mutex<HashMap<MacAddr, Ipv4Addr>>,
    lease_duration: ChronoDuration,
}

impl StaticLeaseFactory {
    pub fn new(addresses: Vec<Ipv4Addr>, lease_duration: Duration) -> Self {
        Self {
            inner: Arc::new(StaticPool {
                available: Mutex::new(addresses),
                by_mac: Mutex::new(HashMap::new()),
                lease_duration: ChronoDuration::from_std(lease_duration)
                    .unwrap_or(ChronoDuration::seconds(3600)),
            }),
        }
    }
}

#[async_trait]
impl DhcpClientFactory for StaticLeaseFactory {
    async fn create(
        &self,
        iface: &InterfaceInfo,
        _hostname: &str,
        leases: mpsc::Sender<Lease>,
    ) -> Result<Arc<dyn RawDhcpClient>> {
        Ok(Arc::new(StaticClient {
            pool: Arc::clone(&self.inner),
            mac: iface.hardware_addr,
            leases,
        }))
    }
}

struct StaticClient {
    pool: Arc<StaticPool>,
    mac: MacAddr,
    leases: mpsc::Sender<Lease>,
}

#[async_trait]
impl RawDhcpClient for StaticClient {
    async fn start(&self) -> Result<()> {
        let assigned = {
            let by_mac = self
                .pool
                .by_mac
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            by_mac.get(&self.mac).copied()
        };
        let assigned = match assigned {
            Some(ip) => Some(ip),
            None => {
                let mut available = self
                    .pool
                    .available
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                available.pop().inspect(|ip| {
                    self.pool
                        .by_mac
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(self.mac, *ip);
                })
            }
        };

        let Some(ip) = assigned else {
            warn!(mac = %self.mac, "static lease pool exhausted, not answering");
            return Ok(());
        };
        let now = Utc::now();
        let lease = Lease {
            fixed_address: ip,
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            expire: now + self.pool.lease_duration,
            server_id: Some(Ipv4Addr::new(10, 0, 0, 1)),
            renew: Some(now + self.pool.lease_duration / 2),
            rebind: None,
        };
        let _ = self.leases.send(lease).await;
        Ok(())
    }

    async fn stop(&self) {}
}
