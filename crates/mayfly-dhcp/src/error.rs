use std::net::Ipv4Addr;
use thiserror::Error;

/// Error type for DHCP and link operations.
#[derive(Debug, Error)]
pub enum DhcpError {
    /// No lease arrived within the bind timeout.
    #[error("timed out binding DHCP client on {0}")]
    BindTimeout(String),

    /// Another client in this process already holds the leased address;
    /// two controllers raced on the same IP.
    #[error("lease for {0} is already managed")]
    DuplicateLease(Ipv4Addr),

    /// The client failed before delivering a first lease.
    #[error("DHCP bind failed: {0}")]
    BindFailed(String),

    #[error("network interface not found: {0}")]
    InterfaceNotFound(String),

    /// A kernel link operation failed.
    #[error("link operation failed: {0}")]
    Link(String),

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DhcpError>;
