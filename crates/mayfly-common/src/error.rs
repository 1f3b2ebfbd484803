use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid MAC address: {0}")]
    InvalidMac(String),

    #[error("invalid IP address: {0}")]
    InvalidIp(String),

    #[error("invalid allocation state: {0}")]
    InvalidState(u8),
}
