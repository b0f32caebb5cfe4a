use std::net::Ipv4Addr;

use thiserror::Error;

/// Errors raised while constructing core values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Invalid MAC address: {0:?}")]
    InvalidMac(String),

    #[error("Invalid IP range: start {start} is after end {end}")]
    InvalidRange { start: Ipv4Addr, end: Ipv4Addr },
}

pub type Result<T> = std::result::Result<T, CoreError>;
