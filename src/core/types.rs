//! Core type aliases and identifiers

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Opaque content identifier naming a texture asset
pub type TextureId = uuid::Uuid;

/// Standard Result type for the fetcher
pub type Result<T> = std::result::Result<T, crate::core::error::Error>;

/// Network region a request is bound to
///
/// An invalid host means "whatever region the agent is currently in".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Host(Option<SocketAddr>);

impl Host {
    /// The invalid host
    pub const INVALID: Host = Host(None);

    /// Create a host for a simulator address
    pub fn new(addr: SocketAddr) -> Self {
        Self(Some(addr))
    }

    /// Check whether this host names no simulator
    pub fn is_invalid(&self) -> bool {
        self.0.is_none()
    }

    /// Get the socket address, if any
    pub fn addr(&self) -> Option<SocketAddr> {
        self.0
    }
}

impl From<SocketAddr> for Host {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr)
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(addr) => write!(f, "{}", addr),
            None => write!(f, "<invalid>"),
        }
    }
}
