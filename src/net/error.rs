//! Network error types

use crate::net::peer::PeerId;
use thiserror::Error;

/// Errors surfaced by the connection manager and its administrative API.
///
/// Per-peer transport, framing and timeout problems never reach the caller:
/// they disconnect the peer and are logged. Only startup and API misuse
/// produce a `NetError`.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unable to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },

    #[error("not enough file descriptors available: {available} < {required}")]
    FdLimit { available: u64, required: u64 },

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("network manager already running")]
    AlreadyRunning,

    #[error("network manager not running")]
    NotRunning,

    #[error("peer not found: {0}")]
    PeerNotFound(PeerId),

    #[error("already connected to {0}")]
    AlreadyConnected(String),

    #[error("address is banned: {0}")]
    Banned(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("node already added: {0}")]
    AlreadyAdded(String),

    #[error("node not added: {0}")]
    NotAdded(String),

    #[error("ban list persistence failed: {0}")]
    Persistence(#[from] crate::net::banman::BanStoreError),
}

/// Result type for network operations
pub type NetResult<T> = Result<T, NetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: NetError = io_err.into();
        assert!(format!("{}", err).contains("IO error"));
    }

    #[test]
    fn test_error_bind() {
        let err = NetError::Bind {
            addr: "127.0.0.1:8333".parse().unwrap(),
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("unable to bind"));
        assert!(msg.contains("127.0.0.1:8333"));
    }

    #[test]
    fn test_error_fd_limit() {
        let err = NetError::FdLimit {
            available: 10,
            required: 150,
        };
        assert!(format!("{}", err).contains("10 < 150"));
    }

    #[test]
    fn test_error_peer_not_found() {
        let err = NetError::PeerNotFound(PeerId(7));
        assert!(format!("{}", err).contains("peer=7"));
    }
}
