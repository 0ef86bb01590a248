//! Framing errors raised while parsing inbound message headers

use thiserror::Error;

/// Errors detected while framing an inbound byte stream into messages.
///
/// Any of these disconnects the peer. Only [`FramingError::Oversized`] also
/// bans the address; malformed headers merely disconnect.
#[derive(Error, Debug)]
pub enum FramingError {
    #[error("bad magic {got}, expected {expected}")]
    BadMagic { got: String, expected: String },
    #[error("invalid command in header")]
    InvalidCommand,
    #[error("oversized {command} message: {length} bytes exceeds limit {limit}")]
    Oversized {
        command: String,
        length: u64,
        limit: u64,
    },
    #[error("malformed extended header: {0}")]
    BadExtendedHeader(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FramingError {
    /// Whether the violation warrants banning the remote address
    pub fn is_ban_worthy(&self) -> bool {
        matches!(self, FramingError::Oversized { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_oversize_bans() {
        let oversized = FramingError::Oversized {
            command: "tx".into(),
            length: 10,
            limit: 5,
        };
        assert!(oversized.is_ban_worthy());
        assert!(!FramingError::InvalidCommand.is_ban_worthy());
        assert!(!FramingError::BadExtendedHeader("x".into()).is_ban_worthy());
        let msg = format!("{}", oversized);
        assert!(msg.contains("oversized tx"));
    }
}
