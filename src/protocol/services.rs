//! Advertised service flags

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Services a node advertises in its version and addr messages
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ServiceFlags: u64 {
        /// Full node serving the complete block chain
        const NODE_NETWORK = 1 << 0;
        /// Supports BIP 37 bloom filtering
        const NODE_BLOOM = 1 << 2;
        /// Bitcoin Cash style fork identifier support
        const NODE_BITCOIN_CASH = 1 << 5;
        /// Serves only the most recent blocks
        const NODE_NETWORK_LIMITED = 1 << 10;
    }
}

impl ServiceFlags {
    /// Services we require from outbound peers before counting them as
    /// relevant for block relay
    pub fn relevant() -> Self {
        ServiceFlags::NODE_NETWORK
    }

    /// Whether `self` includes every relevant service
    pub fn has_relevant(&self) -> bool {
        self.contains(Self::relevant())
    }

    /// Build from a raw wire value, keeping unknown bits
    pub fn from_wire(bits: u64) -> Self {
        ServiceFlags::from_bits_retain(bits)
    }
}

impl Default for ServiceFlags {
    fn default() -> Self {
        ServiceFlags::NODE_NETWORK
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_bits_retained() {
        let flags = ServiceFlags::from_wire(1 | (1 << 40));
        assert!(flags.has_relevant());
        assert_eq!(flags.bits(), 1 | (1 << 40));
    }

    #[test]
    fn test_limited_is_not_relevant() {
        assert!(!ServiceFlags::NODE_NETWORK_LIMITED.has_relevant());
    }
}
