//! Subnets and netgroups
//!
//! - [`SubNet`] is the unit of banning and whitelisting
//! - [`netgroup`] buckets addresses coarsely (IPv4 /16, IPv6 /32) so that
//!   eviction and outbound selection can diversify across operators

use crate::crypto::sha256;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// An IP network: base address plus prefix length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubNet {
    network: IpAddr,
    prefix: u8,
}

impl SubNet {
    /// Build a subnet, masking `addr` down to its network address
    pub fn new(addr: IpAddr, prefix: u8) -> Option<Self> {
        let max = max_prefix(&addr);
        if prefix > max {
            return None;
        }
        Some(Self {
            network: mask(&addr, prefix),
            prefix,
        })
    }

    /// A subnet holding exactly one address
    pub fn single(addr: IpAddr) -> Self {
        let prefix = max_prefix(&addr);
        Self {
            network: canonical(addr),
            prefix,
        }
    }

    pub fn network(&self) -> IpAddr {
        self.network
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn is_single(&self) -> bool {
        self.prefix == max_prefix(&self.network)
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        let addr = canonical(*addr);
        if addr.is_ipv4() != self.network.is_ipv4() {
            return false;
        }
        mask(&addr, self.prefix) == self.network
    }
}

impl From<IpAddr> for SubNet {
    fn from(addr: IpAddr) -> Self {
        SubNet::single(addr)
    }
}

impl fmt::Display for SubNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

impl FromStr for SubNet {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr_part, prefix_part) = match s.split_once('/') {
            Some((a, p)) => (a, Some(p)),
            None => (s, None),
        };
        let addr: IpAddr = addr_part
            .trim()
            .parse()
            .map_err(|_| format!("invalid subnet address: {}", s))?;
        match prefix_part {
            None => Ok(SubNet::single(addr)),
            Some(p) => {
                let p = p.trim();
                // Either a prefix length or a dotted netmask
                if let Ok(prefix) = p.parse::<u8>() {
                    return SubNet::new(addr, prefix)
                        .ok_or_else(|| format!("invalid prefix length: {}", s));
                }
                let netmask: IpAddr = p.parse().map_err(|_| format!("invalid netmask: {}", s))?;
                let prefix = netmask_prefix(&netmask)
                    .ok_or_else(|| format!("non-contiguous netmask: {}", s))?;
                SubNet::new(addr, prefix).ok_or_else(|| format!("invalid netmask: {}", s))
            }
        }
    }
}

impl Serialize for SubNet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SubNet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// IPv4-mapped IPv6 addresses are treated as IPv4
fn canonical(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

fn max_prefix(addr: &IpAddr) -> u8 {
    match canonical(*addr) {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

fn mask(addr: &IpAddr, prefix: u8) -> IpAddr {
    match canonical(*addr) {
        IpAddr::V4(v4) => {
            let bits = u32::from(v4);
            let m = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix as u32) };
            IpAddr::V4((bits & m).into())
        }
        IpAddr::V6(v6) => {
            let bits = u128::from(v6);
            let m = if prefix == 0 { 0 } else { u128::MAX << (128 - prefix as u32) };
            IpAddr::V6((bits & m).into())
        }
    }
}

fn netmask_prefix(netmask: &IpAddr) -> Option<u8> {
    let (ones, zeros, width) = match netmask {
        IpAddr::V4(v4) => {
            let bits = u32::from(*v4);
            (bits.leading_ones(), bits.trailing_zeros(), 32)
        }
        IpAddr::V6(v6) => {
            let bits = u128::from(*v6);
            (bits.leading_ones(), bits.trailing_zeros(), 128)
        }
    };
    if ones + zeros == width {
        Some(ones as u8)
    } else {
        None
    }
}

/// Coarse address group: IPv4 /16 or IPv6 /32, prefixed with the family
pub fn netgroup(addr: &IpAddr) -> Vec<u8> {
    match canonical(*addr) {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            if v4.is_loopback() || v4.is_private() {
                // All local addresses share one group
                vec![0xff]
            } else {
                vec![4, o[0], o[1]]
            }
        }
        IpAddr::V6(v6) => {
            if v6.is_loopback() {
                return vec![0xff];
            }
            let o = v6.octets();
            vec![6, o[0], o[1], o[2], o[3]]
        }
    }
}

/// Netgroup hashed with a per-process secret so remote parties cannot
/// predict which groups eviction protects
pub fn keyed_netgroup(addr: &IpAddr, secret: u64) -> u64 {
    let mut data = secret.to_le_bytes().to_vec();
    data.extend_from_slice(&netgroup(addr));
    let hash = sha256(&data);
    u64::from_le_bytes([
        hash[0], hash[1], hash[2], hash[3], hash[4], hash[5], hash[6], hash[7],
    ])
}
