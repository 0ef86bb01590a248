//! Network addresses as carried in version and addr messages

use crate::protocol::serialize::{self, DecodeError};
use crate::protocol::services::ServiceFlags;
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Maximum number of addresses in a single addr message
pub const MAX_ADDR_TO_SEND: usize = 1000;

/// A peer address with the services it advertises and when it was last seen
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetAddr {
    pub addr: SocketAddr,
    pub services: ServiceFlags,
    /// Unix time the address was last seen
    pub time: u32,
}

impl NetAddr {
    pub fn new(addr: SocketAddr, services: ServiceFlags) -> Self {
        Self {
            addr,
            services,
            time: chrono::Utc::now().timestamp().max(0) as u32,
        }
    }

    /// Whether the address could be reached from the public internet
    pub fn is_routable(&self) -> bool {
        is_routable(&self.addr.ip())
    }

    /// Encode without the timestamp, as in the version message
    pub fn encode_no_time(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.services.bits());
        buf.put_slice(&ipv6_bytes(&self.addr.ip()));
        buf.put_u16(self.addr.port());
    }

    pub fn decode_no_time(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        serialize::need(buf, 26)?;
        let services = ServiceFlags::from_wire(buf.get_u64_le());
        let ip_raw = serialize::read_array::<16>(buf)?;
        let port = buf.get_u16();
        Ok(Self {
            addr: SocketAddr::new(ip_from_bytes(ip_raw), port),
            services,
            time: 0,
        })
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.time);
        self.encode_no_time(buf);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        serialize::need(buf, 4)?;
        let time = buf.get_u32_le();
        let mut addr = Self::decode_no_time(buf)?;
        addr.time = time;
        Ok(addr)
    }
}

/// IPv4 addresses are carried as IPv4-mapped IPv6
pub fn ipv6_bytes(ip: &IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

pub fn ip_from_bytes(raw: [u8; 16]) -> IpAddr {
    let v6 = Ipv6Addr::from(raw);
    match v6.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(v6),
    }
}

/// Whether an IP address is publicly routable
pub fn is_routable(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
                || is_shared_v4(v4))
        }
        IpAddr::V6(v6) => {
            let seg = v6.segments();
            !(v6.is_loopback()
                || v6.is_unspecified()
                || (seg[0] & 0xfe00) == 0xfc00
                || (seg[0] & 0xffc0) == 0xfe80
                || (seg[0] == 0x2001 && seg[1] == 0x0db8))
        }
    }
}

fn is_shared_v4(v4: &Ipv4Addr) -> bool {
    let o = v4.octets();
    o[0] == 100 && (o[1] & 0xc0) == 64
}

/// Encode an addr payload
pub fn encode_addr_list(addrs: &[NetAddr], buf: &mut impl BufMut) {
    serialize::write_compact_size(buf, addrs.len() as u64);
    for addr in addrs {
        addr.encode(buf);
    }
}

/// Decode an addr payload
pub fn decode_addr_list(buf: &mut impl Buf) -> Result<Vec<NetAddr>, DecodeError> {
    let count = serialize::read_length(buf)?;
    if count > MAX_ADDR_TO_SEND {
        return Err(DecodeError::SizeTooLarge(count as u64));
    }
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(NetAddr::decode(buf)?);
    }
    Ok(out)
}
