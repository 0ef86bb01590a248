//! Typed payloads for the network-level messages this node handles itself

use crate::protocol::address::NetAddr;
use crate::protocol::serialize::{self, DecodeError};
use crate::protocol::services::ServiceFlags;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Protocol version we speak
pub const PROTOCOL_VERSION: i32 = 70016;

/// Oldest peer protocol version we still talk to
pub const MIN_PEER_PROTO_VERSION: i32 = 31800;

/// Peers at or above this version understand sendheaders
pub const SENDHEADERS_VERSION: i32 = 70012;

/// Peers at or above this version understand feefilter
pub const FEEFILTER_VERSION: i32 = 70013;

/// Peers at or above this version understand protoconf and extended messages
pub const PROTOCONF_VERSION: i32 = 70016;

/// Payload limit assumed for peers that never sent a protoconf
pub const LEGACY_MAX_PROTOCOL_PAYLOAD_LENGTH: u32 = 1024 * 1024;

/// Stream policy every node supports
pub const DEFAULT_STREAM_POLICY: &str = "Default";

/// Maximum length of the user agent string
pub const MAX_SUBVERSION_LENGTH: usize = 256;

/// Handshake version message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: i32,
    pub services: ServiceFlags,
    pub timestamp: i64,
    pub addr_recv: NetAddr,
    pub addr_from: NetAddr,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

impl VersionMessage {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(128);
        buf.put_i32_le(self.version);
        buf.put_u64_le(self.services.bits());
        buf.put_i64_le(self.timestamp);
        self.addr_recv.encode_no_time(&mut buf);
        self.addr_from.encode_no_time(&mut buf);
        buf.put_u64_le(self.nonce);
        serialize::write_var_str(&mut buf, &self.user_agent);
        buf.put_i32_le(self.start_height);
        buf.put_u8(self.relay as u8);
        buf.freeze()
    }

    /// Decode a version payload.
    ///
    /// Old peers may stop after any of the trailing optional fields.
    pub fn decode(mut buf: &[u8]) -> Result<Self, DecodeError> {
        serialize::need(&buf, 20)?;
        let version = buf.get_i32_le();
        let services = ServiceFlags::from_wire(buf.get_u64_le());
        let timestamp = buf.get_i64_le();
        let addr_recv = NetAddr::decode_no_time(&mut buf)?;

        let mut msg = Self {
            version,
            services,
            timestamp,
            addr_recv: addr_recv.clone(),
            addr_from: addr_recv,
            nonce: 0,
            user_agent: String::new(),
            start_height: 0,
            relay: true,
        };
        if !buf.has_remaining() {
            return Ok(msg);
        }
        msg.addr_from = NetAddr::decode_no_time(&mut buf)?;
        serialize::need(&buf, 8)?;
        msg.nonce = buf.get_u64_le();
        if !buf.has_remaining() {
            return Ok(msg);
        }
        let agent = serialize::read_var_str(&mut buf)?;
        msg.user_agent = agent.chars().take(MAX_SUBVERSION_LENGTH).collect();
        if !buf.has_remaining() {
            return Ok(msg);
        }
        serialize::need(&buf, 4)?;
        msg.start_height = buf.get_i32_le();
        if buf.has_remaining() {
            msg.relay = buf.get_u8() != 0;
        }
        Ok(msg)
    }
}

/// Protocol configuration, sent once after the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Protoconf {
    /// Largest payload the sender is willing to receive
    pub max_recv_payload_length: u32,
    /// Comma separated stream policy names
    pub stream_policies: String,
}

impl Protoconf {
    /// Number of fields we serialize
    const FIELD_COUNT: u64 = 2;

    pub fn new(max_recv_payload_length: u32) -> Self {
        Self {
            max_recv_payload_length,
            stream_policies: DEFAULT_STREAM_POLICY.to_string(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        serialize::write_compact_size(&mut buf, Self::FIELD_COUNT);
        buf.put_u32_le(self.max_recv_payload_length);
        serialize::write_var_str(&mut buf, &self.stream_policies);
        buf.freeze()
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, DecodeError> {
        let fields = serialize::read_compact_size(&mut buf)?;
        if fields == 0 {
            return Err(DecodeError::InvalidValue("protoconf without fields".into()));
        }
        serialize::need(&buf, 4)?;
        let max_recv_payload_length = buf.get_u32_le();
        let stream_policies = if fields >= 2 {
            serialize::read_var_str(&mut buf)?
        } else {
            DEFAULT_STREAM_POLICY.to_string()
        };
        Ok(Self {
            max_recv_payload_length,
            stream_policies,
        })
    }

    pub fn policies(&self) -> Vec<&str> {
        self.stream_policies
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// Ping/pong nonce payload
pub fn encode_nonce(nonce: u64) -> Bytes {
    Bytes::copy_from_slice(&nonce.to_le_bytes())
}

pub fn decode_nonce(mut buf: &[u8]) -> Result<u64, DecodeError> {
    serialize::need(&buf, 8)?;
    Ok(buf.get_u64_le())
}

/// feefilter payload: minimum fee rate in satoshis per kilobyte
pub fn encode_fee_filter(fee_per_kb: i64) -> Bytes {
    Bytes::copy_from_slice(&fee_per_kb.to_le_bytes())
}

pub fn decode_fee_filter(mut buf: &[u8]) -> Result<i64, DecodeError> {
    serialize::need(&buf, 8)?;
    let fee = buf.get_i64_le();
    if fee < 0 {
        return Err(DecodeError::InvalidValue(format!("negative fee filter {}", fee)));
    }
    Ok(fee)
}

/// sendcmpct payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendCmpct {
    pub announce: bool,
    pub version: u64,
}

impl SendCmpct {
    pub fn decode(mut buf: &[u8]) -> Result<Self, DecodeError> {
        serialize::need(&buf, 9)?;
        Ok(Self {
            announce: buf.get_u8() != 0,
            version: buf.get_u64_le(),
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(9);
        buf.put_u8(self.announce as u8);
        buf.put_u64_le(self.version);
        buf.freeze()
    }
}

/// filterload payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterLoad {
    pub data: Vec<u8>,
    pub hash_funcs: u32,
    pub tweak: u32,
    pub flags: u8,
}

impl FilterLoad {
    pub fn decode(mut buf: &[u8]) -> Result<Self, DecodeError> {
        let data = serialize::read_var_bytes(&mut buf)?;
        serialize::need(&buf, 9)?;
        Ok(Self {
            data,
            hash_funcs: buf.get_u32_le(),
            tweak: buf.get_u32_le(),
            flags: buf.get_u8(),
        })
    }
}

/// filteradd payload
pub fn decode_filter_add(mut buf: &[u8]) -> Result<Vec<u8>, DecodeError> {
    serialize::read_var_bytes(&mut buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_version() -> VersionMessage {
        VersionMessage {
            version: PROTOCOL_VERSION,
            services: ServiceFlags::NODE_NETWORK,
            timestamp: 1_700_000_000,
            addr_recv: NetAddr {
                addr: "1.2.3.4:8333".parse().unwrap(),
                services: ServiceFlags::NODE_NETWORK,
                time: 0,
            },
            addr_from: NetAddr {
                addr: "0.0.0.0:0".parse().unwrap(),
                services: ServiceFlags::NODE_NETWORK,
                time: 0,
            },
            nonce: 0xdead_beef,
            user_agent: "/mini-p2p:0.1.0/".into(),
            start_height: 12,
            relay: false,
        }
    }

    #[test]
    fn test_version_roundtrip() {
        let msg = sample_version();
        let decoded = VersionMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_version_without_relay_flag_defaults_true() {
        let msg = sample_version();
        let bytes = msg.encode();
        let decoded = VersionMessage::decode(&bytes[..bytes.len() - 1]).unwrap();
        assert!(decoded.relay);
        assert_eq!(decoded.start_height, 12);
    }

    #[test]
    fn test_protoconf_roundtrip() {
        let conf = Protoconf {
            max_recv_payload_length: 2 * 1024 * 1024,
            stream_policies: "BlockPriority,Default".into(),
        };
        let decoded = Protoconf::decode(&conf.encode()).unwrap();
        assert_eq!(decoded, conf);
        assert_eq!(decoded.policies(), vec!["BlockPriority", "Default"]);
    }

    #[test]
    fn test_negative_fee_filter_rejected() {
        assert!(decode_fee_filter(&encode_fee_filter(-1)).is_err());
        assert_eq!(decode_fee_filter(&encode_fee_filter(1000)).unwrap(), 1000);
    }
}
