//! Inventory items
//!
//! An inventory item announces or requests a transaction or block by hash.

use crate::protocol::serialize::{self, DecodeError};
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum number of entries in an inv/getdata/notfound message
pub const MAX_INV_SZ: usize = 50_000;

/// Encoded size of one inventory entry
pub const INV_ENTRY_SIZE: usize = 36;

/// A 256-bit hash in internal byte order
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    pub const ZERO: Hash256 = Hash256([0u8; 32]);

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Display form: reversed hex, as block explorers show it
    pub fn to_hex(&self) -> String {
        let mut rev = self.0;
        rev.reverse();
        hex::encode(rev)
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Hash256(bytes)
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({})", self.to_hex())
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Kind of inventory item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InvKind {
    Error,
    Tx,
    Block,
    FilteredBlock,
    CompactBlock,
    DataRefTx,
    Unknown(u32),
}

impl InvKind {
    pub fn to_u32(self) -> u32 {
        match self {
            InvKind::Error => 0,
            InvKind::Tx => 1,
            InvKind::Block => 2,
            InvKind::FilteredBlock => 3,
            InvKind::CompactBlock => 4,
            InvKind::DataRefTx => 5,
            InvKind::Unknown(v) => v,
        }
    }

    pub fn from_u32(v: u32) -> Self {
        match v {
            0 => InvKind::Error,
            1 => InvKind::Tx,
            2 => InvKind::Block,
            3 => InvKind::FilteredBlock,
            4 => InvKind::CompactBlock,
            5 => InvKind::DataRefTx,
            other => InvKind::Unknown(other),
        }
    }

    /// Whether items of this kind refer to a block
    pub fn is_block(self) -> bool {
        matches!(
            self,
            InvKind::Block | InvKind::FilteredBlock | InvKind::CompactBlock
        )
    }
}

/// Inventory item: (kind, hash)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InvItem {
    pub kind: InvKind,
    pub hash: Hash256,
}

impl InvItem {
    pub fn new(kind: InvKind, hash: Hash256) -> Self {
        Self { kind, hash }
    }

    pub fn tx(hash: Hash256) -> Self {
        Self::new(InvKind::Tx, hash)
    }

    pub fn block(hash: Hash256) -> Self {
        Self::new(InvKind::Block, hash)
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.kind.to_u32());
        buf.put_slice(&self.hash.0);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        serialize::need(buf, INV_ENTRY_SIZE)?;
        let kind = InvKind::from_u32(buf.get_u32_le());
        let hash = Hash256(serialize::read_array::<32>(buf)?);
        Ok(Self { kind, hash })
    }
}

impl fmt::Display for InvItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {}", self.kind, self.hash)
    }
}

/// Encode an inv/getdata/notfound payload
pub fn encode_inv_list(items: &[InvItem], buf: &mut impl BufMut) {
    serialize::write_compact_size(buf, items.len() as u64);
    for item in items {
        item.encode(buf);
    }
}

/// Decode an inv/getdata/notfound payload
pub fn decode_inv_list(buf: &mut impl Buf) -> Result<Vec<InvItem>, DecodeError> {
    let count = serialize::read_length(buf)?;
    if count > MAX_INV_SZ {
        return Err(DecodeError::SizeTooLarge(count as u64));
    }
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        items.push(InvItem::decode(buf)?);
    }
    Ok(items)
}

/// How many inventory entries fit into a payload of `max_payload` bytes
pub fn max_inv_entries(max_payload: u64) -> usize {
    let fit = max_payload.saturating_sub(9) / INV_ENTRY_SIZE as u64;
    (fit as usize).min(MAX_INV_SZ)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_inv_list_roundtrip() {
        let items = vec![
            InvItem::tx(Hash256([1; 32])),
            InvItem::block(Hash256([2; 32])),
            InvItem::new(InvKind::Unknown(77), Hash256([3; 32])),
        ];
        let mut buf = BytesMut::new();
        encode_inv_list(&items, &mut buf);
        assert_eq!(buf.len(), 1 + 3 * INV_ENTRY_SIZE);

        let decoded = decode_inv_list(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, items);
    }

    #[test]
    fn test_too_many_entries() {
        let mut buf = BytesMut::new();
        serialize::write_compact_size(&mut buf, (MAX_INV_SZ + 1) as u64);
        assert!(decode_inv_list(&mut buf.freeze()).is_err());
    }

    #[test]
    fn test_hash_display_reversed() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0xab;
        assert!(Hash256(bytes).to_hex().ends_with("ab"));
    }

    #[test]
    fn test_max_inv_entries() {
        assert_eq!(max_inv_entries(9 + 36 * 10), 10);
        assert_eq!(max_inv_entries(u64::MAX), MAX_INV_SZ);
    }
}
