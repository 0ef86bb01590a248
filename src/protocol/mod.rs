//! Wire protocol
//!
//! Message framing, header validation and the payload types the networking
//! core understands.
//!
//! # Features
//! - Basic and extended (64-bit length) message headers
//! - Incremental, resumable decoding with lazy checksum finalization
//! - Inventory, address and handshake payloads

pub mod address;
pub mod command;
pub mod error;
pub mod header;
pub mod inventory;
pub mod message;
pub mod payload;
pub mod serialize;
pub mod services;

pub use address::{NetAddr, MAX_ADDR_TO_SEND};
pub use error::FramingError;
pub use header::{
    Magic, MessageHeader, PayloadLimits, EXTENDED_HEADER_SIZE, EXTENDED_LENGTH_SENTINEL,
    HEADER_SIZE,
};
pub use inventory::{Hash256, InvItem, InvKind, MAX_INV_SZ};
pub use message::{MessageCodec, NetMessage, OutboundMessage};
pub use payload::{Protoconf, VersionMessage, PROTOCOL_VERSION};
pub use serialize::DecodeError;
pub use services::ServiceFlags;
