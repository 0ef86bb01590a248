//! Message headers
//!
//! Basic header (24 bytes):
//!
//! ```text
//! | magic (4) | command (12) | length (4, LE) | checksum (4) |
//! ```
//!
//! Extended header (44 bytes), used once a payload no longer fits the
//! 32-bit length field:
//!
//! ```text
//! | magic | "extmsg" | 0xFFFFFFFF | 0x00000000 | command (12) | length (8, LE) |
//! ```

use crate::crypto;
use crate::protocol::command::{self, COMMAND_SIZE};
use crate::protocol::error::FramingError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the network magic
pub const MESSAGE_START_SIZE: usize = 4;

/// Size of a basic header
pub const HEADER_SIZE: usize = MESSAGE_START_SIZE + COMMAND_SIZE + 4 + 4;

/// Size of an extended header (basic header + inner command + 64-bit length)
pub const EXTENDED_HEADER_SIZE: usize = HEADER_SIZE + COMMAND_SIZE + 8;

/// Length value marking the presence of the extended sub-header
pub const EXTENDED_LENGTH_SENTINEL: u32 = 0xFFFF_FFFF;

/// Network magic bytes
pub type Magic = [u8; MESSAGE_START_SIZE];

/// Payload size limits applied at header-parse time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadLimits {
    /// Cap for ordinary messages
    pub max_payload: u64,
    /// Cap for block-content-bearing messages
    pub max_block: u64,
}

impl PayloadLimits {
    /// The limit that applies to `command`
    pub fn limit_for(&self, command: &str) -> u64 {
        if command::is_block_like(command) {
            self.max_block
        } else {
            self.max_payload
        }
    }
}

/// Extended sub-header fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedFields {
    pub command: String,
    pub length: u64,
}

/// A decoded message header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub magic: Magic,
    /// Command from the basic header (`extmsg` for extended messages)
    pub command: String,
    /// Length from the basic header (the sentinel for extended messages)
    pub length: u32,
    pub checksum: [u8; 4],
    pub extended: Option<ExtendedFields>,
}

impl MessageHeader {
    /// Build the header for an outbound payload
    pub fn for_payload(magic: Magic, command: &str, payload: &[u8]) -> Self {
        let len = payload.len() as u64;
        if needs_extended(len) {
            Self::extended(magic, command, len)
        } else {
            Self {
                magic,
                command: command.to_string(),
                length: len as u32,
                checksum: crypto::checksum(payload),
                extended: None,
            }
        }
    }

    /// Build an extended header; the checksum field is left zero
    pub fn extended(magic: Magic, command: &str, length: u64) -> Self {
        Self {
            magic,
            command: command::EXTMSG.to_string(),
            length: EXTENDED_LENGTH_SENTINEL,
            checksum: [0; 4],
            extended: Some(ExtendedFields {
                command: command.to_string(),
                length,
            }),
        }
    }

    /// The command the payload should be dispatched on
    pub fn effective_command(&self) -> &str {
        match &self.extended {
            Some(ext) => &ext.command,
            None => &self.command,
        }
    }

    /// The real payload length
    pub fn payload_length(&self) -> u64 {
        match &self.extended {
            Some(ext) => ext.length,
            None => self.length as u64,
        }
    }

    pub fn is_extended(&self) -> bool {
        self.extended.is_some()
    }

    /// Encoded size of this header
    pub fn encoded_len(&self) -> usize {
        if self.is_extended() {
            EXTENDED_HEADER_SIZE
        } else {
            HEADER_SIZE
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.magic);
        buf.put_slice(&command::encode_command(&self.command));
        buf.put_u32_le(self.length);
        buf.put_slice(&self.checksum);
        if let Some(ext) = &self.extended {
            buf.put_slice(&command::encode_command(&ext.command));
            buf.put_u64_le(ext.length);
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode a complete header.
    ///
    /// `raw` holds either a basic header or, when the basic part carries the
    /// extended markers, the full extended header. Structural problems are
    /// reported here; magic and size limits are checked by [`Self::validate`].
    pub fn decode(raw: &[u8]) -> Result<Self, FramingError> {
        if raw.len() < HEADER_SIZE {
            return Err(FramingError::BadExtendedHeader(format!(
                "short header: {} bytes",
                raw.len()
            )));
        }
        let mut buf = raw;
        let mut magic = [0u8; MESSAGE_START_SIZE];
        buf.copy_to_slice(&mut magic);
        let mut cmd_raw = [0u8; COMMAND_SIZE];
        buf.copy_to_slice(&mut cmd_raw);
        let length = buf.get_u32_le();
        let mut checksum = [0u8; 4];
        buf.copy_to_slice(&mut checksum);

        let command = command::decode_command(&cmd_raw).ok_or(FramingError::InvalidCommand)?;

        let extended = if is_extended_marker(&cmd_raw, length) {
            if buf.remaining() < COMMAND_SIZE + 8 {
                return Err(FramingError::BadExtendedHeader(
                    "missing extended fields".into(),
                ));
            }
            let mut inner_raw = [0u8; COMMAND_SIZE];
            buf.copy_to_slice(&mut inner_raw);
            let inner = command::decode_command(&inner_raw).ok_or_else(|| {
                FramingError::BadExtendedHeader("invalid inner command".into())
            })?;
            if inner == command::EXTMSG {
                return Err(FramingError::BadExtendedHeader(
                    "nested extended message".into(),
                ));
            }
            let ext_length = buf.get_u64_le();
            Some(ExtendedFields {
                command: inner,
                length: ext_length,
            })
        } else {
            None
        };

        Ok(Self {
            magic,
            command,
            length,
            checksum,
            extended,
        })
    }

    /// Check magic and size limits
    pub fn validate(&self, magic: &Magic, limits: &PayloadLimits) -> Result<(), FramingError> {
        if &self.magic != magic {
            return Err(FramingError::BadMagic {
                got: hex::encode(self.magic),
                expected: hex::encode(magic),
            });
        }
        let command = self.effective_command();
        let length = self.payload_length();
        let limit = limits.limit_for(command);
        if length > limit {
            return Err(FramingError::Oversized {
                command: command.to_string(),
                length,
                limit,
            });
        }
        Ok(())
    }
}

/// Whether a payload of `len` bytes requires the extended header
pub fn needs_extended(len: u64) -> bool {
    len >= EXTENDED_LENGTH_SENTINEL as u64
}

/// Whether the basic header fields announce an extended sub-header
pub fn is_extended_marker(cmd_raw: &[u8; COMMAND_SIZE], length: u32) -> bool {
    length == EXTENDED_LENGTH_SENTINEL
        && command::decode_command(cmd_raw).as_deref() == Some(command::EXTMSG)
}
