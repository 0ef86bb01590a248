//! Incremental message framing
//!
//! Inbound bytes arrive in arbitrary slices from non-blocking reads.
//! [`NetMessage`] consumes them in two phases (`read_header`, then
//! `read_data`), reporting how many bytes it took so the caller can resume
//! with the rest of the buffer. [`MessageCodec`] wraps that state machine as a
//! `tokio_util` codec over a `BytesMut` receive buffer.

use crate::crypto::PayloadHasher;
use crate::protocol::error::FramingError;
use crate::protocol::header::{
    is_extended_marker, Magic, MessageHeader, PayloadLimits, EXTENDED_HEADER_SIZE, HEADER_SIZE,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::Instant;
use tokio_util::codec::{Decoder, Encoder};

/// Upper bound on the initial allocation for a payload. Larger payloads grow
/// as their bytes actually arrive.
const MAX_INITIAL_PAYLOAD_ALLOC: usize = 256 * 1024;

/// A message being received, or fully received, from a peer
pub struct NetMessage {
    magic: Magic,
    limits: PayloadLimits,
    header_buf: [u8; EXTENDED_HEADER_SIZE],
    header_pos: usize,
    header: Option<MessageHeader>,
    data: BytesMut,
    data_pos: u64,
    hasher: Option<PayloadHasher>,
    hash: Option<[u8; 32]>,
    /// When the first byte of this message was seen
    pub started_at: Instant,
}

impl NetMessage {
    pub fn new(magic: Magic, limits: PayloadLimits, now: Instant) -> Self {
        Self {
            magic,
            limits,
            header_buf: [0u8; EXTENDED_HEADER_SIZE],
            header_pos: 0,
            header: None,
            data: BytesMut::new(),
            data_pos: 0,
            hasher: Some(PayloadHasher::new()),
            hash: None,
            started_at: now,
        }
    }

    /// Whether the header has been fully parsed
    pub fn in_data(&self) -> bool {
        self.header.is_some()
    }

    /// Whether header and payload have been fully received
    pub fn complete(&self) -> bool {
        match &self.header {
            Some(h) => self.data_pos == h.payload_length(),
            None => false,
        }
    }

    /// Feed bytes, dispatching to the current phase
    pub fn read(&mut self, bytes: &[u8]) -> Result<usize, FramingError> {
        if self.in_data() {
            Ok(self.read_data(bytes))
        } else {
            self.read_header(bytes)
        }
    }

    /// Consume header bytes. Returns the number of bytes taken.
    ///
    /// Fails as soon as the header is known to be invalid: a wrong magic is
    /// reported after the first 24 bytes, before waiting for any extended
    /// sub-header.
    pub fn read_header(&mut self, bytes: &[u8]) -> Result<usize, FramingError> {
        let mut consumed = 0;
        loop {
            let needed = self.header_len_needed();
            let take = (needed - self.header_pos).min(bytes.len() - consumed);
            self.header_buf[self.header_pos..self.header_pos + take]
                .copy_from_slice(&bytes[consumed..consumed + take]);
            self.header_pos += take;
            consumed += take;

            if self.header_pos == HEADER_SIZE && self.header_buf[..4] != self.magic {
                return Err(FramingError::BadMagic {
                    got: hex::encode(&self.header_buf[..4]),
                    expected: hex::encode(self.magic),
                });
            }

            if self.header_pos < self.header_len_needed() {
                if consumed == bytes.len() {
                    return Ok(consumed);
                }
                continue;
            }
            break;
        }

        let header = MessageHeader::decode(&self.header_buf[..self.header_pos])?;
        header.validate(&self.magic, &self.limits)?;

        let initial = (header.payload_length() as usize).min(MAX_INITIAL_PAYLOAD_ALLOC);
        self.data.reserve(initial);
        self.header = Some(header);
        Ok(consumed)
    }

    /// Consume payload bytes. Returns the number of bytes taken.
    pub fn read_data(&mut self, bytes: &[u8]) -> usize {
        let total = match &self.header {
            Some(h) => h.payload_length(),
            None => return 0,
        };
        let remaining = total - self.data_pos;
        let take = (remaining.min(bytes.len() as u64)) as usize;
        let chunk = &bytes[..take];
        self.data.extend_from_slice(chunk);
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(chunk);
        }
        self.data_pos += take as u64;
        take
    }

    fn header_len_needed(&self) -> usize {
        if self.header_pos < HEADER_SIZE {
            return HEADER_SIZE;
        }
        let mut cmd = [0u8; 12];
        cmd.copy_from_slice(&self.header_buf[4..16]);
        let length = u32::from_le_bytes([
            self.header_buf[16],
            self.header_buf[17],
            self.header_buf[18],
            self.header_buf[19],
        ]);
        if is_extended_marker(&cmd, length) {
            EXTENDED_HEADER_SIZE
        } else {
            HEADER_SIZE
        }
    }

    pub fn header(&self) -> Option<&MessageHeader> {
        self.header.as_ref()
    }

    /// Command to dispatch on (inner command for extended messages)
    pub fn command(&self) -> &str {
        self.header
            .as_ref()
            .map(|h| h.effective_command())
            .unwrap_or("")
    }

    pub fn payload(&self) -> &[u8] {
        &self.data
    }

    pub fn into_payload(self) -> Bytes {
        self.data.freeze()
    }

    /// Header plus payload bytes received so far
    pub fn received_size(&self) -> u64 {
        self.header_pos as u64 + self.data_pos
    }

    /// Double SHA-256 of the payload, finalized on first use
    pub fn payload_hash(&mut self) -> [u8; 32] {
        if let Some(hash) = self.hash {
            return hash;
        }
        let hash = self.hasher.take().unwrap_or_default().finalize();
        self.hash = Some(hash);
        hash
    }

    /// Compare the payload hash against the header checksum.
    ///
    /// Extended messages carry no checksum and always verify.
    pub fn verify_checksum(&mut self) -> bool {
        let expected = match &self.header {
            Some(h) if h.is_extended() => return true,
            Some(h) => h.checksum,
            None => return false,
        };
        let hash = self.payload_hash();
        hash[..4] == expected
    }
}

impl std::fmt::Debug for NetMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetMessage")
            .field("command", &self.command())
            .field("received", &self.received_size())
            .field("complete", &self.complete())
            .finish()
    }
}

/// A message queued for sending
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub command: String,
    pub payload: Bytes,
}

impl OutboundMessage {
    pub fn new(command: &str, payload: impl Into<Bytes>) -> Self {
        Self {
            command: command.to_string(),
            payload: payload.into(),
        }
    }

    /// A message with no payload (verack, getaddr, sendheaders, ...)
    pub fn empty(command: &str) -> Self {
        Self::new(command, Bytes::new())
    }

    pub fn header(&self, magic: Magic) -> MessageHeader {
        MessageHeader::for_payload(magic, &self.command, &self.payload)
    }
}

/// Codec turning a receive buffer into [`NetMessage`]s and outbound messages
/// into framed bytes.
pub struct MessageCodec {
    magic: Magic,
    limits: PayloadLimits,
    current: Option<NetMessage>,
}

impl MessageCodec {
    pub fn new(magic: Magic, limits: PayloadLimits) -> Self {
        Self {
            magic,
            limits,
            current: None,
        }
    }

    /// Update the limits used for subsequent messages
    pub fn set_limits(&mut self, limits: PayloadLimits) {
        self.limits = limits;
    }
}

impl Decoder for MessageCodec {
    type Item = NetMessage;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let (magic, limits) = (self.magic, self.limits);
        while !src.is_empty() || self.current.as_ref().map_or(false, |m| m.complete()) {
            let msg = self
                .current
                .get_or_insert_with(|| NetMessage::new(magic, limits, Instant::now()));
            if msg.complete() {
                return Ok(self.current.take());
            }
            let consumed = msg.read(&src[..])?;
            src.advance(consumed);
            if msg.complete() {
                return Ok(self.current.take());
            }
        }
        Ok(None)
    }
}

impl Encoder<OutboundMessage> for MessageCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: OutboundMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let header = item.header(self.magic);
        dst.reserve(header.encoded_len() + item.payload.len());
        header.encode(dst);
        dst.put_slice(&item.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::command;
    use crate::protocol::header::EXTENDED_LENGTH_SENTINEL;

    const MAGIC: Magic = [0xda, 0xb5, 0xbf, 0xfa];

    fn limits() -> PayloadLimits {
        PayloadLimits {
            max_payload: 1024,
            max_block: 64 * 1024,
        }
    }

    fn encode(msg: OutboundMessage) -> BytesMut {
        let mut codec = MessageCodec::new(MAGIC, limits());
        let mut buf = BytesMut::new();
        codec.encode(msg, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_message_codec() {
        let mut buf = encode(OutboundMessage::new(command::PING, 12345u64.to_le_bytes().to_vec()));
        let mut codec = MessageCodec::new(MAGIC, limits());

        let mut msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.command(), command::PING);
        assert_eq!(msg.payload(), &12345u64.to_le_bytes());
        assert!(msg.verify_checksum());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_resumes_across_partial_reads() {
        let payload: Vec<u8> = (0..200u8).collect();
        let wire = encode(OutboundMessage::new(command::TX, payload.clone()));

        let mut msg = NetMessage::new(MAGIC, limits(), Instant::now());
        let mut offset = 0;
        for chunk in wire.chunks(7) {
            let mut pos = 0;
            while pos < chunk.len() {
                let n = msg.read(&chunk[pos..]).unwrap();
                assert!(n > 0);
                pos += n;
            }
            offset += chunk.len();
        }
        assert_eq!(offset, wire.len());
        assert!(msg.complete());
        assert_eq!(msg.payload(), &payload[..]);
        assert!(msg.verify_checksum());
    }

    #[test]
    fn test_two_messages_in_one_buffer() {
        let mut buf = encode(OutboundMessage::empty(command::VERACK));
        buf.extend_from_slice(&encode(OutboundMessage::empty(command::SENDHEADERS)));

        let mut codec = MessageCodec::new(MAGIC, limits());
        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.command(), command::VERACK);
        assert_eq!(second.command(), command::SENDHEADERS);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_payload_fails_checksum() {
        let mut buf = encode(OutboundMessage::new(command::TX, vec![1u8; 32]));
        let last = buf.len() - 1;
        buf[last] ^= 0xff;

        let mut codec = MessageCodec::new(MAGIC, limits());
        let mut msg = codec.decode(&mut buf).unwrap().unwrap();
        assert!(!msg.verify_checksum());
    }

    #[test]
    fn test_bad_magic_fails_on_header() {
        let mut wire = encode(OutboundMessage::empty(command::VERACK));
        wire[0] = 0;
        let mut codec = MessageCodec::new(MAGIC, limits());
        let err = codec.decode(&mut wire).unwrap_err();
        assert!(matches!(err, FramingError::BadMagic { .. }));
    }

    #[test]
    fn test_oversized_header_rejected_before_payload() {
        let header = MessageHeader {
            magic: MAGIC,
            command: command::TX.to_string(),
            length: 4096,
            checksum: [0; 4],
            extended: None,
        };
        let mut msg = NetMessage::new(MAGIC, limits(), Instant::now());
        let err = msg.read(&header.to_bytes()).unwrap_err();
        assert!(err.is_ban_worthy());

        let block_header = MessageHeader {
            command: command::BLOCK.to_string(),
            ..header
        };
        let mut msg = NetMessage::new(MAGIC, limits(), Instant::now());
        assert_eq!(msg.read(&block_header.to_bytes()).unwrap(), HEADER_SIZE);
        assert!(msg.in_data());
        assert!(!msg.complete());
    }

    #[test]
    fn test_extended_header_incremental() {
        let header = MessageHeader::extended(MAGIC, command::BLOCK, 3);
        let mut wire = header.to_bytes().to_vec();
        wire.extend_from_slice(&[9, 9, 9]);

        let generous = PayloadLimits {
            max_payload: 1024,
            max_block: EXTENDED_LENGTH_SENTINEL as u64 * 2,
        };
        let mut msg = NetMessage::new(MAGIC, generous, Instant::now());
        // First 30 bytes leave the extended sub-header incomplete
        assert_eq!(msg.read(&wire[..30]).unwrap(), 30);
        assert!(!msg.in_data());
        let n = msg.read(&wire[30..]).unwrap();
        assert_eq!(n, EXTENDED_HEADER_SIZE - 30);
        msg.read(&wire[30 + n..]).unwrap();
        assert!(msg.complete());
        assert_eq!(msg.command(), command::BLOCK);
        assert!(msg.verify_checksum());
    }
}
