//! Primitive wire encodings
//!
//! Compact-size integers, length-prefixed byte strings and fixed-width
//! little-endian fields on top of `bytes::Buf`/`BufMut`.

use bytes::{Buf, BufMut};
use thiserror::Error;

/// Largest vector length accepted when decoding a compact size prefix
pub const MAX_SIZE: u64 = 0x0200_0000;

/// Payload decoding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end of payload")]
    UnexpectedEnd,
    #[error("non-canonical compact size")]
    NonCanonical,
    #[error("size too large: {0}")]
    SizeTooLarge(u64),
    #[error("invalid utf-8 string")]
    InvalidString,
    #[error("invalid value: {0}")]
    InvalidValue(String),
}

/// Ensure `buf` holds at least `n` more bytes
pub fn need(buf: &impl Buf, n: usize) -> Result<(), DecodeError> {
    if buf.remaining() < n {
        Err(DecodeError::UnexpectedEnd)
    } else {
        Ok(())
    }
}

pub fn write_compact_size(buf: &mut impl BufMut, n: u64) {
    if n < 253 {
        buf.put_u8(n as u8);
    } else if n <= 0xFFFF {
        buf.put_u8(253);
        buf.put_u16_le(n as u16);
    } else if n <= 0xFFFF_FFFF {
        buf.put_u8(254);
        buf.put_u32_le(n as u32);
    } else {
        buf.put_u8(255);
        buf.put_u64_le(n);
    }
}

pub fn read_compact_size(buf: &mut impl Buf) -> Result<u64, DecodeError> {
    need(buf, 1)?;
    let first = buf.get_u8();
    let value = match first {
        253 => {
            need(buf, 2)?;
            let v = buf.get_u16_le() as u64;
            if v < 253 {
                return Err(DecodeError::NonCanonical);
            }
            v
        }
        254 => {
            need(buf, 4)?;
            let v = buf.get_u32_le() as u64;
            if v <= 0xFFFF {
                return Err(DecodeError::NonCanonical);
            }
            v
        }
        255 => {
            need(buf, 8)?;
            let v = buf.get_u64_le();
            if v <= 0xFFFF_FFFF {
                return Err(DecodeError::NonCanonical);
            }
            v
        }
        n => n as u64,
    };
    Ok(value)
}

/// Read a compact size used as a vector length, bounded by [`MAX_SIZE`]
pub fn read_length(buf: &mut impl Buf) -> Result<usize, DecodeError> {
    let n = read_compact_size(buf)?;
    if n > MAX_SIZE {
        return Err(DecodeError::SizeTooLarge(n));
    }
    Ok(n as usize)
}

pub fn write_var_bytes(buf: &mut impl BufMut, data: &[u8]) {
    write_compact_size(buf, data.len() as u64);
    buf.put_slice(data);
}

pub fn read_var_bytes(buf: &mut impl Buf) -> Result<Vec<u8>, DecodeError> {
    let len = read_length(buf)?;
    need(buf, len)?;
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

pub fn write_var_str(buf: &mut impl BufMut, s: &str) {
    write_var_bytes(buf, s.as_bytes());
}

pub fn read_var_str(buf: &mut impl Buf) -> Result<String, DecodeError> {
    let bytes = read_var_bytes(buf)?;
    String::from_utf8(bytes).map_err(|_| DecodeError::InvalidString)
}

pub fn read_array<const N: usize>(buf: &mut impl Buf) -> Result<[u8; N], DecodeError> {
    need(buf, N)?;
    let mut out = [0u8; N];
    buf.copy_to_slice(&mut out);
    Ok(out)
}
