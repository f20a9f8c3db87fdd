//! Variable-length integer and byte-string codec (RFC 9000 Section 16).
//!
//! The two high bits of the first byte select a 1/2/4/8-byte encoding
//! carrying 6/14/30/62 value bits. Decoders take `(buf, pos)` cursors and
//! never advance past malformed input: a failed decode leaves the cursor
//! where it was and the caller surfaces FRAME_ENCODING_ERROR.

#![forbid(unsafe_code)]

use crate::error::{Error, Result};
use crate::types::{VarInt, VARINT_MAX};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Decode a varint from `buf[*pos..]`, advancing `pos` on success.
pub fn decode(buf: &[u8], pos: &mut usize) -> Result<VarInt> {
    let rest = buf.get(*pos..).ok_or(Error::FrameEncodingError)?;
    let first = *rest.first().ok_or(Error::FrameEncodingError)?;
    let len = 1usize << (first >> 6);
    if rest.len() < len {
        return Err(Error::FrameEncodingError);
    }

    let mut value = (first & 0x3f) as u64;
    for b in &rest[1..len] {
        value = value << 8 | *b as u64;
    }
    *pos += len;
    Ok(value)
}

/// Decode a single raw byte.
pub fn decode_u8(buf: &[u8], pos: &mut usize) -> Result<u8> {
    let b = *buf.get(*pos).ok_or(Error::FrameEncodingError)?;
    *pos += 1;
    Ok(b)
}

/// Decode `len` raw bytes as an owned slice of `src`.
///
/// `src` must be the `Bytes` the `buf` slice was taken from, so the result
/// shares its storage instead of copying.
pub fn decode_bytes(src: &Bytes, pos: &mut usize, len: usize) -> Result<Bytes> {
    let end = pos.checked_add(len).ok_or(Error::FrameEncodingError)?;
    if end > src.len() {
        return Err(Error::FrameEncodingError);
    }
    let out = src.slice(*pos..end);
    *pos = end;
    Ok(out)
}

/// Decode a fixed-size array of raw bytes.
pub fn decode_array<const N: usize>(buf: &[u8], pos: &mut usize) -> Result<[u8; N]> {
    let rest = buf.get(*pos..).ok_or(Error::FrameEncodingError)?;
    if rest.len() < N {
        return Err(Error::FrameEncodingError);
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&rest[..N]);
    *pos += N;
    Ok(out)
}

/// Append the minimal encoding of `value`.
///
/// Values above [`VARINT_MAX`] cannot be represented; the caller is expected
/// to have range-checked, so this saturates to the maximum rather than panic.
pub fn encode(buf: &mut BytesMut, value: VarInt) {
    let value = value.min(VARINT_MAX);
    match size(value) {
        1 => buf.put_u8(value as u8),
        2 => buf.put_u16(value as u16 | 0x4000),
        4 => buf.put_u32(value as u32 | 0x8000_0000),
        _ => buf.put_u64(value | 0xc000_0000_0000_0000),
    }
}

/// Minimal encoded size of `value`: 1, 2, 4 or 8 bytes.
pub fn size(value: VarInt) -> usize {
    if value < 1 << 6 {
        1
    } else if value < 1 << 14 {
        2
    } else if value < 1 << 30 {
        4
    } else {
        8
    }
}

/// Decode a varint from a `Buf`, consuming it. Used by the transport
/// parameter codec where input arrives as chained buffers.
pub fn get<B: Buf>(buf: &mut B) -> Result<VarInt> {
    if !buf.has_remaining() {
        return Err(Error::FrameEncodingError);
    }
    let first = buf.chunk()[0];
    let len = 1usize << (first >> 6);
    if buf.remaining() < len {
        return Err(Error::FrameEncodingError);
    }
    Ok(match len {
        1 => buf.get_u8() as u64,
        2 => (buf.get_u16() & 0x3fff) as u64,
        4 => (buf.get_u32() & 0x3fff_ffff) as u64,
        _ => buf.get_u64() & 0x3fff_ffff_ffff_ffff,
    })
}
