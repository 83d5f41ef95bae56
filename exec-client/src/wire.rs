// Buffer read/write helpers shared by both wire protocols
//
// Both the JDWP side and the agent channel use big-endian integers and
// 4-byte-length-prefixed UTF-8 strings.

use bytes::{Buf, BufMut};
use thiserror::Error;

/// Truncated or malformed buffer contents; converted into the owning
/// protocol's error type at the decode boundary.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct WireError(pub String);

pub type WireResult<T> = Result<T, WireError>;

pub fn read_u8(buf: &mut &[u8]) -> WireResult<u8> {
    if buf.remaining() < 1 {
        return Err(WireError("not enough data for u8".to_string()));
    }
    Ok(buf.get_u8())
}

pub fn read_u16(buf: &mut &[u8]) -> WireResult<u16> {
    if buf.remaining() < 2 {
        return Err(WireError("not enough data for u16".to_string()));
    }
    Ok(buf.get_u16())
}

pub fn read_i32(buf: &mut &[u8]) -> WireResult<i32> {
    if buf.remaining() < 4 {
        return Err(WireError("not enough data for i32".to_string()));
    }
    Ok(buf.get_i32())
}

pub fn read_u32(buf: &mut &[u8]) -> WireResult<u32> {
    if buf.remaining() < 4 {
        return Err(WireError("not enough data for u32".to_string()));
    }
    Ok(buf.get_u32())
}

pub fn read_u64(buf: &mut &[u8]) -> WireResult<u64> {
    if buf.remaining() < 8 {
        return Err(WireError("not enough data for u64".to_string()));
    }
    Ok(buf.get_u64())
}

/// Read a length-prefixed UTF-8 string (4-byte length + bytes).
pub fn read_string(buf: &mut &[u8]) -> WireResult<String> {
    let len = read_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(WireError(format!(
            "not enough data for string: expected {}, got {}",
            len,
            buf.remaining()
        )));
    }
    let bytes = &buf[..len];
    buf.advance(len);
    String::from_utf8(bytes.to_vec()).map_err(|e| WireError(format!("invalid UTF-8 in string: {e}")))
}

/// Append a length-prefixed UTF-8 string.
pub fn put_string(out: &mut Vec<u8>, value: &str) {
    out.put_u32(value.len() as u32);
    out.extend_from_slice(value.as_bytes());
}
