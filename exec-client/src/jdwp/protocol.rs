// JDWP packet framing
//
// All multi-byte values are big-endian (network byte order).

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

use crate::wire::WireError;

pub type JdwpResult<T> = Result<T, JdwpError>;

#[derive(Debug, Error)]
pub enum JdwpError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid handshake")]
    InvalidHandshake,

    #[error("JDWP error {0}: {1}")]
    ErrorCode(u16, &'static str),

    #[error("connection closed")]
    ConnectionClosed,
}

impl From<WireError> for JdwpError {
    fn from(err: WireError) -> Self {
        JdwpError::Protocol(err.0)
    }
}

pub const JDWP_HANDSHAKE: &[u8] = b"JDWP-Handshake";

// Packet layout:
// length (4 bytes, includes header)
// id (4 bytes)
// flags (1 byte) - 0x00 = command, 0x80 = reply
// [command packet: command set (1 byte) + command (1 byte)]
// [reply packet: error code (2 bytes)]
// data (variable)

pub const HEADER_SIZE: usize = 11;
pub const REPLY_FLAG: u8 = 0x80;

/// Cap on accepted packet length, to bound memory against a broken VM.
pub const MAX_PACKET_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct CommandPacket {
    pub id: u32,
    pub command_set: u8,
    pub command: u8,
    pub data: Vec<u8>,
}

impl CommandPacket {
    pub fn new(id: u32, command_set: u8, command: u8) -> Self {
        Self {
            id,
            command_set,
            command,
            data: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let length = HEADER_SIZE + self.data.len();
        let mut buf = BytesMut::with_capacity(length);

        buf.put_u32(length as u32);
        buf.put_u32(self.id);
        buf.put_u8(0x00);
        buf.put_u8(self.command_set);
        buf.put_u8(self.command);
        buf.put_slice(&self.data);

        buf.to_vec()
    }
}

#[derive(Debug, Clone)]
pub struct ReplyPacket {
    pub id: u32,
    pub error_code: u16,
    pub data: Vec<u8>,
}

impl ReplyPacket {
    pub fn decode(mut buf: &[u8]) -> JdwpResult<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(JdwpError::Protocol("reply packet too short".to_string()));
        }

        let _length = buf.get_u32();
        let id = buf.get_u32();
        let flags = buf.get_u8();

        if flags != REPLY_FLAG {
            return Err(JdwpError::Protocol(format!(
                "invalid reply flag: {flags:#x}"
            )));
        }

        let error_code = buf.get_u16();
        let data = buf.to_vec();

        Ok(Self {
            id,
            error_code,
            data,
        })
    }

    pub fn check_error(&self) -> JdwpResult<()> {
        if self.error_code != 0 {
            Err(JdwpError::ErrorCode(
                self.error_code,
                error_codes::name(self.error_code),
            ))
        } else {
            Ok(())
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// JDWP error codes the bridge can meaningfully react to; everything else
/// is reported by number.
pub mod error_codes {
    pub const INVALID_THREAD: u16 = 10;
    pub const THREAD_NOT_SUSPENDED: u16 = 13;
    pub const THREAD_SUSPENDED: u16 = 14;
    pub const INVALID_OBJECT: u16 = 20;
    pub const INVALID_CLASS: u16 = 21;
    pub const CLASS_NOT_PREPARED: u16 = 22;
    pub const INVALID_METHODID: u16 = 23;
    pub const INVALID_FIELDID: u16 = 25;
    pub const INVALID_FRAMEID: u16 = 30;
    pub const NOT_FOUND: u16 = 41;
    pub const VM_DEAD: u16 = 112;
    pub const INTERNAL: u16 = 113;
    pub const UNATTACHED_THREAD: u16 = 115;
    pub const INVALID_TAG: u16 = 500;

    pub fn name(code: u16) -> &'static str {
        match code {
            0 => "NONE",
            INVALID_THREAD => "INVALID_THREAD",
            THREAD_NOT_SUSPENDED => "THREAD_NOT_SUSPENDED",
            THREAD_SUSPENDED => "THREAD_SUSPENDED",
            INVALID_OBJECT => "INVALID_OBJECT",
            INVALID_CLASS => "INVALID_CLASS",
            CLASS_NOT_PREPARED => "CLASS_NOT_PREPARED",
            INVALID_METHODID => "INVALID_METHODID",
            INVALID_FIELDID => "INVALID_FIELDID",
            INVALID_FRAMEID => "INVALID_FRAMEID",
            NOT_FOUND => "NOT_FOUND",
            VM_DEAD => "VM_DEAD",
            INTERNAL => "INTERNAL",
            UNATTACHED_THREAD => "UNATTACHED_THREAD",
            INVALID_TAG => "INVALID_TAG",
            _ => "UNKNOWN_ERROR",
        }
    }

    /// Thread-level codes stop() treats as "this thread is not a candidate"
    /// rather than a failed attempt.
    pub fn is_stale_thread(code: u16) -> bool {
        matches!(
            code,
            INVALID_THREAD | THREAD_NOT_SUSPENDED | UNATTACHED_THREAD
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_packet_encodes_header() {
        let packet = CommandPacket::new(1, 11, 10);
        let encoded = packet.encode();

        assert_eq!(encoded.len(), HEADER_SIZE);
        assert_eq!(&encoded[0..4], &[0, 0, 0, 11]); // length (big-endian)
        assert_eq!(&encoded[4..8], &[0, 0, 0, 1]); // id (big-endian)
        assert_eq!(encoded[8], 0x00); // command flag
        assert_eq!(encoded[9], 11); // command set
        assert_eq!(encoded[10], 10); // command
    }

    #[test]
    fn reply_packet_decodes_error_code() {
        let reply_data = vec![
            0, 0, 0, 11, // length
            0, 0, 0, 7, // id
            0x80, // reply flag
            0, 112, // error code = VM_DEAD
        ];

        let packet = ReplyPacket::decode(&reply_data).unwrap();
        assert_eq!(packet.id, 7);
        assert_eq!(packet.error_code, error_codes::VM_DEAD);
        assert!(matches!(
            packet.check_error(),
            Err(JdwpError::ErrorCode(error_codes::VM_DEAD, _))
        ));
    }

    #[test]
    fn command_flag_is_rejected_as_reply() {
        let reply_data = vec![0, 0, 0, 11, 0, 0, 0, 1, 0x00, 0, 0];
        assert!(ReplyPacket::decode(&reply_data).is_err());
    }

    #[test]
    fn error_names_resolve() {
        assert_eq!(error_codes::name(error_codes::VM_DEAD), "VM_DEAD");
        assert_eq!(error_codes::name(9999), "UNKNOWN_ERROR");
    }
}
