// Agent wire protocol
//
// Frame layout (big-endian, mirrors the debug side's discipline):
// length (4 bytes, includes header)
// id (4 bytes, 0 for out-of-band frames)
// kind (1 byte) - command / reply / stream / hello
// code (1 byte) - op for commands, status for replies, channel for streams
// payload (variable)

use std::collections::HashMap;

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{ExecError, ExecResult};
use crate::wire::{put_string, read_string, read_u16, read_u32};

/// Exchanged verbatim in both directions before any frame.
pub const AGENT_HANDSHAKE: &[u8] = b"EXEC-Agent";

/// Protocol revision this client speaks.
pub const PROTOCOL_VERSION: u16 = 1;

pub const HEADER_SIZE: usize = 10;

/// Cap on accepted frame length; user output arrives chunked well below
/// this.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

pub mod frame_kinds {
    pub const COMMAND: u8 = 0x00;
    pub const HELLO: u8 = 0x01;
    pub const STREAM: u8 = 0x40;
    pub const REPLY: u8 = 0x80;
}

pub mod ops {
    pub const INVOKE: u8 = 1;
    pub const ADD_CLASSPATH: u8 = 2;
    pub const RESET_CLASSPATH: u8 = 3;
    pub const VERSION_INFO: u8 = 4;
    pub const SHUTDOWN: u8 = 5;
}

pub mod reply_status {
    pub const OK: u8 = 0;
    /// User code threw; payload is the remote failure description.
    pub const USER_EXCEPTION: u8 = 1;
    /// The agent could not run the request; payload is a message.
    pub const FAILED: u8 = 2;
}

pub mod stream_channels {
    pub const STDOUT: u8 = 1;
    pub const STDERR: u8 = 2;
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub id: u32,
    pub kind: u8,
    pub code: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn command(id: u32, op: u8, payload: Vec<u8>) -> Self {
        Self {
            id,
            kind: frame_kinds::COMMAND,
            code: op,
            payload,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let length = HEADER_SIZE + self.payload.len();
        let mut buf = BytesMut::with_capacity(length);
        buf.put_u32(length as u32);
        buf.put_u32(self.id);
        buf.put_u8(self.kind);
        buf.put_u8(self.code);
        buf.put_slice(&self.payload);
        buf.to_vec()
    }

    /// Decode a frame from `buf`, which must hold exactly one frame.
    pub fn decode(mut buf: &[u8]) -> ExecResult<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(ExecError::Protocol("frame too short".to_string()));
        }
        let length = buf.get_u32() as usize;
        if length != buf.remaining() + 4 {
            return Err(ExecError::Protocol(format!(
                "frame length {} does not match buffer",
                length
            )));
        }
        let id = buf.get_u32();
        let kind = buf.get_u8();
        let code = buf.get_u8();
        Ok(Self {
            id,
            kind,
            code,
            payload: buf.to_vec(),
        })
    }
}

/// First frame the agent sends after the byte handshake.
#[derive(Debug, Clone)]
pub struct AgentHello {
    pub protocol_version: u16,
    pub vm_name: String,
    pub vm_version: String,
    pub agent_class: String,
}

impl AgentHello {
    pub fn decode(payload: &[u8]) -> ExecResult<Self> {
        let mut buf = payload;
        let protocol_version = read_u16(&mut buf)?;
        let vm_name = read_string(&mut buf)?;
        let vm_version = read_string(&mut buf)?;
        let agent_class = read_string(&mut buf)?;
        Ok(Self {
            protocol_version,
            vm_name,
            vm_version,
            agent_class,
        })
    }

    #[cfg(test)]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.put_u16(self.protocol_version);
        put_string(&mut out, &self.vm_name);
        put_string(&mut out, &self.vm_version);
        put_string(&mut out, &self.agent_class);
        out
    }
}

/// Payload of an `INVOKE` command.
pub fn encode_invoke(class: &str, method: &str) -> Vec<u8> {
    let mut out = Vec::new();
    put_string(&mut out, class);
    put_string(&mut out, method);
    out
}

/// Payload of an `ADD_CLASSPATH` command.
pub fn encode_classpath(path: &str) -> Vec<u8> {
    let mut out = Vec::new();
    put_string(&mut out, path);
    out
}

/// Parse a `VERSION_INFO` reply payload: count-prefixed key/value strings.
pub fn decode_version_info(payload: &[u8]) -> ExecResult<HashMap<String, String>> {
    let mut buf = payload;
    let count = read_u32(&mut buf)?;
    let mut map = HashMap::with_capacity(count as usize);
    for _ in 0..count {
        let key = read_string(&mut buf)?;
        let value = read_string(&mut buf)?;
        map.insert(key, value);
    }
    Ok(map)
}
