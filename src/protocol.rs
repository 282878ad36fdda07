//! Control-bus wire protocol shared by test nodes and the harness.
//!
//! Wire format: `[kind: u8][id: u64 big-endian][length: u32 big-endian][payload]`
//!
//! The payload is a JSON-encoded parameter list. Every request's first
//! parameter is a [`ControlOp`] opcode; the remaining parameters are
//! opcode-specific.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Frame kind byte values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Fire-and-forget message; no response expected. Correlation id is 0.
    Message = 0x01,
    /// Request expecting a `Response` frame with the same correlation id.
    Request = 0x02,
    /// Response to an earlier `Request`.
    Response = 0x03,
}

impl FrameKind {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Message),
            0x02 => Some(Self::Request),
            0x03 => Some(Self::Response),
            _ => None,
        }
    }
}

/// The closed set of control operations exchanged over the bus.
///
/// The first parameter of every control request is one of these values.
/// Unrecognized opcodes are a protocol violation, not a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ControlOp {
    /// node → harness: `[ClientIsConnecting, client_id]` registers the node.
    ClientIsConnecting = 1,
    /// harness → node: `[SocketServerStart, port]` stop + start the managed
    /// listener on `port`.
    SocketServerStart = 10,
    /// harness → node: `[SocketServerStop]` stop the managed listener.
    SocketServerStop = 11,
}

impl ControlOp {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::ClientIsConnecting),
            10 => Some(Self::SocketServerStart),
            11 => Some(Self::SocketServerStop),
            _ => None,
        }
    }
}

impl std::fmt::Display for ControlOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::ClientIsConnecting => "ClientIsConnecting",
            Self::SocketServerStart => "SocketServerStart",
            Self::SocketServerStop => "SocketServerStop",
        };
        write!(f, "{}", name)
    }
}

/// A single loosely-typed control parameter.
///
/// Serializes untagged, so a parameter list is a plain JSON array like
/// `[10, 5000]` or `[1, "detail"]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Param {
    Int(i64),
    Text(String),
}

impl Param {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Int(_) => None,
            Self::Text(s) => Some(s),
        }
    }
}

impl From<i64> for Param {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for Param {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

/// A malformed or out-of-contract control request.
#[derive(Debug, Error)]
pub enum ProtocolViolation {
    #[error("empty control request (missing opcode)")]
    EmptyRequest,

    #[error("control opcode must be an integer, got {0:?}")]
    OpcodeNotInt(Param),

    #[error("unsupported control opcode {0}")]
    UnsupportedOpcode(i64),

    #[error("missing control argument `{0}`")]
    MissingArg(&'static str),

    #[error("control argument `{0}` must be an integer")]
    ArgNotInt(&'static str),
}

/// Decode the opcode from a request's parameter list.
pub fn opcode(params: &[Param]) -> Result<ControlOp, ProtocolViolation> {
    let first = params.first().ok_or(ProtocolViolation::EmptyRequest)?;
    let raw = first
        .as_i64()
        .ok_or_else(|| ProtocolViolation::OpcodeNotInt(first.clone()))?;
    u16::try_from(raw)
        .ok()
        .and_then(ControlOp::from_u16)
        .ok_or(ProtocolViolation::UnsupportedOpcode(raw))
}

/// Decode an integer argument at `index`, named for error reporting.
pub fn int_arg(
    params: &[Param],
    index: usize,
    name: &'static str,
) -> Result<i64, ProtocolViolation> {
    let param = params
        .get(index)
        .ok_or(ProtocolViolation::MissingArg(name))?;
    param.as_i64().ok_or(ProtocolViolation::ArgNotInt(name))
}

// ── Response conventions ───────────────────────────────────────────
//
// Responses are themselves parameter lists: `[0]` means success, anything
// else is `[code, "description"]`.

pub fn ack_params() -> Vec<Param> {
    vec![Param::Int(0)]
}

pub fn nack_params(message: &str) -> Vec<Param> {
    vec![Param::Int(1), Param::Text(message.to_string())]
}

/// Interpret a response parameter list as success or an error description.
pub fn parse_ack(params: &[Param]) -> Result<(), String> {
    match params.first().and_then(Param::as_i64) {
        Some(0) => Ok(()),
        Some(code) => {
            let detail = params
                .get(1)
                .and_then(Param::as_str)
                .unwrap_or("no detail");
            Err(format!("peer returned error {}: {}", code, detail))
        }
        None => Err("malformed response (missing status code)".to_string()),
    }
}

/// Maximum frame payload size (1 MiB). Control traffic is tiny; anything
/// larger is malformed data.
const MAX_PAYLOAD_SIZE: u32 = 1024 * 1024;

/// Header bytes preceding the payload: kind + id + length.
const HEADER_LEN: usize = 1 + 8 + 4;

/// A control-bus frame: kind, correlation id, and parameter list.
#[derive(Debug, Clone)]
pub struct ControlFrame {
    pub kind: FrameKind,
    pub id: u64,
    pub params: Vec<Param>,
}

impl ControlFrame {
    pub fn message(params: Vec<Param>) -> Self {
        Self {
            kind: FrameKind::Message,
            id: 0,
            params,
        }
    }

    pub fn request(id: u64, params: Vec<Param>) -> Self {
        Self {
            kind: FrameKind::Request,
            id,
            params,
        }
    }

    pub fn response(id: u64, params: Vec<Param>) -> Self {
        Self {
            kind: FrameKind::Response,
            id,
            params,
        }
    }

    /// Encode this frame into bytes.
    pub fn encode(&self) -> io::Result<Bytes> {
        let payload = serde_json::to_vec(&self.params)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buf.put_u8(self.kind as u8);
        buf.put_u64(self.id);
        buf.put_u32(payload.len() as u32);
        buf.put(payload.as_slice());
        Ok(buf.freeze())
    }

    /// Write this frame to an async writer.
    pub async fn write_to<W: AsyncWriteExt + Unpin>(&self, writer: &mut W) -> io::Result<()> {
        let encoded = self.encode()?;
        writer.write_all(&encoded).await?;
        writer.flush().await
    }

    /// Read a frame from an async reader.
    pub async fn read_from<R: AsyncReadExt + Unpin>(reader: &mut R) -> io::Result<Self> {
        let kind_byte = reader.read_u8().await?;
        let kind = FrameKind::from_u8(kind_byte).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown frame kind: 0x{:02x}", kind_byte),
            )
        })?;

        let id = reader.read_u64().await?;
        let length = reader.read_u32().await?;
        if length > MAX_PAYLOAD_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame payload too large: {} bytes", length),
            ));
        }

        let mut payload = vec![0u8; length as usize];
        reader.read_exact(&mut payload).await?;

        let params: Vec<Param> = serde_json::from_slice(&payload)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        Ok(Self { kind, id, params })
    }

    /// Decode a frame from a byte buffer (synchronous, for testing).
    pub fn decode(mut data: &[u8]) -> io::Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "frame too short",
            ));
        }

        let kind_byte = data.get_u8();
        let kind = FrameKind::from_u8(kind_byte).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown frame kind: 0x{:02x}", kind_byte),
            )
        })?;

        let id = data.get_u64();
        let length = data.get_u32();
        if length > MAX_PAYLOAD_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame payload too large: {} bytes", length),
            ));
        }

        if data.remaining() < length as usize {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "incomplete frame payload",
            ));
        }

        let params: Vec<Param> = serde_json::from_slice(&data[..length as usize])
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        Ok(Self { kind, id, params })
    }
}
