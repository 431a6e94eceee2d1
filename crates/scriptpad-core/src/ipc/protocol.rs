//! Wire protocol between the supervisor and a worker process.
//!
//! Each frame is a 4-byte little-endian length followed by a JSON
//! `Envelope`. One connection carries the handshake, multiplexed
//! request/response pairs (matched by id) and worker-initiated pushes.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::result::{Diagnostic, ExecutionOutcome, InitializationParams, ResultEvent};

/// Protocol version for compatibility checking.
pub const PROTOCOL_VERSION: u32 = 1;

/// Frames larger than this are rejected (100 MiB).
pub const MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

/// Outgoing envelope. Borrows the frame so large payloads are not cloned.
#[derive(Serialize)]
struct Envelope<'a> {
    protocol_version: u32,
    frame: &'a Frame,
}

/// Envelope with the frame left undecoded, so the version can be checked
/// before the frame shape is trusted.
#[derive(Deserialize)]
struct RawEnvelope {
    protocol_version: u32,
    frame: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Supervisor → worker: first frame on a new connection.
    Hello { token: String },
    /// Worker → supervisor: token accepted.
    Welcome { pid: u32 },
    /// Worker → supervisor: token refused; the worker closes the connection.
    Rejected { reason: String },
    Request {
        id: u64,
        body: Request,
    },
    Response {
        id: u64,
        /// `Err` carries a worker-side failure message.
        body: std::result::Result<Response, String>,
    },
    Push {
        body: Push,
    },
}

/// Supervisor → worker operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Request {
    Initialize(InitializationParams),
    Execute { code: String },
    CompileAndSave { code: String, path: String },
    Abort,
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Initialize(_) => "initialize",
            Self::Execute { .. } => "execute",
            Self::CompileAndSave { .. } => "compile_and_save",
            Self::Abort => "abort",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    Ack,
    Outcome(ExecutionOutcome),
    /// Artifact written.
    Saved,
    /// Error diagnostics prevented writing the artifact.
    NotSaved { errors: Vec<Diagnostic> },
}

/// Worker → supervisor notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Push {
    /// One batch of result events, in enqueue order.
    Dump(Vec<ResultEvent>),
}

/// Encode one frame: length prefix followed by the JSON envelope.
///
/// Fails with `Protocol` when the envelope exceeds `MAX_FRAME_LEN`. Nothing
/// has been written at that point, so the connection stays usable.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>> {
    let mut bytes = vec![0u8; 4];
    serde_json::to_writer(
        &mut bytes,
        &Envelope {
            protocol_version: PROTOCOL_VERSION,
            frame,
        },
    )?;

    let len = bytes.len() - 4;
    if len > MAX_FRAME_LEN {
        return Err(Error::Protocol(format!("frame too large: {} bytes", len)));
    }
    bytes[..4].copy_from_slice(&(len as u32).to_le_bytes());
    Ok(bytes)
}

/// Write one length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    let bytes = encode_frame(frame)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame body. Returns `None` on a clean end of stream.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::Protocol(format!("frame too large: {} bytes", len)));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Decode a frame body, checking the protocol version.
pub fn decode_frame(body: &[u8]) -> Result<Frame> {
    let raw: RawEnvelope = serde_json::from_slice(body)?;
    if raw.protocol_version != PROTOCOL_VERSION {
        return Err(Error::Protocol(format!(
            "protocol version mismatch: expected {}, got {}",
            PROTOCOL_VERSION, raw.protocol_version
        )));
    }
    Ok(serde_json::from_value(raw.frame)?)
}
