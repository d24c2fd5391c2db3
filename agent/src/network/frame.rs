// Length-prefixed, checksummed frames for worker traffic
//
// Layout of one frame on the wire:
//
//   [u32 BE length][u8 message type][payload][u32 BE CRC32]
//
// `length` counts the type byte, the payload and the checksum. The CRC32
// covers the type byte and the payload. Payload fields are little-endian
// (see `messages.rs`).

use crate::errors::{MoeError, Result};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default upper bound on a single frame (32MB)
pub const DEFAULT_MAX_FRAME_BYTES: usize = 32 * 1024 * 1024;

/// Bytes of the length prefix
const LENGTH_BYTES: usize = 4;
/// Bytes of the trailing checksum
const CHECKSUM_BYTES: usize = 4;
/// Smallest legal value of the length field (type byte + checksum)
const MIN_FRAME_LEN: usize = 1 + CHECKSUM_BYTES;

/// Message type tag carried in every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    DispatchRequest = 1,
    PartialResult = 2,
    HealthProbe = 3,
    HealthAck = 4,
}

impl TryFrom<u8> for MessageType {
    type Error = MoeError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(MessageType::DispatchRequest),
            2 => Ok(MessageType::PartialResult),
            3 => Ok(MessageType::HealthProbe),
            4 => Ok(MessageType::HealthAck),
            other => Err(MoeError::CorruptFrame(format!(
                "unknown message type {other}"
            ))),
        }
    }
}

/// One decoded frame: a type tag and its raw payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: MessageType,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(kind: MessageType, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }

    /// Total encoded size including length prefix and checksum
    pub fn encoded_len(&self) -> usize {
        LENGTH_BYTES + 1 + self.payload.len() + CHECKSUM_BYTES
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let body_len = 1 + self.payload.len() + CHECKSUM_BYTES;
        let mut buf = Vec::with_capacity(LENGTH_BYTES + body_len);
        buf.extend_from_slice(&(body_len as u32).to_be_bytes());
        buf.push(self.kind as u8);
        buf.extend_from_slice(&self.payload);
        let crc = checksum(self.kind as u8, &self.payload);
        buf.extend_from_slice(&crc.to_be_bytes());
        buf
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// Returns the frame and the number of bytes consumed. Truncated input,
    /// a bad checksum or an unknown type all yield `CorruptFrame`.
    pub fn decode(buf: &[u8]) -> Result<(Frame, usize)> {
        if buf.len() < LENGTH_BYTES {
            return Err(MoeError::CorruptFrame(format!(
                "truncated length prefix: {} bytes",
                buf.len()
            )));
        }
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if len < MIN_FRAME_LEN {
            return Err(MoeError::CorruptFrame(format!("frame length {len} too short")));
        }
        let total = LENGTH_BYTES + len;
        if buf.len() < total {
            return Err(MoeError::CorruptFrame(format!(
                "truncated frame: expected {} bytes, got {}",
                total,
                buf.len()
            )));
        }
        let frame = parse_body(&buf[LENGTH_BYTES..total])?;
        Ok((frame, total))
    }
}

/// CRC32 over the type byte followed by the payload
fn checksum(kind: u8, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[kind]);
    hasher.update(payload);
    hasher.finalize()
}

/// Validate and split a frame body (everything after the length prefix)
fn parse_body(body: &[u8]) -> Result<Frame> {
    let (content, crc_bytes) = body.split_at(body.len() - CHECKSUM_BYTES);
    let expected = u32::from_be_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    let (kind, payload) = (content[0], &content[1..]);

    let actual = checksum(kind, payload);
    if actual != expected {
        return Err(MoeError::CorruptFrame(format!(
            "checksum mismatch: expected {expected:#010x}, computed {actual:#010x}"
        )));
    }

    Ok(Frame {
        kind: MessageType::try_from(kind)?,
        payload: payload.to_vec(),
    })
}

/// Read one frame from an async stream.
///
/// Error kinds matter to callers:
/// - `CorruptFrame`: the frame was fully consumed but failed validation. The
///   stream is still aligned and the caller may keep reading.
/// - `Io`: end of stream, a socket error or a length above `max_frame_bytes`.
///   The connection must be dropped.
pub async fn read_frame<R>(io: &mut R, max_frame_bytes: usize) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LENGTH_BYTES];
    io.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > max_frame_bytes {
        return Err(MoeError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Frame size {} exceeds limit {}", len, max_frame_bytes),
        )));
    }
    if len < MIN_FRAME_LEN {
        return Err(MoeError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Frame length {} below minimum {}", len, MIN_FRAME_LEN),
        )));
    }

    let mut body = vec![0u8; len];
    io.read_exact(&mut body).await?;
    parse_body(&body)
}

/// Write one frame to an async stream and flush it.
pub async fn write_frame<W>(io: &mut W, frame: &Frame, max_frame_bytes: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body_len = frame.encoded_len() - LENGTH_BYTES;
    if body_len > max_frame_bytes {
        return Err(MoeError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Frame size {} exceeds limit {}", body_len, max_frame_bytes),
        )));
    }
    io.write_all(&frame.encode()).await?;
    io.flush().await?;
    Ok(())
}
