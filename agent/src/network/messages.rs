// Payloads carried inside frames
//
// All integers and floats are little-endian. Vectors are encoded as a u32
// element count followed by the elements.
//
//   DISPATCH_REQUEST  sequence u64 | layer u32 | timeout_ms u32 | count u32
//                     | count x (token u64 | expert u32 | hidden vec<f32>)
//   PARTIAL_RESULT    sequence u64 | layer u32 | status u8 | [error string]
//                     | count u32 | count x (token u64 | expert u32 | output vec<f32>)
//   HEALTH_PROBE      nonce u64
//   HEALTH_ACK        nonce u64 | inflight u32 | hosted_experts u32
//
// The error string is present only when status is not `Ok`.

use crate::errors::{MoeError, Result};
use crate::routing::{ExpertId, TokenId};
use std::sync::Arc;

use super::frame::{Frame, MessageType};

/// One (token, expert) pair to compute
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchEntry {
    pub token_id: TokenId,
    pub expert_id: ExpertId,
    pub hidden_state: Arc<[f32]>,
}

/// A batch of pairs for a single node.
///
/// `sequence` is assigned by the dispatcher and strictly increases per
/// destination node; responses are matched back to requests by it.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRequest {
    pub sequence: u64,
    pub layer: u32,
    pub timeout_ms: u32,
    pub entries: Vec<DispatchEntry>,
}

impl DispatchRequest {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Output of one expert for one token
#[derive(Debug, Clone, PartialEq)]
pub struct PartialResult {
    pub token_id: TokenId,
    pub expert_id: ExpertId,
    pub sequence: u64,
    pub layer: u32,
    pub output: Vec<f32>,
}

/// Worker verdict for a whole dispatch request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResultStatus {
    Ok = 0,
    KernelError = 1,
    DeadlineExceeded = 2,
}

impl TryFrom<u8> for ResultStatus {
    type Error = MoeError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ResultStatus::Ok),
            1 => Ok(ResultStatus::KernelError),
            2 => Ok(ResultStatus::DeadlineExceeded),
            other => Err(MoeError::CorruptFrame(format!(
                "unknown result status {other}"
            ))),
        }
    }
}

/// Response to a [`DispatchRequest`]
#[derive(Debug, Clone, PartialEq)]
pub struct PartialResultBatch {
    pub sequence: u64,
    pub layer: u32,
    pub status: ResultStatus,
    pub error: Option<String>,
    pub results: Vec<PartialResult>,
}

impl PartialResultBatch {
    pub fn ok(sequence: u64, layer: u32, results: Vec<PartialResult>) -> Self {
        Self {
            sequence,
            layer,
            status: ResultStatus::Ok,
            error: None,
            results,
        }
    }

    pub fn failed(sequence: u64, layer: u32, status: ResultStatus, error: impl Into<String>) -> Self {
        Self {
            sequence,
            layer,
            status,
            error: Some(error.into()),
            results: Vec::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResultStatus::Ok
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthProbe {
    pub nonce: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthAck {
    pub nonce: u64,
    /// Dispatch requests currently executing on the worker
    pub inflight: u32,
    pub hosted_experts: u32,
}

/// Any message that can travel in a frame
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Dispatch(DispatchRequest),
    Results(PartialResultBatch),
    Probe(HealthProbe),
    Ack(HealthAck),
}

impl Message {
    pub fn kind(&self) -> MessageType {
        match self {
            Message::Dispatch(_) => MessageType::DispatchRequest,
            Message::Results(_) => MessageType::PartialResult,
            Message::Probe(_) => MessageType::HealthProbe,
            Message::Ack(_) => MessageType::HealthAck,
        }
    }

    pub fn to_frame(&self) -> Frame {
        let mut w = PayloadWriter::default();
        match self {
            Message::Dispatch(req) => {
                w.u64(req.sequence);
                w.u32(req.layer);
                w.u32(req.timeout_ms);
                w.u32(req.entries.len() as u32);
                for entry in &req.entries {
                    w.u64(entry.token_id);
                    w.u32(entry.expert_id);
                    w.f32_vec(&entry.hidden_state);
                }
            }
            Message::Results(batch) => {
                w.u64(batch.sequence);
                w.u32(batch.layer);
                w.u8(batch.status as u8);
                if batch.status != ResultStatus::Ok {
                    w.string(batch.error.as_deref().unwrap_or(""));
                }
                w.u32(batch.results.len() as u32);
                for r in &batch.results {
                    w.u64(r.token_id);
                    w.u32(r.expert_id);
                    w.f32_vec(&r.output);
                }
            }
            Message::Probe(probe) => w.u64(probe.nonce),
            Message::Ack(ack) => {
                w.u64(ack.nonce);
                w.u32(ack.inflight);
                w.u32(ack.hosted_experts);
            }
        }
        Frame::new(self.kind(), w.finish())
    }

    pub fn from_frame(frame: &Frame) -> Result<Message> {
        let mut r = PayloadReader::new(&frame.payload);
        let message = match frame.kind {
            MessageType::DispatchRequest => {
                let sequence = r.u64()?;
                let layer = r.u32()?;
                let timeout_ms = r.u32()?;
                // token + expert + vector length
                let count = r.count(8 + 4 + 4)?;
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    entries.push(DispatchEntry {
                        token_id: r.u64()?,
                        expert_id: r.u32()?,
                        hidden_state: r.f32_vec()?.into(),
                    });
                }
                Message::Dispatch(DispatchRequest {
                    sequence,
                    layer,
                    timeout_ms,
                    entries,
                })
            }
            MessageType::PartialResult => {
                let sequence = r.u64()?;
                let layer = r.u32()?;
                let status = ResultStatus::try_from(r.u8()?)?;
                let error = match status {
                    ResultStatus::Ok => None,
                    _ => Some(r.string()?),
                };
                let count = r.count(8 + 4 + 4)?;
                let mut results = Vec::with_capacity(count);
                for _ in 0..count {
                    results.push(PartialResult {
                        token_id: r.u64()?,
                        expert_id: r.u32()?,
                        sequence,
                        layer,
                        output: r.f32_vec()?,
                    });
                }
                Message::Results(PartialResultBatch {
                    sequence,
                    layer,
                    status,
                    error,
                    results,
                })
            }
            MessageType::HealthProbe => Message::Probe(HealthProbe { nonce: r.u64()? }),
            MessageType::HealthAck => Message::Ack(HealthAck {
                nonce: r.u64()?,
                inflight: r.u32()?,
                hosted_experts: r.u32()?,
            }),
        };
        r.finish()?;
        Ok(message)
    }
}

#[derive(Default)]
struct PayloadWriter {
    buf: Vec<u8>,
}

impl PayloadWriter {
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn f32_vec(&mut self, values: &[f32]) {
        self.u32(values.len() as u32);
        self.buf.reserve(values.len() * 4);
        for v in values {
            self.buf.extend_from_slice(&v.to_le_bytes());
        }
    }

    fn string(&mut self, s: &str) {
        self.u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Bounds-checked cursor; every short read is a `CorruptFrame`
struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(MoeError::CorruptFrame(format!(
                "payload truncated at byte {}: need {}, have {}",
                self.pos,
                n,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }

    /// Element count, rejected early if the payload cannot possibly hold it
    fn count(&mut self, min_element_bytes: usize) -> Result<usize> {
        let count = self.u32()? as usize;
        if count.saturating_mul(min_element_bytes) > self.remaining() {
            return Err(MoeError::CorruptFrame(format!(
                "element count {} exceeds payload size",
                count
            )));
        }
        Ok(count)
    }

    fn f32_vec(&mut self) -> Result<Vec<f32>> {
        let len = self.count(4)?;
        let bytes = self.take(len * 4)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect())
    }

    fn string(&mut self) -> Result<String> {
        let len = self.count(1)?;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| MoeError::CorruptFrame(format!("invalid utf-8 in error string: {e}")))
    }

    fn finish(&self) -> Result<()> {
        if self.remaining() != 0 {
            return Err(MoeError::CorruptFrame(format!(
                "{} trailing bytes after payload",
                self.remaining()
            )));
        }
        Ok(())
    }
}
