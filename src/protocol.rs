//! Wire protocol between the coordinator and its workers.
//!
//! Every message travels as one frame on a persistent TCP stream:
//!
//! ```text
//! [len: u32 BE] [kind: u8] [body: len - 1 bytes]
//! ```
//!
//! `len` counts the kind byte and the body. Ids are fixed-width big-endian
//! integers, structured bodies are MessagePack, genome payloads are raw bytes.
//! Encoding and decoding are pure; nothing here knows about scheduling.

use std::io::{self, ErrorKind, Read, Write};

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

use crate::{GenomeId, SessionId, TaskId};

/// Largest accepted frame (kind byte + body): 16 MiB
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

const HEADER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Kind {
    Hello,     // (worker_id: str) (capacity: u32)
    HelloAck,  // (assigned_id: u64) (heartbeat_interval_ms: u64)
    Task,      // (task_id: u64) (genome_id: u64) (payload: bytes)
    Result,    // (task_id: u64) (outcome: msgpack)
    Heartbeat, // empty
    Shutdown,  // empty
    Reject,    // (reason: msgpack str)
}

/// What a worker reports for one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    Fitness(f64),
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Hello {
        worker_id: String,
        capacity: u32,
    },
    HelloAck {
        assigned_id: SessionId,
        heartbeat_interval_ms: u64,
    },
    Task {
        task_id: TaskId,
        genome_id: GenomeId,
        payload: Vec<u8>,
    },
    Result {
        task_id: TaskId,
        outcome: Outcome,
    },
    Heartbeat,
    Shutdown,
    Reject {
        reason: String,
    },
}

impl Message {
    pub fn kind(&self) -> Kind {
        match self {
            Message::Hello { .. } => Kind::Hello,
            Message::HelloAck { .. } => Kind::HelloAck,
            Message::Task { .. } => Kind::Task,
            Message::Result { .. } => Kind::Result,
            Message::Heartbeat => Kind::Heartbeat,
            Message::Shutdown => Kind::Shutdown,
            Message::Reject { .. } => Kind::Reject,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The peer closed the stream cleanly between two frames
    #[error("connection closed")]
    ConnectionClosed,

    #[error("truncated frame: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },

    #[error("frame too large: {0} bytes (max {MAX_FRAME_LEN})")]
    TooLarge(u32),

    #[error("empty frame")]
    Empty,

    #[error("unknown frame kind {0:#04x}")]
    UnknownKind(u8),

    #[error("malformed {kind:?} frame: {reason}")]
    Malformed { kind: Kind, reason: String },

    #[error("unexpected {0:?} frame")]
    Unexpected(Kind),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ProtocolError {
    fn malformed(kind: Kind, reason: impl ToString) -> Self {
        Self::Malformed {
            kind,
            reason: reason.to_string(),
        }
    }

    /// Whether this error means the stream itself is gone, as opposed to a
    /// peer that sent garbage.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::ConnectionClosed | Self::Io(_))
    }
}

/// Encode a message into a complete length-prefixed frame
pub fn encode(msg: &Message) -> Result<Vec<u8>, ProtocolError> {
    let kind = msg.kind();
    let mut frame = vec![0u8; HEADER_LEN];
    frame.push(kind.into());

    match msg {
        Message::Hello {
            worker_id,
            capacity,
        } => {
            let body = rmp_serde::to_vec(&(worker_id, capacity))
                .map_err(|e| ProtocolError::malformed(kind, e))?;
            frame.extend_from_slice(&body);
        }
        Message::HelloAck {
            assigned_id,
            heartbeat_interval_ms,
        } => {
            frame.extend_from_slice(&assigned_id.to_be_bytes());
            frame.extend_from_slice(&heartbeat_interval_ms.to_be_bytes());
        }
        Message::Task {
            task_id,
            genome_id,
            payload,
        } => {
            frame.extend_from_slice(&task_id.to_be_bytes());
            frame.extend_from_slice(&genome_id.to_be_bytes());
            frame.extend_from_slice(payload);
        }
        Message::Result { task_id, outcome } => {
            frame.extend_from_slice(&task_id.to_be_bytes());
            let body = rmp_serde::to_vec(outcome).map_err(|e| ProtocolError::malformed(kind, e))?;
            frame.extend_from_slice(&body);
        }
        Message::Heartbeat | Message::Shutdown => (),
        Message::Reject { reason } => {
            let body = rmp_serde::to_vec(reason).map_err(|e| ProtocolError::malformed(kind, e))?;
            frame.extend_from_slice(&body);
        }
    }

    let len = frame.len() - HEADER_LEN;
    if len > MAX_FRAME_LEN as usize {
        return Err(ProtocolError::TooLarge(len.min(u32::MAX as usize) as u32));
    }
    frame[..HEADER_LEN].copy_from_slice(&(len as u32).to_be_bytes());

    Ok(frame)
}

/// Decode one complete frame, length prefix included.
///
/// The slice must hold exactly one frame: a short slice is `Truncated`, extra
/// trailing bytes are `Malformed`.
pub fn decode(frame: &[u8]) -> Result<Message, ProtocolError> {
    if frame.len() < HEADER_LEN {
        return Err(ProtocolError::Truncated {
            expected: HEADER_LEN,
            got: frame.len(),
        });
    }
    let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
    check_len(len)?;

    let body = &frame[HEADER_LEN..];
    let expected = len as usize;
    if body.len() < expected {
        return Err(ProtocolError::Truncated {
            expected,
            got: body.len(),
        });
    }
    if body.len() > expected {
        let kind = Kind::try_from(body[0]).map_err(|_| ProtocolError::UnknownKind(body[0]))?;
        return Err(ProtocolError::malformed(
            kind,
            format!("{} trailing bytes after frame", body.len() - expected),
        ));
    }

    decode_body(body)
}

/// Decode the part of a frame that follows the length prefix
pub fn decode_body(body: &[u8]) -> Result<Message, ProtocolError> {
    let Some((&kind_b, rest)) = body.split_first() else {
        return Err(ProtocolError::Empty);
    };
    let kind = Kind::try_from(kind_b).map_err(|_| ProtocolError::UnknownKind(kind_b))?;

    let msg = match kind {
        Kind::Hello => {
            let (worker_id, capacity): (String, u32) =
                rmp_serde::from_slice(rest).map_err(|e| ProtocolError::malformed(kind, e))?;
            Message::Hello {
                worker_id,
                capacity,
            }
        }
        Kind::HelloAck => {
            if rest.len() != 16 {
                return Err(ProtocolError::malformed(
                    kind,
                    format!("expected 16 bytes, got {}", rest.len()),
                ));
            }
            Message::HelloAck {
                assigned_id: de_u64(kind, &rest[..8])?,
                heartbeat_interval_ms: de_u64(kind, &rest[8..])?,
            }
        }
        Kind::Task => {
            if rest.len() < 16 {
                return Err(ProtocolError::malformed(
                    kind,
                    format!("expected at least 16 bytes, got {}", rest.len()),
                ));
            }
            Message::Task {
                task_id: de_u64(kind, &rest[..8])?,
                genome_id: de_u64(kind, &rest[8..16])?,
                payload: rest[16..].to_vec(),
            }
        }
        Kind::Result => {
            if rest.len() < 8 {
                return Err(ProtocolError::malformed(
                    kind,
                    format!("expected at least 8 bytes, got {}", rest.len()),
                ));
            }
            let outcome: Outcome =
                rmp_serde::from_slice(&rest[8..]).map_err(|e| ProtocolError::malformed(kind, e))?;
            Message::Result {
                task_id: de_u64(kind, &rest[..8])?,
                outcome,
            }
        }
        Kind::Heartbeat | Kind::Shutdown => {
            if !rest.is_empty() {
                return Err(ProtocolError::malformed(
                    kind,
                    format!("expected empty body, got {} bytes", rest.len()),
                ));
            }
            if kind == Kind::Heartbeat {
                Message::Heartbeat
            } else {
                Message::Shutdown
            }
        }
        Kind::Reject => {
            let reason: String =
                rmp_serde::from_slice(rest).map_err(|e| ProtocolError::malformed(kind, e))?;
            Message::Reject { reason }
        }
    };

    Ok(msg)
}

/// Write one message as a frame and flush
pub fn write_message<W: Write>(writer: &mut W, msg: &Message) -> Result<(), ProtocolError> {
    let frame = encode(msg)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame and decode it.
///
/// A clean EOF before the first header byte is `ConnectionClosed`; an EOF
/// anywhere later is `Truncated`.
pub fn read_message<R: Read>(reader: &mut R) -> Result<Message, ProtocolError> {
    let mut header = [0u8; HEADER_LEN];
    let n = read_full(reader, &mut header)?;
    if n == 0 {
        return Err(ProtocolError::ConnectionClosed);
    }
    if n < HEADER_LEN {
        return Err(ProtocolError::Truncated {
            expected: HEADER_LEN,
            got: n,
        });
    }

    let len = u32::from_be_bytes(header);
    check_len(len)?;

    let mut body = vec![0u8; len as usize];
    let n = read_full(reader, &mut body)?;
    if n < body.len() {
        return Err(ProtocolError::Truncated {
            expected: body.len(),
            got: n,
        });
    }

    decode_body(&body)
}

fn check_len(len: u32) -> Result<(), ProtocolError> {
    if len == 0 {
        return Err(ProtocolError::Empty);
    }
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::TooLarge(len));
    }
    Ok(())
}

/// Like `read_exact`, but reports how many bytes arrived before EOF
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn de_u64(kind: Kind, bytes: &[u8]) -> Result<u64, ProtocolError> {
    let len = bytes.len();
    let bytes: [u8; 8] = bytes.try_into().map_err(|_| {
        ProtocolError::malformed(kind, format!("invalid slice length for u64: {}", len))
    })?;
    Ok(u64::from_be_bytes(bytes))
}
