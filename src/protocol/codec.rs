//! Frame layout and message (de)serialization.
//!
//! Every message travels in one frame:
//!
//! ```text
//! +----------------+------------------+-----------+----------------------+
//! | length: u32 BE | correlation: u64 | kind: u8  | payload (length B)   |
//! +----------------+------------------+-----------+----------------------+
//! ```
//!
//! The payload is the bincode encoding of a [`Request`] or [`Response`], using
//! big-endian fixed-width integers. Enum discriminants double as type tags for
//! values, so nothing is coerced while decoding.
use bincode::{
    config::{BigEndian, Configuration, Fixint},
    decode_from_slice, encode_to_vec,
    error::{DecodeError, EncodeError},
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::trace;
use thiserror::Error;

use super::{Command, CorrelationId, Reply, Request, Response};

/// Length + correlation id + kind.
pub const HEADER_SIZE: usize = 4 + 8 + 1;

/// Upper bound on a single frame payload accepted from a peer (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Default upper bound on the text of one query (1 MiB).
pub const DEFAULT_MAX_COMMAND_SIZE: usize = 1024 * 1024;

/// Largest command body that still fits in one frame once bincode adds its
/// variant tag and string lengths.
pub const MAX_COMMAND_SIZE: usize = MAX_FRAME_SIZE - 64;

const CONFIG: Configuration<BigEndian, Fixint> = bincode::config::standard()
    .with_big_endian()
    .with_fixed_int_encoding();

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("command is {size} bytes, limit is {limit}")]
    SizeLimitExceeded { size: usize, limit: usize },
    #[error("frame payload of {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },
    #[error("unknown frame kind {0:#04x}")]
    UnknownKind(u8),
    #[error("expected a {expected:?} frame, found {found:?}")]
    UnexpectedKind { expected: FrameKind, found: FrameKind },
    #[error("{0} trailing bytes after message payload")]
    TrailingBytes(usize),
    #[error("failed to encode message: {0}")]
    Serialize(#[from] EncodeError),
    #[error("failed to decode message: {0}")]
    Deserialize(#[from] DecodeError),
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Command = 0x01,
    Reply = 0x02,
}

impl TryFrom<u8> for FrameKind {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameKind::Command),
            0x02 => Ok(FrameKind::Reply),
            other => Err(CodecError::UnknownKind(other)),
        }
    }
}

/// Outcome of decoding from a possibly partial byte slice.
#[derive(Debug, PartialEq)]
pub enum Decoded<T> {
    /// A full message was read from the first `consumed` bytes.
    Complete { value: T, consumed: usize },
    /// At least `needed` more bytes must arrive before anything can be decoded.
    Incomplete { needed: usize },
}

impl<T> Decoded<T> {
    pub fn complete(self) -> Option<T> {
        match self {
            Decoded::Complete { value, .. } => Some(value),
            Decoded::Incomplete { .. } => None,
        }
    }
}

/// Wire-level envelope around one encoded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: CorrelationId,
    pub kind: FrameKind,
    pub payload: Bytes,
}

impl Frame {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(HEADER_SIZE + self.payload.len());
        buf.put_u32(self.payload.len() as u32);
        buf.put_u64(self.id);
        buf.put_u8(self.kind as u8);
        buf.put_slice(&self.payload);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decodes one frame from the front of `buf`.
    ///
    /// The header is validated as soon as it is available, so an oversized or
    /// malformed frame is rejected before its payload is buffered.
    pub fn decode(buf: &[u8]) -> Result<Decoded<Frame>, CodecError> {
        if buf.len() < HEADER_SIZE {
            return Ok(Decoded::Incomplete {
                needed: HEADER_SIZE - buf.len(),
            });
        }

        let mut header = &buf[..HEADER_SIZE];
        let length = header.get_u32() as usize;
        let id = header.get_u64();
        let kind = FrameKind::try_from(header.get_u8())?;

        if length > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge {
                size: length,
                max: MAX_FRAME_SIZE,
            });
        }

        let total = HEADER_SIZE + length;
        if buf.len() < total {
            return Ok(Decoded::Incomplete {
                needed: total - buf.len(),
            });
        }

        Ok(Decoded::Complete {
            value: Frame {
                id,
                kind,
                payload: Bytes::copy_from_slice(&buf[HEADER_SIZE..total]),
            },
            consumed: total,
        })
    }

    fn expect_kind(&self, expected: FrameKind) -> Result<(), CodecError> {
        if self.kind != expected {
            return Err(CodecError::UnexpectedKind {
                expected,
                found: self.kind,
            });
        }
        Ok(())
    }
}

fn to_frame<T: bincode::Encode>(
    id: CorrelationId,
    kind: FrameKind,
    body: &T,
) -> Result<Frame, CodecError> {
    let payload = encode_to_vec(body, CONFIG)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    trace!("encoded {kind:?} frame #{id} ({} bytes)", payload.len());
    Ok(Frame {
        id,
        kind,
        payload: Bytes::from(payload),
    })
}

fn from_payload<T: bincode::Decode<()>>(payload: &[u8]) -> Result<T, CodecError> {
    let (body, read) = decode_from_slice(payload, CONFIG)?;
    if read != payload.len() {
        return Err(CodecError::TrailingBytes(payload.len() - read));
    }
    Ok(body)
}

/// Encodes a command, refusing a body longer than `max_command_size` bytes.
///
/// The limit is capped at [`MAX_COMMAND_SIZE`], so a command that passes the
/// check always fits in a frame.
pub fn encode_command(command: &Command, max_command_size: usize) -> Result<Frame, CodecError> {
    let limit = max_command_size.min(MAX_COMMAND_SIZE);
    let size = command.body_len();
    if size > limit {
        return Err(CodecError::SizeLimitExceeded { size, limit });
    }
    to_frame(command.id, FrameKind::Command, &command.request)
}

pub fn encode_reply(reply: &Reply) -> Result<Frame, CodecError> {
    to_frame(reply.id, FrameKind::Reply, &reply.response)
}

pub fn command_from_frame(frame: &Frame) -> Result<Command, CodecError> {
    frame.expect_kind(FrameKind::Command)?;
    let request: Request = from_payload(&frame.payload)?;
    Ok(Command {
        id: frame.id,
        request,
    })
}

pub fn reply_from_frame(frame: &Frame) -> Result<Reply, CodecError> {
    frame.expect_kind(FrameKind::Reply)?;
    let response: Response = from_payload(&frame.payload)?;
    Ok(Reply::new(frame.id, response))
}

pub fn decode_command(buf: &[u8]) -> Result<Decoded<Command>, CodecError> {
    match Frame::decode(buf)? {
        Decoded::Complete { value, consumed } => Ok(Decoded::Complete {
            value: command_from_frame(&value)?,
            consumed,
        }),
        Decoded::Incomplete { needed } => Ok(Decoded::Incomplete { needed }),
    }
}

pub fn decode_reply(buf: &[u8]) -> Result<Decoded<Reply>, CodecError> {
    match Frame::decode(buf)? {
        Decoded::Complete { value, consumed } => Ok(Decoded::Complete {
            value: reply_from_frame(&value)?,
            consumed,
        }),
        Decoded::Incomplete { needed } => Ok(Decoded::Incomplete { needed }),
    }
}

/// Accumulates bytes from partial reads and yields whole frames.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buffer: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8 * 1024),
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Pops the next complete frame, or `None` if more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, CodecError> {
        match Frame::decode(&self.buffer)? {
            Decoded::Complete { value, consumed } => {
                self.buffer.advance(consumed);
                Ok(Some(value))
            }
            Decoded::Incomplete { .. } => Ok(None),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}
