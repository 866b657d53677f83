//! Tag-prefixed binary frames of the lease shell protocol.
//!
//! Every binary WebSocket message is one frame: a single tag byte followed by
//! the payload. The tag tells the receiver which logical stream the payload
//! belongs to.

use bytes::{BufMut, Bytes, BytesMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tag {
    Stdout = 100,
    Stderr = 101,
    Result = 102,
    Failure = 103,
    Stdin = 104,
    TerminalResize = 105,
}

impl Tag {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Tag {
    type Error = FrameError;

    fn try_from(b: u8) -> Result<Self, Self::Error> {
        match b {
            100 => Ok(Tag::Stdout),
            101 => Ok(Tag::Stderr),
            102 => Ok(Tag::Result),
            103 => Ok(Tag::Failure),
            104 => Ok(Tag::Stdin),
            105 => Ok(Tag::TerminalResize),
            other => Err(FrameError::UnknownTag(other)),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("unknown frame tag {0}")]
    UnknownTag(u8),
    #[error("terminal resize payload must be 4 bytes, got {0}")]
    ResizeLength(usize),
    #[error("malformed result payload: {0}")]
    Result(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: Tag,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(tag: Tag, payload: impl Into<Bytes>) -> Self {
        Self {
            tag,
            payload: payload.into(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + self.payload.len());
        buf.put_u8(self.tag.as_u8());
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(data: Bytes) -> Result<Self, FrameError> {
        let Some(&first) = data.first() else {
            return Err(FrameError::Empty);
        };
        let tag = Tag::try_from(first)?;
        Ok(Self {
            tag,
            payload: data.slice(1..),
        })
    }

    pub fn resize(size: TerminalSize) -> Self {
        Self::new(Tag::TerminalResize, Bytes::copy_from_slice(&size.to_bytes()))
    }
}

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TerminalSize {
    pub width: u16,
    pub height: u16,
}

impl TerminalSize {
    pub fn new(width: u16, height: u16) -> Self {
        Self { width, height }
    }

    /// Big-endian width followed by big-endian height.
    pub fn to_bytes(self) -> [u8; 4] {
        let w = self.width.to_be_bytes();
        let h = self.height.to_be_bytes();
        [w[0], w[1], h[0], h[1]]
    }

    pub fn from_bytes(payload: &[u8]) -> Result<Self, FrameError> {
        let [w0, w1, h0, h1] = payload else {
            return Err(FrameError::ResizeLength(payload.len()));
        };
        Ok(Self {
            width: u16::from_be_bytes([*w0, *w1]),
            height: u16::from_be_bytes([*h0, *h1]),
        })
    }
}
