//! Multiplexer frame codec.
//!
//! Wire layout of one frame:
//!
//! ```text
//! +-------+----------+-----------------+----------------+-----------------+
//! | flags | name_len | name (utf-8)    | payload_len    | payload         |
//! | u8    | u8       | name_len bytes  | u32 big-endian | payload_len     |
//! +-------+----------+-----------------+----------------+-----------------+
//! ```
//!
//! A message is one or more frames on the same channel; the last one carries
//! [`FLAG_END`]. [`FLAG_CLOSE`] announces that the sender closed the channel.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

pub const FLAG_END: u8 = 0b0000_0001;
pub const FLAG_CLOSE: u8 = 0b0000_0010;

const HEADER_PREFIX: usize = 2;
const LENGTH_FIELD: usize = 4;

/// One frame on the shared transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxFrame {
    pub channel: String,
    pub flags: u8,
    pub payload: Bytes,
}

impl MuxFrame {
    pub fn data(channel: &str, payload: Bytes, end: bool) -> Self {
        Self {
            channel: channel.to_string(),
            flags: if end { FLAG_END } else { 0 },
            payload,
        }
    }

    pub fn close(channel: &str) -> Self {
        Self {
            channel: channel.to_string(),
            flags: FLAG_CLOSE | FLAG_END,
            payload: Bytes::new(),
        }
    }

    pub fn is_end(&self) -> bool {
        self.flags & FLAG_END != 0
    }

    pub fn is_close(&self) -> bool {
        self.flags & FLAG_CLOSE != 0
    }

    /// Split one message into frames of at most `max_payload` bytes; a zero limit is
    /// treated as one
    pub fn split_message(channel: &str, mut message: Bytes, max_payload: usize) -> Vec<MuxFrame> {
        let max_payload = max_payload.max(1);
        if message.len() <= max_payload {
            return vec![MuxFrame::data(channel, message, true)];
        }

        let mut frames = Vec::with_capacity(message.len() / max_payload + 1);
        while message.len() > max_payload {
            let chunk = message.split_to(max_payload);
            frames.push(MuxFrame::data(channel, chunk, false));
        }
        frames.push(MuxFrame::data(channel, message, true));
        frames
    }
}

/// Result of decoding one frame that was fully length-delimited
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedFrame {
    Frame(MuxFrame),
    /// The frame was skipped; the stream is still in sync
    Malformed(String),
}

/// Errors that leave the byte stream unusable
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame payload of {len} bytes exceeds limit of {max}")]
    Oversized { len: usize, max: usize },

    #[error("channel name too long: {0} bytes")]
    NameTooLong(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Length-delimited codec for [`MuxFrame`]
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_payload: usize,
}

impl FrameCodec {
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }
}

impl Decoder for FrameCodec {
    type Item = DecodedFrame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_PREFIX {
            return Ok(None);
        }

        let flags = src[0];
        let name_len = src[1] as usize;
        let header_len = HEADER_PREFIX + name_len + LENGTH_FIELD;
        if src.len() < header_len {
            src.reserve(header_len - src.len());
            return Ok(None);
        }

        let len_offset = HEADER_PREFIX + name_len;
        let payload_len = u32::from_be_bytes([
            src[len_offset],
            src[len_offset + 1],
            src[len_offset + 2],
            src[len_offset + 3],
        ]) as usize;

        if payload_len > self.max_payload {
            return Err(FrameError::Oversized {
                len: payload_len,
                max: self.max_payload,
            });
        }

        let total = header_len + payload_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_PREFIX);
        let name = src.split_to(name_len);
        src.advance(LENGTH_FIELD);
        let payload = src.split_to(payload_len).freeze();

        if name_len == 0 {
            return Ok(Some(DecodedFrame::Malformed("empty channel name".to_string())));
        }

        match String::from_utf8(name.to_vec()) {
            Ok(channel) => Ok(Some(DecodedFrame::Frame(MuxFrame {
                channel,
                flags,
                payload,
            }))),
            Err(_) => Ok(Some(DecodedFrame::Malformed(
                "channel name is not valid utf-8".to_string(),
            ))),
        }
    }
}

impl Encoder<MuxFrame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: MuxFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let name = frame.channel.as_bytes();
        if name.len() > u8::MAX as usize {
            return Err(FrameError::NameTooLong(name.len()));
        }
        if frame.payload.len() > self.max_payload {
            return Err(FrameError::Oversized {
                len: frame.payload.len(),
                max: self.max_payload,
            });
        }

        dst.reserve(HEADER_PREFIX + name.len() + LENGTH_FIELD + frame.payload.len());
        dst.put_u8(frame.flags);
        dst.put_u8(name.len() as u8);
        dst.put_slice(name);
        dst.put_u32(frame.payload.len() as u32);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}
