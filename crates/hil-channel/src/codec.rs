//! Message codec boundary
//!
//! Channels move opaque byte payloads. Framing belongs to an external
//! message codec; the only things a transport needs from it are the fixed
//! header length and the fixed trailing check-value length, described by a
//! [`FrameLayout`]. The last header byte carries the payload length.
//!
//! ```text
//! | header (header_len) ... len | payload (len) | check (check_len) |
//! ```
//!
//! [`ChecksumCodec`] is the stock codec for this layout, closing each frame
//! with a CRC-16.

use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// Fixed framing lengths of a message codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameLayout {
    /// Header length in bytes; the last header byte is the payload length
    pub header_len: usize,
    /// Trailing check-value (CRC) length in bytes
    pub check_len: usize,
}

impl FrameLayout {
    /// Create a layout from the two codec lengths
    pub const fn new(header_len: usize, check_len: usize) -> Self {
        Self {
            header_len,
            check_len,
        }
    }

    /// Payload length announced by a complete header
    ///
    /// A zero-length header announces an empty payload.
    pub fn payload_len(&self, header: &[u8]) -> Option<usize> {
        match self.header_len {
            0 => Some(0),
            n => header.get(n - 1).map(|&len| len as usize),
        }
    }

    /// Total frame length once the header is available
    pub fn frame_len(&self, header: &[u8]) -> Option<usize> {
        self.payload_len(header)
            .map(|len| self.header_len + len + self.check_len)
    }

    /// Verify that `frame` is exactly as long as its header announces
    pub fn check(&self, frame: &[u8]) -> Result<(), CodecError> {
        if frame.len() < self.header_len {
            return Err(CodecError::Incomplete {
                needed: self.header_len - frame.len(),
            });
        }
        let announced = self.payload_len(frame).unwrap_or(0);
        let actual = frame.len() - self.header_len;
        let actual = actual.saturating_sub(self.check_len);
        if frame.len() != self.header_len + announced + self.check_len {
            return Err(CodecError::LengthMismatch { announced, actual });
        }
        Ok(())
    }
}

/// Streaming splitter turning a byte stream into complete frames
///
/// Bytes are pushed as they arrive; complete frames are pulled out in
/// order. Partial frames stay buffered until the rest arrives.
#[derive(Debug, Clone)]
pub struct FrameAssembler {
    layout: FrameLayout,
    buffer: Vec<u8>,
}

impl FrameAssembler {
    /// Create an empty assembler for `layout`
    pub fn new(layout: FrameLayout) -> Self {
        Self {
            layout,
            buffer: Vec::new(),
        }
    }

    /// Layout this assembler splits on
    pub fn layout(&self) -> FrameLayout {
        self.layout
    }

    /// Append received bytes
    pub fn push_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Extract the next complete frame, if one is buffered
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        if self.buffer.len() < self.layout.header_len {
            return None;
        }
        let frame_len = self.layout.frame_len(&self.buffer)?;
        if self.buffer.len() < frame_len {
            return None;
        }
        let rest = self.buffer.split_off(frame_len);
        Some(std::mem::replace(&mut self.buffer, rest))
    }

    /// Number of bytes waiting for the rest of their frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partially received frame
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// Encoder/decoder for structured messages carried in frames
pub trait MessageCodec: Send + Sync {
    /// Structured message type
    type Message: Send + Sync;

    /// Fixed header and check-value lengths
    fn layout(&self) -> FrameLayout;

    /// Serialize a message into one complete frame
    fn encode(&self, message: &Self::Message) -> Result<Vec<u8>, CodecError>;

    /// Parse one complete frame
    fn decode(&self, frame: &[u8]) -> Result<Self::Message, CodecError>;
}

/// Message carried by a [`ChecksumCodec`] frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramedMessage {
    /// Header fields preceding the length byte
    pub header: Vec<u8>,
    pub payload: Vec<u8>,
}

impl FramedMessage {
    pub fn new(header: impl Into<Vec<u8>>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            header: header.into(),
            payload: payload.into(),
        }
    }
}

/// Length-prefixed codec with a trailing CRC-16/CCITT-FALSE check value
///
/// The check value covers header and payload and is written big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumCodec {
    layout: FrameLayout,
}

impl ChecksumCodec {
    /// Check-value length of every frame
    pub const CHECK_LEN: usize = 2;

    /// Codec for headers of `header_len` bytes, length byte included
    ///
    /// A zero `header_len` is raised to one so the length byte exists.
    pub fn new(header_len: usize) -> Self {
        Self {
            layout: FrameLayout::new(header_len.max(1), Self::CHECK_LEN),
        }
    }

    fn fields_len(&self) -> usize {
        self.layout.header_len - 1
    }
}

impl MessageCodec for ChecksumCodec {
    type Message = FramedMessage;

    fn layout(&self) -> FrameLayout {
        self.layout
    }

    fn encode(&self, message: &FramedMessage) -> Result<Vec<u8>, CodecError> {
        if message.header.len() != self.fields_len() {
            return Err(CodecError::Invalid(format!(
                "header has {} bytes, expected {}",
                message.header.len(),
                self.fields_len()
            )));
        }
        let len = u8::try_from(message.payload.len()).map_err(|_| {
            CodecError::Invalid(format!(
                "payload of {} bytes does not fit a length byte",
                message.payload.len()
            ))
        })?;

        let mut frame = Vec::with_capacity(self.layout.header_len + message.payload.len() + 2);
        frame.extend_from_slice(&message.header);
        frame.push(len);
        frame.extend_from_slice(&message.payload);
        frame.extend_from_slice(&crc16(&frame).to_be_bytes());
        Ok(frame)
    }

    fn decode(&self, frame: &[u8]) -> Result<FramedMessage, CodecError> {
        self.layout.check(frame)?;
        let (body, check) = frame.split_at(frame.len() - Self::CHECK_LEN);
        let expected = crc16(body);
        let actual = u16::from_be_bytes([check[0], check[1]]);
        if expected != actual {
            return Err(CodecError::ChecksumMismatch { expected, actual });
        }
        Ok(FramedMessage {
            header: body[..self.fields_len()].to_vec(),
            payload: body[self.layout.header_len..].to_vec(),
        })
    }
}

/// CRC-16/CCITT-FALSE (poly 0x1021, init 0xFFFF)
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0xFFFF, |crc, &byte| {
        (0..8).fold(crc ^ (u16::from(byte) << 8), |crc, _| {
            if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            }
        })
    })
}
