//! Error types for channels, transports and codecs

use thiserror::Error;

/// Errors raised by a transport hook
#[derive(Debug, Error)]
pub enum TransportError {
    /// I/O error on the underlying medium
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port error
    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// Transport used before it was opened (or after it was closed)
    #[error("transport is not open")]
    NotOpen,

    /// Driver-specific failure
    #[error("transport failure: {0}")]
    Failed(String),
}

/// Errors raised by the thread-safe channel contract
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The exclusivity guard is held by another caller
    #[error("channel {0} is busy")]
    Busy(String),

    /// The channel has no open transport
    #[error("channel {0} is not open")]
    NotOpen(String),

    /// The transport hook failed
    #[error("channel {channel}: {source}")]
    Transport {
        /// Name of the channel whose hook failed
        channel: String,
        /// Underlying transport failure
        #[source]
        source: TransportError,
    },

    /// A message could not be encoded, or a received frame decoded
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

impl ChannelError {
    /// Whether the caller may simply retry (or back off) later
    pub fn is_busy(&self) -> bool {
        matches!(self, ChannelError::Busy(_))
    }
}

/// Errors raised while splitting or decoding frames
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Buffer is incomplete - need more data
    #[error("incomplete frame: need {needed} more bytes")]
    Incomplete { needed: usize },

    /// Payload length in the header disagrees with the frame size
    #[error("length mismatch: header announces {announced} payload bytes, frame carries {actual}")]
    LengthMismatch { announced: usize, actual: usize },

    /// Trailing check value disagrees with the frame content
    #[error("checksum mismatch: expected 0x{expected:04X}, got 0x{actual:04X}")]
    ChecksumMismatch { expected: u16, actual: u16 },

    /// Frame content is not a valid message
    #[error("invalid frame: {0}")]
    Invalid(String),
}
