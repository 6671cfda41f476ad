//! Transport hooks
//!
//! A [`Transport`] is the only point where a concrete driver plugs into a
//! [`Channel`](crate::Channel). The channel owns exclusivity and lifecycle
//! bookkeeping; the transport only moves bytes on its medium.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::TransportError;

/// Data produced by a transport (or delivered to a linked auxiliary)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Raw payload bytes
    pub payload: Vec<u8>,
    /// Opaque origin hint (e.g. a remote CAN id)
    pub source: Option<u32>,
}

impl Frame {
    /// Create a frame with a source hint
    pub fn new(payload: impl Into<Vec<u8>>, source: Option<u32>) -> Self {
        Self {
            payload: payload.into(),
            source,
        }
    }
}

/// Data a linked auxiliary wants transmitted on the physical channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Raw payload bytes
    pub payload: Vec<u8>,
    /// Opaque destination hint, passed through unmodified
    pub destination: Option<u32>,
}

impl Command {
    /// Create a command with a destination hint
    pub fn new(payload: impl Into<Vec<u8>>, destination: Option<u32>) -> Self {
        Self {
            payload: payload.into(),
            destination,
        }
    }
}

/// Byte-level hooks a medium-specific driver must supply
///
/// Timeouts are not errors: `receive` returns `Ok(None)` when nothing
/// arrived within the bounded wait.
#[async_trait]
pub trait Transport: Send {
    /// Acquire the underlying medium
    async fn open(&mut self) -> Result<(), TransportError>;

    /// Release the underlying medium
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Write one payload to the medium
    async fn send(&mut self, payload: &[u8], destination: Option<u32>)
        -> Result<(), TransportError>;

    /// Wait up to `timeout` for one frame
    async fn receive(&mut self, timeout: Duration) -> Result<Option<Frame>, TransportError>;
}
