//! HIL Channel Contract
//!
//! This crate provides the thread-safe connector contract shared by every
//! communication channel of the hardware-in-the-loop harness, plus the
//! transports that plug into it.
//!
//! # Architecture
//!
//! - A [`Transport`] supplies the medium-specific hooks (open, close, send,
//!   receive)
//! - A [`Channel`] wraps one transport behind a non-blocking exclusivity
//!   guard; contention is reported as [`ChannelError::Busy`], never queued
//! - A [`VirtualChannel`] is a channel backed by in-memory queues, shared
//!   with a dispatch engine through a [`ProxyLink`]
//! - A [`SerialTransport`] drives a real serial port
//! - A [`LogCapture`] wraps any transport and records the target's log
//!   output while it is open
//!
//! # Example
//!
//! ```rust,no_run
//! use hil_channel::{Channel, SerialConfig, SerialTransport, DEFAULT_RECEIVE_TIMEOUT};
//!
//! # async fn example() -> Result<(), hil_channel::ChannelError> {
//! let channel = Channel::new("uart", SerialTransport::new(SerialConfig::new("/dev/ttyUSB0")));
//! channel.open().await?;
//! channel.send(&[0x01, 0x02], None).await?;
//! let _frame = channel.receive(DEFAULT_RECEIVE_TIMEOUT).await?;
//! channel.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod channel;
pub mod codec;
pub mod connector;
pub mod error;
pub mod proxy;
pub mod serial;
pub mod transport;

pub use capture::{LogCapture, LogSource, LogStream, CAPTURE_TARGET};
pub use channel::{Channel, DEFAULT_RECEIVE_TIMEOUT};
pub use codec::{ChecksumCodec, FrameAssembler, FrameLayout, FramedMessage, MessageCodec};
pub use connector::{Connector, ConnectorScope};
pub use error::{ChannelError, CodecError, TransportError};
pub use proxy::{ProxyLink, VirtualChannel, VirtualTransport};
pub use serial::{SerialConfig, SerialLogSource, SerialTransport};
pub use transport::{Command, Frame, Transport};
