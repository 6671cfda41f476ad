//! Serial port transport
//!
//! Opens the port with `tokio_serial` on `open` and drops it on `close`.
//! When a [`FrameLayout`] is configured, received bytes are reassembled into
//! complete codec frames; otherwise every read chunk is delivered as one
//! frame.
//!
//! A [`SerialLogSource`] opens a second port carrying the target's log
//! output, for use with [`LogCapture`](crate::LogCapture).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, trace};

use crate::capture::{LogSource, LogStream};
use crate::codec::{FrameAssembler, FrameLayout};
use crate::error::TransportError;
use crate::transport::{Frame, Transport};

fn default_baud_rate() -> u32 {
    115_200
}

/// Serial connector settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Port path (`/dev/ttyUSB0`, `COM3`)
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Codec framing used to split the byte stream
    #[serde(default)]
    pub layout: Option<FrameLayout>,
    /// Port carrying the target's log output, captured while open
    #[serde(default)]
    pub log_port: Option<String>,
}

impl SerialConfig {
    /// Settings for `port` at the default baud rate, without framing
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: default_baud_rate(),
            layout: None,
            log_port: None,
        }
    }
}

/// Transport hooks over a serial port
pub struct SerialTransport {
    config: SerialConfig,
    stream: Option<SerialStream>,
    assembler: Option<FrameAssembler>,
    buffer: Vec<u8>,
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("config", &self.config)
            .field("open", &self.stream.is_some())
            .finish()
    }
}

impl SerialTransport {
    /// Create closed hooks for `config`
    pub fn new(config: SerialConfig) -> Self {
        let assembler = config.layout.map(FrameAssembler::new);
        Self {
            config,
            stream: None,
            assembler,
            buffer: vec![0u8; 1024],
        }
    }

    /// Configured settings
    pub fn config(&self) -> &SerialConfig {
        &self.config
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        let stream = tokio_serial::new(&self.config.port, self.config.baud_rate)
            .timeout(Duration::from_millis(100))
            .open_native_async()?;
        if let Some(assembler) = &mut self.assembler {
            assembler.clear();
        }
        debug!(port = %self.config.port, baud = self.config.baud_rate, "serial port opened");
        self.stream = Some(stream);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.stream.take().is_some() {
            debug!(port = %self.config.port, "serial port closed");
        }
        Ok(())
    }

    async fn send(&mut self, payload: &[u8], _destination: Option<u32>) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotOpen)?;
        stream.write_all(payload).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Option<Frame>, TransportError> {
        let Self {
            config,
            stream,
            assembler,
            buffer,
        } = self;
        let stream = stream.as_mut().ok_or(TransportError::NotOpen)?;
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(frame) = assembler.as_mut().and_then(FrameAssembler::next_frame) {
                return Ok(Some(Frame::new(frame, None)));
            }

            let n = match tokio::time::timeout_at(deadline, stream.read(buffer)).await {
                Err(_) => return Ok(None),
                Ok(Ok(n)) => n,
                Ok(Err(e))
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
                    ) =>
                {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                    continue;
                }
                Ok(Err(e)) => return Err(e.into()),
            };
            if n == 0 {
                return Ok(None);
            }
            trace!(port = %config.port, "read {:02X?}", &buffer[..n]);

            match assembler {
                Some(assembler) => assembler.push_bytes(&buffer[..n]),
                None => return Ok(Some(Frame::new(&buffer[..n], None))),
            }
        }
    }
}

/// Log stream read from a dedicated serial port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialLogSource {
    port: String,
    baud_rate: u32,
}

impl SerialLogSource {
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
        }
    }
}

#[async_trait]
impl LogSource for SerialLogSource {
    async fn connect(&self) -> Result<LogStream, TransportError> {
        let stream = tokio_serial::new(&self.port, self.baud_rate).open_native_async()?;
        debug!(port = %self.port, "serial log port opened");
        Ok(Box::new(stream))
    }
}
