//! Thread-safe channel contract
//!
//! A [`Channel`] guarantees exclusive use of one physical transport. Access
//! is arbitrated by a non-blocking guard: a caller that finds the guard held
//! is rejected immediately with [`ChannelError::Busy`], never queued. Callers
//! that need fairness implement their own backoff.
//!
//! # Guard rules
//!
//! - `open` claims a lease on the channel; a second `open` before `close`
//!   is rejected. A failing open hook keeps the lease, so `close` is still
//!   required afterwards.
//! - `send` / `receive` require the lease and hold the transport for the
//!   duration of the hook call; a concurrent `open`, `send` or `receive` is
//!   rejected. Transfers on a channel that is not open fail with
//!   [`ChannelError::NotOpen`] without reaching the transport.
//! - If a `send` or `receive` hook fails, the channel becomes *faulted* and
//!   rejects every further `send` / `receive` until it is closed. A failed
//!   transfer therefore always requires explicit recovery (close, then
//!   reopen); continued exclusivity must not be assumed.
//! - `close` waits for an in-flight hook, runs the close hook
//!   unconditionally, then releases the lease and clears any fault. `open`
//!   starts from a clean fault state as well.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use crate::codec::MessageCodec;
use crate::connector::{Connector, ConnectorScope};
use crate::error::{ChannelError, TransportError};
use crate::transport::{Frame, Transport};

/// Default bounded wait for [`Channel::receive`] callers
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_millis(100);

/// One physical (or virtual) transport behind an exclusivity guard
pub struct Channel {
    name: String,
    transport: Mutex<Box<dyn Transport>>,
    leased: AtomicBool,
    faulted: AtomicBool,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("transport", &"<transport>")
            .field("open", &self.is_open())
            .field("faulted", &self.is_faulted())
            .finish()
    }
}

impl Channel {
    /// Create a closed channel over a transport
    pub fn new(name: impl Into<String>, transport: impl Transport + 'static) -> Self {
        Self::from_boxed(name, Box::new(transport))
    }

    /// Create a closed channel over an already boxed transport
    pub fn from_boxed(name: impl Into<String>, transport: Box<dyn Transport>) -> Self {
        Self {
            name: name.into(),
            transport: Mutex::new(transport),
            leased: AtomicBool::new(false),
            faulted: AtomicBool::new(false),
        }
    }

    /// Channel alias, used in logs and errors
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the channel's lease is currently claimed by `open`
    pub fn is_open(&self) -> bool {
        self.leased.load(Ordering::Acquire)
    }

    /// Whether a failed transfer left the channel awaiting recovery
    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::Acquire)
    }

    /// Open and not faulted: transfers are expected to succeed
    pub fn is_operational(&self) -> bool {
        self.is_open() && !self.is_faulted()
    }

    /// Claim the channel and open its transport
    pub async fn open(&self) -> Result<(), ChannelError> {
        let Ok(mut transport) = self.transport.try_lock() else {
            debug!(channel = %self.name, "open rejected: operation in flight");
            return Err(self.busy());
        };
        if self.leased.swap(true, Ordering::AcqRel) {
            debug!(channel = %self.name, "open rejected: channel already claimed");
            return Err(self.busy());
        }
        self.faulted.store(false, Ordering::Release);

        debug!(channel = %self.name, "opening channel");
        transport
            .open()
            .await
            .map_err(|source| self.transport_error(source))
    }

    /// Close the transport and release the channel
    ///
    /// The lease is released even when the close hook fails; the hook's
    /// error is still reported.
    pub async fn close(&self) -> Result<(), ChannelError> {
        let mut transport = self.transport.lock().await;
        let result = transport.close().await;
        self.faulted.store(false, Ordering::Release);
        self.leased.store(false, Ordering::Release);
        debug!(channel = %self.name, "channel closed");
        result.map_err(|source| self.transport_error(source))
    }

    /// Send one raw payload
    pub async fn send(&self, payload: &[u8], destination: Option<u32>) -> Result<(), ChannelError> {
        let mut transport = self.acquire()?;
        trace!(channel = %self.name, ?destination, "send {:02X?}", payload);
        transport
            .send(payload, destination)
            .await
            .map_err(|source| self.fault(source))
    }

    /// Wait up to `timeout` for one raw frame
    ///
    /// `Ok(None)` means nothing arrived in time.
    pub async fn receive(&self, timeout: Duration) -> Result<Option<Frame>, ChannelError> {
        let mut transport = self.acquire()?;
        let frame = transport
            .receive(timeout)
            .await
            .map_err(|source| self.fault(source))?;
        if let Some(frame) = &frame {
            trace!(channel = %self.name, source = ?frame.source, "receive {:02X?}", frame.payload);
        }
        Ok(frame)
    }

    /// Encode `message` with `codec` and send it
    pub async fn send_message<C: MessageCodec>(
        &self,
        codec: &C,
        message: &C::Message,
        destination: Option<u32>,
    ) -> Result<(), ChannelError> {
        let bytes = codec.encode(message)?;
        self.send(&bytes, destination).await
    }

    /// Receive one frame and decode it with `codec`
    ///
    /// Returns the decoded message together with the frame's source hint.
    pub async fn receive_message<C: MessageCodec>(
        &self,
        codec: &C,
        timeout: Duration,
    ) -> Result<Option<(C::Message, Option<u32>)>, ChannelError> {
        let Some(frame) = self.receive(timeout).await? else {
            return Ok(None);
        };
        let message = codec.decode(&frame.payload)?;
        Ok(Some((message, frame.source)))
    }

    /// Open the channel for the lifetime of the returned scope
    pub async fn scope(self: &Arc<Self>) -> Result<ConnectorScope<Channel>, ChannelError> {
        ConnectorScope::enter(Arc::clone(self)).await
    }

    fn acquire(&self) -> Result<MutexGuard<'_, Box<dyn Transport>>, ChannelError> {
        let transport = self.transport.try_lock().map_err(|_| self.busy())?;
        if !self.is_open() {
            return Err(ChannelError::NotOpen(self.name.clone()));
        }
        if self.is_faulted() {
            debug!(channel = %self.name, "transfer rejected: channel faulted, close and reopen it");
            return Err(self.busy());
        }
        Ok(transport)
    }

    fn fault(&self, source: TransportError) -> ChannelError {
        if !self.faulted.swap(true, Ordering::AcqRel) {
            warn!(channel = %self.name, "transfer failed, channel needs close and reopen: {}", source);
        }
        self.transport_error(source)
    }

    fn busy(&self) -> ChannelError {
        ChannelError::Busy(self.name.clone())
    }

    fn transport_error(&self, source: TransportError) -> ChannelError {
        ChannelError::Transport {
            channel: self.name.clone(),
            source,
        }
    }
}

#[async_trait]
impl Connector for Channel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self) -> Result<(), ChannelError> {
        Channel::open(self).await
    }

    async fn close(&self) -> Result<(), ChannelError> {
        Channel::close(self).await
    }
}
