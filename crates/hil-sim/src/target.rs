//! Simulated device under test
//!
//! A [`SimulatedTarget`] is handed to a [`Channel`](hil_channel::Channel) as
//! its transport, while the paired [`TargetHandle`] stays with the test to
//! play the device side: injecting frames, inspecting what was sent and
//! arming failures. The handle can also act as the target's log output
//! through [`TargetHandle::log_source`] and [`TargetHandle::emit_log`].

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use hil_channel::{Command, Frame, LogSource, LogStream, Transport, TransportError};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Transport hook that can be armed to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    Open,
    Close,
    Send,
    Receive,
}

impl Hook {
    fn index(self) -> usize {
        match self {
            Hook::Open => 0,
            Hook::Close => 1,
            Hook::Send => 2,
            Hook::Receive => 3,
        }
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Hook::Open => "open",
            Hook::Close => "close",
            Hook::Send => "send",
            Hook::Receive => "receive",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Default)]
struct TargetState {
    open: bool,
    loopback: bool,
    opens: usize,
    closes: usize,
    /// One-shot failures, indexed by [`Hook::index`]
    armed: [bool; 4],
    inbox: VecDeque<Frame>,
    sent: Vec<Command>,
    log_connects: usize,
}

#[derive(Debug)]
struct Shared {
    name: String,
    state: Mutex<TargetState>,
    inbox_ready: Notify,
    sent_ready: Notify,
    /// Writing end of the log stream handed out by the last connect
    log: tokio::sync::Mutex<Option<DuplexStream>>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, TargetState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_failure(&self, hook: Hook) -> Result<(), TransportError> {
        let mut state = self.state();
        if std::mem::take(&mut state.armed[hook.index()]) {
            debug!(target_name = %self.name, %hook, "simulated hook failure");
            return Err(TransportError::Failed(format!(
                "simulated {hook} failure on {}",
                self.name
            )));
        }
        Ok(())
    }
}

/// Transport standing in for a physical medium
#[derive(Debug)]
pub struct SimulatedTarget {
    shared: Arc<Shared>,
}

/// Test-side control of a [`SimulatedTarget`]
#[derive(Debug, Clone)]
pub struct TargetHandle {
    shared: Arc<Shared>,
}

impl SimulatedTarget {
    /// Create a target and its handle
    pub fn new(name: impl Into<String>) -> (Self, TargetHandle) {
        let shared = Arc::new(Shared {
            name: name.into(),
            state: Mutex::new(TargetState::default()),
            inbox_ready: Notify::new(),
            sent_ready: Notify::new(),
            log: tokio::sync::Mutex::new(None),
        });
        (
            Self {
                shared: Arc::clone(&shared),
            },
            TargetHandle { shared },
        )
    }
}

impl TargetHandle {
    /// Target name
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Queue a frame for the next `receive`
    pub fn inject(&self, frame: Frame) {
        self.shared.state().inbox.push_back(frame);
        self.shared.inbox_ready.notify_one();
    }

    /// Frames injected but not yet received
    pub fn pending(&self) -> usize {
        self.shared.state().inbox.len()
    }

    /// Everything sent to the target so far, oldest first
    pub fn sent(&self) -> Vec<Command> {
        self.shared.state().sent.clone()
    }

    /// Take and forget everything sent so far
    pub fn take_sent(&self) -> Vec<Command> {
        std::mem::take(&mut self.shared.state().sent)
    }

    /// Wait up to `timeout` until at least `count` commands were sent
    ///
    /// Returns whether the count was reached.
    pub async fn wait_for_sent(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let ready = self.shared.sent_ready.notified();
            if self.shared.state().sent.len() >= count {
                return true;
            }
            if tokio::time::timeout_at(deadline, ready).await.is_err() {
                return self.shared.state().sent.len() >= count;
            }
        }
    }

    /// Whether the transport is currently open
    pub fn is_open(&self) -> bool {
        self.shared.state().open
    }

    /// Number of open hook calls
    pub fn opens(&self) -> usize {
        self.shared.state().opens
    }

    /// Number of close hook calls
    pub fn closes(&self) -> usize {
        self.shared.state().closes
    }

    /// Make the next call of `hook` fail
    pub fn fail_next(&self, hook: Hook) {
        self.shared.state().armed[hook.index()] = true;
    }

    /// Replay every sent command as a received frame
    pub fn set_loopback(&self, enabled: bool) {
        self.shared.state().loopback = enabled;
    }

    /// Log source reading what [`emit_log`](Self::emit_log) writes
    pub fn log_source(&self) -> TargetLog {
        TargetLog {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Number of times the log source was connected
    pub fn log_connects(&self) -> usize {
        self.shared.state().log_connects
    }

    /// Print one line on the target's log output
    ///
    /// Returns `false` when no reader is connected.
    pub async fn emit_log(&self, line: &str) -> bool {
        let mut log = self.shared.log.lock().await;
        let Some(writer) = log.as_mut() else {
            return false;
        };
        let written = writer.write_all(format!("{line}\n").as_bytes()).await;
        if written.is_err() {
            *log = None;
        }
        written.is_ok()
    }
}

/// Log output of a [`SimulatedTarget`], see [`TargetHandle::log_source`]
#[derive(Debug, Clone)]
pub struct TargetLog {
    shared: Arc<Shared>,
}

#[async_trait]
impl LogSource for TargetLog {
    async fn connect(&self) -> Result<LogStream, TransportError> {
        let (reader, writer) = tokio::io::duplex(4096);
        *self.shared.log.lock().await = Some(writer);
        self.shared.state().log_connects += 1;
        debug!(target_name = %self.shared.name, "simulated log connected");
        Ok(Box::new(reader))
    }
}

#[async_trait]
impl Transport for SimulatedTarget {
    async fn open(&mut self) -> Result<(), TransportError> {
        let mut state = self.shared.state();
        state.opens += 1;
        drop(state);
        self.shared.take_failure(Hook::Open)?;
        self.shared.state().open = true;
        debug!(target_name = %self.shared.name, "simulated target opened");
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        {
            let mut state = self.shared.state();
            state.closes += 1;
            state.open = false;
        }
        self.shared.take_failure(Hook::Close)?;
        debug!(target_name = %self.shared.name, "simulated target closed");
        Ok(())
    }

    async fn send(&mut self, payload: &[u8], destination: Option<u32>) -> Result<(), TransportError> {
        self.shared.take_failure(Hook::Send)?;
        let mut state = self.shared.state();
        if !state.open {
            return Err(TransportError::NotOpen);
        }
        trace!(target_name = %self.shared.name, ?destination, "target got {:02X?}", payload);
        state.sent.push(Command::new(payload, destination));
        if state.loopback {
            state.inbox.push_back(Frame::new(payload, destination));
            self.shared.inbox_ready.notify_one();
        }
        drop(state);
        self.shared.sent_ready.notify_waiters();
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Option<Frame>, TransportError> {
        self.shared.take_failure(Hook::Receive)?;
        let deadline = Instant::now() + timeout;
        loop {
            let ready = self.shared.inbox_ready.notified();
            {
                let mut state = self.shared.state();
                if !state.open {
                    return Err(TransportError::NotOpen);
                }
                if let Some(frame) = state.inbox.pop_front() {
                    return Ok(Some(frame));
                }
            }
            if tokio::time::timeout_at(deadline, ready).await.is_err() {
                return Ok(None);
            }
        }
    }
}
