//! Background capture of a target's log output
//!
//! Many targets print diagnostics on a second stream next to their data
//! channel (a debug UART, an RTT log buffer). [`LogCapture`] wraps the data
//! transport and, for as long as it is open, runs a task reading that
//! stream line by line. Every line is logged on [`CAPTURE_TARGET`] and
//! optionally forwarded to a sink.
//!
//! The capture task is started by `open` and stopped (and awaited) by
//! `close`. A log stream that cannot be connected is reported but does not
//! fail the open.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::transport::{Frame, Transport};

/// Log target of captured lines
pub const CAPTURE_TARGET: &str = "hil_channel::capture";

/// Byte stream a [`LogCapture`] reads from
pub type LogStream = Box<dyn AsyncRead + Send + Unpin>;

/// Connects to a target's log stream
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Open the stream; called on every transport open
    async fn connect(&self) -> Result<LogStream, TransportError>;
}

struct CaptureTask {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Transport wrapper capturing log output while the transport is open
pub struct LogCapture<T> {
    label: String,
    inner: T,
    source: Arc<dyn LogSource>,
    sink: Option<mpsc::UnboundedSender<String>>,
    task: Option<CaptureTask>,
}

impl<T: Transport + fmt::Debug> fmt::Debug for LogCapture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogCapture")
            .field("label", &self.label)
            .field("inner", &self.inner)
            .field("capturing", &self.is_capturing())
            .finish()
    }
}

impl<T: Transport> LogCapture<T> {
    /// Wrap `inner`, capturing from `source`; `label` tags captured lines
    pub fn new(label: impl Into<String>, inner: T, source: impl LogSource + 'static) -> Self {
        Self {
            label: label.into(),
            inner,
            source: Arc::new(source),
            sink: None,
            task: None,
        }
    }

    /// Also forward every captured line to `sink`
    pub fn with_sink(mut self, sink: mpsc::UnboundedSender<String>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Whether a capture task is running
    pub fn is_capturing(&self) -> bool {
        self.task
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    async fn start_capture(&mut self) {
        self.stop_capture().await;
        let stream = match self.source.connect().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(channel = %self.label, "log capture unavailable: {}", e);
                return;
            }
        };
        let (stop, stopped) = oneshot::channel();
        let handle = tokio::spawn(capture_lines(
            self.label.clone(),
            stream,
            self.sink.clone(),
            stopped,
        ));
        info!(channel = %self.label, "log capture started");
        self.task = Some(CaptureTask { stop, handle });
    }

    async fn stop_capture(&mut self) {
        let Some(CaptureTask { stop, handle }) = self.task.take() else {
            return;
        };
        // The task may already have ended on its own
        let _ = stop.send(());
        if let Err(e) = handle.await {
            warn!(channel = %self.label, "log capture task failed: {}", e);
        }
        info!(channel = %self.label, "log capture stopped");
    }
}

async fn capture_lines(
    label: String,
    stream: LogStream,
    sink: Option<mpsc::UnboundedSender<String>>,
    mut stopped: oneshot::Receiver<()>,
) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        tokio::select! {
            _ = &mut stopped => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    info!(target: CAPTURE_TARGET, channel = %label, "{}", line);
                    if let Some(sink) = &sink {
                        let _ = sink.send(line);
                    }
                }
                Ok(None) => {
                    debug!(channel = %label, "log stream ended");
                    break;
                }
                Err(e) => {
                    warn!(channel = %label, "log stream read failed: {}", e);
                    break;
                }
            },
        }
    }
}

#[async_trait]
impl<T: Transport> Transport for LogCapture<T> {
    async fn open(&mut self) -> Result<(), TransportError> {
        self.inner.open().await?;
        self.start_capture().await;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.stop_capture().await;
        self.inner.close().await
    }

    async fn send(&mut self, payload: &[u8], destination: Option<u32>) -> Result<(), TransportError> {
        self.inner.send(payload, destination).await
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Option<Frame>, TransportError> {
        self.inner.receive(timeout).await
    }
}
