//! Auxiliary lifecycle worker
//!
//! Every auxiliary runs on one dedicated tokio task. External callers talk
//! to it through an [`AuxiliaryWorker`] handle, which queues typed
//! [`AuxCommand`]s and observes the published instance state. The task stops
//! cooperatively once its [`StopSignal`] is set; shutdown latency is bounded
//! by the auxiliary's poll interval.
//!
//! # Example
//!
//! ```rust,ignore
//! let worker = AuxiliaryWorker::spawn(engine);
//! assert!(worker.create_instance().await);
//! // ... run tests ...
//! worker.stop().await;
//! ```

use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

/// Default bounded wait for one control command
pub const DEFAULT_COMMAND_WAIT: Duration = Duration::from_millis(10);

/// Cooperative cancellation flag shared between a worker and its auxiliary
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request the worker to stop
    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Named operation queued to an auxiliary worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuxCommand {
    /// Acquire the auxiliary's resources
    CreateInstance,
    /// Release the auxiliary's resources
    DeleteInstance,
    /// Acknowledge an external abort
    Abort,
    /// Auxiliary-specific operation
    Custom(String),
}

impl FromStr for AuxCommand {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "create_auxiliary_instance" => AuxCommand::CreateInstance,
            "delete_auxiliary_instance" => AuxCommand::DeleteInstance,
            "abort" => AuxCommand::Abort,
            other => AuxCommand::Custom(other.to_string()),
        })
    }
}

impl fmt::Display for AuxCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuxCommand::CreateInstance => f.write_str("create_auxiliary_instance"),
            AuxCommand::DeleteInstance => f.write_str("delete_auxiliary_instance"),
            AuxCommand::Abort => f.write_str("abort"),
            AuxCommand::Custom(name) => f.write_str(name),
        }
    }
}

/// Behaviour plugged into an [`AuxiliaryWorker`]
#[async_trait]
pub trait Auxiliary: Send + 'static {
    /// Alias used in logs
    fn name(&self) -> &str;

    /// Signal the worker polls once per iteration
    fn stop_signal(&self) -> &StopSignal;

    /// Acquire resources; `true` on success
    async fn create_instance(&mut self) -> bool;

    /// Release resources; `true` on success
    async fn delete_instance(&mut self) -> bool;

    async fn abort(&mut self) -> bool {
        true
    }

    /// Handle a command the lifecycle does not know
    async fn run_custom(&mut self, command: &str) -> bool {
        warn!(auxiliary = self.name(), "unknown request {command}, will not be processed");
        false
    }

    /// Background work performed once per worker iteration
    async fn run_cycle(&mut self) {}

    /// How long to wait for a control command each iteration
    ///
    /// `Some(wait)` waits for at most one command. `None` drains pending
    /// commands without waiting and only yields to the scheduler, for
    /// auxiliaries whose `run_cycle` already waits on I/O.
    fn command_wait(&self) -> Option<Duration> {
        Some(DEFAULT_COMMAND_WAIT)
    }
}

/// State published by a worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuxState {
    /// Whether the auxiliary's instance currently exists
    pub is_instance: bool,
}

struct Request {
    command: AuxCommand,
    reply: Option<oneshot::Sender<bool>>,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("command", &self.command)
            .field("reply", &self.reply.as_ref().map(|_| "<sender>"))
            .finish()
    }
}

/// Handle to an auxiliary running on its own task
pub struct AuxiliaryWorker {
    name: String,
    requests: mpsc::UnboundedSender<Request>,
    state: watch::Receiver<AuxState>,
    stop: StopSignal,
    task: Option<JoinHandle<()>>,
}

impl fmt::Debug for AuxiliaryWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuxiliaryWorker")
            .field("name", &self.name)
            .field("state", &*self.state.borrow())
            .field("stopping", &self.stop.is_set())
            .finish()
    }
}

impl AuxiliaryWorker {
    /// Move `aux` onto a new task and return its handle
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<A: Auxiliary>(aux: A) -> Self {
        let name = aux.name().to_string();
        let stop = aux.stop_signal().clone();
        let (requests, rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(AuxState::default());

        let span = info_span!("auxiliary", name = %name);
        let task = tokio::spawn(run_worker(aux, rx, state_tx).instrument(span));

        Self {
            name,
            requests,
            state,
            stop,
            task: Some(task),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue `command` and wait for its success flag
    ///
    /// Returns `false` if the worker exits before answering.
    pub async fn request(&self, command: AuxCommand) -> bool {
        let (reply, response) = oneshot::channel();
        let request = Request {
            command,
            reply: Some(reply),
        };
        if self.requests.send(request).is_err() {
            return false;
        }
        response.await.unwrap_or(false)
    }

    /// Queue `command` without waiting for it to run
    pub fn submit(&self, command: AuxCommand) {
        let request = Request {
            command,
            reply: None,
        };
        if self.requests.send(request).is_err() {
            debug!(auxiliary = %self.name, "worker gone, request dropped");
        }
    }

    pub async fn create_instance(&self) -> bool {
        self.request(AuxCommand::CreateInstance).await
    }

    pub async fn delete_instance(&self) -> bool {
        self.request(AuxCommand::DeleteInstance).await
    }

    pub async fn abort(&self) -> bool {
        self.request(AuxCommand::Abort).await
    }

    pub async fn run_custom(&self, command: impl Into<String>) -> bool {
        self.request(AuxCommand::Custom(command.into())).await
    }

    /// Last published instance state
    pub fn is_instance(&self) -> bool {
        self.state.borrow().is_instance
    }

    /// Wait until the instance state equals `expected`
    ///
    /// Returns `false` if the worker exits first.
    pub async fn wait_for_instance(&self, expected: bool) -> bool {
        let mut state = self.state.clone();
        let reached = state.wait_for(|s| s.is_instance == expected).await.is_ok();
        reached
    }

    /// Whether the worker task has exited
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Set the stop signal and wait for the worker to exit
    pub async fn stop(mut self) {
        self.stop.set();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(auxiliary = %self.name, "worker task failed: {}", e);
            }
        }
    }
}

impl Drop for AuxiliaryWorker {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.stop.set();
        }
    }
}

async fn run_worker<A: Auxiliary>(
    mut aux: A,
    mut requests: mpsc::UnboundedReceiver<Request>,
    state: watch::Sender<AuxState>,
) {
    let stop = aux.stop_signal().clone();
    info!("auxiliary worker started");

    'run: while !stop.is_set() {
        aux.run_cycle().await;

        match aux.command_wait() {
            None => {
                loop {
                    match requests.try_recv() {
                        Ok(request) => handle_request(&mut aux, &state, request).await,
                        Err(mpsc::error::TryRecvError::Empty) => break,
                        Err(mpsc::error::TryRecvError::Disconnected) => break 'run,
                    }
                }
                tokio::task::yield_now().await;
            }
            Some(wait) => match tokio::time::timeout(wait, requests.recv()).await {
                Ok(Some(request)) => handle_request(&mut aux, &state, request).await,
                Ok(None) => break 'run,
                Err(_) => {}
            },
        }
    }

    if state.borrow().is_instance {
        debug!("deleting live instance on worker exit");
        let deleted = aux.delete_instance().await;
        state.send_modify(|s| s.is_instance = !deleted);
    }
    info!("auxiliary worker stopped");
}

async fn handle_request<A: Auxiliary>(
    aux: &mut A,
    state: &watch::Sender<AuxState>,
    request: Request,
) {
    let Request { command, reply } = request;
    let is_instance = state.borrow().is_instance;

    let ok = match &command {
        AuxCommand::CreateInstance if is_instance => {
            debug!("instance already exists, create ignored");
            true
        }
        AuxCommand::CreateInstance => {
            let created = aux.create_instance().await;
            state.send_modify(|s| s.is_instance = created);
            created
        }
        AuxCommand::DeleteInstance if !is_instance => {
            debug!("no instance to delete, delete ignored");
            true
        }
        AuxCommand::DeleteInstance => {
            let deleted = aux.delete_instance().await;
            state.send_modify(|s| s.is_instance = !deleted);
            deleted
        }
        AuxCommand::Abort => aux.abort().await,
        AuxCommand::Custom(name) => aux.run_custom(name).await,
    };
    debug!(%command, ok, "request processed");

    if let Some(reply) = reply {
        let _ = reply.send(ok);
    }
}
