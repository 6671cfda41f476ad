//! Dispatch engine
//!
//! The engine owns the physical [`Channel`] and a fixed set of linked
//! virtual channels, and moves traffic between them on every worker
//! iteration:
//!
//! 1. **Downlink fan-out**: one bounded receive on the physical channel; a
//!    received frame is copied to every linked virtual channel.
//! 2. **Uplink drain**: each linked virtual channel, in link order, is
//!    drained of the commands queued when its turn starts. Every command is
//!    written once to the physical channel, then echoed to every *other*
//!    linked channel.
//!
//! A failed transfer is logged and the affected frame or command dropped.
//! The engine then closes and reopens the physical channel itself and
//! carries on with the remaining traffic. When the physical channel is
//! contended, queued commands are kept and the worker backs off for one
//! command poll before the next iteration.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hil_channel::{Channel, ChannelError, Command, Frame, ProxyLink};
use tracing::{debug, error, info, trace, warn, Dispatch};

use crate::config::ProxyAuxiliaryConfig;
use crate::error::ProxyError;
use crate::lifecycle::{Auxiliary, StopSignal};
use crate::logging::trace_file_dispatch;
use crate::registry::AliasResolver;

/// Log target for per-frame traffic tracing
pub const TRACE_TARGET: &str = "hil_proxy::trace";

/// Tunables of a [`DispatchEngine`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Bounded wait of each physical receive
    pub receive_timeout: Duration,
    /// Control-command wait while the physical channel is not operational
    /// or contended
    pub command_poll: Duration,
    /// Log every frame and command at `info` on [`TRACE_TARGET`]
    pub trace: bool,
    /// Also write traced traffic to this file
    pub trace_file: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            receive_timeout: Duration::from_millis(10),
            command_poll: Duration::from_millis(10),
            trace: false,
            trace_file: None,
        }
    }
}

/// One linked auxiliary's virtual channel, as seen by the engine
#[derive(Debug, Clone)]
pub struct LinkedChannel {
    alias: String,
    link: ProxyLink,
}

impl LinkedChannel {
    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn link(&self) -> &ProxyLink {
        &self.link
    }
}

/// Multiplexes one physical channel across several linked auxiliaries
pub struct DispatchEngine {
    name: String,
    physical: Arc<Channel>,
    links: Box<[LinkedChannel]>,
    config: EngineConfig,
    trace_sink: Option<Dispatch>,
    /// Set when the last iteration hit contention or a failure
    backoff: AtomicBool,
    stop: StopSignal,
}

impl std::fmt::Debug for DispatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchEngine")
            .field("name", &self.name)
            .field("physical", &self.physical.name())
            .field(
                "links",
                &self.links.iter().map(LinkedChannel::alias).collect::<Vec<_>>(),
            )
            .field("config", &self.config)
            .finish()
    }
}

macro_rules! traffic {
    ($engine:expr, $($arg:tt)+) => {
        if $engine.config.trace {
            info!(target: TRACE_TARGET, engine = %$engine.name, $($arg)+);
            if let Some(sink) = &$engine.trace_sink {
                tracing::dispatcher::with_default(sink, || {
                    info!(target: TRACE_TARGET, engine = %$engine.name, $($arg)+);
                });
            }
        } else {
            trace!(target: TRACE_TARGET, engine = %$engine.name, $($arg)+);
        }
    };
}

impl DispatchEngine {
    /// Resolve `aliases` and link their virtual channels to `physical`
    ///
    /// Aliases that do not resolve are logged and skipped. A resolved
    /// auxiliary that is not proxy-capable aborts construction.
    pub fn new<S: AsRef<str>>(
        name: impl Into<String>,
        physical: Arc<Channel>,
        aliases: &[S],
        resolver: &dyn AliasResolver,
        config: EngineConfig,
    ) -> Result<Self, ProxyError> {
        let name = name.into();
        let mut links = Vec::with_capacity(aliases.len());

        for alias in aliases.iter().map(AsRef::as_ref) {
            let Some(aux) = resolver.resolve(alias) else {
                error!(engine = %name, "Auxiliary {alias} does not exist");
                continue;
            };
            if !aux.is_proxy_capable() {
                return Err(ProxyError::NotProxyCapable {
                    alias: alias.to_string(),
                });
            }
            let link = aux.proxy_link().ok_or_else(|| ProxyError::MissingProxyLink {
                alias: alias.to_string(),
            })?;
            debug!(engine = %name, %alias, "linked auxiliary");
            links.push(LinkedChannel {
                alias: alias.to_string(),
                link,
            });
        }

        let trace_sink = match (&config.trace_file, config.trace) {
            (Some(path), true) => {
                let sink = trace_file_dispatch(path).map_err(|source| ProxyError::TraceFile {
                    path: path.clone(),
                    source,
                })?;
                info!(engine = %name, path = %path.display(), "tracing traffic to file");
                Some(sink)
            }
            _ => None,
        };

        info!(
            engine = %name,
            physical = physical.name(),
            linked = links.len(),
            "dispatch engine created"
        );
        Ok(Self {
            name,
            physical,
            links: links.into_boxed_slice(),
            config,
            trace_sink,
            backoff: AtomicBool::new(false),
            stop: StopSignal::new(),
        })
    }

    /// Build an engine from its configuration entry
    pub fn from_config(
        name: impl Into<String>,
        config: &ProxyAuxiliaryConfig,
        physical: Arc<Channel>,
        resolver: &dyn AliasResolver,
    ) -> Result<Self, ProxyError> {
        Self::new(
            name,
            physical,
            &config.aux_list,
            resolver,
            config.engine_config(),
        )
    }

    /// Linked channels, in link order
    pub fn linked(&self) -> &[LinkedChannel] {
        &self.links
    }

    pub fn physical(&self) -> &Arc<Channel> {
        &self.physical
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Receive at most one frame from the physical channel and fan it out
    ///
    /// Returns whether a frame was distributed. A failed receive reopens
    /// the physical channel.
    pub async fn receive_downlink(&self) -> bool {
        let frame = match self.physical.receive(self.config.receive_timeout).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return false,
            Err(e @ ChannelError::Transport { .. }) => {
                error!(engine = %self.name, "encountered error while receiving message: {}", e);
                self.backoff.store(true, Ordering::Release);
                self.recover().await;
                return false;
            }
            Err(e) => {
                debug!(engine = %self.name, "physical receive skipped: {}", e);
                self.backoff.store(true, Ordering::Release);
                return false;
            }
        };
        traffic!(self, source = ?frame.source, "received {:02X?}", frame.payload);

        for linked in self.links.iter() {
            linked.link.push_outbound(frame.clone());
        }
        true
    }

    /// Transmit the commands queued on every linked channel
    ///
    /// Each channel is drained of the commands present when its turn
    /// starts; commands queued meanwhile wait for the next call. Returns
    /// the number of commands written to the physical channel.
    pub async fn drain_uplink(&self) -> usize {
        let mut written = 0;
        for (index, linked) in self.links.iter().enumerate() {
            for _ in 0..linked.link.inbound_len() {
                let Some(command) = linked.link.pop_inbound() else {
                    break;
                };
                traffic!(
                    self,
                    from = %linked.alias,
                    destination = ?command.destination,
                    "send {:02X?}",
                    command.payload
                );
                match self
                    .physical
                    .send(&command.payload, command.destination)
                    .await
                {
                    Ok(()) => {
                        written += 1;
                        self.dispatch_command(index, &command);
                    }
                    Err(e @ ChannelError::Transport { .. }) => {
                        error!(
                            engine = %self.name,
                            from = %linked.alias,
                            "encountered error while sending message: {}", e
                        );
                        self.recover().await;
                    }
                    Err(e) => {
                        debug!(engine = %self.name, from = %linked.alias, "command kept for later: {}", e);
                        linked.link.requeue_inbound(command);
                        self.backoff.store(true, Ordering::Release);
                        return written;
                    }
                }
            }
        }
        written
    }

    /// Echo a transmitted command to every linked channel except its origin
    pub fn dispatch_command(&self, origin: usize, command: &Command) {
        let frame = Frame::new(command.payload.clone(), command.destination);
        for (index, linked) in self.links.iter().enumerate() {
            if index != origin {
                linked.link.push_outbound(frame.clone());
            }
        }
    }

    /// Close and reopen the physical channel after a failed transfer
    ///
    /// Returns whether the channel is operational again.
    pub async fn recover(&self) -> bool {
        warn!(engine = %self.name, "reopening physical channel after transfer failure");
        if let Err(e) = self.physical.close().await {
            error!(engine = %self.name, "Error encountered during channel closure: {}", e);
        }
        match self.physical.open().await {
            Ok(()) => {
                info!(engine = %self.name, "physical channel reopened");
                true
            }
            Err(e) => {
                error!(engine = %self.name, "Unable to reopen proxy channel: {}", e);
                self.backoff.store(true, Ordering::Release);
                false
            }
        }
    }
}

#[async_trait]
impl Auxiliary for DispatchEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    async fn create_instance(&mut self) -> bool {
        info!(engine = %self.name, "Create auxiliary instance");
        match self.physical.open().await {
            Ok(()) => true,
            Err(e) => {
                error!(engine = %self.name, "Unable to open proxy channel: {}", e);
                self.stop.set();
                false
            }
        }
    }

    async fn delete_instance(&mut self) -> bool {
        match self.physical.close().await {
            Ok(()) => info!(engine = %self.name, "Delete auxiliary instance"),
            Err(e) => error!(engine = %self.name, "Error encountered during channel closure: {}", e),
        }
        true
    }

    async fn run_cycle(&mut self) {
        self.backoff.store(false, Ordering::Release);
        if !self.physical.is_open() {
            return;
        }
        if self.physical.is_faulted() && !self.recover().await {
            return;
        }
        self.receive_downlink().await;
        self.drain_uplink().await;
    }

    fn command_wait(&self) -> Option<Duration> {
        // The physical receive is the only suspension point of a clean
        // iteration; anything else waits on the control queue instead
        if self.physical.is_operational() && !self.backoff.load(Ordering::Acquire) {
            None
        } else {
            Some(self.config.command_poll)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::AuxiliaryWorker;
    use crate::registry::Registry;
    use crate::CommunicationAuxiliary;
    use hil_channel::{Transport, TransportError, VirtualChannel};
    use hil_sim::{Hook, SimulatedTarget, TargetHandle};
    use proptest::prelude::*;

    fn setup(aliases: &[&str]) -> (DispatchEngine, TargetHandle, Vec<ProxyLink>) {
        let registry = Registry::new();
        let mut links = Vec::new();
        for alias in aliases {
            let virtual_channel = VirtualChannel::new(format!("{alias}_channel"));
            links.push(virtual_channel.link().clone());
            registry.register(Arc::new(CommunicationAuxiliary::over_virtual(
                *alias,
                &virtual_channel,
            )));
        }
        let (target, handle) = SimulatedTarget::new("dut");
        let physical = Arc::new(Channel::new("physical", target));
        let engine = DispatchEngine::new(
            "proxy",
            physical,
            aliases,
            &registry,
            EngineConfig::default(),
        )
        .unwrap();
        (engine, handle, links)
    }

    fn drain_outbound(link: &ProxyLink) -> Vec<Frame> {
        std::iter::from_fn(|| link.pop_outbound()).collect()
    }

    #[tokio::test]
    async fn test_downlink_fans_out_to_every_link() {
        let (engine, handle, links) = setup(&["aux1", "aux2", "aux3"]);
        engine.physical().open().await.unwrap();
        handle.inject(Frame::new(vec![0x01, 0x02], Some(0x500)));

        assert!(engine.receive_downlink().await);
        for link in &links {
            assert_eq!(
                drain_outbound(link),
                vec![Frame::new(vec![0x01, 0x02], Some(0x500))]
            );
        }
        assert!(!engine.receive_downlink().await);
    }

    #[tokio::test]
    async fn test_uplink_writes_once_and_echoes_to_peers() {
        let (engine, handle, links) = setup(&["aux1", "aux2", "aux3"]);
        engine.physical().open().await.unwrap();
        links[0].push_inbound(Command::new(vec![0xAA], Some(1)));

        assert_eq!(engine.drain_uplink().await, 1);
        assert_eq!(handle.sent(), vec![Command::new(vec![0xAA], Some(1))]);
        assert!(drain_outbound(&links[0]).is_empty());
        assert_eq!(drain_outbound(&links[1]), vec![Frame::new(vec![0xAA], Some(1))]);
        assert_eq!(drain_outbound(&links[2]), vec![Frame::new(vec![0xAA], Some(1))]);
    }

    #[tokio::test]
    async fn test_echo_order_across_two_links() {
        let (engine, handle, links) = setup(&["a", "b"]);
        engine.physical().open().await.unwrap();
        links[0].push_inbound(Command::new(vec![1], None));
        links[0].push_inbound(Command::new(vec![2], None));
        links[1].push_inbound(Command::new(vec![3], None));

        assert_eq!(engine.drain_uplink().await, 3);
        let payloads: Vec<Vec<u8>> = handle.sent().into_iter().map(|c| c.payload).collect();
        assert_eq!(payloads, vec![vec![1], vec![2], vec![3]]);
        assert_eq!(
            drain_outbound(&links[1]),
            vec![Frame::new(vec![1], None), Frame::new(vec![2], None)]
        );
        assert_eq!(drain_outbound(&links[0]), vec![Frame::new(vec![3], None)]);
    }

    #[tokio::test]
    async fn test_failed_send_drops_only_that_command() {
        let (engine, handle, links) = setup(&["a", "b"]);
        engine.physical().open().await.unwrap();
        handle.fail_next(Hook::Send);
        links[0].push_inbound(Command::new(vec![1], None));
        links[0].push_inbound(Command::new(vec![2], None));
        links[1].push_inbound(Command::new(vec![3], None));

        assert_eq!(engine.drain_uplink().await, 2);
        assert_eq!(
            handle.sent(),
            vec![Command::new(vec![2], None), Command::new(vec![3], None)]
        );
        assert_eq!(drain_outbound(&links[1]), vec![Frame::new(vec![2], None)]);
        assert_eq!(drain_outbound(&links[0]), vec![Frame::new(vec![3], None)]);
        assert!(engine.physical().is_operational());
        assert_eq!(handle.opens(), 2);
        assert_eq!(handle.closes(), 1);
    }

    #[tokio::test]
    async fn test_failed_receive_reopens_physical_channel() {
        let (mut engine, handle, links) = setup(&["a", "b"]);
        assert!(engine.create_instance().await);
        handle.fail_next(Hook::Receive);

        engine.run_cycle().await;
        assert!(engine.physical().is_operational());
        assert_eq!(handle.opens(), 2);
        assert_eq!(engine.command_wait(), Some(Duration::from_millis(10)));

        handle.inject(Frame::new(vec![0x42], Some(9)));
        links[0].push_inbound(Command::new(vec![0x43], None));
        engine.run_cycle().await;
        assert_eq!(engine.command_wait(), None);
        assert_eq!(
            drain_outbound(&links[0]),
            vec![Frame::new(vec![0x42], Some(9))]
        );
        assert_eq!(
            drain_outbound(&links[1]),
            vec![Frame::new(vec![0x42], Some(9)), Frame::new(vec![0x43], None)]
        );
        assert_eq!(handle.sent(), vec![Command::new(vec![0x43], None)]);
    }

    #[tokio::test]
    async fn test_faulted_physical_channel_is_recovered_by_next_cycle() {
        let (mut engine, handle, _links) = setup(&["a"]);
        assert!(engine.create_instance().await);
        handle.fail_next(Hook::Send);
        assert!(engine.physical().send(&[0x01], None).await.is_err());
        assert!(engine.physical().is_faulted());

        engine.run_cycle().await;
        assert!(engine.physical().is_operational());
        engine.physical().send(&[0x02], None).await.unwrap();
        assert_eq!(handle.sent(), vec![Command::new(vec![0x02], None)]);
    }

    #[tokio::test]
    async fn test_contended_physical_channel_yields_to_other_tasks() {
        let (mut engine, handle, links) = setup(&["a", "b"]);
        assert!(engine.create_instance().await);
        let physical = Arc::clone(engine.physical());
        let holder =
            tokio::spawn(async move { physical.receive(Duration::from_millis(200)).await });
        tokio::task::yield_now().await;
        links[0].push_inbound(Command::new(vec![0x07], None));

        let worker = AuxiliaryWorker::spawn(engine);
        let held = tokio::time::timeout(Duration::from_secs(2), holder)
            .await
            .expect("holder starved by the engine")
            .unwrap();
        assert_eq!(held.unwrap(), None);

        assert!(handle.wait_for_sent(1, Duration::from_secs(2)).await);
        assert_eq!(handle.sent(), vec![Command::new(vec![0x07], None)]);
        assert_eq!(
            links[1].next_outbound(Duration::from_secs(2)).await,
            Some(Frame::new(vec![0x07], None))
        );
        worker.stop().await;
    }

    /// Physical transport whose every send queues another command
    struct RefillingTransport {
        link: ProxyLink,
    }

    #[async_trait]
    impl Transport for RefillingTransport {
        async fn open(&mut self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn send(&mut self, payload: &[u8], _: Option<u32>) -> Result<(), TransportError> {
            self.link.push_inbound(Command::new(payload, None));
            Ok(())
        }

        async fn receive(&mut self, _: Duration) -> Result<Option<Frame>, TransportError> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_uplink_drain_stops_at_queue_snapshot() {
        let registry = Registry::new();
        let virtual_channel = VirtualChannel::new("vc");
        let link = virtual_channel.link().clone();
        registry.register(Arc::new(CommunicationAuxiliary::over_virtual(
            "chatty",
            &virtual_channel,
        )));
        let physical = Arc::new(Channel::new(
            "physical",
            RefillingTransport { link: link.clone() },
        ));
        let engine = DispatchEngine::new(
            "proxy",
            physical,
            &["chatty"],
            &registry,
            EngineConfig::default(),
        )
        .unwrap();
        engine.physical().open().await.unwrap();
        link.push_inbound(Command::new(vec![1], None));
        link.push_inbound(Command::new(vec![2], None));

        let written = tokio::time::timeout(Duration::from_secs(2), engine.drain_uplink())
            .await
            .expect("drain did not terminate");
        assert_eq!(written, 2);
        assert_eq!(link.inbound_len(), 2);
    }

    #[tokio::test]
    async fn test_traffic_is_written_to_trace_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.log");
        let (target, handle) = SimulatedTarget::new("dut");
        let config = EngineConfig {
            trace: true,
            trace_file: Some(path.clone()),
            ..EngineConfig::default()
        };
        let engine = DispatchEngine::new(
            "proxy",
            Arc::new(Channel::new("physical", target)),
            &[] as &[&str],
            &Registry::new(),
            config,
        )
        .unwrap();
        engine.physical().open().await.unwrap();
        handle.inject(Frame::new(vec![0xCA, 0xFE], Some(3)));

        assert!(engine.receive_downlink().await);
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("received [CA, FE]"));
        assert!(text.contains("engine=proxy"));
    }

    #[test]
    fn test_unwritable_trace_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"").unwrap();
        let (target, _handle) = SimulatedTarget::new("dut");
        let config = EngineConfig {
            trace: true,
            trace_file: Some(blocker.join("proxy.log")),
            ..EngineConfig::default()
        };

        let result = DispatchEngine::new(
            "proxy",
            Arc::new(Channel::new("physical", target)),
            &[] as &[&str],
            &Registry::new(),
            config,
        );
        assert!(matches!(result, Err(ProxyError::TraceFile { .. })));
    }

    #[tokio::test]
    async fn test_non_capable_alias_aborts_construction() {
        let registry = Registry::new();
        let (target, _handle) = SimulatedTarget::new("dut");
        let plain = Arc::new(Channel::new("plain", target));
        registry.register(Arc::new(CommunicationAuxiliary::new("plain_aux", plain)));

        let (target, _handle) = SimulatedTarget::new("dut2");
        let result = DispatchEngine::new(
            "proxy",
            Arc::new(Channel::new("physical", target)),
            &["plain_aux"],
            &registry,
            EngineConfig::default(),
        );
        assert!(matches!(
            result,
            Err(ProxyError::NotProxyCapable { alias }) if alias == "plain_aux"
        ));
    }

    #[tokio::test]
    async fn test_closed_engine_waits_for_commands() {
        let (mut engine, handle, links) = setup(&["a", "b"]);
        links[0].push_inbound(Command::new(vec![1], None));

        assert_eq!(engine.command_wait(), Some(Duration::from_millis(10)));
        engine.run_cycle().await;
        assert!(handle.sent().is_empty());
        assert_eq!(links[0].inbound_len(), 1);

        assert!(engine.create_instance().await);
        assert_eq!(engine.command_wait(), None);
        engine.run_cycle().await;
        assert_eq!(handle.sent().len(), 1);
    }

    proptest! {
        #[test]
        fn downlink_reaches_every_link_exactly_once(
            link_count in 1usize..6,
            payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..8), 1..10),
        ) {
            let aliases: Vec<String> = (0..link_count).map(|i| format!("aux{i}")).collect();
            let aliases: Vec<&str> = aliases.iter().map(String::as_str).collect();
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            runtime.block_on(async {
                let (engine, handle, links) = setup(&aliases);
                engine.physical().open().await.unwrap();
                for (i, payload) in payloads.iter().enumerate() {
                    handle.inject(Frame::new(payload.clone(), Some(i as u32)));
                }
                for _ in &payloads {
                    assert!(engine.receive_downlink().await);
                }

                let expected: Vec<Frame> = payloads
                    .iter()
                    .enumerate()
                    .map(|(i, p)| Frame::new(p.clone(), Some(i as u32)))
                    .collect();
                for link in &links {
                    assert_eq!(drain_outbound(link), expected);
                }
            });
        }

        #[test]
        fn uplink_echo_skips_only_the_origin(
            commands in prop::collection::vec((0usize..4, any::<u8>()), 0..20),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            runtime.block_on(async {
                let (engine, handle, links) = setup(&["a", "b", "c", "d"]);
                engine.physical().open().await.unwrap();
                for (origin, byte) in &commands {
                    links[*origin].push_inbound(Command::new(vec![*byte], Some(*origin as u32)));
                }

                assert_eq!(engine.drain_uplink().await, commands.len());

                // Transmission order is link order, FIFO within a link
                let mut by_link = commands.clone();
                by_link.sort_by_key(|(origin, _)| *origin);
                let sent: Vec<(usize, u8)> = handle
                    .sent()
                    .iter()
                    .map(|c| (c.destination.unwrap() as usize, c.payload[0]))
                    .collect();
                assert_eq!(sent, by_link);

                for (index, link) in links.iter().enumerate() {
                    let expected: Vec<Frame> = by_link
                        .iter()
                        .filter(|(origin, _)| *origin != index)
                        .map(|(origin, byte)| Frame::new(vec![*byte], Some(*origin as u32)))
                        .collect();
                    assert_eq!(drain_outbound(link), expected);
                }
            });
        }
    }
}
