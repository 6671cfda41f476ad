//! Raw message auxiliary
//!
//! The simplest auxiliary: it exposes its channel's raw send and receive to
//! test code. Built over a [`VirtualChannel`] it is proxy-capable and can be
//! linked to a [`DispatchEngine`](crate::DispatchEngine).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hil_channel::{Channel, ChannelError, Frame, ProxyLink, VirtualChannel};
use tracing::{error, info};

use crate::lifecycle::{Auxiliary, StopSignal};
use crate::registry::LinkedAuxiliary;

/// Auxiliary sending and receiving raw payloads through one channel
#[derive(Debug, Clone)]
pub struct CommunicationAuxiliary {
    alias: String,
    channel: Arc<Channel>,
    link: Option<ProxyLink>,
    stop: StopSignal,
}

impl CommunicationAuxiliary {
    /// Auxiliary over a dedicated (non-shared) channel
    pub fn new(alias: impl Into<String>, channel: Arc<Channel>) -> Self {
        Self {
            alias: alias.into(),
            channel,
            link: None,
            stop: StopSignal::new(),
        }
    }

    /// Proxy-capable auxiliary over a virtual channel
    pub fn over_virtual(alias: impl Into<String>, channel: &VirtualChannel) -> Self {
        Self {
            alias: alias.into(),
            channel: Arc::clone(channel.channel()),
            link: Some(channel.link().clone()),
            stop: StopSignal::new(),
        }
    }

    pub async fn send_message(
        &self,
        payload: &[u8],
        destination: Option<u32>,
    ) -> Result<(), ChannelError> {
        self.channel.send(payload, destination).await
    }

    /// Wait up to `timeout` for one message; `Ok(None)` on timeout
    pub async fn receive_message(&self, timeout: Duration) -> Result<Option<Frame>, ChannelError> {
        self.channel.receive(timeout).await
    }
}

#[async_trait]
impl Auxiliary for CommunicationAuxiliary {
    fn name(&self) -> &str {
        &self.alias
    }

    fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    async fn create_instance(&mut self) -> bool {
        info!(auxiliary = %self.alias, "Create auxiliary instance");
        match self.channel.open().await {
            Ok(()) => true,
            Err(e) => {
                error!(auxiliary = %self.alias, "Unable to open channel: {}", e);
                false
            }
        }
    }

    async fn delete_instance(&mut self) -> bool {
        info!(auxiliary = %self.alias, "Delete auxiliary instance");
        match self.channel.close().await {
            Ok(()) => true,
            Err(e) => {
                error!(auxiliary = %self.alias, "Unable to close channel: {}", e);
                false
            }
        }
    }
}

impl LinkedAuxiliary for CommunicationAuxiliary {
    fn alias(&self) -> &str {
        &self.alias
    }

    fn is_proxy_capable(&self) -> bool {
        self.link.is_some()
    }

    fn channel(&self) -> Arc<Channel> {
        Arc::clone(&self.channel)
    }

    fn proxy_link(&self) -> Option<ProxyLink> {
        self.link.clone()
    }
}
