//! Virtual channels for proxied auxiliaries
//!
//! A [`VirtualChannel`] satisfies the [`Channel`] contract without touching
//! any hardware. It is backed by two queues shared with the dispatch engine
//! through a [`ProxyLink`]:
//!
//! - *inbound*: commands the auxiliary sent, waiting to go out on the
//!   physical channel (auxiliary pushes, engine pops)
//! - *outbound*: frames destined for the auxiliary (engine pushes,
//!   auxiliary pops)
//!
//! Both queues are FIFO and emptied whenever the virtual channel is opened
//! or closed, so no stale data survives a reopen.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::channel::Channel;
use crate::error::TransportError;
use crate::transport::{Command, Frame, Transport};

#[derive(Debug, Default)]
struct ProxyQueues {
    inbound: Mutex<VecDeque<Command>>,
    outbound: Mutex<VecDeque<Frame>>,
    outbound_ready: Notify,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared view of one virtual channel's queue pair
///
/// The dispatch engine and the virtual channel each hold a clone.
#[derive(Debug, Clone, Default)]
pub struct ProxyLink {
    queues: Arc<ProxyQueues>,
}

impl ProxyLink {
    /// Create a link with empty queues
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a frame to the auxiliary
    pub fn push_outbound(&self, frame: Frame) {
        lock(&self.queues.outbound).push_back(frame);
        self.queues.outbound_ready.notify_one();
    }

    /// Take the oldest command the auxiliary sent, if any
    pub fn pop_inbound(&self) -> Option<Command> {
        lock(&self.queues.inbound).pop_front()
    }

    /// Queue a command for transmission on the physical channel
    pub fn push_inbound(&self, command: Command) {
        lock(&self.queues.inbound).push_back(command);
    }

    /// Put a command the engine could not transmit back at the queue head
    pub fn requeue_inbound(&self, command: Command) {
        lock(&self.queues.inbound).push_front(command);
    }

    /// Take the oldest frame delivered to the auxiliary, if any
    pub fn pop_outbound(&self) -> Option<Frame> {
        lock(&self.queues.outbound).pop_front()
    }

    /// Commands waiting for the engine
    pub fn inbound_len(&self) -> usize {
        lock(&self.queues.inbound).len()
    }

    /// Frames waiting for the auxiliary
    pub fn outbound_len(&self) -> usize {
        lock(&self.queues.outbound).len()
    }

    /// Empty both queues
    pub fn reset(&self) {
        let mut inbound = lock(&self.queues.inbound);
        let mut outbound = lock(&self.queues.outbound);
        inbound.clear();
        outbound.clear();
    }

    /// Wait up to `timeout` for the next frame delivered to the auxiliary
    pub async fn next_outbound(&self, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        loop {
            let ready = self.queues.outbound_ready.notified();
            if let Some(frame) = self.pop_outbound() {
                return Some(frame);
            }
            if tokio::time::timeout_at(deadline, ready).await.is_err() {
                return self.pop_outbound();
            }
        }
    }
}

/// Transport hooks of a virtual channel, operating on a [`ProxyLink`]
#[derive(Debug, Clone)]
pub struct VirtualTransport {
    link: ProxyLink,
}

impl VirtualTransport {
    /// Create hooks over `link`
    pub fn new(link: ProxyLink) -> Self {
        Self { link }
    }
}

#[async_trait]
impl Transport for VirtualTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        self.link.reset();
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.link.reset();
        Ok(())
    }

    async fn send(&mut self, payload: &[u8], destination: Option<u32>) -> Result<(), TransportError> {
        self.link.push_inbound(Command::new(payload, destination));
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Option<Frame>, TransportError> {
        Ok(self.link.next_outbound(timeout).await)
    }
}

/// A [`Channel`] backed by in-memory queues instead of hardware
#[derive(Debug, Clone)]
pub struct VirtualChannel {
    channel: Arc<Channel>,
    link: ProxyLink,
}

impl VirtualChannel {
    /// Create a closed virtual channel with empty queues
    pub fn new(name: impl Into<String>) -> Self {
        let link = ProxyLink::new();
        let channel = Channel::new(name, VirtualTransport::new(link.clone()));
        Self {
            channel: Arc::new(channel),
            link,
        }
    }

    /// The guarded channel the owning auxiliary talks through
    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// The queue pair the dispatch engine talks through
    pub fn link(&self) -> &ProxyLink {
        &self.link
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[tokio::test]
    async fn test_send_lands_in_inbound_queue() {
        let virtual_channel = VirtualChannel::new("proxy_aux");
        let channel = virtual_channel.channel();
        channel.open().await.unwrap();

        channel.send(&[0x01, 0x02], Some(0x10)).await.unwrap();

        let link = virtual_channel.link();
        assert_eq!(link.inbound_len(), 1);
        assert_eq!(link.pop_inbound(), Some(Command::new(vec![0x01, 0x02], Some(0x10))));
        assert_eq!(link.pop_inbound(), None);
    }

    #[tokio::test]
    async fn test_receive_pops_outbound_frame() {
        let virtual_channel = VirtualChannel::new("proxy_aux");
        let channel = virtual_channel.channel();
        channel.open().await.unwrap();

        virtual_channel.link().push_outbound(Frame::new(vec![0xBE, 0xEF], Some(3)));

        let frame = channel.receive(Duration::from_millis(10)).await.unwrap();
        assert_eq!(frame, Some(Frame::new(vec![0xBE, 0xEF], Some(3))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_times_out_on_empty_queue() {
        let virtual_channel = VirtualChannel::new("proxy_aux");
        let channel = virtual_channel.channel();
        channel.open().await.unwrap();

        let frame = channel.receive(Duration::from_millis(50)).await.unwrap();
        assert_eq!(frame, None);
    }

    #[tokio::test]
    async fn test_receive_wakes_on_late_frame() {
        let virtual_channel = VirtualChannel::new("proxy_aux");
        let channel = Arc::clone(virtual_channel.channel());
        channel.open().await.unwrap();

        let receiver = tokio::spawn(async move { channel.receive(Duration::from_secs(5)).await });
        tokio::task::yield_now().await;
        virtual_channel.link().push_outbound(Frame::new(vec![0x07], None));

        let frame = receiver.await.unwrap().unwrap();
        assert_eq!(frame, Some(Frame::new(vec![0x07], None)));
    }

    #[tokio::test]
    async fn test_open_and_close_clear_queues() {
        let virtual_channel = VirtualChannel::new("proxy_aux");
        let channel = virtual_channel.channel();
        let link = virtual_channel.link();

        link.push_inbound(Command::new(vec![0x01], None));
        link.push_outbound(Frame::new(vec![0x02], None));
        channel.open().await.unwrap();
        assert_eq!(link.inbound_len(), 0);
        assert_eq!(link.outbound_len(), 0);

        channel.send(&[0x03], None).await.unwrap();
        link.push_outbound(Frame::new(vec![0x04], None));
        channel.close().await.unwrap();
        assert_eq!(link.inbound_len(), 0);
        assert_eq!(link.outbound_len(), 0);
    }

    #[test]
    fn test_requeued_command_goes_out_first() {
        let link = ProxyLink::new();
        link.push_inbound(Command::new(vec![0x02], None));
        let first = Command::new(vec![0x01], None);

        link.requeue_inbound(first.clone());
        assert_eq!(link.pop_inbound(), Some(first));
        assert_eq!(link.pop_inbound(), Some(Command::new(vec![0x02], None)));
    }

    #[tokio::test]
    async fn test_virtual_channel_keeps_exclusivity_guard() {
        let virtual_channel = VirtualChannel::new("proxy_aux");
        let channel = virtual_channel.channel();

        channel.open().await.unwrap();
        assert!(channel.open().await.unwrap_err().is_busy());
    }

    proptest! {
        #[test]
        fn queues_preserve_fifo_order(payloads in prop::collection::vec(any::<u8>(), 0..64)) {
            let link = ProxyLink::new();
            for (i, byte) in payloads.iter().enumerate() {
                link.push_inbound(Command::new(vec![*byte], Some(i as u32)));
                link.push_outbound(Frame::new(vec![*byte], Some(i as u32)));
            }

            for (i, byte) in payloads.iter().enumerate() {
                prop_assert_eq!(link.pop_inbound(), Some(Command::new(vec![*byte], Some(i as u32))));
                prop_assert_eq!(link.pop_outbound(), Some(Frame::new(vec![*byte], Some(i as u32))));
            }
            prop_assert_eq!(link.pop_inbound(), None);
            prop_assert_eq!(link.pop_outbound(), None);
        }
    }
}
