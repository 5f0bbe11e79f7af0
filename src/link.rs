use std::sync::Weak;
use anyhow::bail;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::frame_codec::PACKET_OVERHEAD;
use crate::transport::Transport;

/// Result of handing a packet to the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// sent synchronously, the buffer can be reused right away
    Sent,
    /// accepted for asynchronous sending - the link calls [Transport::link_send_done] when done
    Queued,
    Timeout,
    Busy,
    Oom,
    NoLink,
    Unspecified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkConfig {
    pub tx_buffer_len: usize,
    pub rx_buffer_len: usize,
}

impl LinkConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tx_buffer_len <= PACKET_OVERHEAD {
            bail!("link TX buffer of {} bytes is too small, it must exceed the packet overhead of {} bytes", self.tx_buffer_len, PACKET_OVERHEAD);
        }
        if self.rx_buffer_len <= PACKET_OVERHEAD {
            bail!("link RX buffer of {} bytes is too small, it must exceed the packet overhead of {} bytes", self.rx_buffer_len, PACKET_OVERHEAD);
        }
        if self.tx_buffer_len - PACKET_OVERHEAD > u16::MAX as usize || self.rx_buffer_len - PACKET_OVERHEAD > u16::MAX as usize {
            bail!("link buffers must not allow payloads beyond {} bytes", u16::MAX);
        }
        Ok(())
    }
}

/// The physical link (UART, mailbox, socket, ...) below the transport.
///
/// The transport owns the TX buffer and passes each packet as a slice. A link that answers
///  [LinkStatus::Queued] must copy what it needs before returning; the transport does not start
///  another send until [Transport::link_send_done] is called.
///
/// Received bytes are pushed into the transport through [Transport::rx_data].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LinkLayer: Send + Sync + 'static {
    /// installs the back reference for RX callbacks and asynchronous send completion
    fn init(&self, transport: Weak<Transport>);

    fn deinit(&self);

    async fn send(&self, packet: &[u8]) -> LinkStatus;

    /// called by the worker for signal bits in [crate::notifier::SIGNAL_LINK_MASK]
    async fn do_work(&self, signals: u32);

    /// aborts an asynchronous send in progress. A completion callback for that send may still
    ///  arrive afterwards.
    fn reset(&self);

    fn config(&self) -> LinkConfig;
}
