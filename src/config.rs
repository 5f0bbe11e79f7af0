use std::time::Duration;
use anyhow::bail;

use crate::reset_config::TransportVersion;

pub struct TransportConfig {
    /// If no ACK arrives for the packet in flight within this time, it is retransmitted unchanged.
    pub tx_timeout: Duration,

    /// A packet that started arriving but is not complete after this time is aborted and NACK'ed.
    ///
    /// This must exceed the peer's longest stall in the middle of a packet under regular load,
    ///  otherwise slow but healthy packets are discarded.
    pub rx_timeout: Duration,

    /// Time to wait for a RESET-ACK before sending another RESET. Like `rx_timeout`, this must
    ///  be generous compared to the peer's worst case processing delay.
    pub reset_timeout: Duration,

    /// The number of retransmissions of a single payload packet before the link is reset
    pub max_retx: usize,

    /// The number of handshake attempts before giving up and entering permanent failure
    pub max_reset: usize,

    /// Datagrams that can be queued for sending - enqueueing fails if the queue is full
    pub tx_queue_len: usize,

    /// Upper bound for reassembling an incoming datagram. A fragment that would grow the
    ///  datagram beyond this is NACK'ed with OOM.
    pub max_rx_datagram_len: usize,

    /// The version advertised in RESET / RESET-ACK packets
    pub version: TransportVersion,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            tx_timeout: Duration::from_millis(100),
            rx_timeout: Duration::from_millis(80),
            reset_timeout: Duration::from_millis(1500),
            max_retx: 3,
            max_reset: 3,
            tx_queue_len: 16,
            max_rx_datagram_len: 64*1024,
            version: TransportVersion::CURRENT,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tx_timeout.is_zero() || self.rx_timeout.is_zero() || self.reset_timeout.is_zero() {
            bail!("timeouts must be greater than zero");
        }
        if self.max_reset == 0 {
            bail!("at least one reset attempt is required");
        }
        if self.tx_queue_len == 0 {
            bail!("TX queue must hold at least one datagram");
        }
        if self.max_rx_datagram_len == 0 {
            bail!("maximum RX datagram length must be greater than zero");
        }
        Ok(())
    }
}
