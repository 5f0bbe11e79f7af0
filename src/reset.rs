use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::packet_header::{PacketAttr, PacketCode, PacketError};
use crate::reset_config::ResetConfiguration;
use crate::rx::RxStatus;
use crate::transport::{Effect, TransportState};
use crate::tx::TxStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetState {
    /// handshake complete, regular operation
    None,
    /// a RESET was sent, waiting for the RESET-ACK
    Resetting,
    /// the handshake failed too often: only a RESET from the peer can revive the link
    PermanentFailure,
}

impl TransportState {
    /// Wipes all protocol state except for the header of the last received packet, and sends a
    ///  RESET or RESET-ACK.
    ///
    /// For a RESET-ACK, the RESET being answered is the last received packet: its seq determines
    ///  the next expected seq.
    pub(crate) fn reset(&mut self, reset_type: PacketAttr, error: PacketError, now: Instant) {
        info!("resetting transport: sending {:?} with error {:?}", reset_type, error);
        self.set_reset_state(ResetState::Resetting);

        if self.tx.link_busy {
            self.push_effect(Effect::LinkReset);
        }

        self.rx_datagram = Vec::new();
        self.tx_queue.clear();

        self.rx = RxStatus::default();
        self.tx = TxStatus::cleared();
        self.rx.received_packet_code = self.rx_header.packet_code;
        self.rx.expected_seq = self.rx_header.seq.wrapping_add(1);

        self.send_reset_locked(reset_type, error, now);

        if reset_type == PacketAttr::ResetAck {
            self.push_effect(Effect::AppReset);
        }
    }

    /// Enqueues a RESET or RESET-ACK datagram carrying the own configuration. Sending a RESET-ACK
    ///  completes the handshake on this side.
    pub(crate) fn send_reset_locked(&mut self, reset_type: PacketAttr, error: PacketError, now: Instant) {
        let config = ResetConfiguration::new(self.config.version);

        if reset_type == PacketAttr::ResetAck {
            debug!("sending RESET-ACK");
            self.set_reset_complete();
        }
        else {
            debug!("sending RESET");
        }

        self.reset_time = Some(now);
        if !self.enqueue_datagram_locked(PacketCode::new(reset_type, error), config.to_vec()) {
            error!("failed to enqueue {:?}", reset_type);
        }
    }

    pub(crate) fn set_reset_complete(&mut self) {
        self.set_reset_state(ResetState::None);
        self.reset_count = 0;
    }

    /// The peer completed its reset. Unless this side is waiting for it, the RESET-ACK is a
    ///  leftover of both sides resetting at the same time: its ACK is still registered, but the
    ///  sequence numbers are left alone.
    pub(crate) fn process_reset_ack(&mut self, discovery_complete: bool) {
        if self.reset_state == ResetState::None {
            warn!("unexpected RESET-ACK: seq={} code={:?}", self.rx_header.seq, self.rx_header.packet_code);
            self.register_rx_ack();
            self.rx_datagram.clear();
            return;
        }

        self.set_reset_complete();
        self.rx.received_packet_code = self.rx_header.packet_code;
        self.rx.expected_seq = self.rx_header.seq.wrapping_add(1);
        self.register_rx_ack();
        self.rx_datagram.clear();

        if discovery_complete {
            self.enqueue_tx_packet(PacketCode::NONE);
        }
        else {
            // the app layer's first datagram carries the ACK
            self.tx.packet_code_to_send = PacketCode::NONE;
        }

        self.push_effect(Effect::AppReset);
    }

    /// Retries the handshake if the RESET-ACK is overdue, or gives up for good after too many
    ///  attempts.
    pub(crate) fn handle_reset_timeout(&mut self, now: Instant) {
        if self.reset_state != ResetState::Resetting {
            return;
        }
        let Some(reset_time) = self.reset_time else {
            return;
        };
        if now.saturating_duration_since(reset_time) < self.config.reset_timeout {
            return;
        }

        if self.reset_count + 1 < self.config.max_reset {
            error!("RESET-ACK timeout: retrying");
            self.reset_count += 1;
            self.reset(PacketAttr::Reset, PacketError::Timeout, now);
        }
        else {
            error!("RESET-ACK timeout: giving up after {} attempts", self.reset_count + 1);
            self.tx.tx_attempts = 0;
            self.set_reset_state(ResetState::PermanentFailure);
            self.tx_queue.clear();
            self.tx.packet_code_to_send = PacketCode::NONE;
        }
    }
}
