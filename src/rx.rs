use std::cmp::min;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::frame_codec::{packet_crc, FOOTER_LEN, PREAMBLE, PREAMBLE_LEN};
use crate::notifier::SIGNAL_RECALC_TIMEOUT;
use crate::packet_header::{PacketAttr, PacketCode, PacketError, PacketHeader};
use crate::reset::ResetState;
use crate::reset_config::ResetConfiguration;
use crate::safe_converter::SafeCast;
use crate::transport::{Effect, TransportState};

/// Position of the receiver in the incoming byte stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RxState {
    /// searching for the start of a packet
    #[default]
    Preamble,
    Header,
    Payload,
    Footer,
}

#[derive(Debug, Default)]
pub(crate) struct RxStatus {
    pub state: RxState,
    /// bytes consumed in the current state
    pub loc_in_state: usize,
    pub header_buf: [u8; PacketHeader::SERIALIZED_LEN],
    pub footer_buf: [u8; FOOTER_LEN],
    /// offset in the reassembly buffer where the current packet's payload starts
    pub packet_start_in_datagram: usize,
    /// seq of the next payload packet that will be accepted
    pub expected_seq: u8,
    /// the last ack seq received from the peer, i.e. the seq of the next payload packet to send
    pub received_ack_seq: u8,
    pub packet_start_time: Option<Instant>,
    pub last_good_packet_time: Option<Instant>,
    pub received_packet_code: PacketCode,
}

impl RxStatus {
    /// not in the middle of a packet
    pub fn is_idle(&self) -> bool {
        self.state == RxState::Preamble && self.loc_in_state == 0
    }
}

impl TransportState {
    /// Runs received bytes through the RX state machine. Bytes may arrive in arbitrary chunks,
    ///  down to one byte at a time.
    ///
    /// `discovery_complete` is the app layer's state, which determines whether a RESET-ACK is
    ///  confirmed right away.
    pub(crate) fn rx_data(&mut self, mut buf: &[u8], now: Instant, discovery_complete: bool) {
        trace!("RX {} bytes in state {:?}", buf.len(), self.rx.state);
        self.check_rx_timeout(now);

        while !buf.is_empty() {
            let consumed = match self.rx.state {
                RxState::Preamble => self.consume_preamble(buf, now),
                RxState::Header => self.consume_header(buf),
                RxState::Payload => self.consume_payload(buf),
                RxState::Footer => self.consume_footer(buf, now, discovery_complete),
            };
            buf = &buf[consumed..];
        }
    }

    fn set_rx_state(&mut self, new_state: RxState) {
        trace!("RX state {:?} -> {:?} after {} bytes", self.rx.state, new_state, self.rx.loc_in_state);
        self.rx.state = new_state;
        self.rx.loc_in_state = 0;
    }

    fn consume_preamble(&mut self, buf: &[u8], now: Instant) -> usize {
        let mut consumed = 0;
        while consumed < buf.len() && self.rx.loc_in_state < PREAMBLE_LEN {
            let b = buf[consumed];
            if b == PREAMBLE[self.rx.loc_in_state] {
                self.rx.loc_in_state += 1;
            }
            else if b == PREAMBLE[0] {
                // the failed match may itself be the start of a preamble
                self.rx.loc_in_state = 1;
            }
            else {
                self.rx.loc_in_state = 0;
            }
            consumed += 1;
        }

        if self.rx.loc_in_state == PREAMBLE_LEN {
            self.rx.packet_start_time = Some(now);
            self.set_rx_state(RxState::Header);
            // an idle worker has no RX deadline yet
            self.notifier.signal(SIGNAL_RECALC_TIMEOUT);
        }
        consumed
    }

    fn consume_header(&mut self, buf: &[u8]) -> usize {
        let loc = self.rx.loc_in_state;
        let n = min(buf.len(), PacketHeader::SERIALIZED_LEN - loc);
        self.rx.header_buf[loc..loc + n].copy_from_slice(&buf[..n]);
        self.rx.loc_in_state += n;

        if self.rx.loc_in_state == PacketHeader::SERIALIZED_LEN {
            let mut header_buf: &[u8] = &self.rx.header_buf;
            match PacketHeader::deser(&mut header_buf) {
                Ok(header) => self.on_header_complete(header),
                Err(e) => {
                    error!("failed to parse packet header: {}", e);
                    self.set_rx_state(RxState::Preamble);
                }
            }
        }
        n
    }

    fn on_header_complete(&mut self, header: PacketHeader) {
        self.rx_header = header;
        self.rx.packet_start_in_datagram = self.rx_datagram.len();

        let length: usize = header.length.safe_cast();
        if length > self.rx_mtu {
            error!("bad header: length {} exceeds RX MTU {} - seq={} expected={}", length, self.rx_mtu, header.seq, self.rx.expected_seq);
            self.enqueue_nack(PacketError::Header);
            self.set_rx_state(RxState::Preamble);
            return;
        }

        if length == 0 {
            self.set_rx_state(RxState::Footer);
            return;
        }

        let new_len = self.rx_datagram.len() + length;
        if new_len > self.config.max_rx_datagram_len || self.rx_datagram.try_reserve(length).is_err() {
            error!("OOM: cannot grow RX datagram of {} bytes by {} bytes", self.rx_datagram.len(), length);
            self.enqueue_nack(PacketError::Oom);
            self.set_rx_state(RxState::Preamble);
            return;
        }
        self.set_rx_state(RxState::Payload);
    }

    fn consume_payload(&mut self, buf: &[u8]) -> usize {
        let length: usize = self.rx_header.length.safe_cast();
        let n = min(buf.len(), length - self.rx.loc_in_state);
        self.rx_datagram.extend_from_slice(&buf[..n]);
        self.rx.loc_in_state += n;

        if self.rx.loc_in_state == length {
            self.set_rx_state(RxState::Footer);
        }
        n
    }

    fn consume_footer(&mut self, buf: &[u8], now: Instant, discovery_complete: bool) -> usize {
        let loc = self.rx.loc_in_state;
        let n = min(buf.len(), FOOTER_LEN - loc);
        self.rx.footer_buf[loc..loc + n].copy_from_slice(&buf[..n]);
        self.rx.loc_in_state += n;

        if self.rx.loc_in_state == FOOTER_LEN {
            self.dispatch_rx_packet(now, discovery_complete);
            self.set_rx_state(RxState::Preamble);
        }
        n
    }

    fn rx_payload(&self) -> &[u8] {
        &self.rx_datagram[self.rx.packet_start_in_datagram..]
    }

    fn is_rx_checksum_ok(&self) -> bool {
        let received = u32::from_le_bytes(self.rx.footer_buf);
        let expected = packet_crc(&self.rx_header, self.rx_payload());
        if received != expected {
            debug!("checksum mismatch: expected {:#010x}, received {:#010x}", expected, received);
        }
        received == expected
    }

    /// A complete packet was received: decide what it means based on its attribute and the reset
    ///  state. Only RESET is accepted in permanent failure, and only RESET-ACK while resetting.
    fn dispatch_rx_packet(&mut self, now: Instant, discovery_complete: bool) {
        let header = self.rx_header;
        if header.packet_code.error_raw() != 0 {
            error!("RX packet {:?} with error code", header);
        }
        else {
            debug!("RX packet {:?}", header);
        }

        let code = header.packet_code;
        if code.is_attr(PacketAttr::LoopbackRequest) {
            self.process_loopback_request();
        }
        else if code.is_attr(PacketAttr::LoopbackResponse) {
            self.process_loopback_response();
        }
        else if !self.is_rx_checksum_ok() {
            error!("bad checksum: seq={} len={}", header.seq, header.length);
            self.abort_rx_packet();
            self.enqueue_nack(PacketError::Checksum);
        }
        else if code.is_attr(PacketAttr::Reset) {
            info!("RX RESET: seq={} error={:?}", header.seq, code.error());
            ResetConfiguration::check_peer(self.rx_payload(), self.config.version);
            self.reset(PacketAttr::ResetAck, PacketError::None, now);
        }
        else if self.reset_state == ResetState::PermanentFailure {
            error!("RX discarded in permanent failure: seq={} len={}", header.seq, header.length);
            self.abort_rx_packet();
        }
        else if code.is_attr(PacketAttr::ResetAck) {
            info!("RX RESET-ACK: seq={}", header.seq);
            ResetConfiguration::check_peer(self.rx_payload(), self.config.version);
            self.process_reset_ack(discovery_complete);
        }
        else if self.reset_state == ResetState::Resetting {
            error!("RX discarded while resetting: seq={} len={}", header.seq, header.length);
            self.abort_rx_packet();
        }
        else {
            self.process_rx_packet(now);
        }
    }

    /// a checksum-validated packet in regular operation
    fn process_rx_packet(&mut self, now: Instant) {
        let header = self.rx_header;
        self.rx.last_good_packet_time = Some(now);
        self.rx.received_packet_code = header.packet_code;
        let got_expected_ack = self.register_rx_ack();

        let out_of_order = header.length > 0 && header.seq != self.rx.expected_seq;

        if (got_expected_ack && self.has_pending_tx_payload()) || out_of_order {
            let mut error = if out_of_order { PacketError::Order } else { PacketError::None };
            if header.length > 0 && header.seq == self.rx.expected_seq.wrapping_sub(1) {
                // the peer did not get our ACK: pretend it was never sent so it goes out again
                warn!("duplicate payload seq={}, resending ACK", header.seq);
                self.tx.sent_ack_seq = self.tx.sent_ack_seq.wrapping_sub(1);
                error = PacketError::None;
            }
            self.enqueue_tx_packet(PacketCode::new(PacketAttr::None, error));
        }

        if out_of_order {
            error!("out of order RX discarded: seq={} expected={} len={}", header.seq, self.rx.expected_seq, header.length);
            self.abort_rx_packet();
        }
        else if header.length > 0 {
            self.process_rx_payload();
        }
        else if !self.has_pending_tx_payload() {
            // an ACK before a period of inactivity
            self.notifier.signal(SIGNAL_RECALC_TIMEOUT);
        }
    }

    fn process_rx_payload(&mut self) {
        self.rx.expected_seq = self.rx.expected_seq.wrapping_add(1);

        if self.rx_header.is_finished_datagram() {
            let datagram = std::mem::take(&mut self.rx_datagram);
            debug!("RX datagram of {} bytes complete, ending with seq={} - sending ACK {}", datagram.len(), self.rx_header.seq, self.rx.expected_seq);
            self.push_effect(Effect::DeliverDatagram(datagram));
        }
        else {
            trace!("RX fragment seq={} len={}, datagram has {} bytes so far", self.rx_header.seq, self.rx_header.length, self.rx_datagram.len());
        }

        self.enqueue_tx_packet(PacketCode::NONE);
    }

    /// Discards the packet being received, including whatever payload it already appended to the
    ///  reassembly buffer. Fragments of the same datagram received earlier are kept.
    pub(crate) fn abort_rx_packet(&mut self) {
        match self.rx.state {
            RxState::Payload | RxState::Footer => {
                self.rx_datagram.truncate(self.rx.packet_start_in_datagram);
            }
            RxState::Preamble | RxState::Header => {}
        }
        self.set_rx_state(RxState::Preamble);
    }

    /// NACKs are only sent in regular operation: during a handshake, the pending RESET's packet
    ///  code must not be replaced.
    pub(crate) fn enqueue_nack(&mut self, error: PacketError) {
        if self.reset_state != ResetState::None {
            debug!("not sending NACK {:?} in reset state {:?}", error, self.reset_state);
            return;
        }
        self.enqueue_tx_packet(PacketCode::new(PacketAttr::None, error));
    }

    /// Aborts and NACKs a packet that has been arriving for too long.
    pub(crate) fn check_rx_timeout(&mut self, now: Instant) {
        if self.rx.state == RxState::Preamble {
            return;
        }
        if let Some(start) = self.rx.packet_start_time {
            if now.saturating_duration_since(start) >= self.config.rx_timeout {
                error!("RX timeout in state {:?} after {} bytes: expected seq={} len={}", self.rx.state, self.rx.loc_in_state, self.rx.expected_seq, self.rx_header.length);
                self.abort_rx_packet();
                self.enqueue_nack(PacketError::Timeout);
            }
        }
    }

    pub(crate) fn rx_packet_complete(&mut self) {
        if self.rx.state != RxState::Preamble {
            error!("RX packet incomplete in state {:?}: {} bytes in state, length {}", self.rx.state, self.rx.loc_in_state, self.rx_header.length);
            self.abort_rx_packet();
            self.enqueue_nack(PacketError::Header);
        }
    }
}
