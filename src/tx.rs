use std::cmp::min;
use bytes::BytesMut;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::frame_codec::encode_packet;
use crate::notifier::SIGNAL_EVENT;
use crate::packet_header::{PacketAttr, PacketCode, PacketError, PacketHeader, FLAG_FINISHED_DATAGRAM};
use crate::reset::ResetState;
use crate::safe_converter::PrecheckedCast;
use crate::transport::TransportState;

/// Sender side of the stop-and-wait ARQ: there is at most one payload packet in flight, and it
///  is always the fragment of the queue's head datagram starting at `acked_loc_in_datagram`.
#[derive(Debug, Default)]
pub(crate) struct TxStatus {
    /// seq of the last payload packet that was sent
    pub sent_seq: u8,
    /// the ack seq in the last packet that was sent
    pub sent_ack_seq: u8,
    pub acked_loc_in_datagram: usize,
    pub sent_loc_in_datagram: usize,
    /// transmissions of the packet in flight, reset on ACK
    pub tx_attempts: usize,
    /// attribute and error for the next packet - the error is sent once, the attribute sticks
    pub packet_code_to_send: PacketCode,
    /// the link holds the TX buffer
    pub link_busy: bool,
    pub last_tx_time: Option<Instant>,
}

impl TxStatus {
    pub fn cleared() -> TxStatus {
        TxStatus {
            // the first payload packet after a reset has seq 0
            sent_seq: u8::MAX,
            ..Default::default()
        }
    }
}

impl TransportState {
    /// true if there is payload that was either not sent yet or is not ACK'ed
    pub(crate) fn has_pending_tx_payload(&self) -> bool {
        !self.tx_queue.is_empty()
    }

    /// Appends a datagram to the TX queue, kicking off transmission if the queue was empty. This
    ///  is used both for app layer datagrams and for RESET / RESET-ACK.
    pub(crate) fn enqueue_datagram_locked(&mut self, packet_code: PacketCode, datagram: Vec<u8>) -> bool {
        if datagram.is_empty() {
            error!("refusing to enqueue empty TX datagram");
            return false;
        }
        if self.tx_queue.len() >= self.config.tx_queue_len {
            error!("TX queue is full: cannot enqueue datagram of {} bytes", datagram.len());
            return false;
        }

        debug!("enqueueing TX datagram: code={:?} len={} pending={}", packet_code, datagram.len(), self.tx_queue.len() + 1);
        self.tx_queue.push_back(datagram);

        if self.tx_queue.len() == 1 {
            self.enqueue_tx_packet(packet_code);
        }
        true
    }

    /// Requests a packet with the given code to be sent by the worker. Whether it carries
    ///  payload is decided when it is actually built.
    pub(crate) fn enqueue_tx_packet(&mut self, packet_code: PacketCode) {
        trace!("enqueueing TX packet with code {:?}", packet_code);
        self.tx.packet_code_to_send = packet_code;
        self.notifier.signal(SIGNAL_EVENT);
    }

    pub(crate) fn enqueue_tx_error_locked(&mut self, error: PacketError) {
        if self.reset_state != ResetState::None {
            error!("discarding app layer error {:?} in reset state {:?}", error, self.reset_state);
            return;
        }
        match error {
            PacketError::Oom | PacketError::AppLayer => {
                debug!("app layer enqueueing error {:?}", error);
                self.enqueue_tx_packet(PacketCode::new(PacketAttr::None, error));
            }
            _ => {
                error!("app layer must not report transport error {:?}", error);
            }
        }
    }

    /// Processes the ack seq of a received packet. Returns true if it acknowledged the packet
    ///  in flight.
    pub(crate) fn register_rx_ack(&mut self) -> bool {
        let rx_ack_seq = self.rx_header.ack_seq;
        if rx_ack_seq == self.rx.received_ack_seq {
            return false;
        }

        if self.rx.received_ack_seq.wrapping_add(1) != rx_ack_seq {
            error!("out of order ACK: last={} rx={}", self.rx.received_ack_seq, rx_ack_seq);
            return false;
        }

        debug!("ACK received: last={} rx={} pending={} acked loc={}", self.rx.received_ack_seq, rx_ack_seq, self.tx_queue.len(), self.tx.acked_loc_in_datagram);
        self.rx.received_ack_seq = rx_ack_seq;
        if self.tx.tx_attempts > 1 {
            warn!("seq {} ACK'ed after {} retransmissions", rx_ack_seq.wrapping_sub(1), self.tx.tx_attempts - 1);
        }
        self.tx.tx_attempts = 0;

        self.tx.acked_loc_in_datagram += self.tx_mtu;
        let head_len = self.tx_queue.front().map(|d| d.len());
        match head_len {
            Some(len) if self.tx.acked_loc_in_datagram >= len => {
                self.tx.acked_loc_in_datagram = 0;
                self.tx.sent_loc_in_datagram = 0;
                self.tx_queue.pop_front();
                // a RESET / RESET-ACK attribute is only repeated until its datagram is ACK'ed
                self.tx.packet_code_to_send = self.tx.packet_code_to_send.with_attr(PacketAttr::None);
                trace!("TX datagram complete, {} pending", self.tx_queue.len());
            }
            Some(_) => {}
            None => {
                warn!("ACK for seq {} without pending TX datagram", rx_ack_seq.wrapping_sub(1));
                self.tx.acked_loc_in_datagram = 0;
            }
        }
        true
    }

    fn should_attach_payload(&self, resend: bool) -> bool {
        let has_payload = self.has_pending_tx_payload();
        if resend && !has_payload {
            error!("trying to resend non-existent payload");
        }
        has_payload && (self.tx.tx_attempts == 0 || resend)
    }

    /// an ACK is owed or an error is waiting to be reported. Attributes only travel with payload.
    fn should_send_possibly_empty_packet(&self) -> bool {
        self.rx.expected_seq != self.tx.sent_ack_seq || self.tx.packet_code_to_send.error_raw() != 0
    }

    /// Builds the next packet to send, if any, and marks the link busy. If the packet in flight
    ///  was retransmitted too often, this triggers a reset instead.
    pub(crate) fn build_next_packet(&mut self, resend: bool, now: Instant) -> Option<BytesMut> {
        let attach_payload = self.should_attach_payload(resend);
        if self.tx.link_busy || !(attach_payload || self.should_send_possibly_empty_packet()) {
            trace!("nothing to send: link busy={} pending={} rx ack={} tx seq={} rx state={:?}",
                self.tx.link_busy, self.tx_queue.len(), self.rx.received_ack_seq, self.tx.sent_seq, self.rx.state);
            return None;
        }

        if attach_payload
            && self.tx.tx_attempts > self.config.max_retx
            && self.reset_state != ResetState::Resetting
        {
            error!("resetting after {} retransmissions", self.config.max_retx);
            self.reset(PacketAttr::Reset, PacketError::MaxRetries, now);
            return None;
        }

        let mut header = PacketHeader {
            flags: FLAG_FINISHED_DATAGRAM,
            packet_code: if attach_payload {
                self.tx.packet_code_to_send
            }
            else {
                self.tx.packet_code_to_send.with_attr(PacketAttr::None)
            },
            ack_seq: self.rx.expected_seq,
            // packets without payload repeat the last payload seq
            seq: self.rx.received_ack_seq.wrapping_sub(1),
            length: 0,
            reserved: 0,
        };
        self.tx.packet_code_to_send = self.tx.packet_code_to_send.without_error();
        self.tx.sent_ack_seq = header.ack_seq;

        let mut payload_range = 0..0;
        if attach_payload {
            header.seq = self.rx.received_ack_seq;
            self.tx.sent_seq = header.seq;

            if let Some(datagram) = self.tx_queue.front() {
                let start = self.tx.acked_loc_in_datagram;
                let len = min(datagram.len().saturating_sub(start), self.tx_mtu);
                payload_range = start..start + len;
                if start + len < datagram.len() {
                    header.flags &= !FLAG_FINISHED_DATAGRAM;
                }
                header.length = len.prechecked_cast();
                self.tx.sent_loc_in_datagram = start + len;
            }
            self.tx.tx_attempts += 1;
        }
        else if self.has_pending_tx_payload() {
            debug!("not attaching pending payload");
        }

        let mut buf = self.take_tx_buffer();
        let payload = self.tx_queue.front()
            .map_or(&[][..], |datagram| &datagram[payload_range]);
        encode_packet(&mut buf, &header, payload);

        debug!("TX packet: {:?} pending={}", header, self.tx_queue.len());
        self.tx.link_busy = true;
        self.tx.last_tx_time = Some(now);
        Some(buf)
    }
}
