use bytes::BytesMut;
use thiserror::Error;
use tracing::{debug, error};

use crate::frame_codec::encode_packet;
use crate::link::LinkStatus;
use crate::packet_header::{PacketAttr, PacketCode, PacketError, PacketHeader, FLAG_FINISHED_DATAGRAM};
use crate::safe_converter::PrecheckedCast;
use crate::transport::{Effect, TransportState};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopbackError {
    #[error("loopback data of {len} bytes does not fit a packet (1..={mtu})")]
    InvalidLength { len: usize, mtu: usize },
    #[error("link is busy")]
    Blocked,
    #[error("a loopback request is already outstanding")]
    Busy,
    #[error("link failed to send loopback request: {0:?}")]
    Link(LinkStatus),
}

/// Result of comparing a loopback response with the request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopbackOutcome {
    Success,
    LengthMismatch,
    DataMismatch,
}

#[derive(Debug, Default)]
pub(crate) struct LoopbackState {
    /// data of the outstanding request
    pub pending: Option<Vec<u8>>,
    pub outcome: Option<LoopbackOutcome>,
}

impl TransportState {
    /// Builds a LOOPBACK-REQUEST packet. It bypasses the datagram queue and is neither ACK'ed nor
    ///  retransmitted.
    pub(crate) fn start_loopback(&mut self, data: &[u8]) -> Result<BytesMut, LoopbackError> {
        if data.is_empty() || data.len() > self.tx_mtu {
            return Err(LoopbackError::InvalidLength { len: data.len(), mtu: self.tx_mtu });
        }
        if self.tx.link_busy {
            return Err(LoopbackError::Blocked);
        }
        if self.loopback.pending.is_some() {
            return Err(LoopbackError::Busy);
        }

        self.loopback.pending = Some(data.to_vec());
        self.loopback.outcome = None;
        self.tx.link_busy = true;

        let header = PacketHeader {
            flags: FLAG_FINISHED_DATAGRAM,
            packet_code: PacketCode::new(PacketAttr::LoopbackRequest, PacketError::None),
            ack_seq: 0,
            seq: 0,
            length: data.len().prechecked_cast(),
            reserved: 0,
        };
        let mut buf = self.take_tx_buffer();
        encode_packet(&mut buf, &header, data);
        debug!("sending loopback request of {} bytes", data.len());
        Ok(buf)
    }

    pub(crate) fn finish_loopback_send(&mut self, buffer: BytesMut, status: LinkStatus) -> Result<(), LoopbackError> {
        self.finish_send(buffer, status);
        match status {
            LinkStatus::Sent | LinkStatus::Queued => Ok(()),
            _ => {
                self.loopback.pending = None;
                Err(LoopbackError::Link(status))
            }
        }
    }

    /// Echoes the received payload in a LOOPBACK-RESPONSE, unless the link is busy.
    pub(crate) fn process_loopback_request(&mut self) {
        let start = self.rx.packet_start_in_datagram;
        if self.tx.link_busy {
            error!("link busy: loopback request dropped");
        }
        else {
            let payload_len = (self.rx_datagram.len() - start).min(self.tx_mtu);
            let header = PacketHeader {
                packet_code: self.rx_header.packet_code.with_attr(PacketAttr::LoopbackResponse),
                length: payload_len.prechecked_cast(),
                ..self.rx_header
            };

            let mut buf = self.take_tx_buffer();
            encode_packet(&mut buf, &header, &self.rx_datagram[start..start + payload_len]);
            debug!("looping back {} bytes", payload_len);

            self.tx.link_busy = true;
            self.push_effect(Effect::Transmit(buf));
        }
        self.rx_datagram.truncate(start);
    }

    pub(crate) fn process_loopback_response(&mut self) {
        let start = self.rx.packet_start_in_datagram;
        let received = &self.rx_datagram[start..];

        let outcome = match &self.loopback.pending {
            None => {
                error!("loopback response without outstanding request");
                None
            }
            Some(sent) if sent.len() != received.len() => {
                error!("loopback response length {} does not match request length {}", received.len(), sent.len());
                Some(LoopbackOutcome::LengthMismatch)
            }
            Some(sent) if sent.as_slice() != received => {
                error!("loopback response data does not match request: len={}", received.len());
                Some(LoopbackOutcome::DataMismatch)
            }
            Some(_) => {
                debug!("loopback successful: {} bytes", received.len());
                Some(LoopbackOutcome::Success)
            }
        };

        if outcome.is_some() {
            self.loopback.outcome = outcome;
        }
        self.loopback.pending = None;
        self.rx_datagram.truncate(start);
    }
}
