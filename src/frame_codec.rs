use bytes::{BufMut, BytesMut};
use crc::{Crc, CRC_32_ISO_HDLC};
use thiserror::Error;

use crate::packet_header::{PacketError, PacketHeader, FLAGS_KNOWN_MASK};
use crate::safe_converter::SafeCast;

pub const PREAMBLE: [u8; 2] = [0x68, 0x43];
pub const PREAMBLE_LEN: usize = PREAMBLE.len();
pub const FOOTER_LEN: usize = size_of::<u32>();

/// bytes a packet needs in addition to its payload
pub const PACKET_OVERHEAD: usize = PREAMBLE_LEN + PacketHeader::SERIALIZED_LEN + FOOTER_LEN;

static PACKET_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// CRC-32 over a packet's serialized header followed by its payload
pub fn packet_crc(header: &PacketHeader, payload: &[u8]) -> u32 {
    let mut header_buf = [0u8; PacketHeader::SERIALIZED_LEN];
    header.ser(&mut header_buf.as_mut_slice());

    let mut digest = PACKET_CRC.digest();
    digest.update(&header_buf);
    digest.update(payload);
    digest.finalize()
}

/// The maximum payload that fits into a link buffer of the given size
pub fn mtu_for_buffer_len(buffer_len: usize) -> usize {
    buffer_len.saturating_sub(PACKET_OVERHEAD)
}

/// Writes a complete packet (preamble, header, payload, footer) into `buf`, replacing its previous
///  content. `buf` is expected to be pre-allocated with the link's buffer size.
pub fn encode_packet(buf: &mut BytesMut, header: &PacketHeader, payload: &[u8]) {
    debug_assert_eq!(header.length.safe_cast(), payload.len(), "header length does not match payload");

    buf.clear();
    buf.put_slice(&PREAMBLE);
    header.ser(buf);
    buf.put_slice(payload);
    buf.put_u32_le(packet_crc(header, payload));
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("packet does not start with the preamble")]
    Preamble,
    #[error("packet is truncated: {0} bytes")]
    Truncated(usize),
    #[error("reserved header field is not 0: {0:#06x}")]
    Reserved(u16),
    #[error("undefined flag bits are set: {0:#04x}")]
    Flags(u8),
    #[error("undefined error code: {0}")]
    ErrorCode(u8),
    #[error("payload length {length} exceeds MTU {mtu}")]
    Length { length: usize, mtu: usize },
    #[error("trailing bytes after footer: {0}")]
    Trailing(usize),
    #[error("checksum mismatch: expected {expected:#010x}, received {received:#010x}")]
    Checksum { expected: u32, received: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatedPacket<'a> {
    pub header: PacketHeader,
    pub payload: &'a [u8],
}

/// Checks a complete, buffered packet against all wire invariants without touching any transport
///  state.
pub fn validate_packet(packet: &[u8], mtu: usize) -> Result<ValidatedPacket<'_>, FrameError> {
    if packet.len() < PACKET_OVERHEAD {
        return Err(FrameError::Truncated(packet.len()));
    }
    if packet[..PREAMBLE_LEN] != PREAMBLE {
        return Err(FrameError::Preamble);
    }

    let mut header_buf = &packet[PREAMBLE_LEN..];
    let header = PacketHeader::deser(&mut header_buf)
        .map_err(|_| FrameError::Truncated(packet.len()))?;

    if header.reserved != 0 {
        return Err(FrameError::Reserved(header.reserved));
    }
    if header.flags & !FLAGS_KNOWN_MASK != 0 {
        return Err(FrameError::Flags(header.flags));
    }
    let error_raw = header.packet_code.error_raw();
    if error_raw > u8::from(PacketError::ForcedReset) && error_raw != u8::from(PacketError::AppLayer) {
        return Err(FrameError::ErrorCode(error_raw));
    }

    let length: usize = header.length.safe_cast();
    if length > mtu {
        return Err(FrameError::Length { length, mtu });
    }

    let payload_start = PREAMBLE_LEN + PacketHeader::SERIALIZED_LEN;
    let expected_len = payload_start + length + FOOTER_LEN;
    if packet.len() < expected_len {
        return Err(FrameError::Truncated(packet.len()));
    }
    if packet.len() > expected_len {
        return Err(FrameError::Trailing(packet.len() - expected_len));
    }

    let payload = &packet[payload_start..payload_start + length];
    let footer = &packet[payload_start + length..];
    let received = u32::from_le_bytes([footer[0], footer[1], footer[2], footer[3]]);
    let expected = packet_crc(&header, payload);
    if received != expected {
        return Err(FrameError::Checksum { expected, received });
    }

    Ok(ValidatedPacket { header, payload })
}
