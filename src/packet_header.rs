use anyhow::bail;
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Set on the last (or only) packet of a datagram. A cleared bit means more fragments follow.
pub const FLAG_FINISHED_DATAGRAM: u8 = 0x01;

/// All flag bits that have a defined meaning - everything else must be zero on the wire
pub const FLAGS_KNOWN_MASK: u8 = FLAG_FINISHED_DATAGRAM;

/// High nibble of the packet code
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum PacketAttr {
    None = 0,
    Reset = 1,
    ResetAck = 2,
    LoopbackRequest = 3,
    LoopbackResponse = 4,
}

/// Low nibble of the packet code. A packet carrying anything but `None` is a NACK, asking the peer
///  to retransmit.
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum PacketError {
    None = 0,
    Checksum = 1,
    Oom = 2,
    Busy = 3,
    Header = 4,
    Order = 5,
    Timeout = 6,
    MaxRetries = 7,
    ForcedReset = 8,
    AppLayer = 0xF,
}

/// Attribute and error combined into a single wire byte, so that any packet can carry data, an
///  attribute and a failure reason at the same time.
///
/// The raw byte is kept as received: a peer may send attribute values this side does not know.
#[derive(Copy, Clone, Eq, PartialEq, Default)]
pub struct PacketCode(u8);

impl PacketCode {
    pub const NONE: PacketCode = PacketCode(0);

    pub fn new(attr: PacketAttr, error: PacketError) -> PacketCode {
        PacketCode((u8::from(attr) << 4) | (u8::from(error) & 0x0f))
    }

    pub fn from_raw(raw: u8) -> PacketCode {
        PacketCode(raw)
    }

    pub fn raw(self) -> u8 {
        self.0
    }

    pub fn attr_raw(self) -> u8 {
        self.0 >> 4
    }

    pub fn error_raw(self) -> u8 {
        self.0 & 0x0f
    }

    pub fn attr(self) -> Option<PacketAttr> {
        PacketAttr::try_from(self.attr_raw()).ok()
    }

    pub fn error(self) -> Option<PacketError> {
        PacketError::try_from(self.error_raw()).ok()
    }

    pub fn is_attr(self, attr: PacketAttr) -> bool {
        self.attr_raw() == u8::from(attr)
    }

    /// same attribute, error cleared - an error is reported once, an attribute sticks
    pub fn without_error(self) -> PacketCode {
        PacketCode(self.0 & 0xf0)
    }

    pub fn with_error(self, error: PacketError) -> PacketCode {
        PacketCode((self.0 & 0xf0) | (u8::from(error) & 0x0f))
    }

    pub fn with_attr(self, attr: PacketAttr) -> PacketCode {
        PacketCode((u8::from(attr) << 4) | (self.0 & 0x0f))
    }
}

impl std::fmt::Debug for PacketCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.attr(), self.error()) {
            (Some(attr), Some(error)) => write!(f, "{:?}/{:?}", attr, error),
            _ => write!(f, "0x{:02x}", self.0),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct PacketHeader {
    pub flags: u8,
    pub packet_code: PacketCode,
    /// the next sequence number the sender expects from its peer
    pub ack_seq: u8,
    pub seq: u8,
    /// payload length, excluding header and footer
    pub length: u16,
    pub reserved: u16,
}

impl PacketHeader {
    pub const SERIALIZED_LEN: usize = 8;

    pub fn is_finished_datagram(&self) -> bool {
        self.flags & FLAG_FINISHED_DATAGRAM != 0
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.flags);
        buf.put_u8(self.packet_code.raw());
        buf.put_u8(self.ack_seq);
        buf.put_u8(self.seq);
        buf.put_u16_le(self.length);
        buf.put_u16_le(self.reserved);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("buffer underflow: packet header requires {} bytes, {} available", Self::SERIALIZED_LEN, buf.remaining());
        }

        Ok(PacketHeader {
            flags: buf.get_u8(),
            packet_code: PacketCode::from_raw(buf.get_u8()),
            ack_seq: buf.get_u8(),
            seq: buf.get_u8(),
            length: buf.get_u16_le(),
            reserved: buf.get_u16_le(),
        })
    }
}
