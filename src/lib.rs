//! A reliable, framed transport for datagrams over a single point-to-point link like a UART or a
//!  shared-memory mailbox. It sits between a link driver that moves raw bytes and an app layer
//!  that exchanges datagrams.
//!
//! ## Design goals
//!
//! * Exactly two peers, connected by a byte-oriented or packet-oriented link that may drop,
//!   corrupt or truncate data
//! * The abstraction is sending / receiving *datagrams*. Datagrams that exceed the link's MTU
//!   are fragmented into packets and reassembled at the receiving end
//! * Delivery is reliable and in order: stop-and-wait ARQ with a single packet in flight, 8-bit
//!   sequence numbers, ACK piggy-backed on every packet, NACK for a packet that was received
//!   broken
//! * Every packet is protected by a CRC-32
//! * Both sides synchronize with a RESET / RESET-ACK handshake on startup, and re-synchronize
//!   if the link is stuck. Repeated failure to synchronize declares the link permanently failed
//! * The protocol does not allocate per packet: there is a single TX buffer, owned by the
//!   transport and lent to the link for each send
//!
//! ## Packet layout
//!
//! All numbers are little endian.
//!
//! ```ascii
//!  0: preamble (2 bytes): 0x68 0x43
//!  2: flags (u8)
//!     * bit 0: FINISHED_DATAGRAM - this packet ends a datagram
//!     * other bits must be 0
//!  3: packet code (u8)
//!     * high nibble: attribute - NONE 0, RESET 1, RESET-ACK 2, LOOPBACK-REQUEST 3,
//!        LOOPBACK-RESPONSE 4
//!     * low nibble: error - NONE 0, CHECKSUM 1, OOM 2, BUSY 3, HEADER 4, ORDER 5, TIMEOUT 6,
//!        MAX_RETRIES 7, FORCED_RESET 8, APP_LAYER 0xF
//!  4: ack seq (u8): the next seq the sender expects from its peer
//!  5: seq (u8)
//!  6: payload length (u16)
//!  8: reserved (u16), must be 0
//! 10: payload (length bytes)
//!  *: CRC-32/ISO-HDLC over header (excluding preamble) and payload (u32)
//! ```
//!
//! This adds 14 bytes to each packet's payload, so a link buffer of `n` bytes has an MTU of
//!  `n - 14`.
//!
//! ## Sequence numbers
//!
//! A payload packet carries the seq the peer asked for in its last ack seq. A packet without
//!  payload (a pure ACK or NACK) repeats the previous seq. The receiver accepts only the payload
//!  packet with the expected seq and NACKs everything else with ORDER, except for a duplicate of
//!  the previous packet: that is the sign of a lost ACK, and the ACK is sent again.
//!
//! ## Handshake
//!
//! ```ascii
//! A                                            B
//! |--- RESET     seq=0 ackSeq=0 cfg ---------->|   B wipes its state
//! |<-- RESET-ACK seq=0 ackSeq=1 cfg -----------|   B is operational
//! |--- ACK       seq=0 ackSeq=1 -------------->|   A is operational
//! |--- payload   seq=1 ackSeq=1 ... ---------->|
//! ```
//!
//! RESET and RESET-ACK carry the sender's protocol version (major, minor, patch followed by three
//!  reserved bytes). A RESET that is not answered within the reset timeout causes another
//!  RESET, and after too many attempts the transport enters permanent failure where it only
//!  reacts to a RESET from the peer.
//!
//! ## Threading
//!
//! All protocol state is behind a single mutex that is never held across an `.await`. Calls into
//!  the link and the app layer happen without the lock, so both may call back into the transport.
//!  Sending, retransmission and all timeouts are handled by a single worker task that is woken
//!  through [notifier::Notifier].

pub mod app_layer;
pub mod config;
pub mod frame_codec;
pub mod link;
pub mod loopback;
pub mod notifier;
pub mod packet_header;
pub mod reset_config;
pub mod safe_converter;
pub mod test_util;
pub mod transport;

mod reset;
mod rx;
mod tx;
mod worker;

pub use reset::ResetState;
pub use rx::RxState;
