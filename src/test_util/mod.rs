//! Utilities for testing code that uses the transport: a fake link, an app layer that records
//!  what it receives, and a pair of transports wired back to back.
//!
//! They are part of the crate's regular (non-#[cfg(test)]) code so that link drivers and app
//!  layers in other crates can use them for their own tests.

pub mod fake_link;
pub mod recording_app;

use std::sync::Arc;
use bytes::BytesMut;

use crate::config::TransportConfig;
use crate::frame_codec::encode_packet;
use crate::packet_header::{PacketCode, PacketHeader};
use crate::safe_converter::PrecheckedCast;
use crate::test_util::fake_link::FakeLink;
use crate::test_util::recording_app::RecordingAppLayer;
use crate::transport::Transport;

/// Encodes a complete packet the way a peer would send it.
pub fn test_packet(flags: u8, packet_code: PacketCode, seq: u8, ack_seq: u8, payload: &[u8]) -> Vec<u8> {
    let header = PacketHeader {
        flags,
        packet_code,
        ack_seq,
        seq,
        length: payload.len().prechecked_cast(),
        reserved: 0,
    };
    let mut buf = BytesMut::with_capacity(payload.len() + crate::frame_codec::PACKET_OVERHEAD);
    encode_packet(&mut buf, &header, payload);
    buf.to_vec()
}

pub struct LinkedPair {
    pub a: Arc<Transport>,
    pub b: Arc<Transport>,
    pub link_a: Arc<FakeLink>,
    pub link_b: Arc<FakeLink>,
    pub app_a: Arc<RecordingAppLayer>,
    pub app_b: Arc<RecordingAppLayer>,
}

impl LinkedPair {
    pub fn start(&self) {
        self.a.start_worker();
        self.b.start_worker();
    }

    pub async fn stop(&self) {
        self.a.stop_worker().await;
        self.b.stop_worker().await;
    }
}

/// Two transports with the same configuration and MTU, connected through [FakeLink]s. The
///  workers are not started. This must be called inside a tokio runtime.
pub fn linked_pair(config: TransportConfig, mtu: usize) -> anyhow::Result<LinkedPair> {
    let config = Arc::new(config);

    let link_a = FakeLink::with_mtu(mtu);
    let link_b = FakeLink::with_mtu(mtu);
    link_a.connect(&link_b);
    link_b.connect(&link_a);

    let app_a = Arc::new(RecordingAppLayer::default());
    let app_b = Arc::new(RecordingAppLayer::default());

    let a = Transport::new(config.clone(), link_a.clone(), app_a.clone())?;
    let b = Transport::new(config, link_b.clone(), app_b.clone())?;

    Ok(LinkedPair { a, b, link_a, link_b, app_a, app_b })
}
