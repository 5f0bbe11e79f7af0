use std::sync::{Arc, Mutex, Weak};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::link::{LinkConfig, LinkLayer, LinkStatus};
use crate::transport::Transport;

/// Decides the fate of a packet on the wire: it may modify the packet, and it returns false to
///  drop it.
pub type Impairment = Box<dyn FnMut(&mut Vec<u8>) -> bool + Send>;

/// An in-memory link for tests. It records every packet the transport sends, and it can be
///  wired to a peer link so that packets are delivered to the peer transport's RX path.
pub struct FakeLink {
    config: LinkConfig,
    transport: Mutex<Weak<Transport>>,
    sent: Mutex<Vec<Vec<u8>>>,
    connected: AtomicBool,
    send_status: Mutex<LinkStatus>,
    wire: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    impairment: Mutex<Option<Impairment>>,
    num_resets: AtomicUsize,
    link_signals: Mutex<Vec<u32>>,
}

impl FakeLink {
    pub fn new(config: LinkConfig) -> Arc<FakeLink> {
        Arc::new(FakeLink {
            config,
            transport: Mutex::new(Weak::new()),
            sent: Default::default(),
            connected: AtomicBool::new(true),
            send_status: Mutex::new(LinkStatus::Sent),
            wire: Default::default(),
            impairment: Default::default(),
            num_resets: AtomicUsize::new(0),
            link_signals: Default::default(),
        })
    }

    pub fn with_mtu(mtu: usize) -> Arc<FakeLink> {
        let buffer_len = mtu + crate::frame_codec::PACKET_OVERHEAD;
        FakeLink::new(LinkConfig { tx_buffer_len: buffer_len, rx_buffer_len: buffer_len })
    }

    /// Delivers everything this link sends to `peer`'s transport. Delivery happens in a separate
    ///  task, so this requires a tokio runtime.
    pub fn connect(&self, peer: &Arc<FakeLink>) {
        let (send, mut recv) = mpsc::unbounded_channel::<Vec<u8>>();
        *self.wire.lock().unwrap() = Some(send);

        let peer = Arc::downgrade(peer);
        tokio::spawn(async move {
            while let Some(packet) = recv.recv().await {
                let transport = match peer.upgrade() {
                    Some(peer) => peer.transport(),
                    None => break,
                };
                match transport {
                    Some(transport) => {
                        transport.rx_data(&packet).await;
                    }
                    None => trace!("peer transport is gone: dropping packet"),
                }
            }
        });
    }

    pub fn transport(&self) -> Option<Arc<Transport>> {
        self.transport.lock().unwrap().upgrade()
    }

    /// A disconnected link still accepts packets, but they never reach the peer.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    pub fn set_impairment(&self, impairment: impl FnMut(&mut Vec<u8>) -> bool + Send + 'static) {
        *self.impairment.lock().unwrap() = Some(Box::new(impairment));
    }

    pub fn clear_impairment(&self) {
        *self.impairment.lock().unwrap() = None;
    }

    /// the status returned by subsequent sends, e.g. [LinkStatus::Queued] to simulate an
    ///  asynchronous link
    pub fn set_send_status(&self, status: LinkStatus) {
        *self.send_status.lock().unwrap() = status;
    }

    /// completes a send that returned [LinkStatus::Queued]
    pub fn complete_send(&self, status: LinkStatus) {
        if let Some(transport) = self.transport() {
            transport.link_send_done(status);
        }
    }

    pub fn sent_packets(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    pub fn take_sent_packets(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub fn num_resets(&self) -> usize {
        self.num_resets.load(Ordering::Acquire)
    }

    pub fn link_signals(&self) -> Vec<u32> {
        self.link_signals.lock().unwrap().clone()
    }
}

#[async_trait]
impl LinkLayer for FakeLink {
    fn init(&self, transport: Weak<Transport>) {
        *self.transport.lock().unwrap() = transport;
    }

    fn deinit(&self) {
        debug!("fake link deinit");
        *self.wire.lock().unwrap() = None;
    }

    async fn send(&self, packet: &[u8]) -> LinkStatus {
        self.sent.lock().unwrap().push(packet.to_vec());

        if self.connected.load(Ordering::Acquire) {
            let mut packet = packet.to_vec();
            let deliver = match self.impairment.lock().unwrap().as_mut() {
                Some(impairment) => impairment(&mut packet),
                None => true,
            };

            if deliver {
                if let Some(wire) = self.wire.lock().unwrap().as_ref() {
                    let _ = wire.send(packet);
                }
            }
            else {
                debug!("fake link dropping packet");
            }
        }

        *self.send_status.lock().unwrap()
    }

    async fn do_work(&self, signals: u32) {
        self.link_signals.lock().unwrap().push(signals);
    }

    fn reset(&self) {
        self.num_resets.fetch_add(1, Ordering::AcqRel);
    }

    fn config(&self) -> LinkConfig {
        self.config
    }
}
