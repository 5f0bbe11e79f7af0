use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use bytes::BytesMut;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::app_layer::AppLayer;
use crate::config::TransportConfig;
use crate::frame_codec::mtu_for_buffer_len;
use crate::link::{LinkConfig, LinkLayer, LinkStatus};
use crate::loopback::{LoopbackError, LoopbackOutcome, LoopbackState};
use crate::notifier::{Notifier, SIGNAL_EVENT, SIGNAL_EXIT, SIGNAL_FORCE_RESET, SIGNAL_LINK_MASK};
use crate::packet_header::{PacketCode, PacketError, PacketHeader};
use crate::reset::ResetState;
use crate::rx::{RxState, RxStatus};
use crate::tx::TxStatus;

/// Work that results from a state transition but must not run while the state is locked: calls
///  into the app layer and into the link.
#[derive(Debug)]
pub(crate) enum Effect {
    DeliverDatagram(Vec<u8>),
    AppReset,
    LinkReset,
    /// a packet that bypasses the TX queue, `link_busy` is already set
    Transmit(BytesMut),
}

/// All mutable protocol state of a transport. It is only ever accessed with the transport's
///  lock held, and the lock is never held across an `.await`.
pub(crate) struct TransportState {
    pub(crate) config: Arc<TransportConfig>,
    pub(crate) notifier: Arc<Notifier>,
    pub(crate) tx_mtu: usize,
    pub(crate) rx_mtu: usize,

    pub(crate) rx: RxStatus,
    /// header of the packet being received - deliberately survives a reset
    pub(crate) rx_header: PacketHeader,
    /// reassembly buffer for the datagram being received
    pub(crate) rx_datagram: Vec<u8>,

    pub(crate) tx: TxStatus,
    pub(crate) tx_queue: VecDeque<Vec<u8>>,
    /// `None` while the link is sending from it
    pub(crate) tx_buffer: Option<BytesMut>,
    tx_buffer_len: usize,

    pub(crate) reset_state: ResetState,
    pub(crate) reset_count: usize,
    pub(crate) reset_time: Option<Instant>,
    reset_watch: watch::Sender<ResetState>,

    pub(crate) loopback: LoopbackState,

    effects: Vec<Effect>,
}

impl TransportState {
    pub(crate) fn new(config: Arc<TransportConfig>, notifier: Arc<Notifier>, link_config: LinkConfig, reset_watch: watch::Sender<ResetState>) -> TransportState {
        TransportState {
            tx_queue: VecDeque::with_capacity(config.tx_queue_len),
            config,
            notifier,
            tx_mtu: mtu_for_buffer_len(link_config.tx_buffer_len),
            rx_mtu: mtu_for_buffer_len(link_config.rx_buffer_len),
            rx: RxStatus::default(),
            rx_header: PacketHeader::default(),
            rx_datagram: Vec::new(),
            tx: TxStatus::cleared(),
            tx_buffer: Some(BytesMut::with_capacity(link_config.tx_buffer_len)),
            tx_buffer_len: link_config.tx_buffer_len,
            reset_state: ResetState::Resetting,
            reset_count: 0,
            reset_time: None,
            reset_watch,
            loopback: LoopbackState::default(),
            effects: Vec::new(),
        }
    }

    pub(crate) fn push_effect(&mut self, effect: Effect) {
        self.effects.push(effect);
    }

    pub(crate) fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    pub(crate) fn set_reset_state(&mut self, reset_state: ResetState) {
        self.reset_state = reset_state;
        self.reset_watch.send_replace(reset_state);
    }

    /// borrows the link TX buffer for building a packet
    pub(crate) fn take_tx_buffer(&mut self) -> BytesMut {
        self.tx_buffer.take()
            .unwrap_or_else(|| {
                debug!("TX buffer is still in use by a send that was reset: allocating a new one");
                BytesMut::with_capacity(self.tx_buffer_len)
            })
    }

    /// Hands the TX buffer back after the link is done with it and processes the send result.
    pub(crate) fn finish_send(&mut self, buffer: BytesMut, status: LinkStatus) {
        self.tx_buffer = Some(buffer);
        if status != LinkStatus::Queued {
            self.link_send_done_locked(status);
        }
    }

    pub(crate) fn link_send_done_locked(&mut self, status: LinkStatus) {
        if status != LinkStatus::Sent {
            error!("link failed to send packet: {:?}", status);
        }
        self.tx.link_busy = false;
        // packets that were due while the link was busy
        self.notifier.signal(SIGNAL_EVENT);
    }
}

/// A reliable, framed transport for datagrams over a single point-to-point link.
///
/// A transport instance is created with [Transport::new], and it starts handling traffic once
///  [Transport::start_worker] was called. The worker sends a RESET to synchronize with the peer,
///  and after the handshake the app layer can send datagrams with [Transport::enqueue_tx_datagram].
pub struct Transport {
    pub(crate) config: Arc<TransportConfig>,
    pub(crate) state: Mutex<TransportState>,
    pub(crate) notifier: Arc<Notifier>,
    pub(crate) link: Arc<dyn LinkLayer>,
    pub(crate) app: Arc<dyn AppLayer>,
    reset_watch: watch::Receiver<ResetState>,
    worker_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Transport {
    pub fn new(
        config: Arc<TransportConfig>,
        link: Arc<dyn LinkLayer>,
        app: Arc<dyn AppLayer>,
    ) -> anyhow::Result<Arc<Transport>> {
        config.validate()?;
        let link_config = link.config();
        link_config.validate()?;

        let notifier = Arc::new(Notifier::new());
        let (reset_tx, reset_rx) = watch::channel(ResetState::Resetting);
        let state = TransportState::new(config.clone(), notifier.clone(), link_config, reset_tx);
        debug!("initializing transport: TX MTU {}, RX MTU {}", state.tx_mtu, state.rx_mtu);

        let transport = Arc::new(Transport {
            config,
            state: Mutex::new(state),
            notifier,
            link,
            app,
            reset_watch: reset_rx,
            worker_handle: Mutex::new(None),
        });
        transport.link.init(Arc::downgrade(&transport));
        Ok(transport)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, TransportState> {
        self.state.lock().unwrap()
    }

    /// Stops the worker and releases everything that is queued or partially received.
    pub async fn deinit(&self) {
        info!("deinitializing transport");
        self.stop_worker().await;
        self.link.deinit();

        let mut state = self.lock();
        state.tx_queue.clear();
        state.rx_datagram = Vec::new();
        state.loopback = LoopbackState::default();
    }

    pub fn start_worker(self: &Arc<Self>) {
        let mut handle = self.worker_handle.lock().unwrap();
        if handle.is_some() {
            warn!("worker already started");
            return;
        }
        *handle = Some(tokio::spawn(self.clone().run_worker()));
    }

    /// signals the worker to terminate and waits for it
    pub async fn stop_worker(&self) {
        let handle = self.worker_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            self.notifier.signal(SIGNAL_EXIT);
            if let Err(e) = handle.await {
                error!("worker terminated abnormally: {}", e);
            }
        }
    }

    /// Feeds bytes received by the link into the transport. Returns true if the receiver is idle
    ///  afterwards, i.e. it is not in the middle of a packet.
    pub async fn rx_data(&self, buf: &[u8]) -> bool {
        let discovery_complete = self.app.is_discovery_complete();
        let (idle, effects) = {
            let mut state = self.lock();
            state.rx_data(buf, Instant::now(), discovery_complete);
            (state.rx.is_idle(), state.take_effects())
        };
        self.run_effects(effects).await;
        idle
    }

    /// Called by the link if its framing indicates the end of a packet: a packet that is not
    ///  complete at this point is aborted and NACK'ed.
    pub fn rx_packet_complete(&self) {
        self.lock().rx_packet_complete();
    }

    /// Enqueues a datagram for sending. This fails if the queue is full or if the link is not
    ///  operational (handshake in progress or permanent failure).
    pub fn enqueue_tx_datagram(&self, datagram: Vec<u8>) -> bool {
        let mut state = self.lock();
        if datagram.is_empty() {
            error!("refusing to enqueue empty datagram");
            return false;
        }
        if state.reset_state != ResetState::None {
            error!("link is in state {:?}: discarding TX datagram of {} bytes", state.reset_state, datagram.len());
            return false;
        }
        state.enqueue_datagram_locked(PacketCode::NONE, datagram)
    }

    /// Lets the app layer report OOM or an app layer error to the peer.
    pub fn enqueue_tx_error_datagram(&self, error: PacketError) {
        self.lock().enqueue_tx_error_locked(error);
    }

    pub fn force_reset(&self) {
        warn!("forcing transport reset");
        self.notifier.signal(SIGNAL_FORCE_RESET);
    }

    /// Raises link-defined signal bits; the worker passes them to [LinkLayer::do_work].
    pub fn signal_link_event(&self, bits: u32) {
        if bits & !SIGNAL_LINK_MASK != 0 {
            error!("link signal {:#x} is outside the link signal mask", bits);
        }
        if bits & SIGNAL_LINK_MASK != 0 {
            self.notifier.signal(bits & SIGNAL_LINK_MASK);
        }
    }

    /// Completion callback for sends that returned [LinkStatus::Queued]
    pub fn link_send_done(&self, status: LinkStatus) {
        self.lock().link_send_done_locked(status);
    }

    /// The app layer is done with a datagram it received. Dropping the `Vec` releases it, so
    ///  calling this is optional; it only marks the end of processing in the log.
    pub fn datagram_process_done(&self, datagram: Vec<u8>) {
        trace!("app layer released RX datagram of {} bytes", datagram.len());
    }

    /// Waits until the handshake is complete. Returns false on timeout.
    pub async fn wait_for_reset_complete(&self, max_wait: Duration) -> bool {
        let mut reset_watch = self.reset_watch.clone();
        // bound to a local: the watch guard must be dropped before `reset_watch`
        let complete = match timeout(max_wait, reset_watch.wait_for(|s| *s == ResetState::None)).await {
            Ok(result) => result.is_ok(),
            Err(_) => {
                debug!("reset did not complete within {:?}", max_wait);
                false
            }
        };
        complete
    }

    /// Sends a transport-level loopback request to the peer. The outcome is available through
    ///  [Transport::loopback_outcome] once the response arrived.
    pub async fn send_loopback(&self, data: &[u8]) -> Result<(), LoopbackError> {
        let packet = self.lock().start_loopback(data)?;
        let status = self.link.send(&packet).await;
        self.lock().finish_loopback_send(packet, status)
    }

    pub fn loopback_outcome(&self) -> Option<LoopbackOutcome> {
        self.lock().loopback.outcome
    }

    pub fn reset_state(&self) -> ResetState {
        self.lock().reset_state
    }

    pub fn tx_mtu(&self) -> usize {
        self.lock().tx_mtu
    }

    pub fn rx_mtu(&self) -> usize {
        self.lock().rx_mtu
    }

    pub fn pending_tx_datagrams(&self) -> usize {
        self.lock().tx_queue.len()
    }

    pub fn expected_seq(&self) -> u8 {
        self.lock().rx.expected_seq
    }

    pub fn received_ack_seq(&self) -> u8 {
        self.lock().rx.received_ack_seq
    }

    pub fn rx_state(&self) -> RxState {
        self.lock().rx.state
    }

    pub(crate) async fn run_effects(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::DeliverDatagram(datagram) => {
                    debug!("delivering datagram of {} bytes to app layer", datagram.len());
                    self.app.process_rx_datagram(datagram).await;
                }
                Effect::AppReset => self.app.process_reset().await,
                Effect::LinkReset => self.link.reset(),
                Effect::Transmit(packet) => {
                    let status = self.link.send(&packet).await;
                    self.lock().finish_send(packet, status);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;
    use crate::app_layer::MockAppLayer;
    use crate::frame_codec::{validate_packet, PACKET_OVERHEAD};
    use crate::link::MockLinkLayer;
    use crate::packet_header::{PacketAttr, FLAG_FINISHED_DATAGRAM};
    use crate::reset_config::{ResetConfiguration, TransportVersion};
    use crate::test_util::fake_link::FakeLink;
    use crate::test_util::recording_app::RecordingAppLayer;
    use crate::test_util::{linked_pair, test_packet};

    const FINISHED: u8 = FLAG_FINISHED_DATAGRAM;

    fn code(attr: PacketAttr, error: PacketError) -> PacketCode {
        PacketCode::new(attr, error)
    }

    fn cfg() -> Vec<u8> {
        ResetConfiguration::new(TransportVersion::CURRENT).to_vec()
    }

    async fn settle() {
        sleep(Duration::from_millis(1)).await;
    }

    /// a transport that completed the handshake as the responder: expected seq 1, received ack seq 1
    async fn responder(mtu: usize) -> (Arc<Transport>, Arc<FakeLink>, Arc<RecordingAppLayer>) {
        let link = FakeLink::with_mtu(mtu);
        let app = Arc::new(RecordingAppLayer::default());
        let transport = Transport::new(Arc::new(TransportConfig::default()), link.clone(), app.clone()).unwrap();

        transport.rx_data(&test_packet(FINISHED, code(PacketAttr::Reset, PacketError::None), 0, 0, &cfg())).await;
        transport.start_worker();
        settle().await;
        assert_eq!(link.take_sent_packets(), vec![test_packet(FINISHED, code(PacketAttr::ResetAck, PacketError::None), 0, 1, &cfg())]);

        transport.rx_data(&test_packet(FINISHED, PacketCode::NONE, 0, 1, &[])).await;
        settle().await;
        assert_eq!(transport.reset_state(), ResetState::None);
        assert_eq!(transport.pending_tx_datagrams(), 0);
        assert_eq!(app.num_resets(), 1);
        (transport, link, app)
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_as_initiator() {
        let link = FakeLink::with_mtu(64);
        let app = Arc::new(RecordingAppLayer::default());
        let transport = Transport::new(Arc::new(TransportConfig::default()), link.clone(), app.clone()).unwrap();
        assert_eq!(transport.tx_mtu(), 64);
        assert_eq!(transport.rx_mtu(), 64);
        assert_eq!(transport.reset_state(), ResetState::Resetting);

        transport.start_worker();
        settle().await;
        let reset = link.take_sent_packets();
        assert_eq!(reset, vec![test_packet(FINISHED, code(PacketAttr::Reset, PacketError::None), 0, 0, &cfg())]);
        assert_eq!(&reset[0][..10], &[0x68, 0x43, 0x01, 0x10, 0x00, 0x00, 0x06, 0x00, 0x00, 0x00]);

        // datagrams are refused until the handshake is complete
        assert!(!transport.enqueue_tx_datagram(vec![1]));

        transport.rx_data(&test_packet(FINISHED, code(PacketAttr::ResetAck, PacketError::None), 0, 1, &cfg())).await;
        settle().await;
        assert_eq!(transport.reset_state(), ResetState::None);
        assert!(transport.wait_for_reset_complete(Duration::from_millis(1)).await);
        assert_eq!(app.num_resets(), 1);
        assert_eq!(link.take_sent_packets(), vec![test_packet(FINISHED, PacketCode::NONE, 0, 1, &[])]);

        assert!(transport.enqueue_tx_datagram(vec![0xde, 0xad, 0xbe, 0xef]));
        settle().await;
        assert_eq!(link.take_sent_packets(), vec![test_packet(FINISHED, PacketCode::NONE, 1, 1, &[0xde, 0xad, 0xbe, 0xef])]);

        transport.rx_data(&test_packet(FINISHED, PacketCode::NONE, 0, 2, &[])).await;
        assert_eq!(transport.pending_tx_datagrams(), 0);
        assert_eq!(transport.received_ack_seq(), 2);

        transport.stop_worker().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_as_responder() {
        let (transport, link, app) = responder(64).await;

        transport.rx_data(&test_packet(FINISHED, PacketCode::NONE, 1, 1, &[0xde, 0xad, 0xbe, 0xef])).await;
        settle().await;
        assert_eq!(app.datagrams(), vec![vec![0xde, 0xad, 0xbe, 0xef]]);
        assert_eq!(transport.expected_seq(), 2);
        assert_eq!(link.take_sent_packets(), vec![test_packet(FINISHED, PacketCode::NONE, 0, 2, &[])]);

        transport.deinit().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_ack_not_acked_before_discovery() {
        let link = FakeLink::with_mtu(64);
        let app = Arc::new(RecordingAppLayer::default());
        app.set_discovery_complete(false);
        let transport = Transport::new(Arc::new(TransportConfig::default()), link.clone(), app.clone()).unwrap();

        transport.start_worker();
        settle().await;
        assert_eq!(link.sent_packets().len(), 1);

        transport.rx_data(&test_packet(FINISHED, code(PacketAttr::ResetAck, PacketError::None), 0, 1, &cfg())).await;
        settle().await;
        assert_eq!(transport.reset_state(), ResetState::None);
        assert_eq!(app.num_resets(), 1);
        // the app layer's first datagram carries the ACK
        assert_eq!(link.sent_packets().len(), 1);

        assert!(transport.enqueue_tx_datagram(vec![9]));
        settle().await;
        assert_eq!(link.take_sent_packets()[1], test_packet(FINISHED, PacketCode::NONE, 1, 1, &[9]));

        transport.stop_worker().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_happy_path_over_linked_pair() {
        let pair = linked_pair(TransportConfig::default(), 64).unwrap();
        pair.start();
        assert!(pair.a.wait_for_reset_complete(Duration::from_secs(1)).await);
        assert!(pair.b.wait_for_reset_complete(Duration::from_secs(1)).await);
        settle().await;
        pair.link_a.take_sent_packets();
        pair.link_b.take_sent_packets();

        assert!(pair.a.enqueue_tx_datagram(vec![0xde, 0xad, 0xbe, 0xef]));
        sleep(Duration::from_millis(10)).await;

        assert_eq!(pair.app_b.datagrams(), vec![vec![0xde, 0xad, 0xbe, 0xef]]);
        assert_eq!(pair.link_a.take_sent_packets(), vec![test_packet(FINISHED, PacketCode::NONE, 1, 1, &[0xde, 0xad, 0xbe, 0xef])]);
        assert_eq!(pair.link_b.take_sent_packets(), vec![test_packet(FINISHED, PacketCode::NONE, 0, 2, &[])]);
        assert_eq!(pair.a.pending_tx_datagrams(), 0);

        // and back
        assert!(pair.b.enqueue_tx_datagram(vec![1, 2, 3]));
        sleep(Duration::from_millis(10)).await;
        assert_eq!(pair.app_a.datagrams(), vec![vec![1, 2, 3]]);

        pair.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_retransmit_after_lost_ack() {
        let pair = linked_pair(TransportConfig::default(), 64).unwrap();
        pair.start();
        assert!(pair.a.wait_for_reset_complete(Duration::from_secs(1)).await);
        assert!(pair.b.wait_for_reset_complete(Duration::from_secs(1)).await);
        settle().await;
        pair.link_a.take_sent_packets();
        pair.link_b.take_sent_packets();

        let mut dropped = false;
        pair.link_b.set_impairment(move |_| {
            let deliver = dropped;
            dropped = true;
            deliver
        });

        assert!(pair.a.enqueue_tx_datagram(vec![0xde, 0xad, 0xbe, 0xef]));
        sleep(Duration::from_millis(250)).await;

        let sent_a = pair.link_a.take_sent_packets();
        assert_eq!(sent_a.len(), 2);
        assert_eq!(sent_a[0], sent_a[1]);

        // the duplicate is ACK'ed again, but not delivered again
        let sent_b = pair.link_b.take_sent_packets();
        assert_eq!(sent_b, vec![test_packet(FINISHED, PacketCode::NONE, 0, 2, &[]); 2]);
        assert_eq!(pair.app_b.datagrams().len(), 1);
        assert_eq!(pair.a.pending_tx_datagrams(), 0);

        pair.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequence_numbers_wrap_around() {
        let pair = linked_pair(TransportConfig::default(), 64).unwrap();
        pair.start();
        assert!(pair.a.wait_for_reset_complete(Duration::from_secs(1)).await);
        assert!(pair.b.wait_for_reset_complete(Duration::from_secs(1)).await);
        settle().await;

        let datagrams = (0..300u16)
            .map(|i| i.to_le_bytes().to_vec())
            .collect::<Vec<_>>();
        for datagram in &datagrams {
            assert!(pair.a.enqueue_tx_datagram(datagram.clone()));
            settle().await;
        }

        assert_eq!(pair.app_b.datagrams(), datagrams);
        assert_eq!(pair.a.pending_tx_datagrams(), 0);
        assert_eq!(pair.a.received_ack_seq(), (301 % 256) as u8);
        assert_eq!(pair.b.expected_seq(), (301 % 256) as u8);

        pair.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_fragmentation_over_linked_pair() {
        let pair = linked_pair(TransportConfig::default(), 8).unwrap();
        pair.start();
        assert!(pair.a.wait_for_reset_complete(Duration::from_secs(1)).await);
        assert!(pair.b.wait_for_reset_complete(Duration::from_secs(1)).await);
        settle().await;
        pair.link_a.take_sent_packets();

        let datagram = (0..12).collect::<Vec<u8>>();
        assert!(pair.a.enqueue_tx_datagram(datagram.clone()));
        sleep(Duration::from_millis(10)).await;

        assert_eq!(pair.app_b.datagrams(), vec![datagram]);

        let sent_a = pair.link_a.take_sent_packets();
        assert_eq!(sent_a, vec![
            test_packet(0, PacketCode::NONE, 1, 1, &[0, 1, 2, 3, 4, 5, 6, 7]),
            test_packet(FINISHED, PacketCode::NONE, 2, 1, &[8, 9, 10, 11]),
        ]);
        assert_eq!(pair.b.expected_seq(), 3);

        pair.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupt_packet_is_nacked_and_retransmitted() {
        let pair = linked_pair(TransportConfig::default(), 64).unwrap();
        pair.start();
        assert!(pair.a.wait_for_reset_complete(Duration::from_secs(1)).await);
        assert!(pair.b.wait_for_reset_complete(Duration::from_secs(1)).await);
        settle().await;
        pair.link_b.take_sent_packets();

        let mut corrupted = false;
        pair.link_a.set_impairment(move |packet| {
            if !corrupted && packet.len() > PACKET_OVERHEAD {
                packet[10] ^= 0xff;
                corrupted = true;
            }
            true
        });

        assert!(pair.a.enqueue_tx_datagram(vec![5, 6, 7]));
        settle().await;
        assert!(pair.app_b.datagrams().is_empty());
        assert_eq!(pair.b.expected_seq(), 1);
        assert_eq!(pair.link_b.take_sent_packets(), vec![test_packet(FINISHED, code(PacketAttr::None, PacketError::Checksum), 0, 1, &[])]);

        sleep(Duration::from_millis(150)).await;
        assert_eq!(pair.app_b.datagrams(), vec![vec![5, 6, 7]]);
        assert_eq!(pair.b.expected_seq(), 2);
        assert_eq!(pair.a.pending_tx_datagrams(), 0);

        pair.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_payload_resends_ack() {
        let (transport, link, app) = responder(64).await;

        let payload = test_packet(FINISHED, PacketCode::NONE, 1, 1, &[1, 2, 3]);
        transport.rx_data(&payload).await;
        settle().await;
        let ack = link.take_sent_packets();
        assert_eq!(ack, vec![test_packet(FINISHED, PacketCode::NONE, 0, 2, &[])]);

        // the ACK was lost, the peer retransmits
        transport.rx_data(&payload).await;
        settle().await;
        assert_eq!(link.take_sent_packets(), ack);
        assert_eq!(app.datagrams(), vec![vec![1, 2, 3]]);
        assert_eq!(transport.expected_seq(), 2);

        transport.stop_worker().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_order_payload_is_nacked() {
        let (transport, link, app) = responder(64).await;

        transport.rx_data(&test_packet(FINISHED, PacketCode::NONE, 2, 1, &[1])).await;
        settle().await;
        assert!(app.datagrams().is_empty());
        assert_eq!(link.take_sent_packets(), vec![test_packet(FINISHED, code(PacketAttr::None, PacketError::Order), 0, 1, &[])]);

        transport.stop_worker().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_storm_then_recovery() {
        let link = FakeLink::with_mtu(64);
        link.set_connected(false);
        let app = Arc::new(RecordingAppLayer::default());
        let config = TransportConfig::default();
        let reset_timeout = config.reset_timeout;
        let transport = Transport::new(Arc::new(config), link.clone(), app.clone()).unwrap();

        transport.start_worker();
        assert!(!transport.wait_for_reset_complete(reset_timeout * 2).await);
        assert_eq!(transport.reset_state(), ResetState::Resetting);

        sleep(reset_timeout * 2).await;
        assert_eq!(transport.reset_state(), ResetState::PermanentFailure);
        assert!(!transport.enqueue_tx_datagram(vec![1]));
        assert_eq!(transport.pending_tx_datagrams(), 0);

        let sent = link.take_sent_packets();
        assert_eq!(sent[0], test_packet(FINISHED, code(PacketAttr::Reset, PacketError::None), 0, 0, &cfg()));
        let num_timeout_resets = sent.iter()
            .filter(|p| validate_packet(p, 64).unwrap().header.packet_code == code(PacketAttr::Reset, PacketError::Timeout))
            .count();
        assert_eq!(num_timeout_resets, 2);

        // nothing more is sent in permanent failure, not even an app layer error
        transport.enqueue_tx_error_datagram(PacketError::AppLayer);
        sleep(reset_timeout * 2).await;
        assert!(link.take_sent_packets().is_empty());

        // only the peer can revive the link
        transport.rx_data(&test_packet(FINISHED, code(PacketAttr::Reset, PacketError::None), 0, 0, &cfg())).await;
        settle().await;
        assert_eq!(transport.reset_state(), ResetState::None);
        assert_eq!(link.take_sent_packets(), vec![test_packet(FINISHED, code(PacketAttr::ResetAck, PacketError::None), 0, 1, &cfg())]);
        assert!(transport.enqueue_tx_datagram(vec![1]));
        assert_eq!(app.num_resets(), 1);

        transport.stop_worker().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_retransmissions_cause_reset() {
        let (transport, link, app) = responder(64).await;
        let config = TransportConfig::default();

        assert!(transport.enqueue_tx_datagram(vec![7, 7]));
        sleep(config.tx_timeout * (config.max_retx as u32 + 1) + Duration::from_millis(10)).await;

        let sent = link.take_sent_packets();
        let payload = test_packet(FINISHED, PacketCode::NONE, 1, 1, &[7, 7]);
        assert_eq!(sent[..=config.max_retx].to_vec(), vec![payload; config.max_retx + 1]);
        assert_eq!(sent[config.max_retx + 1], test_packet(FINISHED, code(PacketAttr::Reset, PacketError::MaxRetries), 0, 1, &cfg()));
        assert_eq!(transport.reset_state(), ResetState::Resetting);
        assert_eq!(app.num_resets(), 1);

        transport.stop_worker().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_reset() {
        let (transport, link, _app) = responder(64).await;

        transport.force_reset();
        settle().await;
        assert_eq!(transport.reset_state(), ResetState::Resetting);
        assert_eq!(link.take_sent_packets(), vec![test_packet(FINISHED, code(PacketAttr::Reset, PacketError::ForcedReset), 0, 1, &cfg())]);

        transport.stop_worker().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rx_timeout_is_nacked() {
        let (transport, link, app) = responder(64).await;

        let packet = test_packet(FINISHED, PacketCode::NONE, 1, 1, &[1, 2, 3, 4]);
        assert!(!transport.rx_data(&packet[..12]).await);
        assert_eq!(transport.rx_state(), RxState::Payload);

        sleep(transport.config.rx_timeout + Duration::from_millis(1)).await;
        assert_eq!(transport.rx_state(), RxState::Preamble);
        assert_eq!(link.take_sent_packets(), vec![test_packet(FINISHED, code(PacketAttr::None, PacketError::Timeout), 0, 1, &[])]);

        assert!(transport.rx_data(&packet).await);
        assert_eq!(app.datagrams(), vec![vec![1, 2, 3, 4]]);

        transport.stop_worker().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_header_length_beyond_mtu_is_nacked() {
        let (transport, link, app) = responder(16).await;

        transport.rx_data(&test_packet(FINISHED, PacketCode::NONE, 1, 1, &[0; 17])).await;
        settle().await;
        assert!(app.datagrams().is_empty());
        assert_eq!(transport.expected_seq(), 1);
        assert_eq!(link.take_sent_packets(), vec![test_packet(FINISHED, code(PacketAttr::None, PacketError::Header), 0, 1, &[])]);

        transport.stop_worker().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_packet_complete_aborts_truncated_packet() {
        let (transport, link, app) = responder(64).await;

        let packet = test_packet(FINISHED, PacketCode::NONE, 1, 1, &[1, 2, 3]);
        transport.rx_data(&packet[..packet.len() - 2]).await;
        transport.rx_packet_complete();
        settle().await;

        assert_eq!(transport.rx_state(), RxState::Preamble);
        assert!(app.datagrams().is_empty());
        assert_eq!(link.take_sent_packets(), vec![test_packet(FINISHED, code(PacketAttr::None, PacketError::Header), 0, 1, &[])]);

        transport.stop_worker().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_tx_queue_full() {
        let (transport, _link, _app) = responder(64).await;

        for i in 0..TransportConfig::default().tx_queue_len {
            assert!(transport.enqueue_tx_datagram(vec![i as u8]));
        }
        assert!(!transport.enqueue_tx_datagram(vec![99]));
        assert!(!transport.enqueue_tx_datagram(vec![]));

        transport.stop_worker().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_datagram() {
        let (transport, link, _app) = responder(64).await;

        transport.enqueue_tx_error_datagram(PacketError::Checksum);
        settle().await;
        assert!(link.take_sent_packets().is_empty());

        transport.enqueue_tx_error_datagram(PacketError::AppLayer);
        settle().await;
        assert_eq!(link.take_sent_packets(), vec![test_packet(FINISHED, code(PacketAttr::None, PacketError::AppLayer), 0, 1, &[])]);

        transport.stop_worker().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_response() {
        let (transport, _link, app) = responder(64).await;

        app.add_request(Instant::now() + Duration::from_millis(50), vec![0xee]);
        // an ACK without pending payload makes the worker recalculate its deadline
        transport.rx_data(&test_packet(FINISHED, PacketCode::NONE, 0, 1, &[])).await;

        sleep(Duration::from_millis(49)).await;
        assert!(app.datagrams().is_empty());
        sleep(Duration::from_millis(2)).await;
        assert_eq!(app.datagrams(), vec![vec![0xee]]);

        transport.stop_worker().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_asynchronous_link_send() {
        let (transport, link, _app) = responder(64).await;
        link.set_send_status(LinkStatus::Queued);

        transport.rx_data(&test_packet(FINISHED, PacketCode::NONE, 1, 1, &[1])).await;
        settle().await;
        assert_eq!(link.take_sent_packets().len(), 1);

        // the link still holds the buffer: the second ACK waits
        transport.rx_data(&test_packet(FINISHED, PacketCode::NONE, 2, 1, &[2])).await;
        settle().await;
        assert!(link.take_sent_packets().is_empty());

        link.set_send_status(LinkStatus::Sent);
        link.complete_send(LinkStatus::Sent);
        settle().await;
        assert_eq!(link.take_sent_packets(), vec![test_packet(FINISHED, PacketCode::NONE, 0, 3, &[])]);

        transport.stop_worker().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_loopback_over_linked_pair() {
        let pair = linked_pair(TransportConfig::default(), 64).unwrap();
        pair.start();
        assert!(pair.a.wait_for_reset_complete(Duration::from_secs(1)).await);
        assert!(pair.b.wait_for_reset_complete(Duration::from_secs(1)).await);
        settle().await;

        pair.a.send_loopback(&[1, 2, 3, 4]).await.unwrap();
        settle().await;
        assert_eq!(pair.a.loopback_outcome(), Some(LoopbackOutcome::Success));
        assert!(pair.app_b.datagrams().is_empty());

        assert_eq!(pair.a.send_loopback(&[]).await, Err(LoopbackError::InvalidLength { len: 0, mtu: 64 }));

        pair.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_event_is_forwarded() {
        let (transport, link, _app) = responder(64).await;

        transport.signal_link_event(0x0001_0000);
        settle().await;
        assert_eq!(link.link_signals(), vec![0x0001_0000]);

        transport.stop_worker().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_deinit_releases_queue() {
        let (transport, _link, _app) = responder(64).await;
        assert!(transport.enqueue_tx_datagram(vec![1, 2, 3]));
        assert!(transport.enqueue_tx_datagram(vec![4]));

        transport.deinit().await;
        assert_eq!(transport.pending_tx_datagrams(), 0);
    }

    #[test]
    fn test_new_rejects_small_link_buffer() {
        let mut link = MockLinkLayer::new();
        link.expect_config()
            .return_const(LinkConfig { tx_buffer_len: PACKET_OVERHEAD, rx_buffer_len: 100 });
        link.expect_init()
            .never();

        assert!(Transport::new(Arc::new(TransportConfig::default()), Arc::new(link), Arc::new(MockAppLayer::new())).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_app_layer_is_called_without_lock() {
        struct ReentrantApp {
            transport: std::sync::Mutex<std::sync::Weak<Transport>>,
            num_echoed: AtomicUsize,
        }

        #[async_trait::async_trait]
        impl AppLayer for ReentrantApp {
            async fn process_rx_datagram(&self, datagram: Vec<u8>) {
                let transport = self.transport.lock().unwrap().upgrade();
                if let Some(transport) = transport {
                    // calling back into the transport would deadlock if the lock were held
                    assert!(transport.enqueue_tx_datagram(datagram.clone()));
                    transport.datagram_process_done(datagram);
                    self.num_echoed.fetch_add(1, Ordering::AcqRel);
                }
            }
            async fn process_reset(&self) {}
            async fn process_timeout(&self, _now: Instant) {}
            fn next_timer_deadline(&self) -> Option<Instant> { None }
            fn next_request_deadline(&self) -> Option<Instant> { None }
            fn take_timed_out_response(&self, _now: Instant) -> Option<Vec<u8>> { None }
            fn is_discovery_complete(&self) -> bool { true }
        }

        let link = FakeLink::with_mtu(64);
        let app = Arc::new(ReentrantApp { transport: Default::default(), num_echoed: AtomicUsize::new(0) });
        let transport = Transport::new(Arc::new(TransportConfig::default()), link.clone(), app.clone()).unwrap();
        *app.transport.lock().unwrap() = Arc::downgrade(&transport);

        transport.rx_data(&test_packet(FINISHED, code(PacketAttr::Reset, PacketError::None), 0, 0, &cfg())).await;
        transport.rx_data(&test_packet(FINISHED, PacketCode::NONE, 0, 1, &[])).await;
        assert_eq!(transport.pending_tx_datagrams(), 0);
        transport.rx_data(&test_packet(FINISHED, PacketCode::NONE, 1, 1, &[4, 2])).await;

        assert_eq!(app.num_echoed.load(Ordering::Acquire), 1);
        assert_eq!(transport.pending_tx_datagrams(), 1);
    }
}
