use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use async_trait::async_trait;
use tokio::time::Instant;

use crate::app_layer::AppLayer;

/// An app layer for tests that records what the transport delivers to it.
pub struct RecordingAppLayer {
    datagrams: Mutex<Vec<Vec<u8>>>,
    num_resets: AtomicUsize,
    num_timeouts: AtomicUsize,
    discovery_complete: AtomicBool,
    /// a synthetic response that is due at the given time
    pending_request: Mutex<Option<(Instant, Vec<u8>)>>,
}

impl Default for RecordingAppLayer {
    fn default() -> Self {
        RecordingAppLayer {
            datagrams: Default::default(),
            num_resets: AtomicUsize::new(0),
            num_timeouts: AtomicUsize::new(0),
            discovery_complete: AtomicBool::new(true),
            pending_request: Default::default(),
        }
    }
}

impl RecordingAppLayer {
    pub fn datagrams(&self) -> Vec<Vec<u8>> {
        self.datagrams.lock().unwrap().clone()
    }

    pub fn num_resets(&self) -> usize {
        self.num_resets.load(Ordering::Acquire)
    }

    pub fn num_timeouts(&self) -> usize {
        self.num_timeouts.load(Ordering::Acquire)
    }

    pub fn set_discovery_complete(&self, discovery_complete: bool) {
        self.discovery_complete.store(discovery_complete, Ordering::Release);
    }

    /// Simulates an outstanding request: `timeout_response` is delivered through the RX path
    ///  if the deadline passes.
    pub fn add_request(&self, deadline: Instant, timeout_response: Vec<u8>) {
        *self.pending_request.lock().unwrap() = Some((deadline, timeout_response));
    }
}

#[async_trait]
impl AppLayer for RecordingAppLayer {
    async fn process_rx_datagram(&self, datagram: Vec<u8>) {
        self.datagrams.lock().unwrap().push(datagram);
    }

    async fn process_reset(&self) {
        self.num_resets.fetch_add(1, Ordering::AcqRel);
    }

    async fn process_timeout(&self, _now: Instant) {
        self.num_timeouts.fetch_add(1, Ordering::AcqRel);
    }

    fn next_timer_deadline(&self) -> Option<Instant> {
        None
    }

    fn next_request_deadline(&self) -> Option<Instant> {
        self.pending_request.lock().unwrap()
            .as_ref()
            .map(|(deadline, _)| *deadline)
    }

    fn take_timed_out_response(&self, now: Instant) -> Option<Vec<u8>> {
        let mut pending = self.pending_request.lock().unwrap();
        match pending.as_ref() {
            Some((deadline, _)) if *deadline <= now => pending.take().map(|(_, response)| response),
            _ => None,
        }
    }

    fn is_discovery_complete(&self) -> bool {
        self.discovery_complete.load(Ordering::Acquire)
    }
}
