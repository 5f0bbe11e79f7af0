use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::notifier::{SIGNAL_EVENT, SIGNAL_EXIT, SIGNAL_FORCE_RESET, SIGNAL_LINK_MASK};
use crate::packet_header::{PacketAttr, PacketError};
use crate::reset::ResetState;
use crate::rx::RxState;
use crate::transport::Transport;

/// How long the worker can sleep before something is due
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkTimeout {
    Immediate,
    Infinite,
    After(Duration),
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

impl Transport {
    /// The worker loop: it sleeps until either a signal arrives or the next deadline expires, and
    ///  does all sending, retransmission and timeout handling.
    pub(crate) async fn run_worker(self: Arc<Self>) {
        info!("transport worker started");
        self.send_initial_reset();

        loop {
            let signals = match self.time_until_next_do_work() {
                WorkTimeout::Immediate => {
                    tokio::task::yield_now().await;
                    self.notifier.get_signal()
                }
                WorkTimeout::Infinite => self.notifier.wait().await,
                WorkTimeout::After(duration) => self.notifier.timed_wait(duration).await,
            };

            if !self.handle_signals(signals).await {
                break;
            }
        }
        info!("transport worker terminated");
    }

    fn send_initial_reset(&self) {
        let mut state = self.lock();
        if state.has_pending_tx_payload() {
            // the peer's RESET was received before the worker started
            debug!("handshake already in progress: not sending initial RESET");
            return;
        }
        state.send_reset_locked(PacketAttr::Reset, PacketError::None, Instant::now());
    }

    /// returns false if the worker should terminate
    async fn handle_signals(&self, signals: u32) -> bool {
        if signals & SIGNAL_EXIT != 0 {
            debug!("worker received exit signal");
            return false;
        }

        if signals == 0 {
            self.handle_timeouts().await;
            return true;
        }

        trace!("worker handling signals {:#x}", signals);
        if signals & SIGNAL_FORCE_RESET != 0 {
            let effects = {
                let mut state = self.lock();
                state.reset(PacketAttr::Reset, PacketError::ForcedReset, Instant::now());
                state.take_effects()
            };
            self.run_effects(effects).await;
        }
        if signals & SIGNAL_EVENT != 0 {
            self.do_work(false).await;
        }
        if signals & SIGNAL_LINK_MASK != 0 {
            self.link.do_work(signals & SIGNAL_LINK_MASK).await;
        }
        true
    }

    pub(crate) fn time_until_next_do_work(&self) -> WorkTimeout {
        let now = Instant::now();
        let mut next = earliest(self.app.next_timer_deadline(), self.app.next_request_deadline());

        {
            let state = self.lock();
            let resetting = state.reset_state == ResetState::Resetting;

            if state.has_pending_tx_payload() && !state.tx.link_busy {
                // a packet that was never sent is due right away
                let tx_deadline = state.tx.last_tx_time.map_or(now, |t| t + self.config.tx_timeout);
                next = earliest(next, Some(tx_deadline));
            }
            if state.rx.state != RxState::Preamble {
                next = earliest(next, state.rx.packet_start_time.map(|t| t + self.config.rx_timeout));
            }
            if resetting {
                next = earliest(next, state.reset_time.map(|t| t + self.config.reset_timeout));
            }
        }

        match next {
            None => WorkTimeout::Infinite,
            Some(deadline) if deadline <= now => WorkTimeout::Immediate,
            Some(deadline) => WorkTimeout::After(deadline - now),
        }
    }

    async fn handle_timeouts(&self) {
        let now = Instant::now();

        let (ack_timeout, never_sent) = {
            let state = self.lock();
            let due = state.has_pending_tx_payload()
                && !state.tx.link_busy
                && state.tx.last_tx_time
                    .map_or(true, |t| now.saturating_duration_since(t) >= self.config.tx_timeout);
            (due, state.tx.last_tx_time.is_none())
        };

        if ack_timeout {
            if !never_sent {
                warn!("ACK timeout: retransmitting");
            }
            self.do_work(true).await;
        }
        else if self.app.next_request_deadline().is_some_and(|d| d <= now) {
            self.do_work(false).await;
        }

        let effects = {
            let mut state = self.lock();
            state.handle_reset_timeout(now);
            state.take_effects()
        };
        self.run_effects(effects).await;

        self.app.process_timeout(now).await;

        self.lock().check_rx_timeout(now);
    }

    /// Sends the next packet if there is anything to send, then delivers synthetic responses for
    ///  requests that timed out.
    pub(crate) async fn do_work(&self, resend: bool) {
        let now = Instant::now();
        let (packet, effects) = {
            let mut state = self.lock();
            let packet = state.build_next_packet(resend, now);
            (packet, state.take_effects())
        };
        self.run_effects(effects).await;

        if let Some(packet) = packet {
            let status = self.link.send(&packet).await;
            self.lock().finish_send(packet, status);
        }

        while let Some(response) = self.app.take_timed_out_response(now) {
            debug!("delivering timeout response of {} bytes", response.len());
            self.app.process_rx_datagram(response).await;
        }
    }
}
