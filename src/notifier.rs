use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::trace;

pub const SIGNAL_EXIT: u32 = 1 << 0;
pub const SIGNAL_EVENT: u32 = 1 << 1;
pub const SIGNAL_FORCE_RESET: u32 = 1 << 2;
pub const SIGNAL_RECALC_TIMEOUT: u32 = 1 << 3;

/// Bits reserved for the link layer. The worker forwards them to [crate::link::LinkLayer::do_work].
pub const SIGNAL_LINK_MASK: u32 = 0xFFFF_0000;

/// Wakes the worker: signals are bits that accumulate until the worker picks them up, so several
///  signals raised before the worker wakes are handled in a single iteration.
pub struct Notifier {
    signals: Mutex<u32>,
    notify: Notify,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Notifier {
        Notifier {
            signals: Mutex::new(0),
            notify: Notify::new(),
        }
    }

    pub fn signal(&self, bits: u32) {
        trace!("signal {:#x}", bits);
        *self.signals.lock().unwrap() |= bits;
        self.notify.notify_one();
    }

    /// returns and clears all pending signals without waiting
    pub fn get_signal(&self) -> u32 {
        std::mem::take(&mut *self.signals.lock().unwrap())
    }

    pub async fn wait(&self) -> u32 {
        loop {
            let signals = self.get_signal();
            if signals != 0 {
                return signals;
            }
            // a permit stored by notify_one() makes this return immediately, so a signal raised
            //  between get_signal() and here is not lost
            self.notify.notified().await;
        }
    }

    /// returns 0 if no signal arrived before the timeout
    pub async fn timed_wait(&self, duration: Duration) -> u32 {
        timeout(duration, self.wait()).await
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::time::Instant;

    #[test]
    fn test_signals_accumulate() {
        let notifier = Notifier::new();
        notifier.signal(SIGNAL_EVENT);
        notifier.signal(SIGNAL_FORCE_RESET);
        notifier.signal(1 << 16);

        assert_eq!(notifier.get_signal(), SIGNAL_EVENT | SIGNAL_FORCE_RESET | (1 << 16));
        assert_eq!(notifier.get_signal(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_wait_times_out() {
        let notifier = Notifier::new();
        let start = Instant::now();
        assert_eq!(notifier.timed_wait(Duration::from_millis(20)).await, 0);
        assert_eq!(start.elapsed(), Duration::from_millis(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_signal_before_wait() {
        let notifier = Notifier::new();
        notifier.signal(SIGNAL_EXIT);
        assert_eq!(notifier.timed_wait(Duration::from_secs(1)).await, SIGNAL_EXIT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_is_woken() {
        let notifier = Arc::new(Notifier::new());

        let n2 = notifier.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            n2.signal(SIGNAL_EVENT);
        });

        let start = Instant::now();
        assert_eq!(notifier.wait().await, SIGNAL_EVENT);
        assert_eq!(start.elapsed(), Duration::from_millis(5));
    }
}
