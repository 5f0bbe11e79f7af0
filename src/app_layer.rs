use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::time::Instant;

/// The layer above the transport, i.e. the dispatcher of services and clients.
///
/// All calls are made without the transport's lock held, so implementations may call back into
///  the transport (e.g. to enqueue a response).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AppLayer: Send + Sync + 'static {
    /// a complete datagram was received - ownership is transferred
    async fn process_rx_datagram(&self, datagram: Vec<u8>);

    /// the link just completed a (re-)handshake
    async fn process_reset(&self);

    /// called on every timer-driven wake-up of the worker
    async fn process_timeout(&self, now: Instant);

    fn next_timer_deadline(&self) -> Option<Instant>;

    /// the earliest point in time at which an outstanding request times out
    fn next_request_deadline(&self) -> Option<Instant>;

    /// The synthetic response for the earliest request that timed out at `now`, if any. The
    ///  transport delivers it through [AppLayer::process_rx_datagram] as if it came from the peer.
    fn take_timed_out_response(&self, now: Instant) -> Option<Vec<u8>>;

    /// Whether the app layer has finished discovering the peer's services. Until then, a
    ///  received RESET-ACK is not confirmed with an explicit ACK: the app layer's first
    ///  message does that.
    fn is_discovery_complete(&self) -> bool;
}
