//! Pub/sub transport seam.
//!
//! The engine drives a broker session owned by the integration. It never
//! connects or reconnects on its own; it observes `connected`, requests
//! subscriptions, publishes, and drains inbound traffic once per tick.

/// Delivery guarantee for subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

/// One message drained from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Broker-facing capability the integration provides.
///
/// `subscribe` and `publish` report success as `bool`. The engine treats
/// subscribe failure as transient and retries; a failed publish is dropped.
pub trait Transport {
    /// Whether the underlying session is currently usable.
    fn connected(&self) -> bool;

    /// Request a subscription. `true` means the broker accepted it.
    fn subscribe(&mut self, topic: &str, qos: QoS) -> bool;

    /// Publish a payload. `true` means the message reached the broker queue.
    fn publish(&mut self, topic: &str, payload: &[u8]) -> bool;

    /// Drain messages received since the last call.
    fn pump(&mut self) -> Vec<Inbound>;

    /// Current receive-buffer capacity in bytes.
    fn rx_buffer_size(&self) -> usize;

    /// Grow the receive buffer. `true` means the new size is in effect.
    fn set_rx_buffer_size(&mut self, size: usize) -> bool;
}
