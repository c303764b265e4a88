//! In-memory doubles for the capability seams.
//!
//! Used by the unit tests and the demo loop. Each double records the calls
//! made against it and exposes knobs to script failures.

use std::cell::Cell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::platform::{Clock, Platform};
use crate::session::CHECKSUM_LEN;
use crate::transport::{Inbound, QoS, Transport};
use crate::writer::FirmwareWriter;

// ---------------------------------------------------------------------------
// FakeTransport
// ---------------------------------------------------------------------------

/// Scriptable broker session.
///
/// Delivered messages queue until `pump` drains them. Accepted publishes
/// land in `published` in order.
#[derive(Debug)]
pub struct FakeTransport {
    pub connected: bool,
    pub accept_subscribes: bool,
    pub accept_publishes: bool,
    pub allow_rx_resize: bool,
    pub rx_buffer: usize,
    /// Topics the broker refuses even while `accept_subscribes` is set.
    pub reject_topics: Vec<String>,
    /// Every subscribe attempt, accepted or not.
    pub subscribe_calls: Vec<(String, QoS)>,
    /// Topics the broker accepted.
    pub subscriptions: Vec<String>,
    /// Accepted publishes in order.
    pub published: Vec<(String, Vec<u8>)>,
    inbound: VecDeque<Inbound>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            connected: true,
            accept_subscribes: true,
            accept_publishes: true,
            allow_rx_resize: true,
            rx_buffer: 0,
            reject_topics: Vec::new(),
            subscribe_calls: Vec::new(),
            subscriptions: Vec::new(),
            published: Vec::new(),
            inbound: VecDeque::new(),
        }
    }

    /// Queue a message for the next `pump`.
    pub fn deliver(&mut self, topic: &str, payload: &[u8]) {
        self.inbound.push_back(Inbound { topic: topic.to_string(), payload: payload.to_vec() });
    }

    /// Payloads published to `topic`, in order.
    pub fn published_to(&self, topic: &str) -> Vec<&[u8]> {
        self.published
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, p)| p.as_slice())
            .collect()
    }
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for FakeTransport {
    fn connected(&self) -> bool {
        self.connected
    }

    fn subscribe(&mut self, topic: &str, qos: QoS) -> bool {
        self.subscribe_calls.push((topic.to_string(), qos));
        if !self.accept_subscribes || self.reject_topics.iter().any(|t| t == topic) {
            return false;
        }
        if !self.subscriptions.iter().any(|t| t == topic) {
            self.subscriptions.push(topic.to_string());
        }
        true
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> bool {
        if !self.accept_publishes {
            return false;
        }
        self.published.push((topic.to_string(), payload.to_vec()));
        true
    }

    fn pump(&mut self) -> Vec<Inbound> {
        self.inbound.drain(..).collect()
    }

    fn rx_buffer_size(&self) -> usize {
        self.rx_buffer
    }

    fn set_rx_buffer_size(&mut self, size: usize) -> bool {
        if !self.allow_rx_resize {
            return false;
        }
        self.rx_buffer = size;
        true
    }
}

// ---------------------------------------------------------------------------
// FakeWriter
// ---------------------------------------------------------------------------

/// Vec-backed firmware sink with scriptable failures.
#[derive(Debug, Default)]
pub struct FakeWriter {
    /// Bytes accepted by the open session.
    pub image: Vec<u8>,
    /// Set by a successful `end`.
    pub committed: bool,
    /// Digest recorded by `set_checksum`.
    pub checksum: Option<[u8; CHECKSUM_LEN]>,
    /// Sizes passed to `begin`, accepted or not.
    pub begin_calls: Vec<u32>,
    pub abort_count: usize,
    /// Refuse the next `begin`.
    pub fail_begin: bool,
    /// Refuse `end`.
    pub fail_end: bool,
    /// Latch an error once this many image bytes have been accepted.
    pub error_after: Option<u32>,
    expected: u32,
    session_open: bool,
    error: Option<String>,
}

impl FakeWriter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FirmwareWriter for FakeWriter {
    fn begin(&mut self, size: u32) -> bool {
        self.begin_calls.push(size);
        if self.fail_begin {
            return false;
        }
        self.session_open = true;
        self.expected = size;
        self.image.clear();
        self.committed = false;
        self.error = None;
        true
    }

    fn write(&mut self, data: &[u8]) -> usize {
        if !self.session_open || self.error.is_some() {
            return 0;
        }
        self.image.extend_from_slice(data);
        if let Some(limit) = self.error_after {
            if self.image.len() as u32 >= limit {
                self.error = Some(format!("flash write failed at byte {limit}"));
            }
        }
        data.len()
    }

    fn set_checksum(&mut self, checksum: &[u8; CHECKSUM_LEN]) {
        self.checksum = Some(*checksum);
    }

    fn has_error(&self) -> bool {
        self.error.is_some()
    }

    fn error_string(&self) -> String {
        self.error.clone().unwrap_or_default()
    }

    fn remaining(&self) -> u32 {
        self.expected.saturating_sub(self.image.len() as u32)
    }

    fn end(&mut self) -> bool {
        if !self.session_open || self.fail_end {
            return false;
        }
        self.session_open = false;
        self.committed = true;
        true
    }

    fn abort(&mut self) {
        self.abort_count += 1;
        self.session_open = false;
        self.image.clear();
        self.error = None;
    }
}

// ---------------------------------------------------------------------------
// FakeClock
// ---------------------------------------------------------------------------

/// Shared-handle monotonic clock. Clones see the same time; `advance`
/// moves it for every holder.
#[derive(Debug, Clone)]
pub struct FakeClock {
    now: Rc<Cell<Instant>>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self { now: Rc::new(Cell::new(Instant::now())) }
    }

    pub fn advance(&self, delta: Duration) {
        self.now.set(self.now.get() + delta);
    }

    pub fn advance_ms(&self, ms: u64) {
        self.advance(Duration::from_millis(ms));
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.now.get()
    }
}

// ---------------------------------------------------------------------------
// FakePlatform
// ---------------------------------------------------------------------------

/// Records the reboot call instead of resetting anything.
#[derive(Debug, Clone)]
pub struct FakePlatform {
    pub id: String,
    pub rebooted: bool,
}

impl FakePlatform {
    pub fn new(id: &str) -> Self {
        Self { id: id.to_string(), rebooted: false }
    }
}

impl Platform for FakePlatform {
    fn device_id(&self) -> String {
        self.id.clone()
    }

    fn reboot(&mut self) {
        self.rebooted = true;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
