//! The update engine: subscription lifecycle, frame dispatch, and the
//! session state machine.
//!
//! Single-threaded and caller-driven. The integration calls
//! [`FuotaEngine::process`] once per device loop iteration and may feed
//! messages through [`FuotaEngine::handle_message`]; both run on the same
//! thread and the engine never blocks or sleeps. Deadlines (subscription
//! retry, reboot settle) are polled against the clock.

use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};

use crate::error::InitError;
use crate::frame::{
    OP_CHECK_REQUESTED, OP_COMPLETED_FAIL, OP_COMPLETED_OK, OP_START_ACK, OP_UPDATE_REQUESTED,
    SetupFrame,
};
use crate::platform::{Clock, Platform};
use crate::session::{CHECKSUM_LEN, FirmwareDescriptor, PendingRequest, SessionState};
use crate::topic::{Channel, MAX_TOPIC_LEN, TopicSet};
use crate::transport::{QoS, Transport};
use crate::writer::FirmwareWriter;

/// Milliseconds between subscribe attempts while either subscription is
/// missing. The first attempt is immediate.
pub const SUBSCRIBE_RETRY_MS: u64 = 5000;

/// Largest data block the server sends in one message.
pub const DATA_BLOCK_SIZE: usize = 1024;

/// Smallest transport receive buffer the engine accepts: one data block
/// plus topic and fixed-header allowance.
pub const MIN_RX_BUFFER: usize = DATA_BLOCK_SIZE + MAX_TOPIC_LEN + 8;

/// Delay between publishing the final session status and rebooting, so the
/// transport can flush.
pub const REBOOT_SETTLE_MS: u64 = 1000;

/// Default cap on announced image sizes.
pub const DEFAULT_MAX_FIRMWARE_SIZE: u32 = 4 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Engine construction parameters.
#[derive(Debug, Clone)]
pub struct Config {
    /// Overrides [`Platform::device_id`] for topic derivation when set.
    pub device_id: Option<String>,
    /// Identity of the image currently running.
    pub firmware: FirmwareDescriptor,
    /// Announced sizes above this are rejected at the update check.
    pub max_firmware_size: u32,
}

impl Config {
    pub fn new(firmware: FirmwareDescriptor) -> Self {
        Self { device_id: None, firmware, max_firmware_size: DEFAULT_MAX_FIRMWARE_SIZE }
    }
}

// ---------------------------------------------------------------------------
// FuotaEngine
// ---------------------------------------------------------------------------

/// Device-side FUOTA protocol engine.
///
/// Owns its collaborators: the broker session, the flash-write driver, a
/// monotonic clock, and the platform (identity + reboot). Construct one per
/// device and keep it for the life of the process.
///
/// # Example
///
/// ```no_run
/// use airflash::{Config, FirmwareDescriptor, FuotaEngine, SystemClock, Version};
/// # use airflash::doubles::{FakePlatform, FakeTransport, FakeWriter};
///
/// # let (transport, writer, platform) =
/// #     (FakeTransport::new(), FakeWriter::new(), FakePlatform::new("dev-1"));
/// let config = Config::new(FirmwareDescriptor::new(
///     Version::new(1, 0, 0),
///     200_000,
///     [0; 16],
/// ));
/// let mut engine = FuotaEngine::new(transport, writer, SystemClock, platform, config)?;
/// engine.process(); // call once per device loop iteration
/// # Ok::<(), airflash::InitError>(())
/// ```
#[derive(Debug)]
pub struct FuotaEngine<T, W, C, P> {
    transport: T,
    writer: W,
    clock: C,
    platform: P,
    topics: TopicSet,
    device: FirmwareDescriptor,
    server: FirmwareDescriptor,
    max_firmware_size: u32,
    subscribed_setup: bool,
    subscribed_data: bool,
    last_subscribe_attempt: Option<Instant>,
    request: Option<PendingRequest>,
    session: SessionState,
    reboot_at: Option<Instant>,
    rebooting: bool,
}

impl<T, W, C, P> FuotaEngine<T, W, C, P>
where
    T: Transport,
    W: FirmwareWriter,
    C: Clock,
    P: Platform,
{
    /// Build the engine: derive the topic set and size the receive buffer.
    ///
    /// Fails if any derived topic exceeds [`MAX_TOPIC_LEN`] bytes or if the
    /// transport cannot provide a [`MIN_RX_BUFFER`]-byte receive buffer.
    pub fn new(
        mut transport: T,
        writer: W,
        clock: C,
        platform: P,
        config: Config,
    ) -> Result<Self, InitError> {
        let Config { device_id, firmware, max_firmware_size } = config;
        let id = device_id.unwrap_or_else(|| platform.device_id());
        let topics = TopicSet::derive(&id)?;

        if transport.rx_buffer_size() < MIN_RX_BUFFER
            && !transport.set_rx_buffer_size(MIN_RX_BUFFER)
        {
            return Err(InitError::RxBufferTooSmall {
                got: transport.rx_buffer_size(),
                need: MIN_RX_BUFFER,
            });
        }

        debug!("update engine for {id}, running v{}", firmware.version);
        Ok(Self {
            transport,
            writer,
            clock,
            platform,
            topics,
            device: firmware,
            server: FirmwareDescriptor::empty(),
            max_firmware_size,
            subscribed_setup: false,
            subscribed_data: false,
            last_subscribe_attempt: None,
            request: None,
            session: SessionState::default(),
            reboot_at: None,
            rebooting: false,
        })
    }

    /// One engine tick: drain the transport, heal subscriptions, service
    /// the pending request, then the completion and reboot deadlines.
    ///
    /// Does nothing while the transport is disconnected, and nothing at all
    /// once the reboot has been requested.
    pub fn process(&mut self) {
        if self.rebooting || !self.transport.connected() {
            return;
        }

        for msg in self.transport.pump() {
            self.handle_message(&msg.topic, &msg.payload);
        }

        self.manage_subscriptions();
        self.service_request();
        self.service_completion();
        self.service_reboot();
    }

    /// Feed one inbound message, returning whether it belonged to this
    /// engine.
    ///
    /// Everything is rejected until both subscriptions are up, even on an
    /// exact topic match. Decode failures are logged and dropped.
    pub fn handle_message(&mut self, topic: &str, payload: &[u8]) -> bool {
        if !self.subscriptions_ready() {
            trace!("dropping message on {topic}: subscriptions not ready");
            return false;
        }
        if topic == self.topics.setup {
            self.on_setup_frame(payload);
            true
        } else if topic == self.topics.data {
            self.on_data_block(payload);
            true
        } else {
            false
        }
    }

    // -----------------------------------------------------------------------
    // Observability
    // -----------------------------------------------------------------------

    pub fn topics(&self) -> &TopicSet {
        &self.topics
    }

    pub fn session(&self) -> SessionState {
        self.session
    }

    /// Image the device is currently running.
    pub fn device_firmware(&self) -> &FirmwareDescriptor {
        &self.device
    }

    /// Image most recently announced by the server (zero between checks).
    pub fn server_firmware(&self) -> &FirmwareDescriptor {
        &self.server
    }

    pub fn subscriptions_ready(&self) -> bool {
        self.subscribed_setup && self.subscribed_data
    }

    /// A successful session has published its status and is waiting out the
    /// settle delay.
    pub fn reboot_pending(&self) -> bool {
        self.reboot_at.is_some()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }

    pub fn writer_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    fn manage_subscriptions(&mut self) {
        if self.subscriptions_ready() {
            return;
        }
        let now = self.clock.now();
        if let Some(last) = self.last_subscribe_attempt {
            if now - last < Duration::from_millis(SUBSCRIBE_RETRY_MS) {
                return;
            }
        }
        self.last_subscribe_attempt = Some(now);

        if !self.subscribed_setup {
            self.subscribed_setup = self.transport.subscribe(&self.topics.setup, QoS::AtLeastOnce);
            if !self.subscribed_setup {
                debug!("subscribe failed for {}", self.topics.setup);
            }
        }
        if !self.subscribed_data {
            self.subscribed_data = self.transport.subscribe(&self.topics.data, QoS::AtLeastOnce);
            if !self.subscribed_data {
                debug!("subscribe failed for {}", self.topics.data);
            }
        }
        if self.subscriptions_ready() {
            info!("listening on {} and {}", self.topics.setup, self.topics.data);
        }
    }

    // -----------------------------------------------------------------------
    // Inbound frames
    // -----------------------------------------------------------------------

    fn on_setup_frame(&mut self, payload: &[u8]) {
        let frame = match SetupFrame::decode(payload) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("discarding setup frame: {err}");
                return;
            }
        };
        // Arm the mailbox only; the state machine acts on the next tick.
        // A second frame before then overwrites the first.
        match frame {
            SetupFrame::TriggerFwUpdateCheck => {
                debug!("server asked for an update check");
                self.request = Some(PendingRequest::TriggerCheck);
            }
            SetupFrame::LastFwInfo(desc) => {
                info!("server firmware {desc}");
                self.server = desc;
                self.request = Some(PendingRequest::FwUpdate);
            }
            SetupFrame::FuotaStart => {
                debug!("server starting a transfer");
                self.request = Some(PendingRequest::FuotaStart);
            }
        }
    }

    fn on_data_block(&mut self, payload: &[u8]) {
        if !(self.session.valid_update && self.session.in_progress) {
            trace!("ignoring {} data bytes outside a session", payload.len());
            return;
        }

        let size = self.server.size;
        let room = size.saturating_sub(self.session.bytes_written) as usize;
        let take = payload.len().min(room);
        if take < payload.len() {
            warn!("block overruns the image, dropping {} trailing bytes", payload.len() - take);
        }

        let written = self.writer.write(&payload[..take]) as u32;
        self.session.bytes_written += written;
        debug!(
            "wrote {written} bytes, {}/{} ({}%)",
            self.session.bytes_written,
            size,
            self.session.percent(size)
        );

        if self.session.bytes_written >= size {
            self.session.completed = true;
        }
    }

    // -----------------------------------------------------------------------
    // State machine
    // -----------------------------------------------------------------------

    fn service_request(&mut self) {
        let Some(request) = self.request.take() else {
            return;
        };
        match request {
            PendingRequest::TriggerCheck => self.report_for_check(),
            PendingRequest::FwUpdate => self.evaluate_update(),
            PendingRequest::FuotaStart => self.start_session(),
        }
    }

    fn report_for_check(&mut self) {
        self.server = FirmwareDescriptor::empty();
        info!("reporting in for an update check, running v{}", self.device.version);
        self.publish(Channel::Control, &OP_CHECK_REQUESTED);
    }

    fn evaluate_update(&mut self) {
        let server = self.server;
        if server.size == 0 || server.size > self.max_firmware_size {
            warn!(
                "ignoring server image v{}: size {} outside (0, {}]",
                server.version, server.size, self.max_firmware_size
            );
            return;
        }

        // Server ordinal zero is the unversioned-build override: always take it.
        let server_ord = server.version.ordinal();
        if server_ord != 0 && server_ord <= self.device.version.ordinal() {
            info!("server image v{} is not newer than v{}", server.version, self.device.version);
            return;
        }

        self.session.valid_update = true;
        info!("requesting update v{} -> v{}", self.device.version, server.version);
        self.publish(Channel::Control, &OP_UPDATE_REQUESTED);
    }

    fn start_session(&mut self) {
        self.writer.abort();

        let size = self.server.size;
        if !self.writer.begin(size) {
            // No server notification on this path; the session simply never
            // opens and the server sees silence.
            warn!("write driver refused a {size}-byte session: {}", self.writer.error_string());
            return;
        }

        self.writer.set_checksum(&self.server.checksum);
        // Handed off to the driver; not needed in memory again.
        self.server.checksum = [0; CHECKSUM_LEN];

        self.session.bytes_written = 0;
        self.session.completed = false;
        self.session.in_progress = true;
        info!("update session open, expecting {size} bytes");
        self.publish(Channel::Ack, &OP_START_ACK);
    }

    fn service_completion(&mut self) {
        if !self.session.in_progress {
            return;
        }

        if self.writer.has_error() {
            warn!("write driver error: {}", self.writer.error_string());
            self.writer.abort();
            self.session.completed = false;
            // Session stays parked until the next transfer start.
            self.publish(Channel::Control, &OP_COMPLETED_FAIL);
            return;
        }

        if !self.session.completed {
            return;
        }
        self.session.completed = false;
        self.session.in_progress = false;

        let remaining = self.writer.remaining();
        if remaining > 0 {
            warn!("driver still expects {remaining} bytes after the final block");
        }
        if self.writer.has_error() {
            self.fail_session("write driver error at completion");
            return;
        }
        if !self.writer.end() {
            self.fail_session("finalize failed");
            return;
        }

        info!(
            "firmware v{} written and verified, rebooting in {}ms",
            self.server.version, REBOOT_SETTLE_MS
        );
        self.session.valid_update = false;
        self.publish(Channel::Control, &OP_COMPLETED_OK);
        self.reboot_at = Some(self.clock.now() + Duration::from_millis(REBOOT_SETTLE_MS));
    }

    fn fail_session(&mut self, what: &str) {
        warn!("{what}: {}", self.writer.error_string());
        self.writer.abort();
        self.session.valid_update = false;
        self.publish(Channel::Control, &OP_COMPLETED_FAIL);
    }

    fn service_reboot(&mut self) {
        let Some(at) = self.reboot_at else {
            return;
        };
        if self.clock.now() < at {
            return;
        }
        info!("rebooting into the new image");
        self.reboot_at = None;
        self.rebooting = true;
        self.platform.reboot();
    }

    fn publish(&mut self, channel: Channel, opcode: &[u8; 4]) {
        if !self.transport.publish(self.topics.get(channel), opcode) {
            warn!("publish on the {channel} channel failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doubles::{FakeClock, FakePlatform, FakeTransport, FakeWriter};
    use crate::frame::{CMD_FUOTA_START, CMD_LAST_FW_INFO, CMD_TRIGGER_FW_UPDATE_CHECK};
    use crate::session::Version;

    type TestEngine = FuotaEngine<FakeTransport, FakeWriter, FakeClock, FakePlatform>;

    const SETUP: &str = "/dev-1/ota/setup";
    const DATA: &str = "/dev-1/ota/data";
    const CONTROL: &str = "/dev-1/ota/control";
    const ACK: &str = "/dev-1/ota/ack";

    fn logs() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn engine() -> (TestEngine, FakeClock) {
        engine_with(FakeTransport::new(), FakeWriter::new())
    }

    fn engine_with(transport: FakeTransport, writer: FakeWriter) -> (TestEngine, FakeClock) {
        let clock = FakeClock::new();
        let config = Config::new(FirmwareDescriptor::new(
            Version::new(1, 0, 0),
            200_000,
            [0x11; CHECKSUM_LEN],
        ));
        let engine = FuotaEngine::new(
            transport,
            writer,
            clock.clone(),
            FakePlatform::new("dev-1"),
            config,
        )
        .unwrap();
        (engine, clock)
    }

    /// First tick subscribes both topics immediately.
    fn subscribe(engine: &mut TestEngine) {
        engine.process();
        assert!(engine.subscriptions_ready());
    }

    fn last_fw_info(version: [u8; 3], size: u32) -> Vec<u8> {
        let mut payload = vec![CMD_LAST_FW_INFO];
        payload.extend_from_slice(&version);
        payload.extend_from_slice(&size.to_be_bytes());
        payload.extend_from_slice(&[0x5C; CHECKSUM_LEN]);
        payload
    }

    /// Drive a fresh engine to an open 1000-byte session for v2.0.0.
    fn open_session(engine: &mut TestEngine) {
        subscribe(engine);
        engine.transport_mut().deliver(SETUP, &last_fw_info([2, 0, 0], 1000));
        engine.process();
        engine.transport_mut().deliver(SETUP, &[CMD_FUOTA_START]);
        engine.process();
        assert!(engine.session().in_progress);
    }

    // -- construction --

    #[test]
    fn init_rejects_oversized_topics() {
        let config = Config {
            device_id: Some("a".repeat(20)),
            firmware: FirmwareDescriptor::empty(),
            max_firmware_size: DEFAULT_MAX_FIRMWARE_SIZE,
        };
        let err = FuotaEngine::new(
            FakeTransport::new(),
            FakeWriter::new(),
            FakeClock::new(),
            FakePlatform::new("unused"),
            config,
        )
        .unwrap_err();
        assert!(matches!(err, InitError::TopicTooLong { .. }));
    }

    #[test]
    fn init_raises_rx_buffer() {
        let (engine, _clock) = engine();
        assert_eq!(engine.transport().rx_buffer, MIN_RX_BUFFER);
    }

    #[test]
    fn init_keeps_larger_rx_buffer() {
        let mut transport = FakeTransport::new();
        transport.rx_buffer = 4096;
        let (engine, _clock) = engine_with(transport, FakeWriter::new());
        assert_eq!(engine.transport().rx_buffer, 4096);
    }

    #[test]
    fn init_rejects_unresizable_rx_buffer() {
        let mut transport = FakeTransport::new();
        transport.allow_rx_resize = false;
        let err = FuotaEngine::new(
            transport,
            FakeWriter::new(),
            FakeClock::new(),
            FakePlatform::new("dev-1"),
            Config::new(FirmwareDescriptor::empty()),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            InitError::RxBufferTooSmall { got: 0, need: MIN_RX_BUFFER }
        ));
    }

    #[test]
    fn config_id_overrides_platform_id() {
        let mut config = Config::new(FirmwareDescriptor::empty());
        config.device_id = Some("other".to_string());
        let engine = FuotaEngine::new(
            FakeTransport::new(),
            FakeWriter::new(),
            FakeClock::new(),
            FakePlatform::new("dev-1"),
            config,
        )
        .unwrap();
        assert_eq!(engine.topics().setup, "/other/ota/setup");
    }

    /// `assert!`/`unwrap_err` failure output needs the engine to render.
    #[test]
    fn debug_rendering_includes_the_topic_set() {
        let (engine, _clock) = engine();
        let rendered = format!("{engine:?}");
        assert!(rendered.contains("FuotaEngine"));
        assert!(rendered.contains("/dev-1/ota/setup"));
    }

    // -- subscriptions --

    #[test]
    fn first_tick_subscribes_both_topics() {
        let (mut engine, _clock) = engine();
        engine.process();
        let calls = &engine.transport().subscribe_calls;
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], (SETUP.to_string(), QoS::AtLeastOnce));
        assert_eq!(calls[1], (DATA.to_string(), QoS::AtLeastOnce));
        assert!(engine.subscriptions_ready());
    }

    #[test]
    fn no_subscribe_calls_after_success() {
        let (mut engine, clock) = engine();
        subscribe(&mut engine);
        for _ in 0..10 {
            clock.advance_ms(SUBSCRIBE_RETRY_MS + 1);
            engine.process();
        }
        assert_eq!(engine.transport().subscribe_calls.len(), 2);
    }

    #[test]
    fn subscribe_retry_waits_out_the_interval() {
        let mut transport = FakeTransport::new();
        transport.accept_subscribes = false;
        let (mut engine, clock) = engine_with(transport, FakeWriter::new());

        engine.process();
        assert_eq!(engine.transport().subscribe_calls.len(), 2);

        // Within the interval nothing happens, however often we tick.
        engine.process();
        clock.advance_ms(SUBSCRIBE_RETRY_MS - 1);
        engine.process();
        assert_eq!(engine.transport().subscribe_calls.len(), 2);

        clock.advance_ms(1);
        engine.process();
        assert_eq!(engine.transport().subscribe_calls.len(), 4);

        engine.transport_mut().accept_subscribes = true;
        clock.advance_ms(SUBSCRIBE_RETRY_MS);
        engine.process();
        assert!(engine.subscriptions_ready());
        assert_eq!(engine.transport().subscribe_calls.len(), 6);
    }

    #[test]
    fn only_the_missing_topic_is_retried() {
        let mut transport = FakeTransport::new();
        transport.reject_topics = vec![DATA.to_string()];
        let (mut engine, clock) = engine_with(transport, FakeWriter::new());

        engine.process();
        assert!(!engine.subscriptions_ready());
        assert_eq!(engine.transport().subscribe_calls.len(), 2);

        engine.transport_mut().reject_topics.clear();
        clock.advance_ms(SUBSCRIBE_RETRY_MS);
        engine.process();
        assert!(engine.subscriptions_ready());
        // Setup had already succeeded; only data is attempted again.
        assert_eq!(engine.transport().subscribe_calls.len(), 3);
        assert_eq!(engine.transport().subscribe_calls[2].0, DATA);
    }

    #[test]
    fn disconnected_ticks_do_nothing() {
        let mut transport = FakeTransport::new();
        transport.connected = false;
        let (mut engine, _clock) = engine_with(transport, FakeWriter::new());

        engine.process();
        assert!(engine.transport().subscribe_calls.is_empty());

        engine.transport_mut().connected = true;
        engine.process();
        assert!(engine.subscriptions_ready());
    }

    // -- dispatcher --

    #[test]
    fn dispatcher_rejects_everything_before_subscriptions() {
        let (mut engine, _clock) = engine();
        assert!(!engine.handle_message(DATA, &[0xAB; 8]));
        assert!(!engine.handle_message(SETUP, &[CMD_TRIGGER_FW_UPDATE_CHECK]));

        subscribe(&mut engine);
        assert!(engine.handle_message(DATA, &[0xAB; 8]));
        assert!(engine.handle_message(SETUP, &[CMD_TRIGGER_FW_UPDATE_CHECK]));
    }

    #[test]
    fn dispatcher_ignores_foreign_topics() {
        let (mut engine, _clock) = engine();
        subscribe(&mut engine);
        assert!(!engine.handle_message("/dev-2/ota/setup", &[CMD_TRIGGER_FW_UPDATE_CHECK]));
        assert!(!engine.handle_message("/dev-1/ota/control", &[0x00]));
        assert!(!engine.handle_message("", &[]));
    }

    #[test]
    fn malformed_setup_frames_leave_state_untouched() {
        let (mut engine, _clock) = engine();
        subscribe(&mut engine);

        let mut truncated = last_fw_info([9, 9, 9], 4096);
        truncated.pop();
        assert!(engine.handle_message(SETUP, &truncated));
        assert!(engine.handle_message(SETUP, &[0x7F]));
        assert!(engine.handle_message(SETUP, &[]));

        engine.process();
        assert!(engine.transport().published.is_empty());
        assert_eq!(*engine.server_firmware(), FirmwareDescriptor::empty());
        assert_eq!(engine.session(), SessionState::default());
    }

    // -- update check --

    #[test]
    fn trigger_check_publishes_opcode_and_clears_server_slot() {
        let (mut engine, _clock) = engine();
        subscribe(&mut engine);
        engine.transport_mut().deliver(SETUP, &last_fw_info([2, 0, 0], 1000));
        engine.process();

        engine.transport_mut().deliver(SETUP, &[CMD_TRIGGER_FW_UPDATE_CHECK]);
        engine.process();
        assert_eq!(
            engine.transport().published_to(CONTROL).last().copied(),
            Some(&OP_CHECK_REQUESTED[..])
        );
        assert_eq!(*engine.server_firmware(), FirmwareDescriptor::empty());

        // Mailbox was consumed; a further tick publishes nothing new.
        let count = engine.transport().published.len();
        engine.process();
        assert_eq!(engine.transport().published.len(), count);
    }

    #[test]
    fn equal_version_is_a_silent_no_update() {
        let (mut engine, _clock) = engine();
        subscribe(&mut engine);
        engine.transport_mut().deliver(SETUP, &last_fw_info([1, 0, 0], 1000));
        engine.process();
        assert!(engine.transport().published.is_empty());
        assert!(!engine.session().valid_update);
    }

    #[test]
    fn newer_version_requests_the_update() {
        let (mut engine, _clock) = engine();
        subscribe(&mut engine);
        engine.transport_mut().deliver(SETUP, &last_fw_info([2, 0, 0], 1000));
        engine.process();
        assert_eq!(engine.transport().published_to(CONTROL), vec![&OP_UPDATE_REQUESTED[..]]);
        assert!(engine.session().valid_update);
    }

    #[test]
    fn zero_version_override_requests_the_update() {
        let (mut engine, _clock) = engine();
        subscribe(&mut engine);
        engine.transport_mut().deliver(SETUP, &last_fw_info([0, 0, 0], 1000));
        engine.process();
        assert_eq!(engine.transport().published_to(CONTROL), vec![&OP_UPDATE_REQUESTED[..]]);
    }

    #[test]
    fn out_of_range_sizes_are_dropped() {
        let (mut engine, _clock) = engine();
        subscribe(&mut engine);
        engine.transport_mut().deliver(SETUP, &last_fw_info([2, 0, 0], 0));
        engine.process();
        engine
            .transport_mut()
            .deliver(SETUP, &last_fw_info([2, 0, 0], DEFAULT_MAX_FIRMWARE_SIZE + 1));
        engine.process();
        assert!(engine.transport().published.is_empty());
        assert!(!engine.session().valid_update);
    }

    #[test]
    fn rapid_frames_overwrite_the_mailbox() {
        let (mut engine, _clock) = engine();
        subscribe(&mut engine);
        // Both arrive before the tick drains the mailbox; the trigger wins.
        engine.transport_mut().deliver(SETUP, &last_fw_info([2, 0, 0], 1000));
        engine.transport_mut().deliver(SETUP, &[CMD_TRIGGER_FW_UPDATE_CHECK]);
        engine.process();
        assert_eq!(engine.transport().published_to(CONTROL), vec![&OP_CHECK_REQUESTED[..]]);
    }

    // -- transfer --

    #[test]
    fn fuota_start_opens_the_session_and_acks() {
        let (mut engine, _clock) = engine();
        open_session(&mut engine);

        assert_eq!(engine.writer().begin_calls, vec![1000]);
        assert_eq!(engine.writer().checksum, Some([0x5C; CHECKSUM_LEN]));
        assert_eq!(engine.transport().published_to(ACK), vec![&OP_START_ACK[..]]);
        // Digest was handed to the driver and wiped from the slot.
        assert_eq!(engine.server_firmware().checksum, [0; CHECKSUM_LEN]);
        assert_eq!(engine.session().bytes_written, 0);
        // One unconditional abort of whatever came before.
        assert_eq!(engine.writer().abort_count, 1);
    }

    #[test]
    fn begin_refusal_stays_server_silent() {
        let mut writer = FakeWriter::new();
        writer.fail_begin = true;
        let (mut engine, _clock) = engine_with(FakeTransport::new(), writer);
        subscribe(&mut engine);
        engine.transport_mut().deliver(SETUP, &last_fw_info([2, 0, 0], 1000));
        engine.process();
        let published = engine.transport().published.len();

        engine.transport_mut().deliver(SETUP, &[CMD_FUOTA_START]);
        engine.process();
        assert!(!engine.session().in_progress);
        assert_eq!(engine.transport().published.len(), published);
    }

    #[test]
    fn data_outside_a_session_is_ignored() {
        let (mut engine, _clock) = engine();
        subscribe(&mut engine);
        assert!(engine.handle_message(DATA, &[0xAB; 64]));
        assert!(engine.writer().image.is_empty());
        assert_eq!(engine.session().bytes_written, 0);
    }

    #[test]
    fn blocks_accumulate_and_complete() {
        logs();
        let (mut engine, _clock) = engine();
        open_session(&mut engine);

        engine.transport_mut().deliver(DATA, &[0xAA; 600]);
        engine.process();
        assert_eq!(engine.session().bytes_written, 600);
        assert!(engine.session().in_progress);
        assert!(!engine.session().completed);

        engine.transport_mut().deliver(DATA, &[0xBB; 400]);
        engine.process();
        assert_eq!(engine.session().bytes_written, 1000);
        assert!(!engine.session().in_progress);
        assert!(engine.writer().committed);
        assert_eq!(
            engine.transport().published_to(CONTROL).last().copied(),
            Some(&OP_COMPLETED_OK[..])
        );
        // The running descriptor only changes when the reboot swaps images.
        assert_eq!(engine.device_firmware().version, Version::new(1, 0, 0));
    }

    #[test]
    fn final_block_is_clamped_to_the_image_size() {
        let (mut engine, _clock) = engine();
        open_session(&mut engine);

        engine.transport_mut().deliver(DATA, &[0xAA; 950]);
        engine.process();
        assert_eq!(engine.session().bytes_written, 950);

        engine.transport_mut().deliver(DATA, &[0xBB; 100]);
        engine.process();
        assert_eq!(engine.session().bytes_written, 1000);
        // Exactly 50 bytes of the overrunning block reached the driver, and
        // completion fired on that same tick.
        let image = &engine.writer().image;
        assert_eq!(image.len(), 1000);
        assert!(image[..950].iter().all(|&b| b == 0xAA));
        assert!(image[950..].iter().all(|&b| b == 0xBB));
        assert!(engine.writer().committed);
    }

    /// A check trigger arriving mid-transfer zeroes the server descriptor
    /// while the session stays open, taking the size target with it. The
    /// next block then clamps to nothing and trips the completion edge,
    /// committing whatever had been written so far.
    #[test]
    fn mid_session_check_trigger_finalizes_the_truncated_image() {
        let (mut engine, _clock) = engine();
        open_session(&mut engine);

        engine.transport_mut().deliver(DATA, &[0xAA; 600]);
        engine.process();
        assert_eq!(engine.session().bytes_written, 600);

        engine.transport_mut().deliver(SETUP, &[CMD_TRIGGER_FW_UPDATE_CHECK]);
        engine.process();
        assert!(engine.session().in_progress);
        assert_eq!(engine.server_firmware().size, 0);

        engine.transport_mut().deliver(DATA, &[0xAA; 100]);
        engine.process();
        assert_eq!(engine.session().bytes_written, 600);
        assert!(!engine.session().in_progress);
        assert_eq!(engine.writer().image.len(), 600);
        assert!(engine.writer().committed);
        assert_eq!(
            engine.transport().published_to(CONTROL).last().copied(),
            Some(&OP_COMPLETED_OK[..])
        );
        assert!(engine.reboot_pending());
    }

    #[test]
    fn write_error_parks_the_session_after_one_fail_report() {
        let mut writer = FakeWriter::new();
        writer.error_after = Some(600);
        let (mut engine, _clock) = engine_with(FakeTransport::new(), writer);
        open_session(&mut engine);

        engine.transport_mut().deliver(DATA, &[0xAA; 600]);
        engine.process();
        assert_eq!(
            engine.transport().published_to(CONTROL).last().copied(),
            Some(&OP_COMPLETED_FAIL[..])
        );
        assert!(engine.session().in_progress);

        // Parked: no repeat reports, no progress.
        let published = engine.transport().published.len();
        engine.process();
        engine.transport_mut().deliver(DATA, &[0xAA; 100]);
        engine.process();
        assert_eq!(engine.transport().published.len(), published);
        assert_eq!(engine.session().bytes_written, 600);

        // A fresh start recovers the session.
        engine.writer_mut().error_after = None;
        engine.transport_mut().deliver(SETUP, &[CMD_FUOTA_START]);
        engine.process();
        assert_eq!(engine.writer().begin_calls, vec![1000, 1000]);
        assert_eq!(engine.session().bytes_written, 0);
        assert_eq!(engine.transport().published_to(ACK).len(), 2);
    }

    #[test]
    fn finalize_failure_publishes_fail_and_ends_the_session() {
        let mut writer = FakeWriter::new();
        writer.fail_end = true;
        let (mut engine, clock) = engine_with(FakeTransport::new(), writer);
        open_session(&mut engine);

        engine.transport_mut().deliver(DATA, &[0xAA; 1000]);
        engine.process();
        assert_eq!(
            engine.transport().published_to(CONTROL).last().copied(),
            Some(&OP_COMPLETED_FAIL[..])
        );
        assert!(!engine.session().in_progress);
        assert!(!engine.session().valid_update);
        assert!(!engine.reboot_pending());

        clock.advance_ms(REBOOT_SETTLE_MS + 1);
        engine.process();
        assert!(!engine.platform().rebooted);
    }

    #[test]
    fn reboot_waits_out_the_settle_delay() {
        logs();
        let (mut engine, clock) = engine();
        open_session(&mut engine);

        engine.transport_mut().deliver(DATA, &[0xAA; 1000]);
        engine.process();
        assert!(engine.reboot_pending());
        assert!(!engine.platform().rebooted);

        clock.advance_ms(REBOOT_SETTLE_MS - 1);
        engine.process();
        assert!(!engine.platform().rebooted);

        clock.advance_ms(1);
        engine.process();
        assert!(engine.platform().rebooted);

        // Terminal: nothing runs after the reboot request.
        engine.transport_mut().deliver(SETUP, &[CMD_TRIGGER_FW_UPDATE_CHECK]);
        let published = engine.transport().published.len();
        engine.process();
        assert_eq!(engine.transport().published.len(), published);
    }
}
