//! Simulated end-to-end update: a scripted server walks a device through
//! check, announce, transfer, and completion using the in-memory doubles.
//!
//! Usage: cargo run --example device_loop
//!
//! Set RUST_LOG=debug to watch the engine's internal flow.

use std::time::Duration;

use airflash::codec::hex_upper;
use airflash::doubles::{FakeClock, FakePlatform, FakeTransport, FakeWriter};
use airflash::engine::{Config, DATA_BLOCK_SIZE, REBOOT_SETTLE_MS};
use airflash::frame::{CMD_FUOTA_START, CMD_LAST_FW_INFO, CMD_TRIGGER_FW_UPDATE_CHECK};
use airflash::{FirmwareDescriptor, FuotaEngine, Version};

type Engine = FuotaEngine<FakeTransport, FakeWriter, FakeClock, FakePlatform>;

/// Size of the image the scripted server offers.
const IMAGE_SIZE: u32 = 10_240;

// ---------------------------------------------------------------------------
// Scripted server
// ---------------------------------------------------------------------------

fn last_fw_info(version: Version, size: u32, checksum: [u8; 16]) -> Vec<u8> {
    let mut frame = vec![CMD_LAST_FW_INFO];
    frame.extend_from_slice(&[version.major, version.minor, version.patch]);
    frame.extend_from_slice(&size.to_be_bytes());
    frame.extend_from_slice(&checksum);
    frame
}

/// Print device-to-server traffic produced since the last call.
fn drain_reports(engine: &Engine, seen: &mut usize) {
    for (topic, payload) in &engine.transport().published[*seen..] {
        println!("  device -> {topic}: {}", hex_upper(payload));
    }
    *seen = engine.transport().published.len();
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let clock = FakeClock::new();
    let running = FirmwareDescriptor::new(Version::new(1, 0, 0), 98_304, [0x31; 16]);
    let mut engine = FuotaEngine::new(
        FakeTransport::new(),
        FakeWriter::new(),
        clock.clone(),
        FakePlatform::new("esp32-a1b2c3"),
        Config::new(running),
    )
    .expect("engine construction");

    let setup = engine.topics().setup.clone();
    let data = engine.topics().data.clone();
    let mut seen = 0;

    println!("== boot: subscribe to the update channels");
    engine.process();

    println!("== server: trigger an update check");
    engine.transport_mut().deliver(&setup, &[CMD_TRIGGER_FW_UPDATE_CHECK]);
    engine.process();
    drain_reports(&engine, &mut seen);

    println!("== server: announce v1.1.0, {IMAGE_SIZE} bytes");
    let info = last_fw_info(Version::new(1, 1, 0), IMAGE_SIZE, [0xC4; 16]);
    engine.transport_mut().deliver(&setup, &info);
    engine.process();
    drain_reports(&engine, &mut seen);

    println!("== server: start the transfer");
    engine.transport_mut().deliver(&setup, &[CMD_FUOTA_START]);
    engine.process();
    drain_reports(&engine, &mut seen);

    println!("== server: stream the image in {DATA_BLOCK_SIZE}-byte blocks");
    let image: Vec<u8> = (0..IMAGE_SIZE).map(|i| (i % 251) as u8).collect();
    for block in image.chunks(DATA_BLOCK_SIZE) {
        engine.transport_mut().deliver(&data, block);
        engine.process();
    }
    drain_reports(&engine, &mut seen);

    println!("== settle delay, then reboot");
    clock.advance(Duration::from_millis(REBOOT_SETTLE_MS));
    engine.process();

    println!(
        "device was running v{}, wrote {} bytes, committed: {}, rebooted: {}",
        engine.device_firmware().version,
        engine.writer().image.len(),
        engine.writer().committed,
        engine.platform().rebooted
    );
}
