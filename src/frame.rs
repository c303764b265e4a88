//! Setup-frame decode and device-to-server opcodes.
//!
//! Setup frames are fixed-layout binary messages selected by the command
//! byte at offset 0. Total length is validated before any field is read;
//! trailing bytes are a decode error, not padding.

use crate::codec::{read_uint32, write_uint32};
use crate::error::{FrameError, Result};
use crate::session::{CHECKSUM_LEN, FirmwareDescriptor, Version};

// ---------------------------------------------------------------------------
// Setup command codes (server sends)
// ---------------------------------------------------------------------------

pub const CMD_TRIGGER_FW_UPDATE_CHECK: u8 = 0x00;
pub const CMD_LAST_FW_INFO: u8 = 0x01;
pub const CMD_FUOTA_START: u8 = 0x02;

/// Total length of a `LastFwInfo` frame: command byte, three version bytes,
/// 32-bit image size, 16-byte checksum.
pub const LAST_FW_INFO_LEN: usize = 1 + 3 + 4 + CHECKSUM_LEN;

// ---------------------------------------------------------------------------
// Device-to-server opcodes (4 opaque bytes each)
// ---------------------------------------------------------------------------

/// Control channel: device is up and asking whether an update is available.
pub const OP_CHECK_REQUESTED: [u8; 4] = [0xAF, 0x12, 0x34, 0x56];
/// Control channel: device accepts the announced image.
pub const OP_UPDATE_REQUESTED: [u8; 4] = [0x55, 0x55, 0xFF, 0xFF];
/// Ack channel: write session opened, ready for blocks.
pub const OP_START_ACK: [u8; 4] = [0xAA, 0xAA, 0xAA, 0xAA];
/// Control channel: image fully written and finalized.
pub const OP_COMPLETED_OK: [u8; 4] = [0x55, 0xAA, 0xFF, 0xFF];
/// Control channel: session failed, image discarded.
pub const OP_COMPLETED_FAIL: [u8; 4] = [0x55, 0xAA, 0x00, 0x00];

// ---------------------------------------------------------------------------
// SetupFrame
// ---------------------------------------------------------------------------

/// A decoded setup-channel frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupFrame {
    /// Report in for an update check.
    TriggerFwUpdateCheck,
    /// Identity of the newest image on the server.
    LastFwInfo(FirmwareDescriptor),
    /// Open the write session; data blocks follow.
    FuotaStart,
}

impl SetupFrame {
    /// Decode a setup payload, dispatching on the command byte.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let Some(&cmd) = payload.first() else {
            return Err(FrameError::Empty);
        };
        match cmd {
            CMD_TRIGGER_FW_UPDATE_CHECK => {
                expect_len(payload, 1, "TriggerFwUpdateCheck")?;
                Ok(Self::TriggerFwUpdateCheck)
            }
            CMD_LAST_FW_INFO => Ok(Self::LastFwInfo(decode_last_fw_info(payload)?)),
            CMD_FUOTA_START => {
                expect_len(payload, 1, "FuotaStart")?;
                Ok(Self::FuotaStart)
            }
            cmd => Err(FrameError::UnknownCommand { cmd }),
        }
    }
}

fn expect_len(payload: &[u8], expected: usize, frame: &'static str) -> Result<()> {
    if payload.len() != expected {
        return Err(
            FrameError::unexpected_length(frame, expected, payload.len()).with_raw(payload)
        );
    }
    Ok(())
}

fn decode_last_fw_info(payload: &[u8]) -> Result<FirmwareDescriptor> {
    expect_len(payload, LAST_FW_INFO_LEN, "LastFwInfo")?;
    let version = Version::new(payload[1], payload[2], payload[3]);
    let size = read_uint32(payload, 4)?;
    let mut checksum = [0u8; CHECKSUM_LEN];
    checksum.copy_from_slice(&payload[8..8 + CHECKSUM_LEN]);
    Ok(FirmwareDescriptor::new(version, size, checksum))
}

// ---------------------------------------------------------------------------
// BlockAck
// ---------------------------------------------------------------------------

/// Per-block acknowledgment for the ack channel: the 32-bit index of the
/// block just written.
///
/// Wire primitive only. The engine acknowledges the session start, not
/// individual blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAck {
    pub index: u32,
}

impl BlockAck {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4);
        write_uint32(&mut buf, self.index);
        buf
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
