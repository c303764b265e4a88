use std::fmt;

use crate::codec::hex_upper;

/// Length of the firmware digest carried by `LastFwInfo`.
pub const CHECKSUM_LEN: usize = 16;

/// Semantic firmware version, three bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl Version {
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self { major, minor, patch }
    }

    /// Pack into a single comparable ordinal, major byte most significant.
    pub fn ordinal(self) -> u32 {
        (u32::from(self.major) << 16) | (u32::from(self.minor) << 8) | u32::from(self.patch)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Identity of one firmware image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FirmwareDescriptor {
    pub version: Version,
    pub size: u32,
    pub checksum: [u8; CHECKSUM_LEN],
}

impl FirmwareDescriptor {
    pub const fn new(version: Version, size: u32, checksum: [u8; CHECKSUM_LEN]) -> Self {
        Self { version, size, checksum }
    }

    /// The all-zero descriptor. The server-side slot is reset to this at the
    /// start of every update check.
    pub const fn empty() -> Self {
        Self { version: Version::new(0, 0, 0), size: 0, checksum: [0; CHECKSUM_LEN] }
    }
}

impl Default for FirmwareDescriptor {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Display for FirmwareDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "v{} ({} bytes, checksum {})",
            self.version,
            self.size,
            hex_upper(&self.checksum)
        )
    }
}

/// One-slot mailbox between the setup parser and the state machine.
///
/// A new arrival overwrites whatever was pending; the state machine takes
/// and clears the slot once per tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingRequest {
    /// Server asked the device to report for an update check.
    TriggerCheck,
    /// Server announced its latest image; decide whether to request it.
    FwUpdate,
    /// Server is about to stream blocks; open the write session.
    FuotaStart,
}

/// Progress of the current update session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SessionState {
    /// Server image accepted as an upgrade.
    pub valid_update: bool,
    /// Blocks are being written. Stays set on a failed session until the
    /// next session start.
    pub in_progress: bool,
    /// Edge flag raised the tick the final byte lands, consumed by the
    /// completion handler.
    pub completed: bool,
    /// Bytes accepted by the write driver, never past the image size.
    pub bytes_written: u32,
}

impl SessionState {
    /// Integer completion percentage against `total` image bytes.
    pub fn percent(&self, total: u32) -> u32 {
        if total == 0 {
            return 0;
        }
        (u64::from(self.bytes_written.min(total)) * 100 / u64::from(total)) as u32
    }
}
