//! Flash-write seam.

use crate::session::CHECKSUM_LEN;

/// Sink for a firmware image arriving in arbitrary-size blocks.
///
/// `begin`, `write`, `end` bracket one image. Errors latch inside the
/// driver and surface through `has_error`/`error_string` rather than
/// through return values, matching how flash drivers fail asynchronously
/// to the byte stream.
pub trait FirmwareWriter {
    /// Open a write session for an image of exactly `size` bytes.
    fn begin(&mut self, size: u32) -> bool;

    /// Append bytes to the open session, returning how many were accepted.
    fn write(&mut self, data: &[u8]) -> usize;

    /// Record the digest that `end` will verify the image against.
    fn set_checksum(&mut self, checksum: &[u8; CHECKSUM_LEN]);

    /// Whether the driver has latched an error since the session opened.
    fn has_error(&self) -> bool;

    /// Driver-specific description of the latched error.
    fn error_string(&self) -> String;

    /// Bytes still expected before the image is complete.
    fn remaining(&self) -> u32;

    /// Verify and commit the image. `true` means it is ready to boot.
    fn end(&mut self) -> bool;

    /// Discard the session and clear any latched error. Idempotent; a call
    /// with no session open is a no-op.
    fn abort(&mut self);
}
