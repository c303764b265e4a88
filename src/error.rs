use thiserror::Error;

/// Errors arising from setup-frame parsing.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("empty payload")]
    Empty,

    #[error("unknown setup command 0x{cmd:02X}")]
    UnknownCommand { cmd: u8 },

    #[error("payload too short for {frame}: need {need} bytes, got {got}{}", format_raw_suffix(raw))]
    PayloadTooShort {
        frame: &'static str,
        need: usize,
        got: usize,
        /// Raw payload bytes for debug context.
        raw: Vec<u8>,
    },

    #[error("unexpected payload length for {frame}: expected {expected}, got {got}{}", format_raw_suffix(raw))]
    UnexpectedLength {
        frame: &'static str,
        expected: usize,
        got: usize,
        /// Raw payload bytes for debug context.
        raw: Vec<u8>,
    },
}

impl FrameError {
    /// Create a `PayloadTooShort` error (raw bytes filled in later via `with_raw`).
    pub(crate) fn payload_too_short(frame: &'static str, need: usize, got: usize) -> Self {
        Self::PayloadTooShort { frame, need, got, raw: Vec::new() }
    }

    /// Create an `UnexpectedLength` error (raw bytes filled in later via `with_raw`).
    pub(crate) fn unexpected_length(frame: &'static str, expected: usize, got: usize) -> Self {
        Self::UnexpectedLength { frame, expected, got, raw: Vec::new() }
    }

    /// Attach raw payload bytes to decode-phase errors for diagnostics.
    pub fn with_raw(self, payload: &[u8]) -> Self {
        match self {
            Self::PayloadTooShort { frame, need, got, .. } => {
                Self::PayloadTooShort { frame, need, got, raw: payload.to_vec() }
            }
            Self::UnexpectedLength { frame, expected, got, .. } => {
                Self::UnexpectedLength { frame, expected, got, raw: payload.to_vec() }
            }
            other => other,
        }
    }
}

/// Format raw bytes as a suffix like " | 01 02 00 ..." (empty if no bytes).
fn format_raw_suffix(raw: &[u8]) -> String {
    if raw.is_empty() {
        return String::new();
    }
    let limit = 16;
    let hex: String = raw.iter().take(limit).map(|b| format!("{b:02X}")).collect();
    let ellipsis = if raw.len() > limit { "..." } else { "" };
    format!(" | {hex}{ellipsis}")
}

/// Errors arising from engine construction.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("topic `{topic}` is {len} bytes, over the {max}-byte budget")]
    TopicTooLong { topic: String, len: usize, max: usize },

    #[error("transport receive buffer is {got} bytes, need at least {need}")]
    RxBufferTooSmall { got: usize, need: usize },
}

pub type Result<T> = std::result::Result<T, FrameError>;
