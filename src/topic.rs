use std::fmt;

use crate::error::InitError;

/// Longest topic string the engine will derive. Overflow is a construction
/// error, never a truncation.
pub const MAX_TOPIC_LEN: usize = 32;

/// The four per-device channels of the update protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Server to device: command frames.
    Setup,
    /// Server to device: firmware blocks.
    Data,
    /// Device to server: status opcodes.
    Control,
    /// Device to server: acknowledgments.
    Ack,
}

impl Channel {
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::Data => "data",
            Self::Control => "control",
            Self::Ack => "ack",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Topic strings derived from the device identity, fixed for the lifetime
/// of the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSet {
    pub setup: String,
    pub data: String,
    pub control: String,
    pub ack: String,
}

impl TopicSet {
    /// Derive all four topics as `/{device_id}/ota/{channel}`.
    pub fn derive(device_id: &str) -> Result<Self, InitError> {
        Ok(Self {
            setup: Self::derive_one(device_id, Channel::Setup)?,
            data: Self::derive_one(device_id, Channel::Data)?,
            control: Self::derive_one(device_id, Channel::Control)?,
            ack: Self::derive_one(device_id, Channel::Ack)?,
        })
    }

    fn derive_one(device_id: &str, channel: Channel) -> Result<String, InitError> {
        let topic = format!("/{device_id}/ota/{channel}");
        if topic.len() > MAX_TOPIC_LEN {
            return Err(InitError::TopicTooLong { len: topic.len(), max: MAX_TOPIC_LEN, topic });
        }
        Ok(topic)
    }

    pub fn get(&self, channel: Channel) -> &str {
        match channel {
            Channel::Setup => &self.setup,
            Channel::Data => &self.data,
            Channel::Control => &self.control,
            Channel::Ack => &self.ack,
        }
    }
}
