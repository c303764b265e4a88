pub mod codec;
pub mod doubles;
pub mod engine;
pub mod error;
pub mod frame;
pub mod platform;
pub mod session;
pub mod topic;
pub mod transport;
pub mod writer;

pub use engine::{Config, FuotaEngine};
pub use error::{FrameError, InitError};
pub use frame::{BlockAck, SetupFrame};
pub use platform::{Clock, Platform, SystemClock};
pub use session::{FirmwareDescriptor, PendingRequest, SessionState, Version};
pub use topic::{Channel, TopicSet};
pub use transport::{Inbound, QoS, Transport};
pub use writer::FirmwareWriter;
