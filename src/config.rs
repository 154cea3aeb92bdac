//! Device configuration

use crate::buffer::OverflowPolicy;
use crate::error::{ChannelError, Result};

/// Default device name
pub const DEFAULT_DEVICE_NAME: &str = "opentpu";

/// Default emulator executable
pub const DEFAULT_EMULATOR: &str = "opentpu-emulator-latest";

/// Environment variable overriding the device name
pub const ENV_DEVICE: &str = "OPENTPU_DEVICE";
/// Environment variable overriding the emulator executable
pub const ENV_EMULATOR: &str = "OPENTPU_EMULATOR";
/// Environment variable selecting the overflow policy (`reject` / `truncate`)
pub const ENV_OVERFLOW: &str = "OPENTPU_OVERFLOW";

/// Channel configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Device name, also the shared memory namespace for cross-process use
    pub name: String,
    /// Emulator executable serving the other end of the channel
    pub emulator: String,
    /// Handling of writes larger than the message buffer
    pub overflow: OverflowPolicy,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_DEVICE_NAME.to_string(),
            emulator: DEFAULT_EMULATOR.to_string(),
            overflow: OverflowPolicy::Reject,
        }
    }
}

impl ChannelConfig {
    /// Defaults overridden by `OPENTPU_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(name) = lookup(ENV_DEVICE) {
            config.name = name;
        }
        if let Some(emulator) = lookup(ENV_EMULATOR) {
            config.emulator = emulator;
        }
        if let Some(overflow) = lookup(ENV_OVERFLOW) {
            config.overflow = parse_overflow(&overflow)?;
        }

        Ok(config)
    }
}

fn parse_overflow(value: &str) -> Result<OverflowPolicy> {
    match value.trim().to_ascii_lowercase().as_str() {
        "reject" => Ok(OverflowPolicy::Reject),
        "truncate" => Ok(OverflowPolicy::Truncate),
        _ => Err(ChannelError::Config {
            key: ENV_OVERFLOW,
            value: value.to_string(),
        }),
    }
}
