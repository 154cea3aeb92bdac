//! Error types for the OpenTPU channel

use std::io;
use rustix::io::Errno;
use thiserror::Error;

/// Result type for channel operations
pub type Result<T> = std::result::Result<T, ChannelError>;

/// Errors that can occur in channel operations
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Another session currently holds the channel
    #[error("Channel busy: device in use by another session")]
    Busy,

    /// Copying between caller memory and the channel buffer failed
    #[error("Bad address: {needed} bytes required, caller memory holds {available}")]
    Fault { needed: usize, available: usize },

    /// Write larger than the message buffer
    #[error("Message overflow: max {max} bytes, got {got} bytes")]
    Overflow { max: usize, got: usize },

    /// Operation not valid in the endpoint's current state
    #[error("Cannot {op} while the endpoint is {state}")]
    InvalidState { op: &'static str, state: &'static str },

    /// Recorded message length exceeds the buffer
    #[error("Corrupt device region: message length {length} exceeds capacity {capacity}")]
    CorruptRegion { length: usize, capacity: usize },

    /// A live device already uses this name
    #[error("Device '{name}' already exists and its owner is running")]
    DeviceExists { name: String },

    /// Failed to create shared memory
    #[error("Failed to create device region '{name}': {source}")]
    ShmCreate {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to open shared memory
    #[error("Failed to open device region '{name}': {source}")]
    ShmOpen {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to map memory
    #[error("Failed to map memory: {0}")]
    Mmap(#[source] io::Error),

    /// Failed to truncate shared memory
    #[error("Failed to set device region size: {0}")]
    Truncate(#[source] io::Error),

    /// Invalid region magic number
    #[error("Invalid device magic number: expected 0x{expected:08X}, got 0x{got:08X}")]
    InvalidMagic { expected: u32, got: u32 },

    /// Region written by an incompatible layout
    #[error("Unsupported device layout version: expected {expected}, got {got}")]
    InvalidVersion { expected: u32, got: u32 },

    /// Mapped region smaller than the channel layout
    #[error("Device region too small: need {need} bytes, found {found}")]
    RegionTooSmall { need: usize, found: usize },

    /// Device name too long
    #[error("Device name too long: max {max} chars, got {got}")]
    NameTooLong { max: usize, got: usize },

    /// Device name cannot be used as a shared memory name
    #[error("Invalid device name '{0}'")]
    InvalidName(String),

    /// Bad configuration value
    #[error("Invalid value '{value}' for {key}")]
    Config { key: &'static str, value: String },
}

impl ChannelError {
    /// The POSIX errno a device node would report for this error
    pub fn errno(&self) -> Errno {
        match self {
            ChannelError::Busy => Errno::BUSY,
            ChannelError::Fault { .. } => Errno::FAULT,
            ChannelError::Overflow { .. } => Errno::MSGSIZE,
            ChannelError::InvalidState { .. } => Errno::BADF,
            ChannelError::DeviceExists { .. } => Errno::EXIST,
            ChannelError::NameTooLong { .. } => Errno::NAMETOOLONG,
            ChannelError::InvalidName(_) | ChannelError::Config { .. } => Errno::INVAL,
            _ => Errno::IO,
        }
    }

    /// Whether the caller may simply retry the same operation later
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChannelError::Busy | ChannelError::Fault { .. })
    }
}

impl From<ChannelError> for io::Error {
    fn from(err: ChannelError) -> Self {
        let kind = match &err {
            ChannelError::Busy => io::ErrorKind::WouldBlock,
            ChannelError::Fault { .. } | ChannelError::Overflow { .. } => {
                io::ErrorKind::InvalidInput
            }
            ChannelError::InvalidState { .. } => io::ErrorKind::NotConnected,
            ChannelError::DeviceExists { .. } => io::ErrorKind::AlreadyExists,
            ChannelError::CorruptRegion { .. } => io::ErrorKind::InvalidData,
            ChannelError::ShmOpen { source, .. } | ChannelError::ShmCreate { source, .. } => {
                source.kind()
            }
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}
