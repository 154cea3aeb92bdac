//! OpenTPU channel - exclusive-access message pipe to an accelerator
//!
//! One host process at a time exchanges short binary messages with an
//! OpenTPU accelerator, or the emulator standing in for it, through a
//! single device channel.
//!
//! # Architecture
//!
//! - **AccessGate**: fail-fast single-holder lock, one per device
//! - **MessageBuffer**: 256-byte store for the most recent unread message
//! - **Channel**: owns both; a `Session` holds the gate from open to close
//!
//! Devices live either in private memory ([`Channel::new`]) or in a named
//! shared memory region so separate processes contend for the same gate
//! ([`Channel::create`] / [`Channel::attach`]).

pub mod error;
pub mod gate;
pub mod buffer;
pub mod config;
pub mod shm;
pub mod channel;
pub mod bindings;

pub use error::{ChannelError, Result};
pub use gate::AccessGate;
pub use buffer::{MessageBuffer, OverflowPolicy, WriteOutcome, MESSAGE_CAPACITY};
pub use config::ChannelConfig;
pub use channel::{Channel, Endpoint, EndpointState, Session};
