//! MessageBuffer - fixed-capacity store for the most recent unread message
//!
//! Not a queue: a write replaces the content, a read drains it exactly once.

use crate::error::{ChannelError, Result};

/// Capacity of the message buffer in bytes
pub const MESSAGE_CAPACITY: usize = 256;

/// What to do with a write larger than [`MESSAGE_CAPACITY`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Refuse the write with `ChannelError::Overflow`, buffer untouched
    #[default]
    Reject,
    /// Keep the first `MESSAGE_CAPACITY` bytes and report the truncation
    Truncate,
}

/// Result of an accepted write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Bytes now held in the buffer
    pub accepted: usize,
    /// Bytes the caller asked to write
    pub requested: usize,
}

impl WriteOutcome {
    /// Whether part of the request was dropped by [`OverflowPolicy::Truncate`]
    #[inline]
    pub fn is_truncated(&self) -> bool {
        self.accepted < self.requested
    }
}

/// Fixed-capacity byte buffer with a valid-length marker
///
/// Only `data[..length]` is content; anything past it is stale.
#[repr(C)]
pub struct MessageBuffer {
    length: u32,
    data: [u8; MESSAGE_CAPACITY],
}

impl MessageBuffer {
    /// An empty buffer
    pub const fn new() -> Self {
        Self {
            length: 0,
            data: [0; MESSAGE_CAPACITY],
        }
    }

    /// Reset the buffer in place
    ///
    /// # Safety
    /// The pointer must point to valid, properly aligned memory
    pub unsafe fn init(ptr: *mut Self) {
        (*ptr).length = 0;
        std::ptr::write_bytes((*ptr).data.as_mut_ptr(), 0, MESSAGE_CAPACITY);
    }

    /// Number of valid bytes, never more than the capacity
    #[inline]
    pub fn len(&self) -> usize {
        (self.length as usize).min(MESSAGE_CAPACITY)
    }

    /// The recorded length, rejected if it exceeds the capacity
    ///
    /// A shared region can be scribbled on by any attached process.
    fn checked_len(&self) -> Result<usize> {
        let len = self.length as usize;
        if len > MESSAGE_CAPACITY {
            return Err(ChannelError::CorruptRegion {
                length: len,
                capacity: MESSAGE_CAPACITY,
            });
        }
        Ok(len)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Buffer capacity
    #[inline]
    pub const fn capacity(&self) -> usize {
        MESSAGE_CAPACITY
    }

    /// The valid content, without draining it
    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.data[..self.len()]
    }

    /// Replace the content with `bytes[..requested]`
    ///
    /// Fails with `Overflow` if `requested` exceeds the capacity under
    /// [`OverflowPolicy::Reject`], and with `Fault` if `bytes` holds fewer
    /// than the bytes to be copied. On failure the previous content stays.
    pub fn write(
        &mut self,
        bytes: &[u8],
        requested: usize,
        policy: OverflowPolicy,
    ) -> Result<WriteOutcome> {
        let accepted = if requested > MESSAGE_CAPACITY {
            match policy {
                OverflowPolicy::Reject => {
                    return Err(ChannelError::Overflow {
                        max: MESSAGE_CAPACITY,
                        got: requested,
                    })
                }
                OverflowPolicy::Truncate => MESSAGE_CAPACITY,
            }
        } else {
            requested
        };

        if bytes.len() < accepted {
            return Err(ChannelError::Fault {
                needed: accepted,
                available: bytes.len(),
            });
        }

        self.data[..accepted].copy_from_slice(&bytes[..accepted]);
        self.length = accepted as u32;

        Ok(WriteOutcome {
            accepted,
            requested,
        })
    }

    /// Move the content into `out` and mark the buffer empty
    ///
    /// Returns the message length. If `out` cannot hold the message the
    /// read fails with `Fault` and the content is kept for a retry.
    pub fn read_into(&mut self, out: &mut [u8]) -> Result<usize> {
        let len = self.checked_len()?;
        if out.len() < len {
            return Err(ChannelError::Fault {
                needed: len,
                available: out.len(),
            });
        }

        out[..len].copy_from_slice(&self.data[..len]);
        self.length = 0;
        Ok(len)
    }

    /// Move up to `out.len()` bytes from the front of the message
    ///
    /// Whatever does not fit stays pending for the next read.
    pub fn read_some(&mut self, out: &mut [u8]) -> Result<usize> {
        let len = self.checked_len()?;
        let n = len.min(out.len());

        out[..n].copy_from_slice(&self.data[..n]);
        self.data.copy_within(n..len, 0);
        self.length = (len - n) as u32;
        Ok(n)
    }

    /// Drain the content into a fresh vector
    pub fn take(&mut self) -> Result<Vec<u8>> {
        let len = self.checked_len()?;
        let msg = self.data[..len].to_vec();
        self.length = 0;
        Ok(msg)
    }

    #[cfg(test)]
    pub(crate) fn set_raw_len(&mut self, length: u32) {
        self.length = length;
    }
}

impl Default for MessageBuffer {
    fn default() -> Self {
        Self::new()
    }
}
