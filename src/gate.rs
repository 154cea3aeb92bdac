//! AccessGate - single-holder exclusivity for a channel session
//!
//! A try-lock without a wait queue: a second caller is rejected, never
//! delayed. The state is a single atomic word holding the holder's pid
//! (0 = free), so the gate works the same in private memory and inside a
//! shared device region, and a gate left behind by an exited process can
//! be reclaimed.

use rustix::io::Errno;
use rustix::process::{getpid, test_kill_process, Pid};
use std::sync::atomic::{AtomicU32, Ordering};

const FREE: u32 = 0;

/// Pid of the calling process
pub(crate) fn current_pid() -> u32 {
    Pid::as_raw(Some(getpid())) as u32
}

/// Whether `pid` names a running process
///
/// A process we may not signal still exists; only `ESRCH` means gone.
pub(crate) fn pid_alive(pid: u32) -> bool {
    match i32::try_from(pid).ok().and_then(Pid::from_raw) {
        Some(pid) => !matches!(test_kill_process(pid), Err(Errno::SRCH)),
        None => false,
    }
}

/// Binary exclusive lock guarding one open-to-close session
#[repr(C)]
pub struct AccessGate {
    holder: AtomicU32,
}

impl AccessGate {
    /// A gate in the `Free` state
    pub const fn new() -> Self {
        Self {
            holder: AtomicU32::new(FREE),
        }
    }

    /// Reset the gate in place
    ///
    /// # Safety
    /// The pointer must point to valid, properly aligned memory that no
    /// session is using
    pub unsafe fn init(ptr: *mut Self) {
        (*ptr).holder = AtomicU32::new(FREE);
    }

    /// Try to take the gate
    ///
    /// Returns `true` on `Free -> Held`, `false` if held by a live process.
    /// A gate still held by an exited process is taken over.
    #[inline]
    pub fn try_acquire(&self) -> bool {
        let me = current_pid();
        match self
            .holder
            .compare_exchange(FREE, me, Ordering::Acquire, Ordering::Relaxed)
        {
            Ok(_) => true,
            Err(holder) if holder != me && !pid_alive(holder) => {
                let reclaimed = self
                    .holder
                    .compare_exchange(holder, me, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok();
                if reclaimed {
                    log::warn!("opentpu: reclaimed device gate from exited process {}", holder);
                }
                reclaimed
            }
            Err(_) => false,
        }
    }

    /// Give the gate back
    ///
    /// Must pair with exactly one successful `try_acquire`.
    #[inline]
    pub fn release(&self) {
        let prev = self.holder.swap(FREE, Ordering::Release);
        debug_assert_ne!(prev, FREE, "released a gate that was not held");
    }

    /// Whether some session currently holds the gate
    #[inline]
    pub fn is_held(&self) -> bool {
        self.holder.load(Ordering::Acquire) != FREE
    }

    /// Pid of the process holding the gate
    #[inline]
    pub fn holder(&self) -> Option<u32> {
        match self.holder.load(Ordering::Acquire) {
            FREE => None,
            pid => Some(pid),
        }
    }

    #[cfg(test)]
    pub(crate) fn hold_for(&self, pid: u32) {
        self.holder.store(pid, Ordering::Release);
    }
}

impl Default for AccessGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Pid of a process that has already exited and been reaped
#[cfg(test)]
pub(crate) fn exited_pid() -> u32 {
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    pid
}
