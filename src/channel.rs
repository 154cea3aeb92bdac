//! Channel - the exclusive-access device endpoint
//!
//! A `Channel` owns one [`AccessGate`] and one [`MessageBuffer`]. The buffer
//! is reachable only through a [`Session`], and a session exists only while
//! it holds the gate, so no mutation path bypasses exclusivity.
//!
//! Two ways to drive it:
//! - [`Channel::open`] returns a borrowed RAII `Session`; dropping it closes.
//! - [`Endpoint`] is a file-descriptor-like handle with an explicit
//!   `Closed`/`Open` state, reporting `InvalidState` for misuse.

use crate::buffer::{MessageBuffer, OverflowPolicy, WriteOutcome};
use crate::config::ChannelConfig;
use crate::error::{ChannelError, Result};
use crate::gate::{current_pid, pid_alive, AccessGate};
use crate::shm::DeviceShm;
use std::borrow::Borrow;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Magic number for device region validation
const DEVICE_MAGIC: u32 = 0x4F545055; // "OTPU"
const DEVICE_VERSION: u32 = 2;

/// Layout of a device, in private memory or at the start of a shared region
#[repr(C)]
struct DeviceRegion {
    magic: u32,
    version: u32,
    /// Pid of the process that created the shared region
    owner: AtomicU32,
    gate: AccessGate,
    buffer: MessageBuffer,
}

impl DeviceRegion {
    const SIZE: usize = std::mem::size_of::<DeviceRegion>();

    fn new() -> Self {
        Self {
            magic: DEVICE_MAGIC,
            version: DEVICE_VERSION,
            owner: AtomicU32::new(0),
            gate: AccessGate::new(),
            buffer: MessageBuffer::new(),
        }
    }

    /// # Safety
    /// The pointer must point to `SIZE` bytes of valid, aligned memory
    unsafe fn init(ptr: *mut Self) {
        (*ptr).magic = DEVICE_MAGIC;
        (*ptr).version = DEVICE_VERSION;
        (*ptr).owner = AtomicU32::new(0);
        AccessGate::init(std::ptr::addr_of_mut!((*ptr).gate));
        MessageBuffer::init(std::ptr::addr_of_mut!((*ptr).buffer));
    }
}

enum Backing {
    /// Heap region from `Box::into_raw`, freed on drop
    Local,
    Shared(DeviceShm),
}

/// One exclusive-access device
pub struct Channel {
    backing: Backing,
    region: *mut DeviceRegion,
    config: ChannelConfig,
}

// SAFETY: the gate is atomic and the buffer is only touched by the
// session holding it
unsafe impl Send for Channel {}
unsafe impl Sync for Channel {}

impl Channel {
    /// Create a private in-process channel
    pub fn new(config: ChannelConfig) -> Self {
        let region = Box::into_raw(Box::new(DeviceRegion::new()));

        log::info!(
            "opentpu: device '{}' ready with emulator '{}'",
            config.name,
            config.emulator
        );

        Self {
            backing: Backing::Local,
            region,
            config,
        }
    }

    /// Create a device in shared memory, named after `config.name`
    ///
    /// Other processes reach it with [`Channel::attach`]. The region is
    /// unlinked when this channel is dropped.
    ///
    /// A region whose creator is still running is never touched: that
    /// fails with `DeviceExists`. A region left by an exited creator is
    /// taken over with its gate and pending message intact.
    pub fn create(config: ChannelConfig) -> Result<Self> {
        let shm = match DeviceShm::create(&config.name, DeviceRegion::SIZE) {
            Ok(shm) => {
                let region = shm.as_ptr() as *mut DeviceRegion;
                unsafe {
                    DeviceRegion::init(region);
                    (*region).owner.store(current_pid(), Ordering::Release);
                }
                shm
            }
            Err(ChannelError::DeviceExists { .. }) => Self::take_over(&config.name)?,
            Err(e) => return Err(e),
        };
        let region = shm.as_ptr() as *mut DeviceRegion;

        log::info!(
            "opentpu: shared device '{}' created ({} bytes) with emulator '{}'",
            config.name,
            DeviceRegion::SIZE,
            config.emulator
        );

        Ok(Self {
            backing: Backing::Shared(shm),
            region,
            config,
        })
    }

    fn take_over(name: &str) -> Result<DeviceShm> {
        let mut shm = DeviceShm::open_sized(name, DeviceRegion::SIZE)?;
        let region = shm.as_ptr() as *mut DeviceRegion;
        let me = current_pid();

        unsafe {
            if (*region).magic == DEVICE_MAGIC && (*region).version == DEVICE_VERSION {
                let owner = (*region).owner.load(Ordering::Acquire);
                if owner != 0 && pid_alive(owner) {
                    return Err(ChannelError::DeviceExists {
                        name: name.to_string(),
                    });
                }
                if (*region)
                    .owner
                    .compare_exchange(owner, me, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    return Err(ChannelError::DeviceExists {
                        name: name.to_string(),
                    });
                }
                log::warn!(
                    "opentpu: taking over device '{}' left by exited process {}",
                    name,
                    owner
                );
            } else {
                // No handle of this layout can be attached to it
                log::warn!("opentpu: reinitialising foreign region '{}'", name);
                DeviceRegion::init(region);
                (*region).owner.store(me, Ordering::Release);
            }
        }

        shm.claim();
        Ok(shm)
    }

    /// Attach to a shared device created by another process
    pub fn attach(config: ChannelConfig) -> Result<Self> {
        let shm = DeviceShm::open(&config.name)?;

        if shm.size() < DeviceRegion::SIZE {
            return Err(ChannelError::RegionTooSmall {
                need: DeviceRegion::SIZE,
                found: shm.size(),
            });
        }

        let region = shm.as_ptr() as *mut DeviceRegion;

        unsafe {
            let magic = (*region).magic;
            if magic != DEVICE_MAGIC {
                return Err(ChannelError::InvalidMagic {
                    expected: DEVICE_MAGIC,
                    got: magic,
                });
            }
            let version = (*region).version;
            if version != DEVICE_VERSION {
                return Err(ChannelError::InvalidVersion {
                    expected: DEVICE_VERSION,
                    got: version,
                });
            }
        }

        log::debug!("opentpu: attached to shared device '{}'", config.name);

        Ok(Self {
            backing: Backing::Shared(shm),
            region,
            config,
        })
    }

    /// Start a session, failing fast with `Busy` if one is active
    pub fn open(&self) -> Result<Session<&Channel>> {
        Session::acquire(self)
    }

    /// Like [`Channel::open`], but the session keeps the channel alive
    pub fn open_owned(self: &Arc<Self>) -> Result<Session<Arc<Channel>>> {
        Session::acquire(Arc::clone(self))
    }

    /// Whether some session currently holds the device
    #[inline]
    pub fn is_busy(&self) -> bool {
        self.gate().is_held()
    }

    /// Device name
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Emulator executable configured for this device
    pub fn emulator(&self) -> &str {
        &self.config.emulator
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Whether the device lives in shared memory
    pub fn is_shared(&self) -> bool {
        matches!(self.backing, Backing::Shared(_))
    }

    /// Whether this handle created the shared region
    pub fn is_owner(&self) -> bool {
        match &self.backing {
            Backing::Local => true,
            Backing::Shared(shm) => shm.is_owner(),
        }
    }

    #[inline]
    fn gate(&self) -> &AccessGate {
        unsafe { &(*self.region).gate }
    }

    /// # Safety
    /// Caller must hold the gate, and must not keep another reference to
    /// the buffer alive
    #[inline]
    #[allow(clippy::mut_from_ref)]
    unsafe fn buffer_mut(&self) -> &mut MessageBuffer {
        &mut *std::ptr::addr_of_mut!((*self.region).buffer)
    }
}

impl Default for Channel {
    fn default() -> Self {
        Self::new(ChannelConfig::default())
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Backing::Local = self.backing {
            // SAFETY: allocated in `Channel::new`; no session can outlive
            // the channel it borrows
            unsafe { drop(Box::from_raw(self.region)) };
        }
        log::info!("opentpu: device '{}' unregistered", self.config.name);
    }
}

/// Exclusive access to a channel, from open until drop
///
/// `C` is how the session refers to its channel: `&Channel` for scoped use,
/// `Arc<Channel>` when the session must own it.
pub struct Session<C: Borrow<Channel>> {
    channel: C,
}

impl<C: Borrow<Channel>> Session<C> {
    /// Take the channel's gate
    pub fn acquire(channel: C) -> Result<Self> {
        let ch = channel.borrow();
        if !ch.gate().try_acquire() {
            log::warn!("opentpu: device '{}' in use by another process", ch.name());
            return Err(ChannelError::Busy);
        }

        log::debug!("opentpu: device '{}' opened", ch.name());
        Ok(Self { channel })
    }

    pub fn channel(&self) -> &Channel {
        self.channel.borrow()
    }

    #[inline]
    fn buffer(&self) -> &MessageBuffer {
        // SAFETY: this session holds the gate
        unsafe { self.channel.borrow().buffer_mut() }
    }

    #[inline]
    fn buffer_mut(&mut self) -> &mut MessageBuffer {
        // SAFETY: this session holds the gate and `&mut self` is unique
        unsafe { self.channel.borrow().buffer_mut() }
    }

    /// Write `bytes[..requested]` as the new message
    ///
    /// Returns how many bytes were accepted. Oversized requests follow the
    /// channel's [`OverflowPolicy`].
    pub fn write(&mut self, bytes: &[u8], requested: usize) -> Result<WriteOutcome> {
        let policy: OverflowPolicy = self.channel().config.overflow;
        match self.buffer_mut().write(bytes, requested, policy) {
            Ok(outcome) => {
                if outcome.is_truncated() {
                    log::warn!(
                        "opentpu: truncated write of {} bytes to {}",
                        outcome.requested,
                        outcome.accepted
                    );
                }
                log::debug!("opentpu: received {} characters from the user", outcome.accepted);
                Ok(outcome)
            }
            Err(e) => {
                log::warn!("opentpu: write failed: {}", e);
                Err(e)
            }
        }
    }

    /// Write the whole of `msg`
    pub fn write_message(&mut self, msg: &[u8]) -> Result<WriteOutcome> {
        self.write(msg, msg.len())
    }

    /// Move the pending message into `out` and clear it
    ///
    /// Returns its length, `0` if nothing was written since the last read.
    /// Fails with `Fault` if `out` is too small; the message is kept.
    pub fn read(&mut self, out: &mut [u8]) -> Result<usize> {
        match self.buffer_mut().read_into(out) {
            Ok(len) => {
                log::debug!("opentpu: sent {} characters to the user", len);
                Ok(len)
            }
            Err(e) => {
                log::warn!("opentpu: failed to send message: {}", e);
                Err(e)
            }
        }
    }

    /// Move the pending message out and clear it
    pub fn read_message(&mut self) -> Result<Vec<u8>> {
        let msg = self.buffer_mut().take()?;
        log::debug!("opentpu: sent {} characters to the user", msg.len());
        Ok(msg)
    }

    /// Move up to `out.len()` bytes of the pending message into `out`
    ///
    /// The rest stays pending, so a message can be consumed in pieces.
    pub fn read_partial(&mut self, out: &mut [u8]) -> Result<usize> {
        let n = self.buffer_mut().read_some(out)?;
        log::debug!("opentpu: sent {} characters to the user", n);
        Ok(n)
    }

    /// Length of the pending message, at most the capacity
    pub fn pending(&self) -> usize {
        self.buffer().len()
    }

    /// End the session and release the gate
    pub fn close(self) {}
}

impl<C: Borrow<Channel>> Drop for Session<C> {
    fn drop(&mut self) {
        let ch = self.channel.borrow();
        ch.gate().release();
        log::debug!("opentpu: device '{}' successfully closed", ch.name());
    }
}

/// Reads consume the pending message from the front; `Ok(0)` once drained.
impl<C: Borrow<Channel>> io::Read for Session<C> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_partial(buf).map_err(io::Error::from)
    }
}

/// Every `write` call replaces the pending message.
impl<C: Borrow<Channel>> io::Write for Session<C> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_message(buf)
            .map(|outcome| outcome.accepted)
            .map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Endpoint state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Closed,
    Open,
}

impl EndpointState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointState::Closed => "closed",
            EndpointState::Open => "open",
        }
    }
}

/// A caller's handle on a channel, like an open file description
pub struct Endpoint {
    channel: Arc<Channel>,
    session: Option<Session<Arc<Channel>>>,
}

impl Endpoint {
    /// A closed endpoint on `channel`
    pub fn new(channel: Arc<Channel>) -> Self {
        Self {
            channel,
            session: None,
        }
    }

    pub fn state(&self) -> EndpointState {
        if self.session.is_some() {
            EndpointState::Open
        } else {
            EndpointState::Closed
        }
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// `Closed -> Open`; `Busy` if another session holds the channel
    pub fn open(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Err(self.invalid("open"));
        }
        self.session = Some(self.channel.open_owned()?);
        Ok(())
    }

    pub fn write(&mut self, bytes: &[u8], requested: usize) -> Result<WriteOutcome> {
        self.session_mut("write")?.write(bytes, requested)
    }

    pub fn read(&mut self, out: &mut [u8]) -> Result<usize> {
        self.session_mut("read")?.read(out)
    }

    pub fn read_message(&mut self) -> Result<Vec<u8>> {
        self.session_mut("read")?.read_message()
    }

    /// `Open -> Closed`; never releases the gate twice
    pub fn close(&mut self) -> Result<()> {
        match self.session.take() {
            Some(session) => {
                session.close();
                Ok(())
            }
            None => Err(self.invalid("close")),
        }
    }

    fn session_mut(&mut self, op: &'static str) -> Result<&mut Session<Arc<Channel>>> {
        let state = self.state();
        self.session.as_mut().ok_or(ChannelError::InvalidState {
            op,
            state: state.as_str(),
        })
    }

    fn invalid(&self, op: &'static str) -> ChannelError {
        ChannelError::InvalidState {
            op,
            state: self.state().as_str(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::MESSAGE_CAPACITY;
    use std::io::{Read, Write};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn shared_config(name: &str) -> ChannelConfig {
        ChannelConfig {
            name: name.to_string(),
            ..ChannelConfig::default()
        }
    }

    #[test]
    fn test_hello_scenario() {
        let channel = Channel::default();

        let mut session = channel.open().unwrap();
        let outcome = session.write(b"hello", 5).unwrap();
        assert_eq!(outcome.accepted, 5);

        let mut buf = [0u8; 64];
        assert_eq!(session.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(session.read(&mut buf).unwrap(), 0);
        session.close();

        assert!(channel.open().is_ok());
    }

    #[test]
    fn test_second_open_is_busy() {
        let channel = Channel::default();
        let mut first = channel.open().unwrap();
        first.write_message(b"mine").unwrap();

        assert!(matches!(channel.open(), Err(ChannelError::Busy)));
        assert!(channel.is_busy());

        // The rejected open left the first session intact
        assert_eq!(first.pending(), 4);
        assert_eq!(first.read_message().unwrap(), b"mine");
    }

    #[test]
    fn test_drop_releases_gate() {
        let channel = Channel::default();
        {
            let _session = channel.open().unwrap();
            assert!(channel.is_busy());
        }
        assert!(!channel.is_busy());
        assert!(channel.open().is_ok());
    }

    #[test]
    fn test_round_trip_all_lengths() {
        let channel = Channel::default();
        let mut session = channel.open().unwrap();

        for len in 0..=MESSAGE_CAPACITY {
            let msg: Vec<u8> = (0..len).map(|i| (i * 7 + len) as u8).collect();
            let outcome = session.write(&msg, len).unwrap();
            assert_eq!(outcome.accepted, len);
            assert_eq!(session.read_message().unwrap(), msg);
            assert_eq!(session.pending(), 0);
        }
    }

    #[test]
    fn test_capacity_boundary_reject() {
        let channel = Channel::default();
        let mut session = channel.open().unwrap();

        let big = vec![1u8; 300];
        let err = session.write(&big, 300).unwrap_err();
        assert!(matches!(err, ChannelError::Overflow { max: 256, got: 300 }));
        assert_eq!(session.pending(), 0);
    }

    #[test]
    fn test_capacity_boundary_truncate() {
        let channel = Channel::new(ChannelConfig {
            overflow: OverflowPolicy::Truncate,
            ..ChannelConfig::default()
        });
        let mut session = channel.open().unwrap();

        let big: Vec<u8> = (0..300).map(|i| i as u8).collect();
        let outcome = session.write(&big, 300).unwrap();
        assert_eq!(outcome.accepted, MESSAGE_CAPACITY);
        assert!(outcome.is_truncated());
        assert_eq!(session.read_message().unwrap(), &big[..MESSAGE_CAPACITY]);
    }

    #[test]
    fn test_read_fault_keeps_message() {
        let channel = Channel::default();
        let mut session = channel.open().unwrap();
        session.write_message(b"accelerate").unwrap();

        let mut small = [0u8; 4];
        assert!(matches!(
            session.read(&mut small),
            Err(ChannelError::Fault { needed: 10, available: 4 })
        ));
        assert_eq!(session.pending(), 10);
        assert_eq!(session.read_message().unwrap(), b"accelerate");
    }

    #[test]
    fn test_write_fault_is_reported() {
        let channel = Channel::default();
        let mut session = channel.open().unwrap();

        let err = session.write(b"abc", 8).unwrap_err();
        assert!(matches!(err, ChannelError::Fault { needed: 8, available: 3 }));
        assert_eq!(session.pending(), 0);
    }

    #[test]
    fn test_message_survives_between_sessions() {
        let channel = Channel::default();

        let mut host = channel.open().unwrap();
        host.write_message(b"matmul").unwrap();
        host.close();

        let mut emulator = channel.open().unwrap();
        assert_eq!(emulator.read_message().unwrap(), b"matmul");
    }

    #[test]
    fn test_concurrent_open_single_winner() {
        let channel = Arc::new(Channel::default());
        let opened = AtomicUsize::new(0);
        let busy = AtomicUsize::new(0);
        let held = channel.open_owned().unwrap();

        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| match channel.open() {
                    Ok(_) => {
                        opened.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(ChannelError::Busy) => {
                        busy.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(e) => panic!("unexpected error: {}", e),
                });
            }
        });

        assert_eq!(opened.load(Ordering::SeqCst), 0);
        assert_eq!(busy.load(Ordering::SeqCst), 8);
        drop(held);
        assert!(!channel.is_busy());
    }

    #[test]
    fn test_sessions_never_overlap() {
        let channel = Arc::new(Channel::default());
        let inside = AtomicUsize::new(0);

        thread::scope(|s| {
            for id in 0..4u8 {
                let channel = &channel;
                let inside = &inside;
                s.spawn(move || {
                    let mut done = 0;
                    while done < 200 {
                        let mut session = match channel.open() {
                            Ok(session) => session,
                            Err(ChannelError::Busy) => {
                                thread::yield_now();
                                continue;
                            }
                            Err(e) => panic!("unexpected error: {}", e),
                        };
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        session.write_message(&[id; 16]).unwrap();
                        assert_eq!(session.read_message().unwrap(), [id; 16]);
                        inside.fetch_sub(1, Ordering::SeqCst);
                        done += 1;
                    }
                });
            }
        });

        assert!(!channel.is_busy());
    }

    #[test]
    fn test_io_traits() {
        let channel = Channel::default();
        let mut session = channel.open().unwrap();

        session.write_all(b"stream").unwrap();
        let mut out = Vec::new();
        session.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"stream");

        let mut tiny = [0u8; 1];
        io::Write::write(&mut session, b"xy").unwrap();
        assert_eq!(io::Read::read(&mut session, &mut tiny).unwrap(), 1);
        assert_eq!(&tiny, b"x");
        assert_eq!(session.pending(), 1);
        assert_eq!(io::Read::read(&mut session, &mut tiny).unwrap(), 1);
        assert_eq!(&tiny, b"y");
        assert_eq!(io::Read::read(&mut session, &mut tiny).unwrap(), 0);
    }

    #[test]
    fn test_read_to_end_full_message() {
        let channel = Channel::default();
        let mut session = channel.open().unwrap();

        let msg: Vec<u8> = (0..MESSAGE_CAPACITY).map(|i| (i * 3) as u8).collect();
        session.write_all(&msg).unwrap();
        let mut out = Vec::new();
        assert_eq!(session.read_to_end(&mut out).unwrap(), MESSAGE_CAPACITY);
        assert_eq!(out, msg);
        assert_eq!(session.pending(), 0);

        session.write_all(&msg).unwrap();
        let mut head = [0u8; 100];
        session.read_exact(&mut head).unwrap();
        assert_eq!(&head[..], &msg[..100]);
        assert_eq!(session.read_message().unwrap(), &msg[100..]);
    }

    #[test]
    fn test_endpoint_state_machine() {
        let channel = Arc::new(Channel::default());
        let mut ep = Endpoint::new(Arc::clone(&channel));
        assert_eq!(ep.state(), EndpointState::Closed);

        assert!(matches!(
            ep.write(b"x", 1),
            Err(ChannelError::InvalidState { op: "write", state: "closed" })
        ));
        assert!(matches!(
            ep.read(&mut [0u8; 4]),
            Err(ChannelError::InvalidState { op: "read", .. })
        ));
        assert!(matches!(
            ep.close(),
            Err(ChannelError::InvalidState { op: "close", .. })
        ));

        ep.open().unwrap();
        assert_eq!(ep.state(), EndpointState::Open);
        assert!(matches!(
            ep.open(),
            Err(ChannelError::InvalidState { op: "open", state: "open" })
        ));

        assert_eq!(ep.write(b"hello", 5).unwrap().accepted, 5);
        assert_eq!(ep.read_message().unwrap(), b"hello");
        assert!(ep.read_message().unwrap().is_empty());

        ep.close().unwrap();
        assert!(ep.close().is_err());
        assert!(!channel.is_busy());
    }

    #[test]
    fn test_endpoints_exclude_each_other() {
        let channel = Arc::new(Channel::default());
        let mut a = Endpoint::new(Arc::clone(&channel));
        let mut b = Endpoint::new(Arc::clone(&channel));

        a.open().unwrap();
        assert!(matches!(b.open(), Err(ChannelError::Busy)));
        assert_eq!(b.state(), EndpointState::Closed);

        a.close().unwrap();
        b.open().unwrap();
        drop(b);
        assert!(!channel.is_busy());
    }

    #[test]
    fn test_shared_device_exclusive_across_handles() {
        let owner = Channel::create(shared_config("test_channel_shared")).unwrap();
        let other = Channel::attach(shared_config("test_channel_shared")).unwrap();
        assert!(owner.is_shared() && owner.is_owner());
        assert!(!other.is_owner());

        let mut session = owner.open().unwrap();
        assert!(matches!(other.open(), Err(ChannelError::Busy)));
        session.write_message(b"to emulator").unwrap();
        session.close();

        let mut session = other.open().unwrap();
        assert_eq!(session.read_message().unwrap(), b"to emulator");
        session.close();

        assert!(owner.open().is_ok());
    }

    #[test]
    fn test_create_refuses_live_device() {
        let name = "test_channel_live_create";
        let owner = Channel::create(shared_config(name)).unwrap();
        let other = Channel::attach(shared_config(name)).unwrap();

        let mut session = owner.open().unwrap();
        session.write_message(b"in flight").unwrap();

        assert!(matches!(
            Channel::create(shared_config(name)).err().unwrap(),
            ChannelError::DeviceExists { .. }
        ));

        // The region was left alone: still held, message still pending
        assert!(matches!(other.open(), Err(ChannelError::Busy)));
        assert_eq!(session.pending(), 9);
        assert_eq!(session.read_message().unwrap(), b"in flight");
    }

    #[test]
    fn test_create_takes_over_stale_device() {
        let name = "test_channel_stale_create";
        let stale = Channel::create(shared_config(name)).unwrap();
        let dead = crate::gate::exited_pid();

        let mut session = stale.open().unwrap();
        session.write_message(b"left behind").unwrap();
        std::mem::forget(session);
        unsafe {
            (*stale.region).owner.store(dead, Ordering::SeqCst);
            (*stale.region).gate.hold_for(dead);
        }

        let fresh = Channel::create(shared_config(name)).unwrap();
        assert!(fresh.is_owner());
        let mut session = fresh.open().unwrap();
        assert_eq!(session.read_message().unwrap(), b"left behind");
        session.close();

        assert!(matches!(
            Channel::create(shared_config(name)).err().unwrap(),
            ChannelError::DeviceExists { .. }
        ));
    }

    #[test]
    fn test_gate_reclaimed_from_exited_process() {
        let name = "test_channel_reclaim";
        let owner = Channel::create(shared_config(name)).unwrap();
        let other = Channel::attach(shared_config(name)).unwrap();

        // A session whose process exited without closing
        unsafe { (*other.region).gate.hold_for(crate::gate::exited_pid()) };
        assert!(owner.is_busy());

        let mut session = owner.open().unwrap();
        assert!(matches!(other.open(), Err(ChannelError::Busy)));
        session.write_message(b"recovered").unwrap();
        session.close();
        assert!(!owner.is_busy());
    }

    #[test]
    fn test_corrupt_shared_length_is_reported() {
        let name = "test_channel_corrupt_len";
        let owner = Channel::create(shared_config(name)).unwrap();
        let other = Channel::attach(shared_config(name)).unwrap();

        unsafe { owner.buffer_mut().set_raw_len(1000) };

        let mut session = other.open().unwrap();
        assert_eq!(session.pending(), MESSAGE_CAPACITY);
        let mut out = [0u8; 2048];
        assert!(matches!(
            session.read(&mut out),
            Err(ChannelError::CorruptRegion { length: 1000, .. })
        ));
        assert!(session.read_message().is_err());
        let err = io::Read::read(&mut session, &mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        session.write_message(b"fixed").unwrap();
        assert_eq!(session.read_message().unwrap(), b"fixed");
    }

    #[test]
    fn test_attach_validates_region() {
        let name = "test_channel_bad_magic";
        let _raw = DeviceShm::create(name, DeviceRegion::SIZE).unwrap();
        assert!(matches!(
            Channel::attach(shared_config(name)).err().unwrap(),
            ChannelError::InvalidMagic { got: 0, .. }
        ));

        let name = "test_channel_small";
        let _raw = DeviceShm::create(name, 16).unwrap();
        assert!(matches!(
            Channel::attach(shared_config(name)).err().unwrap(),
            ChannelError::RegionTooSmall { found: 16, .. }
        ));
    }
}
