//! C Bindings for the OpenTPU channel
//!
//! Mirrors the device file operations: `open`, `write`, `read`, `close`
//! return byte counts or a negated errno, as a character device would.

use crate::buffer::OverflowPolicy;
use crate::channel::{Channel, Endpoint};
use crate::config::ChannelConfig;
use crate::error::{ChannelError, Result};
use rustix::io::Errno;
use std::ffi::CStr;
use std::os::raw::{c_char, c_int};
use std::ptr;
use std::slice;
use std::sync::Arc;

// Opaque handles
pub struct OpenTpuDevice(Arc<Channel>);
pub struct OpenTpuEndpoint(Endpoint);

#[repr(C)]
pub struct OpenTpuConfig {
    /// Truncate oversized writes instead of rejecting them
    pub truncate_overflow: bool,
}

fn to_config(name: &str, config: OpenTpuConfig) -> ChannelConfig {
    ChannelConfig {
        name: name.to_string(),
        overflow: if config.truncate_overflow {
            OverflowPolicy::Truncate
        } else {
            OverflowPolicy::Reject
        },
        ..ChannelConfig::default()
    }
}

fn neg_errno(err: &ChannelError) -> c_int {
    -err.errno().raw_os_error()
}

fn to_ret(result: Result<usize>) -> isize {
    match result {
        Ok(n) => n as isize,
        Err(e) => neg_errno(&e) as isize,
    }
}

unsafe fn name_arg<'a>(name: *const c_char) -> Option<&'a str> {
    if name.is_null() {
        return None;
    }
    CStr::from_ptr(name).to_str().ok()
}

fn device_handle(result: Result<Channel>) -> *mut OpenTpuDevice {
    match result {
        Ok(channel) => Box::into_raw(Box::new(OpenTpuDevice(Arc::new(channel)))),
        Err(e) => {
            log::warn!("opentpu: device setup failed: {}", e);
            ptr::null_mut()
        }
    }
}

/// Create a private in-process device with default settings
#[no_mangle]
pub extern "C" fn opentpu_device_new() -> *mut OpenTpuDevice {
    device_handle(Ok(Channel::default()))
}

/// Create a shared device
///
/// # Safety
/// name must be a valid null-terminated string
#[no_mangle]
pub unsafe extern "C" fn opentpu_device_create(
    name: *const c_char,
    config: OpenTpuConfig,
) -> *mut OpenTpuDevice {
    match name_arg(name) {
        Some(name) => device_handle(Channel::create(to_config(name, config))),
        None => ptr::null_mut(),
    }
}

/// Attach to a shared device created by another process
///
/// # Safety
/// name must be a valid null-terminated string
#[no_mangle]
pub unsafe extern "C" fn opentpu_device_attach(
    name: *const c_char,
    config: OpenTpuConfig,
) -> *mut OpenTpuDevice {
    match name_arg(name) {
        Some(name) => device_handle(Channel::attach(to_config(name, config))),
        None => ptr::null_mut(),
    }
}

/// Destroy a device handle
///
/// Endpoints created from it stay usable until freed.
#[no_mangle]
pub unsafe extern "C" fn opentpu_device_destroy(handle: *mut OpenTpuDevice) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

/// Create a closed endpoint on a device
#[no_mangle]
pub unsafe extern "C" fn opentpu_endpoint_new(device: *mut OpenTpuDevice) -> *mut OpenTpuEndpoint {
    if device.is_null() {
        return ptr::null_mut();
    }
    let channel = Arc::clone(&(*device).0);
    Box::into_raw(Box::new(OpenTpuEndpoint(Endpoint::new(channel))))
}

/// Free an endpoint, closing it if open
#[no_mangle]
pub unsafe extern "C" fn opentpu_endpoint_free(handle: *mut OpenTpuEndpoint) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

/// Open: 0, or -EBUSY if another session holds the device
#[no_mangle]
pub unsafe extern "C" fn opentpu_open(handle: *mut OpenTpuEndpoint) -> c_int {
    if handle.is_null() {
        return -einval();
    }
    match (*handle).0.open() {
        Ok(()) => 0,
        Err(e) => neg_errno(&e),
    }
}

/// Write: accepted byte count, or a negated errno
#[no_mangle]
pub unsafe extern "C" fn opentpu_write(
    handle: *mut OpenTpuEndpoint,
    buf: *const u8,
    len: usize,
) -> isize {
    if handle.is_null() {
        return -einval() as isize;
    }
    if buf.is_null() && len > 0 {
        return -efault() as isize;
    }
    let data: &[u8] = if len == 0 { &[] } else { slice::from_raw_parts(buf, len) };
    to_ret((*handle).0.write(data, len).map(|outcome| outcome.accepted))
}

/// Read: message length (0 if none pending), or a negated errno
#[no_mangle]
pub unsafe extern "C" fn opentpu_read(
    handle: *mut OpenTpuEndpoint,
    buf: *mut u8,
    max_len: usize,
) -> isize {
    if handle.is_null() {
        return -einval() as isize;
    }
    if buf.is_null() && max_len > 0 {
        return -efault() as isize;
    }
    let out: &mut [u8] = if max_len == 0 {
        &mut []
    } else {
        slice::from_raw_parts_mut(buf, max_len)
    };
    to_ret((*handle).0.read(out))
}

/// Close: 0, or -EBADF if the endpoint is not open
#[no_mangle]
pub unsafe extern "C" fn opentpu_close(handle: *mut OpenTpuEndpoint) -> c_int {
    if handle.is_null() {
        return -einval();
    }
    match (*handle).0.close() {
        Ok(()) => 0,
        Err(e) => neg_errno(&e),
    }
}

fn einval() -> c_int {
    Errno::INVAL.raw_os_error()
}

fn efault() -> c_int {
    Errno::FAULT.raw_os_error()
}
