//! POSIX shared memory backing for cross-process devices

use crate::error::{ChannelError, Result};
use rustix::fd::OwnedFd;
use rustix::fs::ftruncate;
use rustix::io::Errno;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use rustix::shm::{shm_open, shm_unlink, Mode, ShmOFlags};
use std::ffi::CString;
use std::ptr::NonNull;

const DEVICE_SHM_PREFIX: &str = "/opentpu_";
const MAX_NAME_LEN: usize = 255 - DEVICE_SHM_PREFIX.len();

/// Handle to a mapped device region
pub struct DeviceShm {
    _fd: OwnedFd,
    addr: NonNull<u8>,
    size: usize,
    name: String,
    is_owner: bool,
}

// SAFETY: the region is only mutated under the device's AccessGate
unsafe impl Send for DeviceShm {}
unsafe impl Sync for DeviceShm {}

fn shm_name(name: &str) -> Result<CString> {
    if name.len() > MAX_NAME_LEN {
        return Err(ChannelError::NameTooLong {
            max: MAX_NAME_LEN,
            got: name.len(),
        });
    }
    if name.is_empty() || name.contains('/') {
        return Err(ChannelError::InvalidName(name.to_string()));
    }
    CString::new(format!("{}{}", DEVICE_SHM_PREFIX, name))
        .map_err(|_| ChannelError::InvalidName(name.to_string()))
}

fn map_region(fd: &OwnedFd, size: usize) -> Result<NonNull<u8>> {
    let addr = unsafe {
        mmap(
            std::ptr::null_mut(),
            size,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )
        .map_err(|e| ChannelError::Mmap(e.into()))?
    };

    NonNull::new(addr.cast::<u8>())
        .ok_or_else(|| ChannelError::Mmap(std::io::Error::other("mmap returned null")))
}

impl DeviceShm {
    /// Create a new device region
    ///
    /// # Arguments
    /// * `name` - Device name (will be prefixed with "/opentpu_")
    /// * `size` - Size in bytes
    ///
    /// Fails with `DeviceExists` if the name is taken; the region is
    /// zero-filled on return.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let c_name = shm_name(name)?;

        let fd = shm_open(
            c_name.as_c_str(),
            ShmOFlags::CREATE | ShmOFlags::EXCL | ShmOFlags::RDWR,
            Mode::RUSR | Mode::WUSR | Mode::RGRP | Mode::WGRP,
        )
        .map_err(|e| match e {
            Errno::EXIST => ChannelError::DeviceExists {
                name: name.to_string(),
            },
            e => ChannelError::ShmCreate {
                name: name.to_string(),
                source: e.into(),
            },
        })?;

        ftruncate(&fd, size as u64).map_err(|e| ChannelError::Truncate(e.into()))?;

        let addr = map_region(&fd, size)?;

        unsafe {
            std::ptr::write_bytes(addr.as_ptr(), 0, size);
        }

        Ok(Self {
            _fd: fd,
            addr,
            size,
            name: name.to_string(),
            is_owner: true,
        })
    }

    /// Map an existing device region
    pub fn open(name: &str) -> Result<Self> {
        Self::open_sized(name, 0)
    }

    /// Map an existing device region, growing it to at least `min_size`
    ///
    /// Existing content is left as it is. The handle does not own the
    /// region until [`DeviceShm::claim`] is called.
    pub fn open_sized(name: &str, min_size: usize) -> Result<Self> {
        let c_name = shm_name(name)?;
        let open_err = |e: Errno| ChannelError::ShmOpen {
            name: name.to_string(),
            source: e.into(),
        };

        let fd = shm_open(c_name.as_c_str(), ShmOFlags::RDWR, Mode::empty()).map_err(open_err)?;

        let stat = rustix::fs::fstat(&fd).map_err(open_err)?;
        let mut size = stat.st_size as usize;
        if size < min_size {
            ftruncate(&fd, min_size as u64).map_err(|e| ChannelError::Truncate(e.into()))?;
            size = min_size;
        }
        if size == 0 {
            return Err(ChannelError::RegionTooSmall { need: 1, found: 0 });
        }

        let addr = map_region(&fd, size)?;

        Ok(Self {
            _fd: fd,
            addr,
            size,
            name: name.to_string(),
            is_owner: false,
        })
    }

    /// Take ownership: the region is unlinked when this handle drops
    pub fn claim(&mut self) {
        self.is_owner = true;
    }

    /// Raw pointer to the start of the region
    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr()
    }

    /// Size of the mapping in bytes
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether dropping this handle unlinks the region
    #[inline(always)]
    pub fn is_owner(&self) -> bool {
        self.is_owner
    }
}

impl Drop for DeviceShm {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.addr.as_ptr().cast(), self.size);
        }

        if self.is_owner {
            if let Ok(c_name) = shm_name(&self.name) {
                let _ = shm_unlink(c_name.as_c_str());
            }
        }
    }
}
