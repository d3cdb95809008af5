// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 intercore contributors
//
// POSIX shared memory backing for host-side instance windows.
//
// A freshly created shm object is zero-filled by the kernel, which is
// exactly the CLEAR state the transport expects before its first init.

use std::ffi::CString;
use std::io;
use std::ptr;

/// Open mode for a named region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmMode {
    /// Create exclusively; fail if it already exists.
    Create,
    /// Open existing; fail if it does not exist.
    Open,
    /// Create if missing, open otherwise.
    CreateOrOpen,
}

/// Turn a user name into a POSIX shm name (leading '/', no other slashes).
fn make_shm_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 1);
    out.push('/');
    for c in name.chars() {
        out.push(if c == '/' { '_' } else { c });
    }
    out
}

pub struct PlatformShm {
    mem: *mut u8,
    size: usize,
    name: String,
}

// The mapped region is process-shared by design.
unsafe impl Send for PlatformShm {}
unsafe impl Sync for PlatformShm {}

impl PlatformShm {
    /// Acquire a named shared memory region of `size` bytes.
    pub fn acquire(name: &str, size: usize, mode: ShmMode) -> io::Result<Self> {
        if name.is_empty() || size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty name or zero size",
            ));
        }
        let posix_name = make_shm_name(name);
        let c_name = CString::new(posix_name.as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let perms: libc::mode_t = 0o666;

        // For CreateOrOpen, try exclusive create first so ftruncate runs
        // only on an object we own; truncating an existing object can zero
        // live contents on some platforms.
        let (fd, need_truncate) = match mode {
            ShmMode::Create => {
                let fd = unsafe {
                    libc::shm_open(
                        c_name.as_ptr(),
                        libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                        perms as libc::c_uint,
                    )
                };
                if fd == -1 {
                    return Err(io::Error::last_os_error());
                }
                (fd, true)
            }
            ShmMode::Open => {
                let fd =
                    unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, perms as libc::c_uint) };
                if fd == -1 {
                    return Err(io::Error::last_os_error());
                }
                (fd, false)
            }
            ShmMode::CreateOrOpen => {
                let fd = unsafe {
                    libc::shm_open(
                        c_name.as_ptr(),
                        libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                        perms as libc::c_uint,
                    )
                };
                if fd != -1 {
                    (fd, true)
                } else {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() != Some(libc::EEXIST) {
                        return Err(err);
                    }
                    let fd = unsafe {
                        libc::shm_open(c_name.as_ptr(), libc::O_RDWR, perms as libc::c_uint)
                    };
                    if fd == -1 {
                        return Err(io::Error::last_os_error());
                    }
                    (fd, false)
                }
            }
        };

        if need_truncate {
            let ret = unsafe { libc::ftruncate(fd, size as libc::off_t) };
            if ret != 0 {
                let err = io::Error::last_os_error();
                unsafe { libc::close(fd) };
                return Err(err);
            }
        }

        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };
        if mem == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            mem: mem as *mut u8,
            size,
            name: posix_name,
        })
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.mem
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Remove the backing object by name, without an open handle.
    pub fn unlink_by_name(name: &str) {
        if let Ok(c_name) = CString::new(make_shm_name(name).into_bytes()) {
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
    }
}

impl Drop for PlatformShm {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.mem as *mut libc::c_void, self.size);
        }
    }
}
