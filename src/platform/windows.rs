// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 intercore contributors
//
// Win32 file-mapping backing for host-side instance windows.

use std::io;
use std::ptr;

use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_ALREADY_EXISTS, HANDLE, INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::System::Memory::{
    CreateFileMappingW, MapViewOfFile, OpenFileMappingW, UnmapViewOfFile, FILE_MAP_ALL_ACCESS,
    MEMORY_MAPPED_VIEW_ADDRESS, PAGE_READWRITE,
};

/// Open mode for a named region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmMode {
    Create,
    Open,
    CreateOrOpen,
}

fn wide_name(name: &str) -> Vec<u16> {
    let mut out: Vec<u16> = format!("Local\\{}", name.replace('\\', "_"))
        .encode_utf16()
        .collect();
    out.push(0);
    out
}

pub struct PlatformShm {
    mem: *mut u8,
    size: usize,
    handle: HANDLE,
    name: String,
}

// The mapped region is process-shared by design.
unsafe impl Send for PlatformShm {}
unsafe impl Sync for PlatformShm {}

impl PlatformShm {
    pub fn acquire(name: &str, size: usize, mode: ShmMode) -> io::Result<Self> {
        if name.is_empty() || size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty name or zero size",
            ));
        }
        let wname = wide_name(name);

        let handle = unsafe {
            match mode {
                ShmMode::Open => OpenFileMappingW(FILE_MAP_ALL_ACCESS, 0, wname.as_ptr()),
                ShmMode::Create | ShmMode::CreateOrOpen => {
                    let h = CreateFileMappingW(
                        INVALID_HANDLE_VALUE,
                        ptr::null(),
                        PAGE_READWRITE,
                        ((size as u64) >> 32) as u32,
                        size as u32,
                        wname.as_ptr(),
                    );
                    if !h.is_null()
                        && mode == ShmMode::Create
                        && GetLastError() == ERROR_ALREADY_EXISTS
                    {
                        CloseHandle(h);
                        return Err(io::Error::new(
                            io::ErrorKind::AlreadyExists,
                            "mapping already exists",
                        ));
                    }
                    h
                }
            }
        };
        if handle.is_null() {
            return Err(io::Error::last_os_error());
        }

        let view: MEMORY_MAPPED_VIEW_ADDRESS =
            unsafe { MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, size) };
        if view.Value.is_null() {
            let err = io::Error::last_os_error();
            unsafe { CloseHandle(handle) };
            return Err(err);
        }

        Ok(Self {
            mem: view.Value as *mut u8,
            size,
            handle,
            name: name.to_owned(),
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

    /// Named mappings disappear with their last handle on Windows; nothing
    /// to unlink eagerly.
    pub fn unlink_by_name(_name: &str) {}
}

impl Drop for PlatformShm {
    fn drop(&mut self) {
        unsafe {
            UnmapViewOfFile(MEMORY_MAPPED_VIEW_ADDRESS {
                Value: self.mem as _,
            });
            CloseHandle(self.handle);
        }
    }
}
