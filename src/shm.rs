// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 intercore contributors
//
// Shared-memory regions backing instance windows on a host.
//
// An instance needs two mirrored windows (local and remote). On the SoC
// these are carved out of a dedicated SRAM range; on a host they are either
// named OS mappings (so two processes can attach the same pair, each side
// swapping local/remote) or plain anonymous allocations for two peers
// inside one process.

use std::io;

use crate::platform::{PlatformShm, ShmMode};

/// Open mode for named regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmOpenMode {
    Create,
    Open,
    CreateOrOpen,
}

enum Backing {
    Mapped(PlatformShm),
    // Box<[u64]> keeps the region 8-byte aligned for the ring headers.
    Anonymous(Box<[u64]>),
}

/// One shared-memory window.
pub struct ShmRegion {
    backing: Backing,
}

impl ShmRegion {
    /// Acquire a named region of `size` bytes. A fresh region is
    /// zero-filled, i.e. in the CLEAR state the transport expects.
    pub fn named(name: &str, size: usize, mode: ShmOpenMode) -> io::Result<ShmRegion> {
        let platform_mode = match mode {
            ShmOpenMode::Create => ShmMode::Create,
            ShmOpenMode::Open => ShmMode::Open,
            ShmOpenMode::CreateOrOpen => ShmMode::CreateOrOpen,
        };
        let shm = PlatformShm::acquire(name, size, platform_mode)?;
        Ok(ShmRegion {
            backing: Backing::Mapped(shm),
        })
    }

    /// Anonymous zeroed region for in-process peers. 8-byte aligned.
    pub fn anonymous(size: usize) -> ShmRegion {
        let words = size.div_ceil(8);
        ShmRegion {
            backing: Backing::Anonymous(vec![0u64; words].into_boxed_slice()),
        }
    }

    /// Base address of the window.
    pub fn base(&self) -> usize {
        self.as_mut_ptr() as usize
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        match &self.backing {
            Backing::Mapped(shm) => shm.as_mut_ptr(),
            Backing::Anonymous(words) => words.as_ptr() as *mut u8,
        }
    }

    pub fn len(&self) -> usize {
        match &self.backing {
            Backing::Mapped(shm) => shm.size(),
            Backing::Anonymous(words) => words.len() * 8,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Zero the whole window.
    pub fn clear(&self) {
        unsafe {
            std::ptr::write_bytes(self.as_mut_ptr(), 0, self.len());
        }
    }

    /// Remove a named region's backing object.
    pub fn unlink_by_name(name: &str) {
        PlatformShm::unlink_by_name(name);
    }
}
