// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 intercore contributors

#[cfg(unix)]
pub mod posix;
#[cfg(unix)]
pub(crate) use posix::{PlatformShm, ShmMode};

#[cfg(windows)]
pub mod windows;
#[cfg(windows)]
pub(crate) use windows::{PlatformShm, ShmMode};
