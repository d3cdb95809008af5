// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 intercore contributors
//
// Error taxonomy shared by the transport and the PICC middleware, plus the
// process-wide error-site slot.
//
// Errors carry the same negative diagnostic codes as the C-ABI error table
// of the shared-memory driver family, so the error slot stays comparable
// across ports. There is no unwinding: a failing call records its site and
// returns, and the system keeps running.

use std::panic::Location;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// Error kinds surfaced across the transport and middleware API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Peer's global word is not READY.
    #[error("remote peer is not ready")]
    NotReady,
    /// No free buffer in any fitting pool, or the target ring is full.
    #[error("no free buffer or ring slot")]
    NoMem,
    /// Argument out of range, null, or state wrong for the call.
    #[error("invalid argument or state")]
    Inval,
    /// Ring was empty on pop.
    #[error("queue is empty")]
    NoQueue,
    /// Mode not compiled in / not configured.
    #[error("operation not supported in this mode")]
    NotSup,
    /// Sentinel mismatch, CRC mismatch, or out-of-range index observed.
    #[error("integrity failure")]
    Integrity,
    /// Peer is mid-initialization; caller must retry.
    #[error("remote initialization in progress")]
    RemoteInitInProgress,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Negative diagnostic code recorded in the error slot.
    pub fn code(self) -> i32 {
        match self {
            Error::NotReady => -1,
            Error::NoMem => -2,
            Error::Inval => -3,
            Error::NoQueue => -4,
            Error::NotSup => -5,
            Error::Integrity => -6,
            Error::RemoteInitInProgress => -7,
        }
    }
}

/// Process-wide error-site capture.
///
/// Mirrors the driver's single diagnostic slot: every failing internal call
/// records (file, line, code) and bumps a counter. The slot holds the most
/// recent failure; the counter never resets on its own.
pub mod site {
    use super::*;

    /// A recorded failure site.
    #[derive(Debug, Clone, Copy)]
    pub struct ErrorSite {
        pub code: i32,
        pub file: &'static str,
        pub line: u32,
    }

    static ERROR_COUNT: AtomicU32 = AtomicU32::new(0);
    static LAST_SITE: Mutex<Option<ErrorSite>> = Mutex::new(None);

    /// Record a failure with an explicit diagnostic code.
    #[track_caller]
    pub fn record(code: i32) {
        let loc = Location::caller();
        ERROR_COUNT.fetch_add(1, Ordering::Relaxed);
        log::debug!("error {} at {}:{}", code, loc.file(), loc.line());
        if let Ok(mut slot) = LAST_SITE.lock() {
            *slot = Some(ErrorSite {
                code,
                file: loc.file(),
                line: loc.line(),
            });
        }
    }

    /// Record `err` and hand it back, for use in `return Err(site::fail(..))`.
    #[track_caller]
    pub fn fail(err: Error) -> Error {
        record(err.code());
        err
    }

    /// Most recently recorded failure site, if any.
    pub fn last() -> Option<ErrorSite> {
        LAST_SITE.lock().ok().and_then(|slot| *slot)
    }

    /// Total failures recorded since process start (or the last `reset`).
    pub fn count() -> u32 {
        ERROR_COUNT.load(Ordering::Relaxed)
    }

    /// Clear the slot and counter. Diagnostic/test hook.
    pub fn reset() {
        ERROR_COUNT.store(0, Ordering::Relaxed);
        if let Ok(mut slot) = LAST_SITE.lock() {
            *slot = None;
        }
    }
}
