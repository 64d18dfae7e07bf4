//! Runtime error codes and the per-device error latch

use std::sync::atomic::{AtomicI32, Ordering};

use thiserror::Error;

/// Errors surfaced to the application
///
/// Mirrors the classic audio-runtime error taxonomy: validation failures
/// (bad handle, bad enum, bad value), resource exhaustion, and device
/// failures. Every error is also latched on the offending device (or the
/// process-wide slot when no device is involved) so `take_error` can
/// report it later.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtError {
    /// The device handle is not a live, registered device
    #[error("invalid device handle")]
    InvalidDevice,

    /// The context handle is not attached to any live device
    #[error("invalid context handle")]
    InvalidContext,

    /// An enumerant (format, attribute key, query) is not recognized
    #[error("invalid enum value")]
    InvalidEnum,

    /// A parameter value is out of range or inconsistent
    #[error("invalid parameter value")]
    InvalidValue,

    /// Allocation of the backend or voice pool failed
    #[error("out of memory")]
    OutOfMemory,
}

/// Result alias used throughout the crate
pub type RtResult<T> = Result<T, RtError>;

impl RtError {
    /// Numeric code stored in the error latch
    pub fn code(self) -> i32 {
        match self {
            RtError::InvalidDevice => 0xA001,
            RtError::InvalidContext => 0xA002,
            RtError::InvalidEnum => 0xA003,
            RtError::InvalidValue => 0xA004,
            RtError::OutOfMemory => 0xA005,
        }
    }

    /// Inverse of [`RtError::code`]; `None` for the no-error code
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0xA001 => Some(RtError::InvalidDevice),
            0xA002 => Some(RtError::InvalidContext),
            0xA003 => Some(RtError::InvalidEnum),
            0xA004 => Some(RtError::InvalidValue),
            0xA005 => Some(RtError::OutOfMemory),
            _ => None,
        }
    }
}

/// Code stored in an empty latch
pub const NO_ERROR: i32 = 0;

/// A read-and-clear error latch
///
/// Stores the most recent error code; errors are not queued. Reading the
/// latch exchanges it back to the no-error state.
#[derive(Debug)]
pub struct ErrorLatch(AtomicI32);

impl ErrorLatch {
    pub const fn new() -> Self {
        ErrorLatch(AtomicI32::new(NO_ERROR))
    }

    /// Latch an error code, replacing whatever was there
    pub fn set(&self, err: RtError) {
        self.0.store(err.code(), Ordering::Release);
    }

    /// Return and clear the latched error
    pub fn take(&self) -> Option<RtError> {
        RtError::from_code(self.0.swap(NO_ERROR, Ordering::AcqRel))
    }

    /// Peek without clearing (used by tests and queries)
    pub fn peek(&self) -> Option<RtError> {
        RtError::from_code(self.0.load(Ordering::Acquire))
    }
}

impl Default for ErrorLatch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_round_trip() {
        for err in [
            RtError::InvalidDevice,
            RtError::InvalidContext,
            RtError::InvalidEnum,
            RtError::InvalidValue,
            RtError::OutOfMemory,
        ] {
            assert_eq!(RtError::from_code(err.code()), Some(err));
        }
        assert_eq!(RtError::from_code(NO_ERROR), None);
    }

    #[test]
    fn test_latch_reads_and_clears() {
        let latch = ErrorLatch::new();
        assert_eq!(latch.take(), None);

        latch.set(RtError::InvalidValue);
        assert_eq!(latch.take(), Some(RtError::InvalidValue));
        assert_eq!(latch.take(), None);
    }

    #[test]
    fn test_latch_keeps_latest_error_only() {
        let latch = ErrorLatch::new();
        latch.set(RtError::InvalidEnum);
        latch.set(RtError::OutOfMemory);
        assert_eq!(latch.take(), Some(RtError::OutOfMemory));
    }
}
