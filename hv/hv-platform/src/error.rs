//! Driver-level errors.

/// An error reported by the platform driver.
///
/// The numeric code is whatever the underlying substrate produced
/// (an HRESULT on Windows Hypervisor Platform); it is preserved verbatim
/// so callers can log or compare it.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
#[error("platform driver call failed (code 0x{code:08X})")]
pub struct PlatformError {
    /// The driver's original result code.
    pub code: u32,
}

impl PlatformError {
    #[inline]
    #[must_use]
    pub const fn new(code: u32) -> Self {
        Self { code }
    }
}

/// Result alias for driver calls.
pub type PlatformResult<T> = Result<T, PlatformError>;
