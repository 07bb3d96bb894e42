//! Error taxonomy of the emulator core.

use hv_platform::PlatformError;

/// Errors surfaced by the emulator core.
///
/// Platform failures keep the driver's original code; everything else is
/// a library-level verdict. Multi-step operations reverse their earlier
/// steps before returning. Errors are `Clone` so the partition can cache
/// the most recent failure for its `last_result`/`last_error` accessors.
#[derive(Clone, Debug, thiserror::Error)]
pub enum VmError {
    /// A caller-supplied value was rejected (zero size, prefilled output,
    /// address outside every guest subrange, slot out of range).
    #[error("invalid argument")]
    InvalidArgument,

    /// The operation needs the allocation tracker or paging tree first.
    #[error("memory layout not initialized")]
    NotInitialized,

    /// Setup was re-run on an already-initialized partition.
    #[error("memory layout already initialized")]
    AlreadyInitialized,

    /// Host allocation failure or address-space arena exhaustion.
    #[error("out of memory")]
    OutOfMemory,

    /// A lookup matched nothing.
    #[error("not found")]
    NotFound,

    /// The tracker already owns the requested guest address.
    #[error("guest address already mapped")]
    AlreadyMapped,

    /// The platform driver failed; the original code is preserved.
    #[error(transparent)]
    Platform(#[from] PlatformError),

    /// An internal invariant broke (unpopulated PML4 slot, missing exit
    /// callback for a reason the platform reported, …).
    #[error("internal invariant violated: {0}")]
    Internal(&'static str),
}

/// Result alias used throughout the core.
pub type VmResult<T> = Result<T, VmError>;
