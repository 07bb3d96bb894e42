//! # Platform Driver Interface
//!
//! The seam between this workspace and the host's hardware-virtualization
//! substrate. The emulator core never talks to a hypervisor directly; it
//! drives a [`PlatformDriver`] implementation that exposes partitions,
//! virtual processors, a guest-physical mapping primitive, bulk register
//! access and address translation.
//!
//! The exit side of the interface is a sum type ([`VpExit`]): every
//! reason a virtual processor can return from its run call carries its
//! reason-specific payload in the matching variant, so dispatch is an
//! exhaustive `match` rather than a tag-plus-union dance.

mod driver;
mod error;
mod exit;
mod flags;

pub use crate::driver::{PlatformDriver, ProcessorVendor, VpCanceller};
pub use crate::error::{PlatformError, PlatformResult};
pub use crate::exit::{
    ApicEoiContext, CancelContext, CpuidContext, ExceptionContext, ExecutionState,
    InterruptWindowContext, IoPortAccessContext, IoPortAccessInfo, MemoryAccessContext,
    MemoryAccessInfo, MemoryAccessType, MsrAccessContext, RdtscContext, UnsupportedFeatureContext,
    VpContext, VpExit, VpExitContext, VpExitReason,
};
pub use crate::flags::{MemoryAccessFlags, TranslateFlags, TranslationResult};
