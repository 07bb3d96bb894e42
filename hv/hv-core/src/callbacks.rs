//! Exit and ISR callback registry.
//!
//! Exit handlers are a typed slot table: each handler variant carries the
//! closure signature matching its exit reason's payload, so registering
//! into the wrong slot is unrepresentable. Handlers are stored as their
//! [`VpExitHandler`] values, which lets the registry hand back a borrow
//! of whatever is installed in a slot. ISR handlers live in a separate
//! 256-entry table indexed by vector number.

use crate::partition::Partition;
use hv_descriptors::InterruptFrame;
use hv_platform::{
    ApicEoiContext, CancelContext, CpuidContext, ExceptionContext, InterruptWindowContext,
    IoPortAccessContext, MemoryAccessContext, MsrAccessContext, PlatformDriver, RdtscContext,
    UnsupportedFeatureContext, VpContext, VpExitReason,
};

/// Callback taking a reason-specific context; returns whether the run
/// loop should re-enter the guest instead of surfacing the exit.
pub type ContextCallback<P, C> =
    Box<dyn FnMut(&mut Partition<P>, &VpContext, &C) -> bool + Send>;

/// Callback for exits without a payload.
pub type BasicCallback<P> = Box<dyn FnMut(&mut Partition<P>, &VpContext) -> bool + Send>;

/// Interrupt-service callback: receives the popped interrupt frame and
/// the error code (zero for vectors that push none).
pub type IsrCallback<P> =
    Box<dyn FnMut(&mut Partition<P>, &InterruptFrame, u32) -> bool + Send>;

/// Number of exit callback slots.
pub const EXIT_CALLBACK_SLOTS: usize = 13;

/// Number of ISR vectors.
pub const ISR_VECTORS: usize = 256;

/// The slots of the exit callback table.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ExitCallbackSlot {
    MemoryAccess,
    IoPortAccess,
    UnrecoverableException,
    InvalidVpRegisterValue,
    UnsupportedFeature,
    InterruptWindow,
    Halt,
    ApicEoi,
    MsrAccess,
    Cpuid,
    Exception,
    Rdtsc,
    UserCanceled,
}

impl ExitCallbackSlot {
    /// The slot's position in the callback table.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// The slot serving `reason`, if callbacks apply to it at all.
    #[must_use]
    pub const fn for_reason(reason: VpExitReason) -> Option<Self> {
        match reason {
            VpExitReason::None => None,
            VpExitReason::MemoryAccess => Some(Self::MemoryAccess),
            VpExitReason::IoPortAccess => Some(Self::IoPortAccess),
            VpExitReason::UnrecoverableException => Some(Self::UnrecoverableException),
            VpExitReason::InvalidVpRegisterValue => Some(Self::InvalidVpRegisterValue),
            VpExitReason::UnsupportedFeature => Some(Self::UnsupportedFeature),
            VpExitReason::InterruptWindow => Some(Self::InterruptWindow),
            VpExitReason::Halt => Some(Self::Halt),
            VpExitReason::ApicEoi => Some(Self::ApicEoi),
            VpExitReason::MsrAccess => Some(Self::MsrAccess),
            VpExitReason::Cpuid => Some(Self::Cpuid),
            VpExitReason::Exception => Some(Self::Exception),
            VpExitReason::Rdtsc => Some(Self::Rdtsc),
            VpExitReason::UserCanceled => Some(Self::UserCanceled),
        }
    }
}

/// A registered exit handler; the variant fixes the slot.
pub enum VpExitHandler<P: PlatformDriver> {
    MemoryAccess(ContextCallback<P, MemoryAccessContext>),
    IoPortAccess(ContextCallback<P, IoPortAccessContext>),
    UnrecoverableException(BasicCallback<P>),
    InvalidVpRegisterValue(BasicCallback<P>),
    UnsupportedFeature(ContextCallback<P, UnsupportedFeatureContext>),
    InterruptWindow(ContextCallback<P, InterruptWindowContext>),
    Halt(BasicCallback<P>),
    ApicEoi(ContextCallback<P, ApicEoiContext>),
    MsrAccess(ContextCallback<P, MsrAccessContext>),
    Cpuid(ContextCallback<P, CpuidContext>),
    Exception(ContextCallback<P, ExceptionContext>),
    Rdtsc(ContextCallback<P, RdtscContext>),
    UserCanceled(ContextCallback<P, CancelContext>),
}

impl<P: PlatformDriver> VpExitHandler<P> {
    /// The slot this handler belongs to.
    #[must_use]
    pub const fn slot(&self) -> ExitCallbackSlot {
        match self {
            Self::MemoryAccess(_) => ExitCallbackSlot::MemoryAccess,
            Self::IoPortAccess(_) => ExitCallbackSlot::IoPortAccess,
            Self::UnrecoverableException(_) => ExitCallbackSlot::UnrecoverableException,
            Self::InvalidVpRegisterValue(_) => ExitCallbackSlot::InvalidVpRegisterValue,
            Self::UnsupportedFeature(_) => ExitCallbackSlot::UnsupportedFeature,
            Self::InterruptWindow(_) => ExitCallbackSlot::InterruptWindow,
            Self::Halt(_) => ExitCallbackSlot::Halt,
            Self::ApicEoi(_) => ExitCallbackSlot::ApicEoi,
            Self::MsrAccess(_) => ExitCallbackSlot::MsrAccess,
            Self::Cpuid(_) => ExitCallbackSlot::Cpuid,
            Self::Exception(_) => ExitCallbackSlot::Exception,
            Self::Rdtsc(_) => ExitCallbackSlot::Rdtsc,
            Self::UserCanceled(_) => ExitCallbackSlot::UserCanceled,
        }
    }
}

/// The 13-slot exit callback table.
///
/// Each slot holds the [`VpExitHandler`] registered for it (the variant
/// always matches the slot; registration derives the index from the
/// variant).
pub struct ExitCallbacks<P: PlatformDriver> {
    handlers: [Option<VpExitHandler<P>>; EXIT_CALLBACK_SLOTS],
}

impl<P: PlatformDriver> Default for ExitCallbacks<P> {
    fn default() -> Self {
        Self {
            handlers: std::array::from_fn(|_| None),
        }
    }
}

impl<P: PlatformDriver> ExitCallbacks<P> {
    /// Install `handler` into its slot, replacing any previous handler.
    pub fn register(&mut self, handler: VpExitHandler<P>) {
        let index = handler.slot().index();
        self.handlers[index] = Some(handler);
    }

    /// Borrow the handler installed in `slot`.
    #[must_use]
    pub fn get(&self, slot: ExitCallbackSlot) -> Option<&VpExitHandler<P>> {
        self.handlers[slot.index()].as_ref()
    }

    /// Whether `slot` has a handler.
    #[must_use]
    pub fn is_registered(&self, slot: ExitCallbackSlot) -> bool {
        self.handlers[slot.index()].is_some()
    }

    /// Clear `slot`, reporting whether a handler was installed.
    pub fn unregister(&mut self, slot: ExitCallbackSlot) -> bool {
        self.handlers[slot.index()].take().is_some()
    }

    pub(crate) fn take(&mut self, slot: ExitCallbackSlot) -> Option<VpExitHandler<P>> {
        self.handlers[slot.index()].take()
    }

    pub(crate) fn restore(&mut self, slot: ExitCallbackSlot, handler: VpExitHandler<P>) {
        let entry = &mut self.handlers[slot.index()];
        if entry.is_none() {
            *entry = Some(handler);
        }
    }
}

/// The 256-entry ISR table.
pub struct IsrTable<P: PlatformDriver> {
    handlers: Vec<Option<IsrCallback<P>>>,
}

impl<P: PlatformDriver> Default for IsrTable<P> {
    fn default() -> Self {
        Self {
            handlers: (0..ISR_VECTORS).map(|_| None).collect(),
        }
    }
}

impl<P: PlatformDriver> IsrTable<P> {
    /// Install a handler for `vector`.
    pub fn register(&mut self, vector: u8, handler: IsrCallback<P>) {
        self.handlers[vector as usize] = Some(handler);
    }

    /// Clear the handler for `vector`, reporting whether one existed.
    pub fn unregister(&mut self, vector: u8) -> bool {
        self.handlers[vector as usize].take().is_some()
    }

    /// Whether `vector` has a handler.
    #[must_use]
    pub fn is_registered(&self, vector: u8) -> bool {
        self.handlers[vector as usize].is_some()
    }

    pub(crate) fn take(&mut self, vector: u8) -> Option<IsrCallback<P>> {
        self.handlers[vector as usize].take()
    }

    pub(crate) fn restore(&mut self, vector: u8, handler: IsrCallback<P>) {
        let slot = &mut self.handlers[vector as usize];
        if slot.is_none() {
            *slot = Some(handler);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_real_reason_has_a_slot() {
        assert_eq!(ExitCallbackSlot::for_reason(VpExitReason::None), None);
        assert_eq!(
            ExitCallbackSlot::for_reason(VpExitReason::Halt),
            Some(ExitCallbackSlot::Halt)
        );
        assert_eq!(
            ExitCallbackSlot::for_reason(VpExitReason::UserCanceled),
            Some(ExitCallbackSlot::UserCanceled)
        );
    }

    #[test]
    fn slot_indices_span_the_table() {
        assert_eq!(ExitCallbackSlot::MemoryAccess.index(), 0);
        assert_eq!(ExitCallbackSlot::UserCanceled.index(), EXIT_CALLBACK_SLOTS - 1);
    }
}
