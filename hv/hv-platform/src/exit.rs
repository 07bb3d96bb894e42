//! Virtual-processor exit contexts.

use bitfield_struct::bitfield;
use hv_addresses::{Gpa, Gva};
use hv_registers::SegmentRegister;

/// Why the virtual processor returned from its run call.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum VpExitReason {
    /// No exit pending; the caller may simply run again.
    None,
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

/// Processor execution state captured at exit time.
#[bitfield(u16)]
#[derive(Eq, PartialEq)]
pub struct ExecutionState {
    /// Current privilege level.
    #[bits(2)]
    pub cpl: u8,

    /// CR0.PE at the time of the exit.
    pub cr0_pe: bool,

    /// CR0.AM at the time of the exit.
    pub cr0_am: bool,

    /// EFER.LMA at the time of the exit.
    pub efer_lma: bool,

    /// Debug state active.
    pub debug_active: bool,

    /// An interruption is pending delivery.
    pub interruption_pending: bool,

    #[bits(5, default = 0)]
    __reserved0: u8,

    /// Executing in an interrupt shadow.
    pub interrupt_shadow: bool,

    #[bits(3, default = 0)]
    __reserved1: u8,
}

/// The reason-independent half of an exit: where the processor stopped.
#[derive(Copy, Clone, Debug, Default)]
pub struct VpContext {
    pub execution_state: ExecutionState,
    pub instruction_length: u8,
    pub cs: SegmentRegister,
    pub rip: u64,
    pub rflags: u64,
}

/// Kind of guest memory access that caused an exit.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum MemoryAccessType {
    #[default]
    Read,
    Write,
    Execute,
}

impl MemoryAccessType {
    #[doc(hidden)]
    #[must_use]
    pub const fn from_bits(v: u8) -> Self {
        match v {
            1 => Self::Write,
            2 => Self::Execute,
            _ => Self::Read,
        }
    }

    #[doc(hidden)]
    #[must_use]
    pub const fn into_bits(self) -> u8 {
        match self {
            Self::Read => 0,
            Self::Write => 1,
            Self::Execute => 2,
        }
    }
}

/// Qualifiers of a memory-access exit.
#[bitfield(u8)]
#[derive(Eq, PartialEq)]
pub struct MemoryAccessInfo {
    /// What the guest was doing with the address.
    #[bits(2, default = MemoryAccessType::Read)]
    pub access_type: MemoryAccessType,

    /// The faulting GPA has no mapping in the partition.
    pub gpa_unmapped: bool,

    /// The GVA field is meaningful.
    pub gva_valid: bool,

    #[bits(4, default = 0)]
    __reserved: u8,
}

/// Payload of a [`VpExitReason::MemoryAccess`] exit.
#[derive(Copy, Clone, Debug, Default)]
pub struct MemoryAccessContext {
    pub access_info: MemoryAccessInfo,
    pub gpa: Gpa,
    pub gva: Gva,
}

/// Qualifiers of an I/O port access exit.
#[bitfield(u8)]
#[derive(Eq, PartialEq)]
pub struct IoPortAccessInfo {
    /// Direction: set for `out`, clear for `in`.
    pub is_write: bool,

    /// Operand size in bytes (1, 2 or 4).
    #[bits(3)]
    pub access_size: u8,

    /// A string instruction (`ins`/`outs`).
    pub string_op: bool,

    /// REP-prefixed.
    pub rep_prefixed: bool,

    #[bits(2, default = 0)]
    __reserved: u8,
}

/// Payload of a [`VpExitReason::IoPortAccess`] exit.
#[derive(Copy, Clone, Debug, Default)]
pub struct IoPortAccessContext {
    pub access_info: IoPortAccessInfo,
    pub port_number: u16,
    pub rax: u64,
    pub rcx: u64,
    pub rsi: u64,
    pub rdi: u64,
}

/// Payload of a [`VpExitReason::UnsupportedFeature`] exit.
#[derive(Copy, Clone, Debug, Default)]
pub struct UnsupportedFeatureContext {
    pub feature_code: u32,
    pub feature_parameter: u64,
}

/// Payload of a [`VpExitReason::InterruptWindow`] exit.
#[derive(Copy, Clone, Debug, Default)]
pub struct InterruptWindowContext {
    pub deliverable_type: u8,
}

/// Payload of a [`VpExitReason::ApicEoi`] exit.
#[derive(Copy, Clone, Debug, Default)]
pub struct ApicEoiContext {
    pub interrupt_vector: u32,
}

/// Payload of a [`VpExitReason::MsrAccess`] exit.
#[derive(Copy, Clone, Debug, Default)]
pub struct MsrAccessContext {
    /// Set for `wrmsr`, clear for `rdmsr`.
    pub is_write: bool,
    pub msr_number: u32,
    pub rax: u64,
    pub rdx: u64,
}

/// Payload of a [`VpExitReason::Cpuid`] exit.
#[derive(Copy, Clone, Debug, Default)]
pub struct CpuidContext {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    /// Results the hypervisor would have delivered by itself.
    pub default_rax: u64,
    pub default_rbx: u64,
    pub default_rcx: u64,
    pub default_rdx: u64,
}

/// Payload of a [`VpExitReason::Exception`] exit.
#[derive(Copy, Clone, Debug, Default)]
pub struct ExceptionContext {
    pub exception_type: u8,
    pub error_code_valid: bool,
    pub error_code: u32,
    pub exception_parameter: u64,
}

/// Payload of a [`VpExitReason::Rdtsc`] exit.
#[derive(Copy, Clone, Debug, Default)]
pub struct RdtscContext {
    pub tsc_aux: u64,
    pub virtual_offset: u64,
}

/// Payload of a [`VpExitReason::UserCanceled`] exit.
#[derive(Copy, Clone, Debug, Default)]
pub struct CancelContext {
    pub cancel_reason: u32,
}

/// The reason-specific half of an exit.
#[derive(Copy, Clone, Debug)]
pub enum VpExit {
    None,
    MemoryAccess(MemoryAccessContext),
    IoPortAccess(IoPortAccessContext),
    UnrecoverableException,
    InvalidVpRegisterValue,
    UnsupportedFeature(UnsupportedFeatureContext),
    InterruptWindow(InterruptWindowContext),
    Halt,
    ApicEoi(ApicEoiContext),
    MsrAccess(MsrAccessContext),
    Cpuid(CpuidContext),
    Exception(ExceptionContext),
    Rdtsc(RdtscContext),
    Canceled(CancelContext),
}

impl VpExit {
    /// The plain reason tag for this exit.
    #[must_use]
    pub const fn reason(&self) -> VpExitReason {
        match self {
            Self::None => VpExitReason::None,
            Self::MemoryAccess(_) => VpExitReason::MemoryAccess,
            Self::IoPortAccess(_) => VpExitReason::IoPortAccess,
            Self::UnrecoverableException => VpExitReason::UnrecoverableException,
            Self::InvalidVpRegisterValue => VpExitReason::InvalidVpRegisterValue,
            Self::UnsupportedFeature(_) => VpExitReason::UnsupportedFeature,
            Self::InterruptWindow(_) => VpExitReason::InterruptWindow,
            Self::Halt => VpExitReason::Halt,
            Self::ApicEoi(_) => VpExitReason::ApicEoi,
            Self::MsrAccess(_) => VpExitReason::MsrAccess,
            Self::Cpuid(_) => VpExitReason::Cpuid,
            Self::Exception(_) => VpExitReason::Exception,
            Self::Rdtsc(_) => VpExitReason::Rdtsc,
            Self::Canceled(_) => VpExitReason::UserCanceled,
        }
    }
}

/// Everything the driver reports about one return from the run call.
#[derive(Copy, Clone, Debug)]
pub struct VpExitContext {
    pub vp_context: VpContext,
    pub exit: VpExit,
}

impl VpExitContext {
    /// An idle context: no exit pending.
    #[must_use]
    pub fn none() -> Self {
        Self {
            vp_context: VpContext::default(),
            exit: VpExit::None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn reason(&self) -> VpExitReason {
        self.exit.reason()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_variants_report_their_reason() {
        assert_eq!(VpExit::Halt.reason(), VpExitReason::Halt);
        assert_eq!(
            VpExit::MemoryAccess(MemoryAccessContext::default()).reason(),
            VpExitReason::MemoryAccess
        );
        assert_eq!(
            VpExit::Canceled(CancelContext::default()).reason(),
            VpExitReason::UserCanceled
        );
    }

    #[test]
    fn execution_state_cpl_occupies_the_low_bits() {
        let state = ExecutionState::new().with_cpl(3).with_efer_lma(true);
        assert_eq!(state.into_bits() & 0b11, 3);
        assert!(state.efer_lma());
    }
}
