//! Snapshot slots and platform wire names.

/// Index into the 33-entry register snapshot.
///
/// The declaration order *is* the snapshot order; do not reorder without
/// updating [`SNAPSHOT_NAMES`] in lockstep.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Register {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rbp,
    Rsp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rip,
    Rflags,
    Gs,
    Fs,
    Es,
    Ds,
    Cs,
    Ss,
    Gdtr,
    Ldtr,
    Idtr,
    Tr,
    Cr0,
    Cr2,
    Cr3,
    Cr4,
    Efer,
}

/// Number of registers in the snapshot.
pub const SNAPSHOT_REGISTER_COUNT: usize = 33;

impl Register {
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// A register name as the platform driver understands it.
///
/// Covers the snapshot set plus the syscall MSRs, which are programmed
/// once during memory-layout initialization and are not part of the
/// per-exit snapshot.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum RegisterName {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rbp,
    Rsp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rip,
    Rflags,
    Gs,
    Fs,
    Es,
    Ds,
    Cs,
    Ss,
    Gdtr,
    Ldtr,
    Idtr,
    Tr,
    Cr0,
    Cr2,
    Cr3,
    Cr4,
    Efer,
    /// `IA32_STAR` — syscall/sysret segment bases.
    Star,
    /// `IA32_LSTAR` — 64-bit syscall entry point.
    Lstar,
    /// `IA32_CSTAR` — compatibility-mode syscall entry point.
    Cstar,
    /// `IA32_SFMASK` — RFLAGS mask applied on syscall.
    Sfmask,
}

/// The wire names of the snapshot, in snapshot order.
///
/// Handed to the platform's bulk register get/set together with a value
/// array in the same order.
pub const SNAPSHOT_NAMES: [RegisterName; SNAPSHOT_REGISTER_COUNT] = [
    RegisterName::Rax,
    RegisterName::Rbx,
    RegisterName::Rcx,
    RegisterName::Rdx,
    RegisterName::Rbp,
    RegisterName::Rsp,
    RegisterName::Rsi,
    RegisterName::Rdi,
    RegisterName::R8,
    RegisterName::R9,
    RegisterName::R10,
    RegisterName::R11,
    RegisterName::R12,
    RegisterName::R13,
    RegisterName::R14,
    RegisterName::R15,
    RegisterName::Rip,
    RegisterName::Rflags,
    RegisterName::Gs,
    RegisterName::Fs,
    RegisterName::Es,
    RegisterName::Ds,
    RegisterName::Cs,
    RegisterName::Ss,
    RegisterName::Gdtr,
    RegisterName::Ldtr,
    RegisterName::Idtr,
    RegisterName::Tr,
    RegisterName::Cr0,
    RegisterName::Cr2,
    RegisterName::Cr3,
    RegisterName::Cr4,
    RegisterName::Efer,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_has_exactly_33_slots() {
        assert_eq!(Register::Efer.index() + 1, SNAPSHOT_REGISTER_COUNT);
        assert_eq!(SNAPSHOT_NAMES.len(), SNAPSHOT_REGISTER_COUNT);
    }

    #[test]
    fn names_line_up_with_slots() {
        assert_eq!(SNAPSHOT_NAMES[Register::Rip.index()], RegisterName::Rip);
        assert_eq!(SNAPSHOT_NAMES[Register::Gdtr.index()], RegisterName::Gdtr);
        assert_eq!(SNAPSHOT_NAMES[Register::Efer.index()], RegisterName::Efer);
    }
}
