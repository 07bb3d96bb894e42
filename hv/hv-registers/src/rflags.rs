//! RFLAGS model.

use bitfield_struct::bitfield;

/// The RFLAGS register.
///
/// Bit 1 is architecturally fixed to one; [`Rflags::reset`] produces the
/// initial guest image (interrupts enabled, everything else clear).
#[bitfield(u64)]
#[derive(Eq, PartialEq)]
pub struct Rflags {
    /// Bit 0 — CF: Carry.
    pub cf: bool,

    /// Bit 1 — fixed to 1.
    #[bits(default = true)]
    pub fixed_one: bool,

    /// Bit 2 — PF: Parity.
    pub pf: bool,

    /// Bit 3 — Reserved.
    #[bits(default = false)]
    __reserved_3: bool,

    /// Bit 4 — AF: Auxiliary carry.
    pub af: bool,

    /// Bit 5 — Reserved.
    #[bits(default = false)]
    __reserved_5: bool,

    /// Bit 6 — ZF: Zero.
    pub zf: bool,

    /// Bit 7 — SF: Sign.
    pub sf: bool,

    /// Bit 8 — TF: Trap (single-step).
    pub tf: bool,

    /// Bit 9 — IF: Interrupt enable.
    pub interrupt_enable: bool,

    /// Bit 10 — DF: Direction.
    pub df: bool,

    /// Bit 11 — OF: Overflow.
    pub of: bool,

    /// Bits 12–13 — IOPL: I/O privilege level.
    #[bits(2)]
    pub iopl: u8,

    /// Bit 14 — NT: Nested task.
    pub nt: bool,

    /// Bit 15 — Reserved.
    #[bits(default = false)]
    __reserved_15: bool,

    /// Bit 16 — RF: Resume.
    pub rf: bool,

    /// Bit 17 — VM: Virtual-8086 mode.
    pub vm: bool,

    /// Bit 18 — AC: Alignment check.
    pub ac: bool,

    /// Bit 19 — VIF: Virtual interrupt flag.
    pub vif: bool,

    /// Bit 20 — VIP: Virtual interrupt pending.
    pub vip: bool,

    /// Bit 21 — ID: CPUID available.
    pub id: bool,

    /// Bits 22–63 — Reserved.
    #[bits(42, default = 0)]
    __reserved_22_63: u64,
}

impl Rflags {
    /// Initial guest image: IF set, fixed bit 1 set, everything else zero.
    #[inline]
    #[must_use]
    pub const fn reset() -> Self {
        Self::new().with_interrupt_enable(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_is_0x202() {
        assert_eq!(Rflags::reset().into_bits(), 0x202);
    }
}
