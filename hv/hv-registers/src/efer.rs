//! `IA32_EFER` model.

use bitfield_struct::bitfield;

/// `IA32_EFER` (MSR `0xC000_0080`).
///
/// Extended Feature Enable Register used for `SYSCALL`/`SYSRET`, long
/// mode and `NX`.
#[bitfield(u64)]
#[derive(Eq, PartialEq)]
pub struct Efer {
    /// Bit 0 — SCE: System Call Extensions (enables SYSCALL/SYSRET).
    pub sce: bool,

    /// Bits 1–7 — legacy AMD bits and reserved.
    #[bits(7, default = 0)]
    __legacy_1_7: u8,

    /// Bit 8 — LME: Long Mode Enable.
    pub lme: bool,

    /// Bit 9 — Reserved.
    #[bits(default = false)]
    __reserved_9: bool,

    /// Bit 10 — LMA: Long Mode Active (set by the processor).
    pub lma: bool,

    /// Bit 11 — NXE: No-Execute Enable.
    pub nxe: bool,

    /// Bit 12 — SVME: Secure Virtual Machine Enable.
    pub svme: bool,

    /// Bit 13 — LMSLE: Long Mode Segment Limit Enable.
    pub lmsle: bool,

    /// Bit 14 — FFXSR: Fast FXSAVE/FXRSTOR.
    pub ffxsr: bool,

    /// Bit 15 — TCE: Translation Cache Extension.
    pub tce: bool,

    /// Bit 16 — Reserved.
    #[bits(default = false)]
    __reserved_16: bool,

    /// Bits 17–63 — extensions and reserved.
    #[bits(47, default = 0)]
    __reserved_17_63: u64,
}

impl Efer {
    /// MSR index for `IA32_EFER`.
    pub const MSR_EFER: u32 = 0xC000_0080;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sce_and_lme_bits() {
        let efer = Efer::new().with_sce(true).with_lme(true);
        assert_eq!(efer.into_bits(), (1 << 8) | 1);
    }
}
