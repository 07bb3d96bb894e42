//! CR4 model.

use bitfield_struct::bitfield;

/// Architectural model of CR4.
///
/// Only PAE matters to this library (it must be set before long mode is
/// enabled); the remaining bits are modeled so a guest image survives a
/// read-modify-write untouched.
#[bitfield(u64)]
#[derive(Eq, PartialEq)]
pub struct Cr4 {
    /// Bit 0 — VME: Virtual-8086 Mode Extensions.
    pub vme: bool,

    /// Bit 1 — PVI: Protected-Mode Virtual Interrupts.
    pub pvi: bool,

    /// Bit 2 — TSD: Time Stamp Disable.
    pub tsd: bool,

    /// Bit 3 — DE: Debugging Extensions.
    pub de: bool,

    /// Bit 4 — PSE: Page Size Extensions (32-bit paging only).
    pub pse: bool,

    /// Bit 5 — PAE: Physical Address Extension. Required for long mode.
    pub pae: bool,

    /// Bit 6 — MCE: Machine-Check Enable.
    pub mce: bool,

    /// Bit 7 — PGE: Page Global Enable.
    pub pge: bool,

    /// Bit 8 — PCE: Performance-Counter Enable.
    pub pce: bool,

    /// Bit 9 — OSFXSR: FXSAVE/FXRSTOR support.
    pub osfxsr: bool,

    /// Bit 10 — OSXMMEXCPT: unmasked SIMD FP exceptions.
    pub osxmmexcpt: bool,

    /// Bit 11 — UMIP: User-Mode Instruction Prevention.
    pub umip: bool,

    /// Bit 12 — LA57: 5-level paging (not used here).
    pub la57: bool,

    /// Bit 13 — VMXE: VMX enable.
    pub vmxe: bool,

    /// Bit 14 — SMXE: SMX enable.
    pub smxe: bool,

    /// Bit 15 — Reserved.
    #[bits(default = false)]
    __reserved_15: bool,

    /// Bit 16 — FSGSBASE: RDFSBASE etc. enable.
    pub fsgsbase: bool,

    /// Bit 17 — PCIDE: Process-Context Identifiers.
    pub pcide: bool,

    /// Bit 18 — OSXSAVE: XSAVE enable.
    pub osxsave: bool,

    /// Bit 19 — Reserved.
    #[bits(default = false)]
    __reserved_19: bool,

    /// Bit 20 — SMEP: Supervisor-Mode Execution Prevention.
    pub smep: bool,

    /// Bit 21 — SMAP: Supervisor-Mode Access Prevention.
    pub smap: bool,

    /// Bit 22 — PKE: Protection Keys for user pages.
    pub pke: bool,

    /// Bit 23 — CET: Control-flow Enforcement.
    pub cet: bool,

    /// Bit 24 — PKS: Protection Keys for supervisor pages.
    pub pks: bool,

    /// Bits 25–63 — Reserved.
    #[bits(39, default = 0)]
    __reserved_25_63: u64,
}
