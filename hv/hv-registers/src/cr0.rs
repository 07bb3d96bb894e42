//! CR0 model.

use bitfield_struct::bitfield;

/// Architectural model of CR0 in 64-bit mode.
///
/// Exposes the control bits this library programs as booleans and keeps
/// the reserved bits forced to zero. The guest image travels through the
/// platform driver; nothing here touches the host CPU.
#[bitfield(u64)]
#[derive(Eq, PartialEq)]
pub struct Cr0 {
    /// Bit 0 — PE: Protection Enable. Required for long mode.
    pub pe: bool,

    /// Bit 1 — MP: Monitor Coprocessor.
    pub mp: bool,

    /// Bit 2 — EM: x87 Emulation.
    pub em: bool,

    /// Bit 3 — TS: Task Switched.
    pub ts: bool,

    /// Bit 4 — ET: Extension Type (effectively reserved-1 on modern CPUs).
    pub et: bool,

    /// Bit 5 — NE: Numeric Error reporting via #MF.
    pub ne: bool,

    /// Bits 6–15 — Reserved.
    #[bits(10, default = 0)]
    __reserved_6_15: u16,

    /// Bit 16 — WP: Write Protect for supervisor writes.
    pub wp: bool,

    /// Bit 17 — Reserved.
    #[bits(default = false)]
    __reserved_17: bool,

    /// Bit 18 — AM: Alignment Mask.
    pub am: bool,

    /// Bits 19–28 — Reserved.
    #[bits(10, default = 0)]
    __reserved_19_28: u16,

    /// Bit 29 — NW: Not Write-Through.
    pub nw: bool,

    /// Bit 30 — CD: Cache Disable.
    pub cd: bool,

    /// Bit 31 — PG: Paging. Requires PE=1.
    pub pg: bool,

    /// Bits 32–63 — Reserved.
    #[bits(32, default = 0)]
    __reserved_32_63: u32,
}
