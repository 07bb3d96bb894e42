//! GDT segment descriptors.

use bitfield_struct::bitfield;
use hv_addresses::Gva;

/// An 8-byte GDT segment descriptor.
///
/// The access byte and flags nibble are kept raw: the descriptor table
/// builder writes the canonical long-mode values (0x9A/0xA for kernel
/// code, 0x92/0xC for kernel data, 0xFA/0xA and 0xF2/0xC for their user
/// counterparts, 0x89 for the TSS low half).
#[bitfield(u64)]
#[derive(Eq, PartialEq)]
pub struct GdtEntry {
    /// Limit bits 15:0.
    pub limit_low: u16,

    /// Base bits 15:0.
    pub base_low: u16,

    /// Base bits 23:16.
    pub base_mid: u8,

    /// Access byte: present, DPL, class and type.
    pub access: u8,

    /// Limit bits 19:16.
    #[bits(4)]
    pub limit_high: u8,

    /// Flags nibble: AVL, L, D/B, G.
    #[bits(4)]
    pub flags: u8,

    /// Base bits 31:24.
    pub base_high: u8,
}

impl GdtEntry {
    /// Build a descriptor from its parts, scattering base and limit into
    /// their split fields.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn make(base: u64, limit: u32, access: u8, flags: u8) -> Self {
        Self::new()
            .with_limit_low((limit & 0xFFFF) as u16)
            .with_base_low((base & 0xFFFF) as u16)
            .with_base_mid(((base >> 16) & 0xFF) as u8)
            .with_access(access)
            .with_limit_high(((limit >> 16) & 0xF) as u8)
            .with_flags(flags & 0xF)
            .with_base_high(((base >> 24) & 0xFF) as u8)
    }

    /// The null descriptor occupying GDT slot 0.
    #[inline]
    #[must_use]
    pub const fn null() -> Self {
        Self::new()
    }
}

/// High 8 bytes of a 16-byte system descriptor: base bits 63:32.
#[bitfield(u64)]
#[derive(Eq, PartialEq)]
pub struct SystemDescriptorHigh {
    /// Base bits 63:32.
    pub base_upper: u32,

    /// Reserved, must be zero.
    #[bits(32, default = 0)]
    __reserved: u32,
}

/// The 16-byte TSS system descriptor (two consecutive GDT slots).
#[repr(C)]
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct TssDescriptor {
    pub low: GdtEntry,
    pub high: SystemDescriptorHigh,
}

impl TssDescriptor {
    /// Build an *Available 64-bit TSS* descriptor for a TSS at `base`
    /// spanning `limit + 1` bytes.
    ///
    /// `access` 0x89 encodes present, DPL 0, system class, type 0x9.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn make(base: Gva, limit: u32, access: u8, flags: u8) -> Self {
        Self {
            low: GdtEntry::make(base.as_u64(), limit, access, flags),
            high: SystemDescriptorHigh::new().with_base_upper((base.as_u64() >> 32) as u32),
        }
    }
}

const _: () = {
    assert!(size_of::<GdtEntry>() == 8);
    assert!(size_of::<TssDescriptor>() == 16);
};
