//! IDT gate descriptors.

use bitfield_struct::bitfield;
use hv_addresses::Gva;

/// Number of vectors in the interrupt descriptor table.
pub const IDT_ENTRY_COUNT: usize = 256;

/// The attribute byte of an IDT gate.
///
/// `P | DPL | 0 | GateType`, most significant bit first. A present
/// DPL-0 trap gate is `0x8E` (type `0b1110`).
#[bitfield(u8)]
#[derive(Eq, PartialEq)]
pub struct IdtAttributes {
    /// Gate type (bits 0..3): `0b1110` interrupt gate, `0b1111` trap gate.
    #[bits(4)]
    pub gate_type: u8,

    /// Bit 4 — must be zero for interrupt/trap gates.
    #[bits(default = false)]
    __zero: bool,

    /// Descriptor privilege level (bits 5..6).
    #[bits(2)]
    pub dpl: u8,

    /// Present (bit 7).
    pub present: bool,
}

impl IdtAttributes {
    /// A present gate with the given DPL and type.
    #[inline]
    #[must_use]
    pub const fn make(dpl: u8, gate_type: u8) -> Self {
        Self::new()
            .with_present(true)
            .with_dpl(dpl)
            .with_gate_type(gate_type)
    }
}

/// A 16-byte long-mode IDT gate descriptor.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct IdtEntry {
    /// Handler offset bits 15:0.
    pub low: u16,
    /// Code segment selector the handler runs with.
    pub selector: u16,
    /// IST index (bits 0..2); zero selects the legacy stack mechanism.
    pub interrupt_stack_table: u8,
    /// Gate attributes ([`IdtAttributes`]).
    pub attributes: u8,
    /// Handler offset bits 31:16.
    pub mid: u16,
    /// Handler offset bits 63:32.
    pub high: u32,
    /// Reserved, must be zero.
    pub reserved: u32,
}

impl IdtEntry {
    /// A gate sending vector dispatch to `handler` through `selector`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn make(handler: Gva, selector: u16, attributes: IdtAttributes) -> Self {
        let offset = handler.as_u64();
        Self {
            low: (offset & 0xFFFF) as u16,
            selector,
            interrupt_stack_table: 0,
            attributes: attributes.into_bits(),
            mid: ((offset >> 16) & 0xFFFF) as u16,
            high: ((offset >> 32) & 0xFFFF_FFFF) as u32,
            reserved: 0,
        }
    }

    /// The handler offset reassembled from its three fields.
    #[inline]
    #[must_use]
    pub const fn handler(&self) -> Gva {
        Gva::new((self.high as u64) << 32 | (self.mid as u64) << 16 | self.low as u64)
    }
}

const _: () = {
    assert!(size_of::<IdtEntry>() == 16);
    assert!(size_of::<IdtAttributes>() == 1);
};
