//! Tagged register values: integer, segment and table shapes.

use bitfield_struct::bitfield;

/// Attribute word of a segment register, as the hypervisor exchanges it.
///
/// This is the 16-bit packed form of the descriptor's access and flag
/// bits; the selector, base and limit travel alongside it in
/// [`SegmentRegister`].
#[bitfield(u16)]
#[derive(Eq, PartialEq)]
pub struct SegmentAttributes {
    /// Segment type (bits 0..3): code/data subtype.
    #[bits(4)]
    pub segment_type: u8,

    /// Descriptor class (bit 4): set for code/data, clear for system.
    pub non_system_segment: bool,

    /// Descriptor privilege level (bits 5..6).
    #[bits(2)]
    pub descriptor_privilege_level: u8,

    /// Present (bit 7).
    pub present: bool,

    /// Reserved (bits 8..11).
    #[bits(4)]
    __reserved: u8,

    /// Available for system software (bit 12).
    pub available: bool,

    /// 64-bit code segment (bit 13, `L`).
    pub long: bool,

    /// Default operation size (bit 14, `D/B`).
    pub default_size: bool,

    /// Granularity (bit 15): limit counted in 4 KiB units.
    pub granularity: bool,
}

/// A segment register image: selector, base, limit and attributes.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SegmentRegister {
    pub base: u64,
    pub limit: u32,
    pub selector: u16,
    pub attributes: SegmentAttributes,
}

/// A descriptor-table register image (GDTR/IDTR).
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TableRegister {
    pub base: u64,
    pub limit: u16,
}

/// One register value in the shape the platform exchanges it.
///
/// The snapshot is an ordered array of these; each slot keeps a fixed
/// shape (general-purpose and control registers are [`Reg64`]
/// (Self::Reg64), the segment registers are [`Segment`](Self::Segment),
/// GDTR/IDTR are [`Table`](Self::Table)).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegisterValue {
    Reg64(u64),
    Segment(SegmentRegister),
    Table(TableRegister),
}

impl RegisterValue {
    /// The integer view; zero when the slot holds a non-integer shape.
    #[inline]
    #[must_use]
    pub const fn reg64(&self) -> u64 {
        match self {
            Self::Reg64(v) => *v,
            Self::Segment(_) | Self::Table(_) => 0,
        }
    }

    /// The segment view, if this value is one.
    #[inline]
    #[must_use]
    pub const fn segment(&self) -> Option<SegmentRegister> {
        match self {
            Self::Segment(s) => Some(*s),
            Self::Reg64(_) | Self::Table(_) => None,
        }
    }

    /// The table view, if this value is one.
    #[inline]
    #[must_use]
    pub const fn table(&self) -> Option<TableRegister> {
        match self {
            Self::Table(t) => Some(*t),
            Self::Reg64(_) | Self::Segment(_) => None,
        }
    }
}

impl Default for RegisterValue {
    fn default() -> Self {
        Self::Reg64(0)
    }
}

const _: () = {
    assert!(size_of::<SegmentAttributes>() == 2);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attribute_bits_land_where_the_hardware_wants_them() {
        let attrs = SegmentAttributes::new()
            .with_segment_type(0b1011)
            .with_non_system_segment(true)
            .with_descriptor_privilege_level(3)
            .with_present(true)
            .with_long(true);
        assert_eq!(attrs.into_bits(), 0b0010_0000_1111_1011);
    }

    #[test]
    fn shape_accessors() {
        let v = RegisterValue::Reg64(0x1337);
        assert_eq!(v.reg64(), 0x1337);
        assert!(v.segment().is_none());

        let s = RegisterValue::Segment(SegmentRegister {
            selector: 0x2B,
            ..SegmentRegister::default()
        });
        assert_eq!(s.reg64(), 0);
        assert_eq!(s.segment().map(|s| s.selector), Some(0x2B));
    }
}
