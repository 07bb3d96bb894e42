//! The 33-entry register snapshot.

use crate::name::{Register, SNAPSHOT_REGISTER_COUNT};
use crate::value::{RegisterValue, SegmentRegister, TableRegister};
use core::ops::{Index, IndexMut};

/// The virtual processor's register snapshot.
///
/// A fixed, ordered array of [`RegisterValue`]s whose order matches
/// [`SNAPSHOT_NAMES`](crate::SNAPSHOT_NAMES). Constructed zeroed with
/// every slot already in its platform shape: segments for
/// GS/FS/ES/DS/CS/SS/LDTR/TR, tables for GDTR/IDTR, integers elsewhere.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Registers([RegisterValue; SNAPSHOT_REGISTER_COUNT]);

impl Registers {
    /// An all-zero snapshot with correctly shaped slots.
    #[must_use]
    pub fn zeroed() -> Self {
        let mut values = [RegisterValue::Reg64(0); SNAPSHOT_REGISTER_COUNT];
        for seg in [
            Register::Gs,
            Register::Fs,
            Register::Es,
            Register::Ds,
            Register::Cs,
            Register::Ss,
            Register::Ldtr,
            Register::Tr,
        ] {
            values[seg.index()] = RegisterValue::Segment(SegmentRegister::default());
        }
        for table in [Register::Gdtr, Register::Idtr] {
            values[table.index()] = RegisterValue::Table(TableRegister::default());
        }
        Self(values)
    }

    /// The raw value array, in snapshot order.
    #[inline]
    #[must_use]
    pub const fn values(&self) -> &[RegisterValue; SNAPSHOT_REGISTER_COUNT] {
        &self.0
    }

    /// Mutable access to the raw value array, in snapshot order.
    #[inline]
    pub const fn values_mut(&mut self) -> &mut [RegisterValue; SNAPSHOT_REGISTER_COUNT] {
        &mut self.0
    }

    /// Integer view of a slot (zero for non-integer shapes).
    #[inline]
    #[must_use]
    pub fn reg64(&self, r: Register) -> u64 {
        self.0[r.index()].reg64()
    }

    /// Store an integer into a slot, overwriting its shape.
    #[inline]
    pub fn set_reg64(&mut self, r: Register, v: u64) {
        self.0[r.index()] = RegisterValue::Reg64(v);
    }

    /// Segment view of a slot; a default image if the shape differs.
    #[inline]
    #[must_use]
    pub fn segment(&self, r: Register) -> SegmentRegister {
        self.0[r.index()].segment().unwrap_or_default()
    }

    /// Mutable segment view, coercing the slot into segment shape.
    #[inline]
    pub fn segment_mut(&mut self, r: Register) -> &mut SegmentRegister {
        let slot = &mut self.0[r.index()];
        if !matches!(slot, RegisterValue::Segment(_)) {
            *slot = RegisterValue::Segment(SegmentRegister::default());
        }
        match slot {
            RegisterValue::Segment(s) => s,
            RegisterValue::Reg64(_) | RegisterValue::Table(_) => unreachable!(),
        }
    }

    /// Table view of a slot; a default image if the shape differs.
    #[inline]
    #[must_use]
    pub fn table(&self, r: Register) -> TableRegister {
        self.0[r.index()].table().unwrap_or_default()
    }

    /// Store a table image into a slot.
    #[inline]
    pub fn set_table(&mut self, r: Register, t: TableRegister) {
        self.0[r.index()] = RegisterValue::Table(t);
    }
}

impl Default for Registers {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl Index<Register> for Registers {
    type Output = RegisterValue;

    #[inline]
    fn index(&self, r: Register) -> &Self::Output {
        &self.0[r.index()]
    }
}

impl IndexMut<Register> for Registers {
    #[inline]
    fn index_mut(&mut self, r: Register) -> &mut Self::Output {
        &mut self.0[r.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zeroed_snapshot_has_platform_shapes() {
        let regs = Registers::zeroed();
        assert!(regs[Register::Rax].segment().is_none());
        assert!(regs[Register::Cs].segment().is_some());
        assert!(regs[Register::Gdtr].table().is_some());
        assert!(regs[Register::Tr].segment().is_some());
    }

    #[test]
    fn segment_mut_coerces_shape() {
        let mut regs = Registers::zeroed();
        regs.set_reg64(Register::Cs, 7);
        regs.segment_mut(Register::Cs).selector = 0x08;
        assert_eq!(regs.segment(Register::Cs).selector, 0x08);
    }

    #[test]
    fn set_get_round_trip() {
        let mut regs = Registers::zeroed();
        regs.set_reg64(Register::Rax, 0x1337);
        regs.set_table(
            Register::Idtr,
            TableRegister {
                base: 0xFFFF_8000_0000_1000,
                limit: 0xFFF,
            },
        );
        assert_eq!(regs.reg64(Register::Rax), 0x1337);
        assert_eq!(regs.table(Register::Idtr).limit, 0xFFF);
    }
}
