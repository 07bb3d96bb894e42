//! The long-mode Task State Segment.

/// 64-bit Task State Segment.
///
/// Long mode does not hardware-task-switch, but the CPU still consults
/// the TSS for the privilege stack table (`rsp0..rsp2`, loaded on a
/// CPL-lowering transition) and the interrupt stack table (`ist1..ist7`,
/// selected per IDT gate). The I/O permission bitmap offset of
/// `size_of::<TaskStateSegment>()` means "no bitmap": port access is then
/// governed by IOPL against CPL alone.
#[repr(C, packed(4))]
#[derive(Copy, Clone)]
pub struct TaskStateSegment {
    _reserved0: u32,

    /// Ring-0 stack pointer loaded on a privilege transition to CPL 0.
    pub rsp0: u64,
    /// Ring-1 stack pointer (unused by this workspace).
    pub rsp1: u64,
    /// Ring-2 stack pointer (unused by this workspace).
    pub rsp2: u64,

    _reserved1: u64,

    /// Interrupt-stack-table slots 1..7, selected by an IDT gate's IST
    /// index.
    pub ist1: u64,
    pub ist2: u64,
    pub ist3: u64,
    pub ist4: u64,
    pub ist5: u64,
    pub ist6: u64,
    pub ist7: u64,

    _reserved2: u64,
    _reserved3: u16,

    /// Byte offset from the TSS base to the I/O permission bitmap;
    /// at or past the limit means no bitmap is present.
    pub iopb_offset: u16,
}

impl TaskStateSegment {
    /// A zeroed TSS with the I/O bitmap disabled.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn new() -> Self {
        Self {
            _reserved0: 0,
            rsp0: 0,
            rsp1: 0,
            rsp2: 0,
            _reserved1: 0,
            ist1: 0,
            ist2: 0,
            ist3: 0,
            ist4: 0,
            ist5: 0,
            ist6: 0,
            ist7: 0,
            _reserved2: 0,
            _reserved3: 0,
            iopb_offset: size_of::<Self>() as u16,
        }
    }
}

impl Default for TaskStateSegment {
    fn default() -> Self {
        Self::new()
    }
}

const _: () = {
    assert!(size_of::<TaskStateSegment>() == 104);
};

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::offset_of;

    #[test]
    fn field_offsets_match_the_architecture() {
        assert_eq!(offset_of!(TaskStateSegment, rsp0), 4);
        assert_eq!(offset_of!(TaskStateSegment, ist1), 36);
        assert_eq!(offset_of!(TaskStateSegment, iopb_offset), 102);
    }

    #[test]
    fn default_disables_the_io_bitmap() {
        let tss = TaskStateSegment::new();
        let iopb = tss.iopb_offset;
        assert_eq!(iopb as usize, size_of::<TaskStateSegment>());
    }
}
