//! Exception vectors and the CPU-pushed interrupt frame.

/// The stack image the CPU pushes when delivering an interrupt, as found
/// at the interrupted RSP (after the optional error code).
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct InterruptFrame {
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

const _: () = {
    assert!(size_of::<InterruptFrame>() == 40);
};

/// Architectural exception vectors.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ExceptionVector {
    DivideError = 0,
    Debug = 1,
    NonMaskableInterrupt = 2,
    Breakpoint = 3,
    Overflow = 4,
    BoundRangeExceeded = 5,
    InvalidOpcode = 6,
    DeviceNotAvailable = 7,
    DoubleFault = 8,
    CoprocessorSegmentOverrun = 9,
    InvalidTss = 10,
    SegmentNotPresent = 11,
    StackSegmentFault = 12,
    GeneralProtectionFault = 13,
    PageFault = 14,
    FloatingPointError = 16,
    AlignmentCheck = 17,
    MachineCheck = 18,
    SimdFloatingPointError = 19,
    VirtualizationException = 20,
    ControlProtectionException = 21,
    VmmCommunicationException = 29,
    SecurityException = 30,
}

impl ExceptionVector {
    /// The vector number.
    #[inline]
    #[must_use]
    pub const fn number(self) -> u8 {
        self as u8
    }

    /// Whether the CPU pushes an error code before the interrupt frame
    /// when delivering this vector.
    #[inline]
    #[must_use]
    pub const fn pushes_error_code(vector: u8) -> bool {
        matches!(
            vector,
            8 | 10 | 11 | 12 | 13 | 14 | 17 | 21 | 29 | 30
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_fault_pushes_an_error_code_breakpoint_does_not() {
        assert!(ExceptionVector::pushes_error_code(
            ExceptionVector::PageFault.number()
        ));
        assert!(ExceptionVector::pushes_error_code(
            ExceptionVector::DoubleFault.number()
        ));
        assert!(!ExceptionVector::pushes_error_code(
            ExceptionVector::Breakpoint.number()
        ));
        assert!(!ExceptionVector::pushes_error_code(32));
    }

    #[test]
    fn frame_slots_are_in_push_order() {
        use core::mem::offset_of;
        assert_eq!(offset_of!(InterruptFrame, rip), 0);
        assert_eq!(offset_of!(InterruptFrame, cs), 8);
        assert_eq!(offset_of!(InterruptFrame, rflags), 16);
        assert_eq!(offset_of!(InterruptFrame, rsp), 24);
        assert_eq!(offset_of!(InterruptFrame, ss), 32);
    }
}
