//! Virtual-processor state management.

use crate::error::{VmError, VmResult};
use crate::partition::Partition;
use hv_platform::{PlatformDriver, ProcessorVendor, VpExitContext};
use hv_registers::{Register, Registers, Rflags, SNAPSHOT_NAMES};
use log::debug;

/// Selector constants of the GDT layout the memory initializer builds.
pub mod selectors {
    /// Kernel code, GDT index 1.
    pub const KERNEL_CS: u16 = 0x08;
    /// Kernel data, GDT index 2.
    pub const KERNEL_DS: u16 = 0x10;
    /// User code, GDT index 3.
    pub const USER_CS: u16 = 0x18;
    /// User data, GDT index 4.
    pub const USER_DS: u16 = 0x20;
    /// TSS system descriptor, GDT index 5.
    pub const TSS: u16 = 0x28;

    // Encoding: (index << 3) | RPL, RPL applied at segment-load time.
    const _: () = {
        assert!(KERNEL_CS == 1 << 3);
        assert!(KERNEL_DS == 2 << 3);
        assert!(USER_CS == 3 << 3);
        assert!(USER_DS == 4 << 3);
        assert!(TSS == 5 << 3);
    };
}

/// Processor mode a payload runs in.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum CpuMode {
    /// Ring 3, user half of the virtual address space.
    #[default]
    User,
    /// Ring 0, kernel half of the virtual address space.
    Kernel,
}

impl CpuMode {
    /// `(ring, code selector, data selector)` for this mode.
    #[must_use]
    pub const fn segment_layout(self) -> (u8, u16, u16) {
        match self {
            Self::User => (3, selectors::USER_CS, selectors::USER_DS),
            Self::Kernel => (0, selectors::KERNEL_CS, selectors::KERNEL_DS),
        }
    }
}

/// Per-processor state mirrored on the host side.
#[derive(Default)]
pub struct VirtualProcessor {
    pub(crate) index: u32,
    pub(crate) mode: CpuMode,
    pub(crate) vendor: ProcessorVendor,
    pub(crate) created: bool,
    /// Ring-0 escalation latch for unrecoverable-exception handling.
    pub(crate) escalated: bool,
    pub(crate) registers: Registers,
    pub(crate) exit_context: Option<VpExitContext>,
}

/// Write `mode`'s segment layout into a register snapshot.
///
/// CS gets the long bit; SS gets default-size and granularity; DS, ES
/// and GS copy SS. FS is left alone.
pub(crate) fn apply_mode_segments(registers: &mut Registers, mode: CpuMode) {
    let (ring, code_selector, data_selector) = mode.segment_layout();

    let cs = registers.segment_mut(Register::Cs);
    cs.selector = code_selector | u16::from(ring);
    cs.attributes.set_descriptor_privilege_level(ring);
    cs.attributes.set_long(true);

    let ss = registers.segment_mut(Register::Ss);
    ss.selector = data_selector | u16::from(ring);
    ss.attributes.set_descriptor_privilege_level(ring);
    ss.attributes.set_default_size(true);
    ss.attributes.set_granularity(true);

    let ss_image = *ss;
    *registers.segment_mut(Register::Ds) = ss_image;
    *registers.segment_mut(Register::Es) = ss_image;
    *registers.segment_mut(Register::Gs) = ss_image;
}

impl<P: PlatformDriver> Partition<P> {
    /// Create the partition's single virtual processor in `mode`.
    ///
    /// Queries the processor vendor, creates the platform processor,
    /// loads the mode's segment layout and resets RFLAGS with interrupts
    /// enabled.
    pub fn create_processor(&mut self, mode: CpuMode) -> VmResult<()> {
        let result = self.bring_up_processor(mode);
        self.record(result)
    }

    fn bring_up_processor(&mut self, mode: CpuMode) -> VmResult<()> {
        if self.vp.created {
            return Err(VmError::AlreadyInitialized);
        }

        self.vp.index = 0;
        self.vp.vendor = self.driver.processor_vendor()?;
        self.driver
            .create_virtual_processor(&self.handle, self.vp.index)?;
        self.vp.created = true;

        let mut registers = self.get_registers()?;
        apply_mode_segments(&mut registers, mode);
        self.vp.mode = mode;
        registers.set_reg64(Register::Rflags, Rflags::reset().into_bits());
        self.set_registers(&registers)?;

        debug!("virtual processor {} created ({mode:?})", self.vp.index);
        Ok(())
    }

    /// Delete the virtual processor.
    ///
    /// ### Errors
    /// [`VmError::NotFound`] when no processor was created.
    pub fn delete_processor(&mut self) -> VmResult<()> {
        let result = self.tear_down_processor();
        self.record(result)
    }

    fn tear_down_processor(&mut self) -> VmResult<()> {
        if !self.vp.created {
            return Err(VmError::NotFound);
        }
        self.driver
            .delete_virtual_processor(&self.handle, self.vp.index)?;
        self.vp.created = false;
        Ok(())
    }

    /// Copy the platform's register state into the snapshot and return
    /// it.
    pub fn get_registers(&mut self) -> VmResult<Registers> {
        let result = self.read_registers();
        self.record(result)
    }

    fn read_registers(&mut self) -> VmResult<Registers> {
        self.driver.get_registers(
            &self.handle,
            self.vp.index,
            &SNAPSHOT_NAMES,
            self.vp.registers.values_mut(),
        )?;
        Ok(self.vp.registers)
    }

    /// Push `registers` to the platform and mirror them into the
    /// snapshot.
    pub fn set_registers(&mut self, registers: &Registers) -> VmResult<()> {
        let result = self.write_registers(registers);
        self.record(result)
    }

    fn write_registers(&mut self, registers: &Registers) -> VmResult<()> {
        self.vp.registers = *registers;
        self.driver.set_registers(
            &self.handle,
            self.vp.index,
            &SNAPSHOT_NAMES,
            registers.values(),
        )?;
        Ok(())
    }

    /// The snapshot as of the last register exchange.
    #[must_use]
    pub const fn registers(&self) -> &Registers {
        &self.vp.registers
    }

    /// The processor's current mode.
    #[must_use]
    pub const fn processor_mode(&self) -> CpuMode {
        self.vp.mode
    }

    /// The virtualized processor's vendor.
    #[must_use]
    pub const fn processor_vendor(&self) -> ProcessorVendor {
        self.vp.vendor
    }

    /// The exit context of the most recent run, if any.
    #[must_use]
    pub const fn last_exit_context(&self) -> Option<&VpExitContext> {
        self.vp.exit_context.as_ref()
    }

    /// Reload segment registers for `mode` and record it.
    ///
    /// Used at processor creation and by the run loop's ring-3
    /// escalation; the caller pushes the snapshot to the platform.
    pub(crate) fn switch_processor_mode(&mut self, mode: CpuMode) {
        apply_mode_segments(&mut self.vp.registers, mode);
        self.vp.mode = mode;
    }
}
