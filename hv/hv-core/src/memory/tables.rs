//! Descriptor-table builder: GDT with TSS, IDT with its trap page, and
//! the syscall MSRs.

use crate::error::VmResult;
use crate::partition::Partition;
use crate::processor::selectors;
use hv_addresses::{Gva, PAGE_SIZE};
use hv_descriptors::{
    GdtEntry, IDT_ENTRY_COUNT, IdtAttributes, IdtEntry, TaskStateSegment, TssDescriptor,
};
use hv_platform::{MemoryAccessFlags, PlatformDriver};
use hv_registers::{Register, RegisterName, RegisterValue, Registers, Rflags, Star, TableRegister};
use log::debug;

/// Guest virtual base of the GDT page.
const GDT_BASE: Gva = Gva::new(0xFFFF_8000_0000_0000);

/// Guest virtual base of the TSS.
const TSS_BASE: Gva = Gva::new(0xFFFF_A000_0000_0000);

/// Guest virtual base of the live IDT.
const IDT_BASE: Gva = Gva::new(0xFFFF_8000_0000_1000);

/// Guest virtual base of the trap page the IDT entries point into.
const IDT_TRAP_BASE: Gva = Gva::new(0xFFFF_8000_0000_2000);

/// Number of 8-byte descriptors ahead of the TSS descriptor.
const GDT_DESCRIPTORS: usize = 5;

impl<P: PlatformDriver> Partition<P> {
    /// Build the GDT and TSS and point GDTR/TR at them.
    ///
    /// Five 8-byte descriptors (null, kernel code/data, user code/data)
    /// with limit `0xFFFFF` and base 0, followed by the 16-byte TSS
    /// descriptor. The TSS itself lives in its own guest-virtual
    /// allocation with the I/O bitmap disabled.
    pub(crate) fn setup_gdt(&mut self, registers: &mut Registers) -> VmResult<()> {
        let (gdt_hva, gdt_gva) =
            self.allocate_guest_virtual(Some(GDT_BASE), PAGE_SIZE, MemoryAccessFlags::RW)?;

        let (tss_hva, tss_gva) = self.allocate_guest_virtual(
            Some(TSS_BASE),
            size_of::<TaskStateSegment>() as u64,
            MemoryAccessFlags::RW,
        )?;
        // SAFETY: tss_hva is the start of a fresh page-sized allocation
        // owned by the tracker.
        unsafe {
            tss_hva
                .as_ptr::<TaskStateSegment>()
                .write(TaskStateSegment::new());
        }

        let base = 0;
        let limit = 0xF_FFFF;
        let descriptors: [GdtEntry; GDT_DESCRIPTORS] = [
            GdtEntry::null(),
            GdtEntry::make(base, limit, 0x9A, 0xA), // kernel code
            GdtEntry::make(base, limit, 0x92, 0xC), // kernel data
            GdtEntry::make(base, limit, 0xFA, 0xA), // user code
            GdtEntry::make(base, limit, 0xF2, 0xC), // user data
        ];
        let tss_descriptor = TssDescriptor::make(
            tss_gva,
            size_of::<TaskStateSegment>() as u32 - 1,
            0x89,
            0x0,
        );

        // SAFETY: the GDT page is a fresh tracked allocation large enough
        // for five descriptors plus the 16-byte TSS descriptor.
        unsafe {
            let gdt = gdt_hva.as_ptr::<GdtEntry>();
            for (slot, descriptor) in descriptors.iter().enumerate() {
                gdt.add(slot).write(*descriptor);
            }
            gdt_hva
                .as_ptr::<u8>()
                .add(GDT_DESCRIPTORS * size_of::<GdtEntry>())
                .cast::<TssDescriptor>()
                .write(tss_descriptor);
        }

        #[allow(clippy::cast_possible_truncation)]
        let gdt_limit = (size_of::<TssDescriptor>()
            + GDT_DESCRIPTORS * size_of::<GdtEntry>()
            - 1) as u16;
        registers.set_table(
            Register::Gdtr,
            TableRegister {
                base: gdt_gva.as_u64(),
                limit: gdt_limit,
            },
        );
        registers.segment_mut(Register::Tr).selector = selectors::TSS;

        debug!("GDT at {gdt_gva}, TSS at {tss_gva}");
        Ok(())
    }

    /// Build the IDT and its trap page and point IDTR at the table.
    ///
    /// Two pages go in: the live IDT, and a second page whose physical
    /// backing is immediately released while its page-table entries stay
    /// installed. Every one of the 256 gates targets an address inside
    /// that unmapped page, so any interrupt or exception the guest takes
    /// lands there and produces a memory-access exit whose faulting
    /// address encodes the vector.
    pub(crate) fn setup_idt(&mut self, registers: &mut Registers) -> VmResult<()> {
        let (idt_hva, idt_gva) =
            self.allocate_guest_virtual(Some(IDT_BASE), PAGE_SIZE, MemoryAccessFlags::RW)?;

        let (_trap_hva, trap_gva) =
            self.allocate_guest_virtual(Some(IDT_TRAP_BASE), PAGE_SIZE, MemoryAccessFlags::RW)?;

        // Unmap the trap page immediately, keeping the paging entries but
        // releasing the backing memory. Jumping to any of its addresses
        // now raises a memory-access exit instead of executing.
        self.release_virtual_range(trap_gva)?;

        let attributes = IdtAttributes::make(0, 0b1110);
        // SAFETY: the IDT page is a fresh tracked allocation holding
        // exactly 256 16-byte gates.
        unsafe {
            let idt = idt_hva.as_ptr::<IdtEntry>();
            let mut handler = trap_gva;
            for vector in 0..IDT_ENTRY_COUNT {
                idt.add(vector).write(IdtEntry::make(
                    handler,
                    selectors::KERNEL_CS,
                    attributes,
                ));
                handler = handler.add(size_of::<u64>() as u64);
            }
        }

        #[allow(clippy::cast_possible_truncation)]
        let idt_limit = (IDT_ENTRY_COUNT * size_of::<IdtEntry>() - 1) as u16;
        registers.set_table(
            Register::Idtr,
            TableRegister {
                base: idt_gva.as_u64(),
                limit: idt_limit,
            },
        );

        self.layout.idt_trap_gva = trap_gva;
        debug!("IDT at {idt_gva}, trap page at {trap_gva}");
        Ok(())
    }

    /// Program the syscall MSRs.
    ///
    /// STAR carries the kernel code selector for `syscall` and the
    /// sysret base; SFMASK clears IF on entry. LSTAR and CSTAR stay
    /// zero: no syscall handler is resident, so a `syscall` lands on an
    /// unmapped page and surfaces as a memory-access exit like any other
    /// stray jump.
    pub(crate) fn setup_syscalls(&mut self) -> VmResult<()> {
        let star = Star::for_layout(selectors::KERNEL_CS, selectors::KERNEL_DS);
        // Mask IF only; the fixed bit cannot be cleared by SFMASK anyway.
        let sfmask = Rflags::new()
            .with_fixed_one(false)
            .with_interrupt_enable(true)
            .into_bits();

        let names = [
            RegisterName::Star,
            RegisterName::Lstar,
            RegisterName::Cstar,
            RegisterName::Sfmask,
        ];
        let values = [
            RegisterValue::Reg64(star.into_bits()),
            RegisterValue::Reg64(0),
            RegisterValue::Reg64(0),
            RegisterValue::Reg64(sfmask),
        ];
        self.driver
            .set_registers(&self.handle, self.vp.index, &names, &values)?;
        Ok(())
    }
}
