//! Guest memory management: the authoritative allocate/map/free surface
//! and memory-layout initialization.
//!
//! Every operation keeps the HVA↔GPA↔GVA triple honest: host memory is
//! owned by the allocation tracker, guest physical placement comes from
//! the arena, and guest virtual placement additionally installs leaf
//! entries into the paging tree before the platform mapping is created.
//!
//! Re-mapping an already-tracked GPA is refused (the tracker is the
//! collision authority); mapping through the platform twice would replace
//! the hypervisor-side range without freeing host memory, which is
//! exactly the aliasing the tracker exists to prevent.

pub(crate) mod paging;
pub(crate) mod tables;

use crate::error::{VmError, VmResult};
use crate::host::{HostAlloc, protection_for_flags};
use crate::partition::Partition;
use crate::tracker::{AllocationNode, BlockType, HostBacking};
use hv_addresses::{Gpa, Gva, Hva, KIB, PAGE_SIZE, align_up};
use hv_platform::{MemoryAccessFlags, PlatformDriver, TranslateFlags, TranslationResult};
use hv_registers::{Cr0, Cr4, Efer, Register};
use log::{debug, trace, warn};

impl<P: PlatformDriver> Partition<P> {
    /// Allocate host-backed memory in the guest physical space.
    ///
    /// With no `gpa_hint` the arena suggests a placement; a hint is
    /// aligned down to its page. The backing host pages are freshly
    /// allocated, owned by the tracker and mapped with `flags`.
    ///
    /// Returns the backing host address and the final guest physical
    /// address.
    pub fn allocate_guest_physical(
        &mut self,
        gpa_hint: Option<Gpa>,
        size: u64,
        flags: MemoryAccessFlags,
    ) -> VmResult<(Hva, Gpa)> {
        let result = self.allocate_physical_block(gpa_hint, size, flags, BlockType::Physical);
        self.record(result)
    }

    /// Map caller-owned host memory into the guest physical space.
    ///
    /// Like [`allocate_guest_physical`](Self::allocate_guest_physical)
    /// but without a host allocation: the tracker records the backing as
    /// borrowed and will never free it.
    pub fn map_host_to_guest_physical(
        &mut self,
        host: Hva,
        gpa_hint: Option<Gpa>,
        size: u64,
        flags: MemoryAccessFlags,
    ) -> VmResult<Gpa> {
        let result = self.map_host_physical_block(host, gpa_hint, size, flags);
        self.record(result)
    }

    fn map_host_physical_block(
        &mut self,
        host: Hva,
        gpa_hint: Option<Gpa>,
        size: u64,
        flags: MemoryAccessFlags,
    ) -> VmResult<Gpa> {
        if host.is_zero() {
            return Err(VmError::InvalidArgument);
        }
        let (gpa, size) = self.place_physical(gpa_hint, size, flags)?;

        self.layout.tracker.insert(AllocationNode {
            block_type: BlockType::Physical,
            backing: HostBacking::Borrowed(host),
            gpa,
            gva: Gva::zero(),
            size,
        });

        if let Err(e) = self
            .driver
            .map_gpa_range(&self.handle, host, gpa, size, flags)
        {
            self.layout.tracker.remove_by_gpa(gpa);
            return Err(e.into());
        }

        trace!("mapped host {host} -> {gpa} ({size} bytes)");
        Ok(gpa)
    }

    /// Allocate host-backed memory in the guest virtual space.
    ///
    /// Chooses (or validates) a guest virtual placement, allocates host
    /// pages and a guest physical range, installs a page-table entry for
    /// every 4 KiB frame and maps the physical range with `flags`.
    ///
    /// Returns the backing host address and the final guest virtual
    /// address.
    pub fn allocate_guest_virtual(
        &mut self,
        gva_hint: Option<Gva>,
        size: u64,
        flags: MemoryAccessFlags,
    ) -> VmResult<(Hva, Gva)> {
        let result = self.allocate_virtual_block(gva_hint, size, flags);
        self.record(result)
    }

    fn allocate_virtual_block(
        &mut self,
        gva_hint: Option<Gva>,
        size: u64,
        flags: MemoryAccessFlags,
    ) -> VmResult<(Hva, Gva)> {
        let protection = protection_for_flags(flags)?;
        let (gva, size) = self.place_virtual(gva_hint, size)?;

        let backing = HostAlloc::new(size, protection)?;
        let hva = backing.hva();
        self.finish_virtual_mapping(HostBacking::Owned(backing), hva, gva, size, flags)?;
        Ok((hva, gva))
    }

    /// Map caller-owned host memory into the guest virtual space.
    ///
    /// Like [`allocate_guest_virtual`](Self::allocate_guest_virtual)
    /// without the host allocation.
    pub fn map_host_to_guest_virtual(
        &mut self,
        host: Hva,
        gva_hint: Option<Gva>,
        size: u64,
        flags: MemoryAccessFlags,
    ) -> VmResult<Gva> {
        let result = self.map_host_virtual_block(host, gva_hint, size, flags);
        self.record(result)
    }

    fn map_host_virtual_block(
        &mut self,
        host: Hva,
        gva_hint: Option<Gva>,
        size: u64,
        flags: MemoryAccessFlags,
    ) -> VmResult<Gva> {
        if host.is_zero() {
            return Err(VmError::InvalidArgument);
        }
        protection_for_flags(flags)?;
        let (gva, size) = self.place_virtual(gva_hint, size)?;
        self.finish_virtual_mapping(HostBacking::Borrowed(host), host, gva, size, flags)?;
        Ok(gva)
    }

    /// Free a guest physical allocation: unmap the range and release the
    /// tracker record (and with it any owned host backing).
    pub fn free_guest_physical(&mut self, gpa: Gpa) -> VmResult<()> {
        let result = self.free_physical_block(gpa);
        self.record(result)
    }

    fn free_physical_block(&mut self, gpa: Gpa) -> VmResult<()> {
        let node = self.layout.tracker.find_by_gpa(gpa).ok_or(VmError::NotFound)?;
        let (base, size) = (node.gpa, node.size);
        self.driver
            .unmap_gpa_range(&self.handle, base, align_up(size, PAGE_SIZE))?;
        self.layout.tracker.remove_by_gpa(base);
        trace!("freed physical {base} ({size} bytes)");
        Ok(())
    }

    /// Free a guest virtual allocation.
    ///
    /// Translates the GVA first, unmaps the backing physical range and
    /// removes the tracker record. The page-table entries stay installed:
    /// a GVA freed this way still translates but its physical layer is
    /// gone, which is the property the IDT trap page is built on.
    pub fn free_guest_virtual(&mut self, gva: Gva) -> VmResult<()> {
        let result = self.free_virtual_block(gva);
        self.record(result)
    }

    fn free_virtual_block(&mut self, gva: Gva) -> VmResult<()> {
        let base = self.release_virtual_range(gva)?;
        self.layout.tracker.remove_by_gva(base);
        trace!("freed virtual {base}");
        Ok(())
    }

    /// Translate a guest virtual address through the platform.
    ///
    /// The translation result travels with the address: `PageNotPresent`
    /// means a missing leaf a caller may repair (install the entry, retry
    /// once); `GpaUnmapped` means the walk finished but the physical page
    /// is not mapped.
    pub fn translate_gva_to_gpa(&mut self, gva: Gva) -> VmResult<(TranslationResult, Gpa)> {
        let result = self
            .driver
            .translate_gva(
                &self.handle,
                self.vp.index,
                gva,
                TranslateFlags::RW_PRIVILEGE_EXEMPT,
            )
            .map_err(VmError::from);
        self.record(result)
    }

    /// Initialize the partition's memory layout.
    ///
    /// Sizes the physical space from the platform's installed-memory
    /// report, builds the paging tree, enables protected mode, paging,
    /// PAE and long mode, then builds the GDT (with TSS), the IDT (with
    /// its trap page) and the syscall MSRs.
    pub fn initialize_memory_layout(&mut self) -> VmResult<()> {
        let result = self.initialize_layout();
        self.record(result)
    }

    fn initialize_layout(&mut self) -> VmResult<()> {
        if self.layout.arena.is_some() || !self.layout.pml4_hva.is_zero() {
            return Err(VmError::AlreadyInitialized);
        }

        let installed_kib = self.driver.installed_memory_kib()?;
        self.layout.arena = Some(crate::arena::MemoryArena::new(installed_kib * KIB));

        let pml4_gpa = self.setup_paging()?;
        debug!("paging tree built, PML4 at {pml4_gpa}");

        let mut registers = self.get_registers()?;

        // Protected mode + paging; CR0's upper half is reserved.
        let cr0 = Cr0::from_bits(registers.reg64(Register::Cr0))
            .with_pe(true)
            .with_pg(true);
        registers.set_reg64(Register::Cr0, cr0.into_bits() & u64::from(u32::MAX));

        registers.set_reg64(Register::Cr3, pml4_gpa.as_u64());

        let cr4 = Cr4::from_bits(registers.reg64(Register::Cr4))
            .with_pae(true)
            .with_pks(false);
        registers.set_reg64(Register::Cr4, cr4.into_bits());

        let efer = Efer::from_bits(registers.reg64(Register::Efer))
            .with_lme(true)
            .with_sce(true);
        registers.set_reg64(Register::Efer, efer.into_bits() & !(1 << 16));

        self.set_registers(&registers)?;

        self.setup_gdt(&mut registers)?;
        self.setup_idt(&mut registers)?;
        self.setup_syscalls()?;

        self.set_registers(&registers)
    }

    // ---- shared innards ----------------------------------------------

    /// Validate size/flags and choose the physical placement.
    fn place_physical(
        &mut self,
        gpa_hint: Option<Gpa>,
        size: u64,
        flags: MemoryAccessFlags,
    ) -> VmResult<(Gpa, u64)> {
        if size == 0 {
            return Err(VmError::InvalidArgument);
        }
        protection_for_flags(flags)?;
        let size = align_up(size, PAGE_SIZE);

        let hint = gpa_hint.filter(|g| !g.is_zero());
        let gpa = match hint {
            Some(g) => g.page_base(),
            None => self
                .layout
                .arena
                .as_mut()
                .ok_or(VmError::NotInitialized)?
                .suggest_physical(size)?,
        };

        if self.layout.tracker.find_by_gpa(gpa).is_some() {
            return Err(VmError::AlreadyMapped);
        }
        Ok((gpa, size))
    }

    /// Allocate-and-map for physical blocks; also used for paging
    /// structure pages.
    pub(crate) fn allocate_physical_block(
        &mut self,
        gpa_hint: Option<Gpa>,
        size: u64,
        flags: MemoryAccessFlags,
        block_type: BlockType,
    ) -> VmResult<(Hva, Gpa)> {
        let protection = protection_for_flags(flags)?;
        let (gpa, size) = self.place_physical(gpa_hint, size, flags)?;

        let backing = HostAlloc::new(size, protection)?;
        let hva = backing.hva();

        self.layout.tracker.insert(AllocationNode {
            block_type,
            backing: HostBacking::Owned(backing),
            gpa,
            gva: Gva::zero(),
            size,
        });

        if let Err(e) = self
            .driver
            .map_gpa_range(&self.handle, hva, gpa, size, flags)
        {
            // Undo the host allocation by dropping the record.
            self.layout.tracker.remove_by_gpa(gpa);
            return Err(e.into());
        }

        trace!("allocated physical {gpa} at {hva} ({size} bytes)");
        Ok((hva, gpa))
    }

    /// Validate size and choose the virtual placement.
    fn place_virtual(&mut self, gva_hint: Option<Gva>, size: u64) -> VmResult<(Gva, u64)> {
        if size == 0 {
            return Err(VmError::InvalidArgument);
        }
        let size = align_up(size, PAGE_SIZE);
        let mode = self.vp.mode;

        let layout = &mut self.layout;
        let arena = layout.arena.as_ref().ok_or(VmError::NotInitialized)?;

        let hint = gva_hint.filter(|g| !g.is_zero());
        let gva = match hint {
            // A hinted address that is already tracked falls back to a
            // fresh suggestion, mirroring the zero-hint path.
            Some(g) if layout.tracker.find_by_gva(g).is_none() => {
                if !arena.virtual_address_valid(g) {
                    return Err(VmError::InvalidArgument);
                }
                g.page_base()
            }
            _ => arena.suggest_virtual(size, mode, &layout.tracker)?,
        };

        if layout.tracker.find_by_gva(gva).is_some() {
            return Err(VmError::AlreadyMapped);
        }
        Ok((gva, size))
    }

    /// Shared tail of the virtual allocate/map paths: pick a physical
    /// range, record the node, install page-table entries, create the
    /// platform mapping. Unwinds the record (releasing any owned host
    /// backing) on failure.
    fn finish_virtual_mapping(
        &mut self,
        backing: HostBacking,
        hva: Hva,
        gva: Gva,
        size: u64,
        flags: MemoryAccessFlags,
    ) -> VmResult<()> {
        let gpa = self
            .layout
            .arena
            .as_mut()
            .ok_or(VmError::NotInitialized)?
            .suggest_physical(size)?;

        self.layout.tracker.insert(AllocationNode {
            block_type: BlockType::Virtual,
            backing,
            gpa,
            gva,
            size,
        });

        let result = self.install_range_entries(gva, gpa, size).and_then(|()| {
            self.driver
                .map_gpa_range(&self.handle, hva, gpa, size, flags)
                .map_err(VmError::from)
        });
        if let Err(e) = result {
            self.layout.tracker.remove_by_gva(gva);
            return Err(e);
        }

        trace!("mapped virtual {gva} -> {gpa} at {hva} ({size} bytes)");
        Ok(())
    }

    /// Install a leaf entry for every page of `[gva, gva + size)` onto
    /// consecutive physical pages starting at `gpa`.
    fn install_range_entries(&mut self, gva: Gva, gpa: Gpa, size: u64) -> VmResult<()> {
        let mut offset = 0;
        while offset < size {
            self.insert_page_table_entry(gva.add(offset), gpa.add(offset))?;
            offset += PAGE_SIZE;
        }
        Ok(())
    }

    /// Unmap the physical layer behind a tracked virtual range and drop
    /// its host backing, leaving the record and the page-table entries in
    /// place. Returns the record's base GVA.
    pub(crate) fn release_virtual_range(&mut self, gva: Gva) -> VmResult<Gva> {
        let node = self.layout.tracker.find_by_gva(gva).ok_or(VmError::NotFound)?;
        let (base, size) = (node.gva, node.size);

        // Translate before unmapping; the platform still can.
        let (result, gpa) = self.driver.translate_gva(
            &self.handle,
            self.vp.index,
            base,
            TranslateFlags::RW_PRIVILEGE_EXEMPT,
        )?;
        if !result.is_success() {
            return Err(VmError::Internal("stale translation on virtual free"));
        }

        self.driver.unmap_gpa_range(
            &self.handle,
            gpa.page_base(),
            align_up(size, PAGE_SIZE),
        )?;
        self.layout.tracker.release_backing_by_gva(base);
        Ok(base)
    }

    /// Teardown pass over every allocation record.
    ///
    /// Virtual records go first: they are translated through the guest's
    /// paging structures, which must still be mapped at that point. The
    /// physical and paging-structure records follow. Records whose
    /// backing was already released need nothing. Host memory goes away
    /// with the records. The pass keeps going after failures and reports
    /// the first one at the end.
    pub(crate) fn release_all_allocations(&mut self) -> VmResult<()> {
        let nodes = self.layout.tracker.drain();
        let mut first_error = None;

        let virtual_first = nodes
            .iter()
            .filter(|n| !n.gva.is_zero())
            .chain(nodes.iter().filter(|n| n.gva.is_zero()));
        for node in virtual_first {
            if let Err(e) = self.release_node(node) {
                warn!(
                    "failed to release allocation {}/{}: {e}",
                    node.gpa, node.gva
                );
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        debug!("released {} allocation records", nodes.len());
        first_error.map_or(Ok(()), Err)
    }

    fn release_node(&mut self, node: &AllocationNode) -> VmResult<()> {
        if matches!(node.backing, HostBacking::Released) {
            // Physical layer already gone (the IDT trap page).
            return Ok(());
        }
        if node.gpa.is_zero() && node.gva.is_zero() {
            return Err(VmError::Internal("allocation record with no address"));
        }

        let gpa = if node.gva.is_zero() {
            node.gpa
        } else {
            let (result, gpa) = self.driver.translate_gva(
                &self.handle,
                self.vp.index,
                node.gva,
                TranslateFlags::RW_PRIVILEGE_EXEMPT,
            )?;
            if !result.is_success() {
                return Err(VmError::Internal("stale translation on teardown"));
            }
            gpa.page_base()
        };

        self.driver
            .unmap_gpa_range(&self.handle, gpa, align_up(node.size, PAGE_SIZE))?;
        Ok(())
    }
}
