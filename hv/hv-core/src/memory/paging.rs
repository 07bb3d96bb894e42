//! Paging builder: constructs and mutates the guest's four-level tree.
//!
//! Table pages are ordinary tracked physical allocations, which makes the
//! tracker the resolver for walking: a table entry stores only a
//! page-frame number, and the matching host pointer comes from the
//! record that allocated the frame.

use crate::error::{VmError, VmResult};
use crate::partition::Partition;
use crate::tracker::BlockType;
use hv_addresses::{Gpa, Gva, Hva, PAGE_SIZE, PageFrameNumber};
use hv_paging::{PAGE_TABLE_ENTRIES, PageIndices, PageTable, PageTableEntry};
use hv_platform::{MemoryAccessFlags, PlatformDriver};
use log::trace;

/// Read the entry at `index` of the table living at `table` in host
/// memory.
///
/// # Safety
/// `table` must point at a live, 4 KiB-aligned table page owned by the
/// tracker, with no other reference to it alive.
unsafe fn read_entry(table: Hva, index: u16) -> PageTableEntry {
    // SAFETY: per contract, the page is a valid PageTable.
    unsafe { (*table.as_ptr::<PageTable>()).entry(index) }
}

/// Write the entry at `index` of the table living at `table`.
///
/// # Safety
/// As for [`read_entry`].
unsafe fn write_entry(table: Hva, index: u16, entry: PageTableEntry) {
    // SAFETY: per contract, the page is a valid PageTable.
    unsafe {
        (*table.as_ptr::<PageTable>()).set_entry(index, entry);
    }
}

impl<P: PlatformDriver> Partition<P> {
    /// Build the paging tree: one PML4 page whose 512 slots all point at
    /// freshly allocated (zeroed) page-directory-pointer pages.
    ///
    /// The PDP pages are zero, so everything below the top level still
    /// faults lazily. Returns the PML4's guest physical address for CR3.
    pub(crate) fn setup_paging(&mut self) -> VmResult<Gpa> {
        if !self.layout.pml4_hva.is_zero() {
            return Err(VmError::AlreadyInitialized);
        }

        let (pml4_hva, pml4_gpa) = self.allocate_table_page()?;
        self.layout.pml4_hva = pml4_hva;
        self.layout.pml4_gpa = pml4_gpa;

        for index in 0..PAGE_TABLE_ENTRIES as u16 {
            let (_pdp_hva, pdp_gpa) = self.allocate_table_page()?;
            // SAFETY: pml4_hva is the tracked PML4 page allocated above.
            unsafe {
                write_entry(pml4_hva, index, PageTableEntry::present_frame(pdp_gpa));
            }
        }

        Ok(pml4_gpa)
    }

    /// Install a leaf entry translating `gva`'s page to `gpa`'s frame.
    ///
    /// The PML4 level is eagerly populated, so an invalid slot there is
    /// an internal fault. Missing page-directory and page-table levels
    /// are allocated on the way down. Re-installing an existing leaf is a
    /// no-op success.
    pub(crate) fn insert_page_table_entry(&mut self, gva: Gva, gpa: Gpa) -> VmResult<()> {
        if self.layout.pml4_hva.is_zero() {
            return Err(VmError::NotInitialized);
        }
        let ix = PageIndices::decompose(gva);

        // SAFETY: the PML4 page is tracked and live for the partition's
        // lifetime.
        let pml4e = unsafe { read_entry(self.layout.pml4_hva, ix.pml4) };
        if !pml4e.valid() {
            return Err(VmError::Internal("unpopulated PML4 slot"));
        }

        let pdp_hva = self.hva_from_pfn(pml4e.page_frame_number())?;
        let pd_hva = self.descend(pdp_hva, ix.pdp)?;
        let pt_hva = self.descend(pd_hva, ix.pd)?;

        // SAFETY: pt_hva resolved through the tracker.
        let leaf = unsafe { read_entry(pt_hva, ix.pt) };
        if !leaf.valid() {
            // SAFETY: as above.
            unsafe {
                write_entry(
                    pt_hva,
                    ix.pt,
                    PageTableEntry::present_frame(gpa.page_base()),
                );
            }
            trace!("installed PTE {gva} -> {gpa}");
        }

        Ok(())
    }

    /// Resolve a page-frame number back to the host pointer of the
    /// record owning that frame.
    pub(crate) fn hva_from_pfn(&self, pfn: PageFrameNumber) -> VmResult<Hva> {
        let frame = pfn.base();
        let node = self
            .layout
            .tracker
            .find_by_gpa(frame)
            .ok_or(VmError::NotFound)?;
        Ok(Hva::new(
            node.hva().as_u64() + (frame.as_u64() - node.gpa.as_u64()),
        ))
    }

    /// One step down the tree: return the host pointer of the table the
    /// entry at `(table, index)` points to, allocating and installing it
    /// when absent.
    fn descend(&mut self, table: Hva, index: u16) -> VmResult<Hva> {
        // SAFETY: `table` came from hva_from_pfn over a tracked page.
        let entry = unsafe { read_entry(table, index) };
        if entry.valid() {
            return self.hva_from_pfn(entry.page_frame_number());
        }

        let (child_hva, child_gpa) = self.allocate_table_page()?;
        // SAFETY: as above; the slot was invalid and is being installed.
        unsafe {
            write_entry(table, index, PageTableEntry::present_frame(child_gpa));
        }
        Ok(child_hva)
    }

    /// Allocate one zeroed, tracked, RW-mapped page for a paging
    /// structure.
    fn allocate_table_page(&mut self) -> VmResult<(Hva, Gpa)> {
        self.allocate_physical_block(
            None,
            PAGE_SIZE,
            MemoryAccessFlags::RW,
            BlockType::PageTable,
        )
    }
}
