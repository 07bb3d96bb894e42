//! The 64-bit page-table entry shared by all four paging levels.

use bitfield_struct::bitfield;
use hv_addresses::{Gpa, PageFrameNumber};

/// A hardware page-table entry (PML4E, PDPE, PDE or PTE).
///
/// Non-leaf entries point at the next-level table's frame; the leaf PTE
/// points at the mapped 4 KiB frame. The layout is identical either way,
/// which is why one type serves every level.
///
/// Reference: AMD APM / Intel SDM paging structures (x86-64).
#[bitfield(u64)]
#[derive(Eq, PartialEq)]
pub struct PageTableEntry {
    /// **Present** (bit 0): the entry maps something.
    ///
    /// When clear, the CPU faults on any access through this entry and
    /// every other field is software-owned.
    pub valid: bool,

    /// **Read/Write** (bit 1): write permission.
    pub write: bool,

    /// **User/Supervisor** (bit 2): allow CPL 3 access if set.
    pub owner: bool,

    /// **Page Write-Through** (PWT, bit 3).
    pub write_through: bool,

    /// **Page Cache Disable** (PCD, bit 4).
    pub cache_disable: bool,

    /// **Accessed** (bit 5): set by the CPU on first use of this entry.
    pub accessed: bool,

    /// **Dirty** (bit 6): set by the CPU on first write (leaf only).
    pub dirty: bool,

    /// **Page Size** (bit 7): large-page leaf at PDP/PD level.
    ///
    /// Always zero here; this workspace maps 4 KiB pages only.
    pub large_page: bool,

    /// **OS-available** (bits 8..11): not interpreted by hardware.
    #[bits(4)]
    pub available: u8,

    /// **Page-frame number** (bits 12..47): physical frame of the
    /// next-level table, or of the mapped page at the leaf.
    #[bits(36, default = PageFrameNumber::new(0))]
    pub page_frame_number: PageFrameNumber,

    /// Reserved for hardware (bits 48..51), must be zero.
    #[bits(4)]
    __reserved_hw: u8,

    /// Reserved for software (bits 52..62).
    #[bits(11)]
    __reserved_sw: u16,

    /// **No-Execute** (NX, bit 63): instruction fetch disallowed when
    /// EFER.NXE is enabled.
    pub no_execute: bool,
}

impl PageTableEntry {
    /// Build the entry this workspace installs everywhere: present,
    /// writable, user-accessible, pointing at `frame`.
    #[inline]
    #[must_use]
    pub const fn present_frame(frame: Gpa) -> Self {
        Self::new()
            .with_valid(true)
            .with_write(true)
            .with_owner(true)
            .with_page_frame_number(frame.pfn())
    }

    /// The guest physical base address this entry points at.
    #[inline]
    #[must_use]
    pub const fn frame_base(self) -> Gpa {
        self.page_frame_number().base()
    }
}

const _: () = {
    assert!(size_of::<PageTableEntry>() == 8);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn present_frame_sets_low_bits_and_pfn() {
        let e = PageTableEntry::present_frame(Gpa::new(0x30_5000));
        assert_eq!(e.into_bits() & 0x7, 0b111);
        assert_eq!(e.page_frame_number().as_u64(), 0x305);
        assert_eq!(e.frame_base(), Gpa::new(0x30_5000));
        assert!(!e.large_page());
        assert!(!e.no_execute());
    }

    #[test]
    fn pfn_occupies_bits_12_to_47() {
        let e = PageTableEntry::new().with_page_frame_number(PageFrameNumber::new(0xF_FFFF_FFFF));
        assert_eq!(e.into_bits(), 0x0000_FFFF_FFFF_F000);
    }

    #[test]
    fn nx_is_bit_63() {
        let e = PageTableEntry::new().with_no_execute(true);
        assert_eq!(e.into_bits(), 1 << 63);
    }
}
