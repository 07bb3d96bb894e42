//! Address-space arena: pure advisors for free guest addresses.
//!
//! Neither operation allocates host memory or creates tracker records;
//! the arena only hands out addresses that do not collide with what the
//! tracker already knows.

use crate::error::{VmError, VmResult};
use crate::processor::CpuMode;
use crate::tracker::AllocationTracker;
use hv_addresses::{AddressRange, Gpa, Gva, KIB, MIB, PAGE_SIZE, align_up};

/// Lowest user-mode address ever suggested; keeps GVA zero (the "not
/// assigned" sentinel) and the null page out of circulation.
const USER_SUGGESTION_BASE: u64 = 64 * KIB;

/// User virtual range: `[0, 2^47 - 64 KiB)`.
const USER_HIGHEST: u64 = 0x0000_8000_0000_0000 - 64 * KIB;

/// Kernel virtual range: `[0xFFFF_8000_0000_0000, 2^64 - 4 MiB)`.
const KERNEL_LOWEST: u64 = 0xFFFF_8000_0000_0000;
const KERNEL_HIGHEST: u64 = u64::MAX - 4 * MIB;

/// Bump-style suggestion state for guest physical and guest virtual
/// addresses.
#[derive(Debug)]
pub struct MemoryArena {
    physical: AddressRange,
    next_physical: u64,
    user_virtual: AddressRange,
    kernel_virtual: AddressRange,
}

impl MemoryArena {
    /// Arena over a physical space of `physical_size` bytes.
    #[must_use]
    pub const fn new(physical_size: u64) -> Self {
        Self {
            physical: AddressRange::new(0, physical_size),
            // First page above zero; the null frame is never suggested.
            next_physical: PAGE_SIZE,
            user_virtual: AddressRange::new(0, USER_HIGHEST),
            kernel_virtual: AddressRange::new(KERNEL_LOWEST, KERNEL_HIGHEST),
        }
    }

    /// The partition's physical space.
    #[must_use]
    pub const fn physical_range(&self) -> AddressRange {
        self.physical
    }

    /// The virtual subrange for `mode`.
    #[must_use]
    pub const fn virtual_range(&self, mode: CpuMode) -> AddressRange {
        match mode {
            CpuMode::User => self.user_virtual,
            CpuMode::Kernel => self.kernel_virtual,
        }
    }

    /// Whether `gva` lies inside either virtual subrange.
    #[must_use]
    pub const fn virtual_address_valid(&self, gva: Gva) -> bool {
        self.user_virtual.contains(gva.as_u64()) || self.kernel_virtual.contains(gva.as_u64())
    }

    /// Suggest a free guest physical address for `size` bytes and advance
    /// the watermark.
    pub fn suggest_physical(&mut self, size: u64) -> VmResult<Gpa> {
        if size == 0 {
            return Err(VmError::InvalidArgument);
        }
        let bytes = align_up(size, PAGE_SIZE);
        let suggestion = self.next_physical;
        if suggestion + bytes > self.physical.highest() {
            return Err(VmError::OutOfMemory);
        }
        self.next_physical = suggestion + bytes;
        Ok(Gpa::new(suggestion))
    }

    /// Suggest a free guest virtual address for `size` bytes in `mode`'s
    /// subrange.
    ///
    /// The suggestion sits above every range the tracker has recorded in
    /// that subrange, so it can never overlap a live allocation.
    pub fn suggest_virtual(
        &self,
        size: u64,
        mode: CpuMode,
        tracker: &AllocationTracker,
    ) -> VmResult<Gva> {
        if size == 0 {
            return Err(VmError::InvalidArgument);
        }
        let range = self.virtual_range(mode);
        let mut candidate = match mode {
            CpuMode::User => USER_SUGGESTION_BASE,
            CpuMode::Kernel => range.lowest(),
        };
        for node in tracker.iter() {
            if node.gva.is_zero() || !range.contains(node.gva.as_u64()) {
                continue;
            }
            let top = align_up(node.gva.as_u64() + node.size, PAGE_SIZE);
            if top > candidate {
                candidate = top;
            }
        }
        if candidate + align_up(size, PAGE_SIZE) > range.highest() {
            return Err(VmError::OutOfMemory);
        }
        Ok(Gva::new(candidate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::{AllocationNode, BlockType, HostBacking};
    use hv_addresses::Hva;

    fn virtual_node(gva: u64, size: u64) -> AllocationNode {
        AllocationNode {
            block_type: BlockType::Virtual,
            backing: HostBacking::Borrowed(Hva::new(0x1000)),
            gpa: Gpa::new(0x1000),
            gva: Gva::new(gva),
            size,
        }
    }

    #[test]
    fn physical_suggestions_start_above_the_null_frame() {
        let mut arena = MemoryArena::new(16 * MIB);
        assert_eq!(arena.suggest_physical(0x1000).unwrap(), Gpa::new(0x1000));
        assert_eq!(arena.suggest_physical(0x800).unwrap(), Gpa::new(0x2000));
        assert_eq!(arena.suggest_physical(0x1000).unwrap(), Gpa::new(0x3000));
    }

    #[test]
    fn physical_exhaustion_reports_out_of_memory() {
        let mut arena = MemoryArena::new(4 * PAGE_SIZE);
        // Watermark at one page; three pages remain.
        assert!(arena.suggest_physical(3 * PAGE_SIZE).is_ok());
        assert!(matches!(
            arena.suggest_physical(PAGE_SIZE),
            Err(VmError::OutOfMemory)
        ));
    }

    #[test]
    fn exact_fit_succeeds() {
        let mut arena = MemoryArena::new(4 * PAGE_SIZE);
        assert_eq!(
            arena.suggest_physical(3 * PAGE_SIZE).unwrap(),
            Gpa::new(PAGE_SIZE)
        );
    }

    #[test]
    fn user_suggestions_avoid_the_null_page_and_recorded_ranges() {
        let arena = MemoryArena::new(16 * MIB);
        let mut tracker = AllocationTracker::new();
        assert_eq!(
            arena
                .suggest_virtual(0x1000, CpuMode::User, &tracker)
                .unwrap(),
            Gva::new(USER_SUGGESTION_BASE)
        );
        tracker.insert(virtual_node(0x40_0000, 0x2000));
        assert_eq!(
            arena
                .suggest_virtual(0x1000, CpuMode::User, &tracker)
                .unwrap(),
            Gva::new(0x40_2000)
        );
    }

    #[test]
    fn kernel_suggestions_ignore_user_nodes() {
        let arena = MemoryArena::new(16 * MIB);
        let mut tracker = AllocationTracker::new();
        tracker.insert(virtual_node(0x40_0000, 0x2000));
        assert_eq!(
            arena
                .suggest_virtual(0x1000, CpuMode::Kernel, &tracker)
                .unwrap(),
            Gva::new(KERNEL_LOWEST)
        );
    }

    #[test]
    fn virtual_validity_covers_both_subranges_and_nothing_between() {
        let arena = MemoryArena::new(16 * MIB);
        assert!(arena.virtual_address_valid(Gva::new(0x10000)));
        assert!(arena.virtual_address_valid(Gva::new(KERNEL_LOWEST)));
        // The 64 KiB guard below 2^47.
        assert!(!arena.virtual_address_valid(Gva::new(USER_HIGHEST)));
        // The non-canonical hole.
        assert!(!arena.virtual_address_valid(Gva::new(0x0000_9000_0000_0000)));
    }
}
