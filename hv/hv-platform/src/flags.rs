//! Mapping and translation flags.

bitflags::bitflags! {
    /// Access rights of a guest-physical mapping.
    ///
    /// Empty flags map a range with no guest access at all.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct MemoryAccessFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

impl MemoryAccessFlags {
    /// Read + write, the workhorse combination for data pages.
    pub const RW: Self = Self::READ.union(Self::WRITE);

    /// Read + write + execute, used for staged code.
    pub const RWX: Self = Self::RW.union(Self::EXECUTE);
}

bitflags::bitflags! {
    /// Validation requested from the driver's GVA translation.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct TranslateFlags: u32 {
        const VALIDATE_READ = 1 << 0;
        const VALIDATE_WRITE = 1 << 1;
        const VALIDATE_EXECUTE = 1 << 2;
        /// Translate regardless of the current privilege level.
        const PRIVILEGE_EXEMPT = 1 << 3;
    }
}

impl TranslateFlags {
    /// The combination the memory manager uses everywhere: validate
    /// read+write, ignore CPL.
    pub const RW_PRIVILEGE_EXEMPT: Self = Self::VALIDATE_READ
        .union(Self::VALIDATE_WRITE)
        .union(Self::PRIVILEGE_EXEMPT);
}

/// Outcome of a driver-side GVA→GPA translation.
///
/// Travels alongside the translated address: a translation can complete
/// (yielding the GPA) and still report that the backing physical page is
/// not mapped into the partition.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TranslationResult {
    /// Translation succeeded and the page is mapped.
    Success,
    /// A page-table entry on the walk was not present.
    PageNotPresent,
    /// The access would violate privilege checks.
    PrivilegeViolation,
    /// The walk completed but the resulting GPA has no mapping.
    GpaUnmapped,
}

impl TranslationResult {
    #[inline]
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rw_is_read_and_write() {
        assert!(MemoryAccessFlags::RW.contains(MemoryAccessFlags::READ));
        assert!(MemoryAccessFlags::RW.contains(MemoryAccessFlags::WRITE));
        assert!(!MemoryAccessFlags::RW.contains(MemoryAccessFlags::EXECUTE));
    }
}
