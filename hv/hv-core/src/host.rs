//! Host-side page allocation and the guest-flag → host-protection table.

use crate::error::{VmError, VmResult};
use hv_addresses::{Hva, PAGE_SIZE, align_up};
use hv_platform::MemoryAccessFlags;
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::ptr::NonNull;

/// Host protection class for a guest mapping's backing pages.
///
/// The classes mirror the closed translation table below. Backing memory
/// is committed read-write in this process either way (the protection of
/// the *guest* view is enforced by the hypervisor's GPA mapping flags);
/// the class records the intent and rejects combinations the table does
/// not admit.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HostProtection {
    NoAccess,
    ReadOnly,
    ReadWrite,
    ExecuteReadWrite,
}

/// Translate guest mapping flags to a host protection class.
///
/// The table is closed: `None`, `{R}`, `{R,W}` and `{R,W,X}` are the only
/// admitted combinations. Write-only, execute-only and
/// read-execute-without-write have no host representation and are
/// rejected, so a host page can never end up more restrictive than the
/// guest mapping in front of it.
pub fn protection_for_flags(flags: MemoryAccessFlags) -> VmResult<HostProtection> {
    match flags {
        f if f.is_empty() => Ok(HostProtection::NoAccess),
        f if f == MemoryAccessFlags::READ => Ok(HostProtection::ReadOnly),
        f if f == MemoryAccessFlags::RW => Ok(HostProtection::ReadWrite),
        f if f == MemoryAccessFlags::RWX => Ok(HostProtection::ExecuteReadWrite),
        _ => Err(VmError::InvalidArgument),
    }
}

/// A page-aligned, zero-initialized allocation on the host heap.
///
/// Owns its memory; dropping releases it. This is the backing store for
/// guest pages, page tables and descriptor tables.
#[derive(Debug)]
pub struct HostAlloc {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl HostAlloc {
    /// Allocate `size` bytes rounded up to page granularity, zeroed.
    pub fn new(size: u64, protection: HostProtection) -> VmResult<Self> {
        if size == 0 {
            return Err(VmError::InvalidArgument);
        }
        // The class is validated by the caller's flag translation; the
        // host commit itself is uniform.
        let _ = protection;
        let bytes = usize::try_from(align_up(size, PAGE_SIZE)).map_err(|_| VmError::OutOfMemory)?;
        let layout = Layout::from_size_align(bytes, PAGE_SIZE as usize)
            .map_err(|_| VmError::OutOfMemory)?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(VmError::OutOfMemory)?;
        Ok(Self { ptr, layout })
    }

    /// The allocation's address in this process.
    #[inline]
    #[must_use]
    pub fn hva(&self) -> Hva {
        Hva::from_ptr(self.ptr.as_ptr())
    }

    /// Allocated size in bytes (page multiple).
    #[inline]
    #[must_use]
    pub fn size(&self) -> u64 {
        self.layout.size() as u64
    }
}

impl Drop for HostAlloc {
    fn drop(&mut self) {
        // SAFETY: ptr/layout are the pair returned by alloc_zeroed.
        unsafe {
            dealloc(self.ptr.as_ptr(), self.layout);
        }
    }
}

// SAFETY: the allocation is plain heap memory with unique ownership; the
// raw pointer is never shared outside the owning tracker.
unsafe impl Send for HostAlloc {}
