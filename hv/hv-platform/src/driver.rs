//! The driver trait proper.

use crate::error::PlatformResult;
use crate::exit::VpExitContext;
use crate::flags::{MemoryAccessFlags, TranslateFlags, TranslationResult};
use hv_addresses::{Gpa, Gva, Hva};
use hv_registers::{RegisterName, RegisterValue};

/// Vendor of the (virtualized) processor.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum ProcessorVendor {
    #[default]
    Amd,
    Intel,
    Hygon,
}

/// Handle that can interrupt a blocked run call from another thread.
///
/// Cancellation is idempotent; delivery surfaces on the running thread as
/// a user-canceled exit.
pub trait VpCanceller {
    fn cancel(&self) -> PlatformResult<()>;
}

/// The host-provided hardware-virtualization substrate.
///
/// Implementations wrap whatever the host OS exposes (on Windows this is
/// the Hypervisor Platform C API); the test substrate in `hv-mock` is a
/// pure-software stand-in. All methods take `&self`: the driver itself is
/// a stateless facade, with per-partition state behind the opaque
/// [`PartitionHandle`](Self::PartitionHandle).
///
/// ### Contract notes
///
/// - `map_gpa_range` on an already-mapped GPA *replaces* the mapping; it
///   never frees host memory. The caller owns all host backing.
/// - `translate_gva` reports its [`TranslationResult`] alongside the GPA:
///   a walk can complete and still find the physical page unmapped.
/// - `run_virtual_processor` blocks until the guest exits; a canceller
///   obtained beforehand may unblock it from another thread.
pub trait PlatformDriver {
    /// Opaque per-partition state.
    type PartitionHandle;

    /// Cross-thread cancellation handle for a virtual processor.
    type Canceller: VpCanceller + Send + 'static;

    /// Whether a hypervisor is present and usable. Call before anything
    /// else.
    fn hypervisor_present(&self) -> bool;

    /// Vendor of the processor the hypervisor virtualizes.
    fn processor_vendor(&self) -> PlatformResult<ProcessorVendor>;

    /// Installed host memory in KiB; bounds the guest physical space.
    fn installed_memory_kib(&self) -> PlatformResult<u64>;

    fn create_partition(&self) -> PlatformResult<Self::PartitionHandle>;

    /// Constrain the partition to `count` processors. Must precede
    /// [`setup_partition`](Self::setup_partition).
    fn set_processor_count(
        &self,
        handle: &Self::PartitionHandle,
        count: u32,
    ) -> PlatformResult<()>;

    /// Finalize partition properties; required before processor creation.
    fn setup_partition(&self, handle: &Self::PartitionHandle) -> PlatformResult<()>;

    fn delete_partition(&self, handle: &mut Self::PartitionHandle) -> PlatformResult<()>;

    fn create_virtual_processor(
        &self,
        handle: &Self::PartitionHandle,
        index: u32,
    ) -> PlatformResult<()>;

    fn delete_virtual_processor(
        &self,
        handle: &Self::PartitionHandle,
        index: u32,
    ) -> PlatformResult<()>;

    /// Run the processor until the next exit.
    fn run_virtual_processor(
        &self,
        handle: &Self::PartitionHandle,
        index: u32,
    ) -> PlatformResult<VpExitContext>;

    /// A handle that cancels a concurrent
    /// [`run_virtual_processor`](Self::run_virtual_processor) on this
    /// processor.
    fn canceller(&self, handle: &Self::PartitionHandle, index: u32) -> Self::Canceller;

    /// Bulk register read; `values[i]` receives the value of `names[i]`.
    fn get_registers(
        &self,
        handle: &Self::PartitionHandle,
        index: u32,
        names: &[RegisterName],
        values: &mut [RegisterValue],
    ) -> PlatformResult<()>;

    /// Bulk register write; `values[i]` is applied to `names[i]`.
    fn set_registers(
        &self,
        handle: &Self::PartitionHandle,
        index: u32,
        names: &[RegisterName],
        values: &[RegisterValue],
    ) -> PlatformResult<()>;

    /// Map `size` bytes of host memory at `host` onto guest physical
    /// `gpa` with the given access.
    fn map_gpa_range(
        &self,
        handle: &Self::PartitionHandle,
        host: Hva,
        gpa: Gpa,
        size: u64,
        flags: MemoryAccessFlags,
    ) -> PlatformResult<()>;

    /// Remove the guest physical mapping at `gpa`.
    fn unmap_gpa_range(
        &self,
        handle: &Self::PartitionHandle,
        gpa: Gpa,
        size: u64,
    ) -> PlatformResult<()>;

    /// Translate a guest virtual address through the guest's paging
    /// structures.
    fn translate_gva(
        &self,
        handle: &Self::PartitionHandle,
        index: u32,
        gva: Gva,
        flags: TranslateFlags,
    ) -> PlatformResult<(TranslationResult, Gpa)>;
}
