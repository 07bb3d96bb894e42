//! Partition lifecycle and the aggregate state record.

use crate::arena::MemoryArena;
use crate::callbacks::{ExitCallbackSlot, ExitCallbacks, IsrCallback, IsrTable, VpExitHandler};
use crate::error::{VmError, VmResult};
use crate::processor::VirtualProcessor;
use crate::tracker::{AllocationNode, AllocationTracker};
use hv_addresses::{Gpa, Gva, Hva};
use hv_platform::PlatformDriver;
use log::{debug, warn};

/// Whether the platform reports a usable hypervisor.
///
/// Call before creating partitions.
#[must_use]
pub fn is_hypervisor_present<P: PlatformDriver>(driver: &P) -> bool {
    driver.hypervisor_present()
}

/// The partition's memory bookkeeping: address-space arena, allocation
/// tracker, paging root and the IDT trap page location.
#[derive(Debug, Default)]
pub struct MemoryLayout {
    pub(crate) arena: Option<MemoryArena>,
    pub(crate) tracker: AllocationTracker,
    pub(crate) pml4_gpa: Gpa,
    pub(crate) pml4_hva: Hva,
    pub(crate) idt_trap_gva: Gva,
}

impl MemoryLayout {
    /// Guest physical address of the PML4 (what CR3 holds).
    #[must_use]
    pub const fn pml4_gpa(&self) -> Gpa {
        self.pml4_gpa
    }

    /// Base of the unmapped page the IDT entries point into.
    #[must_use]
    pub const fn idt_trap_page(&self) -> Gva {
        self.idt_trap_gva
    }
}

/// A guest partition: platform handle, one virtual processor, the memory
/// layout and the callback tables.
pub struct Partition<P: PlatformDriver> {
    pub(crate) driver: P,
    pub(crate) handle: P::PartitionHandle,
    pub(crate) layout: MemoryLayout,
    pub(crate) vp: VirtualProcessor,
    pub(crate) exit_callbacks: ExitCallbacks<P>,
    pub(crate) isr_callbacks: IsrTable<P>,
    /// Most recent failure of a partition operation (sticky).
    last_result: Option<VmError>,
    /// Driver code of the most recent platform failure (sticky).
    last_platform_code: Option<u32>,
}

impl<P: PlatformDriver> Partition<P> {
    /// Create a partition constrained to a single processor.
    ///
    /// The platform partition is opened, limited to one processor and
    /// finalized; the allocation tracker starts empty. The processor
    /// itself and the memory layout are separate steps
    /// ([`create_processor`](Self::create_processor),
    /// [`initialize_memory_layout`](Self::initialize_memory_layout)).
    pub fn create(driver: P) -> VmResult<Self> {
        let mut handle = driver.create_partition()?;

        let setup = driver
            .set_processor_count(&handle, 1)
            .and_then(|()| driver.setup_partition(&handle));
        if let Err(e) = setup {
            if let Err(del) = driver.delete_partition(&mut handle) {
                warn!("failed to delete half-created partition: {del}");
            }
            return Err(e.into());
        }

        debug!("partition created");
        Ok(Self {
            driver,
            handle,
            layout: MemoryLayout::default(),
            vp: VirtualProcessor::default(),
            exit_callbacks: ExitCallbacks::default(),
            isr_callbacks: IsrTable::default(),
            last_result: None,
            last_platform_code: None,
        })
    }

    /// Tear the partition down: walk every allocation record, delete the
    /// virtual processor, destroy the platform partition.
    ///
    /// The teardown keeps going past individual failures; the first error
    /// encountered is returned once everything has been attempted.
    pub fn delete(mut self) -> VmResult<()> {
        let mut first_error: Option<VmError> = None;
        let mut note = |result: VmResult<()>| {
            if let Err(e) = result {
                warn!("partition teardown step failed: {e}");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        };

        note(self.release_all_allocations());
        if self.vp.created {
            note(self.delete_processor());
        }
        note(
            self.driver
                .delete_partition(&mut self.handle)
                .map_err(VmError::from),
        );

        debug!("partition deleted");
        first_error.map_or(Ok(()), Err)
    }

    /// The platform driver this partition runs on.
    #[must_use]
    pub const fn driver(&self) -> &P {
        &self.driver
    }

    /// The platform's partition handle.
    #[must_use]
    pub const fn platform_handle(&self) -> &P::PartitionHandle {
        &self.handle
    }

    /// The memory layout bookkeeping.
    #[must_use]
    pub const fn memory_layout(&self) -> &MemoryLayout {
        &self.layout
    }

    /// A handle that cancels a concurrent
    /// [`run_processor`](Self::run_processor) from another thread.
    #[must_use]
    pub fn canceller(&self) -> P::Canceller {
        self.driver.canceller(&self.handle, self.vp.index)
    }

    /// The most recent failure of a partition operation.
    ///
    /// Memory, processor and run-loop operations record their failures
    /// here before returning them; successes do not clear the cache.
    /// `None` until the first failure.
    #[must_use]
    pub const fn last_result(&self) -> Option<&VmError> {
        self.last_result.as_ref()
    }

    /// The platform driver's code from the most recent platform failure.
    ///
    /// Library-level failures (invalid arguments, lookups, collisions)
    /// leave this untouched; only [`VmError::Platform`] updates it.
    #[must_use]
    pub const fn last_error(&self) -> Option<u32> {
        self.last_platform_code
    }

    /// Cache a failed result for [`last_result`](Self::last_result) /
    /// [`last_error`](Self::last_error) and pass it through.
    pub(crate) fn record<T>(&mut self, result: VmResult<T>) -> VmResult<T> {
        if let Err(e) = &result {
            if let VmError::Platform(platform) = e {
                self.last_platform_code = Some(platform.code);
            }
            self.last_result = Some(e.clone());
        }
        result
    }

    // ---- callback registry -------------------------------------------

    /// Install an exit handler; the variant determines the slot.
    pub fn register_exit_callback(&mut self, handler: VpExitHandler<P>) {
        self.exit_callbacks.register(handler);
    }

    /// Borrow the handler registered in `slot`.
    #[must_use]
    pub fn get_exit_callback(&self, slot: ExitCallbackSlot) -> Option<&VpExitHandler<P>> {
        self.exit_callbacks.get(slot)
    }

    /// Whether `slot` currently has a handler.
    #[must_use]
    pub fn exit_callback_registered(&self, slot: ExitCallbackSlot) -> bool {
        self.exit_callbacks.is_registered(slot)
    }

    /// Remove the handler in `slot`.
    ///
    /// ### Errors
    /// [`VmError::NotFound`] when the slot was empty.
    pub fn unregister_exit_callback(&mut self, slot: ExitCallbackSlot) -> VmResult<()> {
        if self.exit_callbacks.unregister(slot) {
            Ok(())
        } else {
            Err(VmError::NotFound)
        }
    }

    /// Install an interrupt-service callback for `vector`.
    pub fn register_isr_callback(&mut self, vector: u8, handler: IsrCallback<P>) {
        self.isr_callbacks.register(vector, handler);
    }

    /// Whether `vector` currently has an ISR callback.
    #[must_use]
    pub fn isr_callback_registered(&self, vector: u8) -> bool {
        self.isr_callbacks.is_registered(vector)
    }

    /// Remove the ISR callback for `vector`.
    ///
    /// ### Errors
    /// [`VmError::NotFound`] when the vector had none.
    pub fn unregister_isr_callback(&mut self, vector: u8) -> VmResult<()> {
        if self.isr_callbacks.unregister(vector) {
            Ok(())
        } else {
            Err(VmError::NotFound)
        }
    }

    // ---- allocation tracker (advanced) -------------------------------

    /// First allocation record matching `predicate`.
    pub fn find_node(
        &self,
        predicate: impl Fn(&AllocationNode) -> bool,
    ) -> Option<&AllocationNode> {
        self.layout.tracker.find(predicate)
    }

    /// First allocation record whose virtual range contains `gva`.
    #[must_use]
    pub fn find_node_by_gva(&self, gva: Gva) -> Option<&AllocationNode> {
        self.layout.tracker.find_by_gva(gva)
    }

    /// First allocation record whose physical range contains `gpa`.
    #[must_use]
    pub fn find_node_by_gpa(&self, gpa: Gpa) -> Option<&AllocationNode> {
        self.layout.tracker.find_by_gpa(gpa)
    }

    /// Append a record the caller assembled.
    ///
    /// No overlap checking happens here; this is the escape hatch for
    /// callers doing their own mapping through the platform handle.
    pub fn insert_node(&mut self, node: AllocationNode) {
        self.layout.tracker.insert(node);
    }

    /// Number of live allocation records.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.layout.tracker.len()
    }
}
