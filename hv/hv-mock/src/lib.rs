//! # Software Platform Driver
//!
//! A pure in-process implementation of
//! [`PlatformDriver`](hv_platform::PlatformDriver), standing in for a real
//! hypervisor the way a mock kernel stands in for the real one during
//! development: state lives in ordinary data structures and the guest
//! never executes an instruction.
//!
//! What it does model faithfully:
//!
//! - **Guest physical mappings**: an ordered map of GPA ranges onto host
//!   memory, with replace-on-remap semantics.
//! - **Address translation**: [`translate_gva`]
//!   (hv_platform::PlatformDriver::translate_gva) genuinely walks the
//!   guest's four-level paging tree through the mapped ranges, reading
//!   table entries out of host memory. `PageNotPresent` and `GpaUnmapped`
//!   therefore fall out of real paging state, not scripting.
//! - **Cancellation**: a run call with nothing to deliver blocks until an
//!   exit is queued or a canceller fires, from any thread.
//!
//! What it leaves to the test: exits. [`MockHandle::queue_exit`] scripts
//! the exit stream the virtual processor will deliver.

use hv_addresses::{Gpa, Gva, Hva, PAGE_SIZE};
use hv_paging::PageIndices;
use hv_platform::{
    CancelContext, MemoryAccessFlags, PlatformDriver, PlatformError, PlatformResult,
    ProcessorVendor, TranslateFlags, TranslationResult, VpCanceller, VpExit, VpExitContext,
};
use hv_registers::{RegisterName, RegisterValue, SegmentRegister, TableRegister};
use log::trace;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Result code for a run call that waited too long for scripted exits.
pub const E_RUN_TIMED_OUT: u32 = 0x8000_0102;

/// Result code for operations against state that does not exist.
pub const E_INVALID_STATE: u32 = 0x8000_0005;

/// How long a run call waits for an exit or cancellation before failing
/// the test that forgot to script one.
const RUN_WAIT: Duration = Duration::from_secs(10);

#[derive(Copy, Clone, Debug)]
struct MappedRange {
    host: Hva,
    size: u64,
    #[allow(dead_code)]
    flags: MemoryAccessFlags,
}

#[derive(Default)]
struct MockState {
    mappings: BTreeMap<u64, MappedRange>,
    registers: HashMap<RegisterName, RegisterValue>,
    pending_exits: VecDeque<VpExitContext>,
    cancel_pending: bool,
    vp_created: bool,
    set_up: bool,
}

struct MockVm {
    state: Mutex<MockState>,
    wakeup: Condvar,
}

/// Partition handle of the mock driver.
///
/// Cloning shares the underlying partition; tests keep a clone around to
/// script exits and inspect state while the core owns the original.
#[derive(Clone)]
pub struct MockHandle(Arc<MockVm>);

/// The mock driver facade.
#[derive(Copy, Clone)]
pub struct MockDriver {
    /// Installed "host" memory reported to the core, in KiB.
    pub installed_memory_kib: u64,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    /// A driver reporting 4 GiB of installed memory.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            installed_memory_kib: 4 * 1024 * 1024,
        }
    }

    /// A driver reporting a specific installed memory size.
    #[must_use]
    pub const fn with_memory_kib(installed_memory_kib: u64) -> Self {
        Self {
            installed_memory_kib,
        }
    }
}

/// Canceller for a mock virtual processor.
pub struct MockCanceller(Arc<MockVm>);

impl VpCanceller for MockCanceller {
    fn cancel(&self) -> PlatformResult<()> {
        let mut state = self.0.state.lock().expect("mock state poisoned");
        state.cancel_pending = true;
        self.0.wakeup.notify_all();
        Ok(())
    }
}

impl MockHandle {
    /// Script the next exit the virtual processor will deliver.
    pub fn queue_exit(&self, exit: VpExitContext) {
        let mut state = self.0.state.lock().expect("mock state poisoned");
        state.pending_exits.push_back(exit);
        self.0.wakeup.notify_all();
    }

    /// Number of live guest-physical mappings.
    #[must_use]
    pub fn mapping_count(&self) -> usize {
        self.0.state.lock().expect("mock state poisoned").mappings.len()
    }

    /// Whether any mapping covers `gpa`.
    #[must_use]
    pub fn is_mapped(&self, gpa: Gpa) -> bool {
        self.0
            .state
            .lock()
            .expect("mock state poisoned")
            .resolve(gpa, 1)
            .is_some()
    }

    /// Read guest-physical memory through the mapping table.
    ///
    /// Returns `false` when the range is not fully mapped.
    #[must_use]
    pub fn read_guest_memory(&self, gpa: Gpa, buf: &mut [u8]) -> bool {
        let state = self.0.state.lock().expect("mock state poisoned");
        let Some(host) = state.resolve(gpa, buf.len() as u64) else {
            return false;
        };
        // SAFETY: the range was mapped from live host memory owned by the
        // caller of map_gpa_range and resolve checked the bounds.
        unsafe {
            core::ptr::copy_nonoverlapping(host.as_ptr::<u8>(), buf.as_mut_ptr(), buf.len());
        }
        true
    }

    /// Write guest-physical memory through the mapping table.
    #[must_use]
    pub fn write_guest_memory(&self, gpa: Gpa, buf: &[u8]) -> bool {
        let state = self.0.state.lock().expect("mock state poisoned");
        let Some(host) = state.resolve(gpa, buf.len() as u64) else {
            return false;
        };
        // SAFETY: as in read_guest_memory.
        unsafe {
            core::ptr::copy_nonoverlapping(buf.as_ptr(), host.as_ptr::<u8>(), buf.len());
        }
        true
    }

    /// Current value of a register as the guest would see it.
    #[must_use]
    pub fn register(&self, name: RegisterName) -> RegisterValue {
        self.0
            .state
            .lock()
            .expect("mock state poisoned")
            .register(name)
    }
}

impl MockState {
    /// Resolve a guest physical range to its host address, if a single
    /// mapping covers all of it.
    fn resolve(&self, gpa: Gpa, len: u64) -> Option<Hva> {
        let addr = gpa.as_u64();
        let (&base, range) = self.mappings.range(..=addr).next_back()?;
        if addr + len > base + range.size {
            return None;
        }
        Some(Hva::new(range.host.as_u64() + (addr - base)))
    }

    fn register(&self, name: RegisterName) -> RegisterValue {
        self.registers
            .get(&name)
            .copied()
            .unwrap_or_else(|| default_value(name))
    }

    /// Walk the guest paging tree for `gva`.
    fn translate(&self, gva: Gva) -> (TranslationResult, Gpa) {
        let cr3 = self.register(RegisterName::Cr3).reg64();
        let ix = PageIndices::decompose(gva);

        let mut table = Gpa::new(cr3).page_base();
        for (level, index) in [(4u8, ix.pml4), (3, ix.pdp), (2, ix.pd), (1, ix.pt)] {
            let Some(raw) = self.read_qword(table.add(u64::from(index) * 8)) else {
                return (TranslationResult::GpaUnmapped, Gpa::zero());
            };
            let entry = hv_paging::PageTableEntry::from_bits(raw);
            if !entry.valid() {
                return (TranslationResult::PageNotPresent, Gpa::zero());
            }
            let frame = entry.frame_base();
            if level == 1 {
                let gpa = frame.add(u64::from(ix.offset));
                if self.resolve(gpa, 1).is_none() {
                    return (TranslationResult::GpaUnmapped, gpa);
                }
                return (TranslationResult::Success, gpa);
            }
            table = frame;
        }
        unreachable!("walk terminates at level 1");
    }

    fn read_qword(&self, gpa: Gpa) -> Option<u64> {
        let host = self.resolve(gpa, 8)?;
        // SAFETY: resolve bounds-checked the mapped host range.
        Some(unsafe { core::ptr::read_unaligned(host.as_ptr::<u64>()) })
    }
}

/// Platform default for registers the core has not set yet.
fn default_value(name: RegisterName) -> RegisterValue {
    match name {
        RegisterName::Gs
        | RegisterName::Fs
        | RegisterName::Es
        | RegisterName::Ds
        | RegisterName::Cs
        | RegisterName::Ss
        | RegisterName::Ldtr
        | RegisterName::Tr => RegisterValue::Segment(SegmentRegister::default()),
        RegisterName::Gdtr | RegisterName::Idtr => RegisterValue::Table(TableRegister::default()),
        _ => RegisterValue::Reg64(0),
    }
}

impl PlatformDriver for MockDriver {
    type PartitionHandle = MockHandle;
    type Canceller = MockCanceller;

    fn hypervisor_present(&self) -> bool {
        true
    }

    fn processor_vendor(&self) -> PlatformResult<ProcessorVendor> {
        Ok(ProcessorVendor::Amd)
    }

    fn installed_memory_kib(&self) -> PlatformResult<u64> {
        Ok(self.installed_memory_kib)
    }

    fn create_partition(&self) -> PlatformResult<Self::PartitionHandle> {
        Ok(MockHandle(Arc::new(MockVm {
            state: Mutex::new(MockState::default()),
            wakeup: Condvar::new(),
        })))
    }

    fn set_processor_count(
        &self,
        _handle: &Self::PartitionHandle,
        count: u32,
    ) -> PlatformResult<()> {
        if count == 1 {
            Ok(())
        } else {
            Err(PlatformError::new(E_INVALID_STATE))
        }
    }

    fn setup_partition(&self, handle: &Self::PartitionHandle) -> PlatformResult<()> {
        let mut state = handle.0.state.lock().expect("mock state poisoned");
        if state.set_up {
            return Err(PlatformError::new(E_INVALID_STATE));
        }
        state.set_up = true;
        Ok(())
    }

    fn delete_partition(&self, handle: &mut Self::PartitionHandle) -> PlatformResult<()> {
        // Mappings are left alone: a correct caller has unmapped them
        // already, and tests inspect exactly that.
        let mut state = handle.0.state.lock().expect("mock state poisoned");
        state.set_up = false;
        Ok(())
    }

    fn create_virtual_processor(
        &self,
        handle: &Self::PartitionHandle,
        _index: u32,
    ) -> PlatformResult<()> {
        let mut state = handle.0.state.lock().expect("mock state poisoned");
        if !state.set_up || state.vp_created {
            return Err(PlatformError::new(E_INVALID_STATE));
        }
        state.vp_created = true;
        Ok(())
    }

    fn delete_virtual_processor(
        &self,
        handle: &Self::PartitionHandle,
        _index: u32,
    ) -> PlatformResult<()> {
        let mut state = handle.0.state.lock().expect("mock state poisoned");
        if !state.vp_created {
            return Err(PlatformError::new(E_INVALID_STATE));
        }
        state.vp_created = false;
        Ok(())
    }

    fn run_virtual_processor(
        &self,
        handle: &Self::PartitionHandle,
        _index: u32,
    ) -> PlatformResult<VpExitContext> {
        let mut state = handle.0.state.lock().expect("mock state poisoned");
        loop {
            if state.cancel_pending {
                state.cancel_pending = false;
                trace!("mock vp run observed cancellation");
                return Ok(VpExitContext {
                    vp_context: Default::default(),
                    exit: VpExit::Canceled(CancelContext { cancel_reason: 0 }),
                });
            }
            if let Some(exit) = state.pending_exits.pop_front() {
                return Ok(exit);
            }
            let (next, timeout) = handle
                .0
                .wakeup
                .wait_timeout(state, RUN_WAIT)
                .expect("mock state poisoned");
            state = next;
            if timeout.timed_out() {
                return Err(PlatformError::new(E_RUN_TIMED_OUT));
            }
        }
    }

    fn canceller(&self, handle: &Self::PartitionHandle, _index: u32) -> Self::Canceller {
        MockCanceller(Arc::clone(&handle.0))
    }

    fn get_registers(
        &self,
        handle: &Self::PartitionHandle,
        _index: u32,
        names: &[RegisterName],
        values: &mut [RegisterValue],
    ) -> PlatformResult<()> {
        if names.len() != values.len() {
            return Err(PlatformError::new(E_INVALID_STATE));
        }
        let state = handle.0.state.lock().expect("mock state poisoned");
        for (name, value) in names.iter().zip(values.iter_mut()) {
            *value = state.register(*name);
        }
        Ok(())
    }

    fn set_registers(
        &self,
        handle: &Self::PartitionHandle,
        _index: u32,
        names: &[RegisterName],
        values: &[RegisterValue],
    ) -> PlatformResult<()> {
        if names.len() != values.len() {
            return Err(PlatformError::new(E_INVALID_STATE));
        }
        let mut state = handle.0.state.lock().expect("mock state poisoned");
        for (name, value) in names.iter().zip(values.iter()) {
            state.registers.insert(*name, *value);
        }
        Ok(())
    }

    fn map_gpa_range(
        &self,
        handle: &Self::PartitionHandle,
        host: Hva,
        gpa: Gpa,
        size: u64,
        flags: MemoryAccessFlags,
    ) -> PlatformResult<()> {
        if host.is_zero() || size == 0 || size % PAGE_SIZE != 0 {
            return Err(PlatformError::new(E_INVALID_STATE));
        }
        let mut state = handle.0.state.lock().expect("mock state poisoned");
        trace!("mock map {gpa:?} -> {host:?} ({size} bytes, {flags:?})");
        state
            .mappings
            .insert(gpa.as_u64(), MappedRange { host, size, flags });
        Ok(())
    }

    fn unmap_gpa_range(
        &self,
        handle: &Self::PartitionHandle,
        gpa: Gpa,
        size: u64,
    ) -> PlatformResult<()> {
        let mut state = handle.0.state.lock().expect("mock state poisoned");
        let start = gpa.as_u64();
        let keys: Vec<u64> = state
            .mappings
            .range(start..start + size)
            .map(|(k, _)| *k)
            .collect();
        if keys.is_empty() {
            return Err(PlatformError::new(E_INVALID_STATE));
        }
        for key in keys {
            state.mappings.remove(&key);
        }
        trace!("mock unmap {gpa:?} ({size} bytes)");
        Ok(())
    }

    fn translate_gva(
        &self,
        handle: &Self::PartitionHandle,
        _index: u32,
        gva: Gva,
        _flags: TranslateFlags,
    ) -> PlatformResult<(TranslationResult, Gpa)> {
        let state = handle.0.state.lock().expect("mock state poisoned");
        Ok(state.translate(gva))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hv_platform::VpExitReason;

    fn mapped_partition() -> (MockDriver, MockHandle, Vec<u8>) {
        let driver = MockDriver::new();
        let handle = driver.create_partition().expect("create");
        driver.setup_partition(&handle).expect("setup");
        // One page of backing memory mapped at GPA 0x1000.
        let mut backing = vec![0u8; PAGE_SIZE as usize];
        driver
            .map_gpa_range(
                &handle,
                Hva::from_ptr(backing.as_mut_ptr()),
                Gpa::new(0x1000),
                PAGE_SIZE,
                MemoryAccessFlags::RW,
            )
            .expect("map");
        (driver, handle, backing)
    }

    #[test]
    fn guest_memory_round_trips_through_the_mapping() {
        let (_driver, handle, backing) = mapped_partition();
        assert!(handle.write_guest_memory(Gpa::new(0x1008), &[0xAA, 0xBB]));
        let mut buf = [0u8; 2];
        assert!(handle.read_guest_memory(Gpa::new(0x1008), &mut buf));
        assert_eq!(buf, [0xAA, 0xBB]);
        assert_eq!(backing[8], 0xAA);
    }

    #[test]
    fn reads_outside_any_mapping_fail() {
        let (_driver, handle, _backing) = mapped_partition();
        let mut buf = [0u8; 4];
        assert!(!handle.read_guest_memory(Gpa::new(0x3000), &mut buf));
        // A read straddling the end of the mapping fails too.
        assert!(!handle.read_guest_memory(Gpa::new(0x1FFE), &mut buf));
    }

    #[test]
    fn scripted_exits_come_back_in_order() {
        let (driver, handle, _backing) = mapped_partition();
        driver.create_virtual_processor(&handle, 0).expect("vp");
        handle.queue_exit(VpExitContext {
            vp_context: Default::default(),
            exit: VpExit::Halt,
        });
        let exit = driver.run_virtual_processor(&handle, 0).expect("run");
        assert_eq!(exit.reason(), VpExitReason::Halt);
    }

    #[test]
    fn cancellation_unblocks_a_waiting_run() {
        let (driver, handle, _backing) = mapped_partition();
        driver.create_virtual_processor(&handle, 0).expect("vp");
        let canceller = driver.canceller(&handle, 0);
        let runner = {
            let driver = driver;
            let handle = handle.clone();
            std::thread::spawn(move || driver.run_virtual_processor(&handle, 0))
        };
        std::thread::sleep(Duration::from_millis(50));
        canceller.cancel().expect("cancel");
        let exit = runner.join().expect("join").expect("run");
        assert_eq!(exit.reason(), VpExitReason::UserCanceled);
    }
}
