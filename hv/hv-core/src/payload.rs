//! Payload staging: put shellcode and a stack into the guest and aim the
//! processor at them.

use crate::callbacks::VpExitHandler;
use crate::error::{VmError, VmResult};
use crate::partition::Partition;
use hv_addresses::{Gva, MIB, PAGE_SIZE, align_up};
use hv_platform::{MemoryAccessFlags, PlatformDriver, VpExitReason};
use log::debug;

/// Where a staged payload ended up.
#[derive(Copy, Clone, Debug)]
pub struct PayloadLayout {
    /// First instruction of the payload (initial RIP).
    pub entrypoint: Gva,
    /// Base of the code allocation.
    pub code_base: Gva,
    /// Mapped code size (page multiple).
    pub code_size: u64,
    /// Base of the stack allocation.
    pub stack_base: Gva,
    /// Stack allocation size.
    pub stack_size: u64,
    /// Initial RSP: the top of the stack range minus two pages of
    /// headroom.
    pub stack_top: Gva,
}

/// Default payload stack size.
const STACK_SIZE: u64 = MIB;

/// Headroom left above the initial RSP.
const STACK_GUARD: u64 = 2 * PAGE_SIZE;

impl<P: PlatformDriver> Partition<P> {
    /// Map a stack and the payload bytes into guest virtual memory and
    /// program RIP/RSP.
    ///
    /// The stack is a 1 MiB read-write allocation at an arena-suggested
    /// address; the code lands read-write-execute at `base` (or a
    /// suggested address when `None`). Call after
    /// [`initialize_memory_layout`](Self::initialize_memory_layout).
    pub fn stage_payload(&mut self, code: &[u8], base: Option<Gva>) -> VmResult<PayloadLayout> {
        if code.is_empty() {
            return Err(VmError::InvalidArgument);
        }

        let (_stack_hva, stack_base) =
            self.allocate_guest_virtual(None, STACK_SIZE, MemoryAccessFlags::RW)?;

        let code_size = align_up(code.len() as u64, PAGE_SIZE);
        let (code_hva, code_base) =
            self.allocate_guest_virtual(base, code_size, MemoryAccessFlags::RWX)?;
        // SAFETY: the code allocation is fresh, tracked and at least
        // code.len() bytes.
        unsafe {
            core::ptr::copy_nonoverlapping(code.as_ptr(), code_hva.as_ptr::<u8>(), code.len());
        }

        // The stack grows downward; leave headroom at the very top.
        let stack_top = Gva::new(stack_base.as_u64() + STACK_SIZE - STACK_GUARD);

        let mut registers = self.get_registers()?;
        registers.set_reg64(hv_registers::Register::Rip, code_base.as_u64());
        registers.set_reg64(hv_registers::Register::Rsp, stack_top.as_u64());
        self.set_registers(&registers)?;

        debug!("payload staged: code at {code_base} ({code_size} bytes), stack top {stack_top}");
        Ok(PayloadLayout {
            entrypoint: code_base,
            code_base,
            code_size,
            stack_base,
            stack_size: STACK_SIZE,
            stack_top,
        })
    }

    /// Drive the run loop until the guest produces a real exit.
    pub fn run_payload(&mut self) -> VmResult<VpExitReason> {
        loop {
            let reason = self.run_processor()?;
            if reason != VpExitReason::None {
                return Ok(reason);
            }
        }
    }

    /// Fill all thirteen exit slots with logging, non-retrying handlers.
    ///
    /// A missing callback for an exit that occurs is an internal error;
    /// installing these first means every exit surfaces to the caller
    /// instead. Individual slots can be overridden afterwards.
    pub fn register_default_exit_callbacks(&mut self) {
        self.register_exit_callback(VpExitHandler::MemoryAccess(Box::new(|_, _, ctx| {
            debug!("memory access exit at {} (gpa {})", ctx.gva, ctx.gpa);
            false
        })));
        self.register_exit_callback(VpExitHandler::IoPortAccess(Box::new(|_, _, ctx| {
            debug!("io port exit on port {:#x}", ctx.port_number);
            false
        })));
        self.register_exit_callback(VpExitHandler::UnrecoverableException(Box::new(|_, _| {
            debug!("unrecoverable exception exit");
            false
        })));
        self.register_exit_callback(VpExitHandler::InvalidVpRegisterValue(Box::new(|_, _| {
            debug!("invalid register value exit");
            false
        })));
        self.register_exit_callback(VpExitHandler::UnsupportedFeature(Box::new(|_, _, ctx| {
            debug!("unsupported feature exit (code {})", ctx.feature_code);
            false
        })));
        self.register_exit_callback(VpExitHandler::InterruptWindow(Box::new(|_, _, _| {
            debug!("interrupt window exit");
            false
        })));
        self.register_exit_callback(VpExitHandler::Halt(Box::new(|_, _| {
            debug!("halt exit");
            false
        })));
        self.register_exit_callback(VpExitHandler::ApicEoi(Box::new(|_, _, ctx| {
            debug!("apic eoi exit (vector {})", ctx.interrupt_vector);
            false
        })));
        self.register_exit_callback(VpExitHandler::MsrAccess(Box::new(|_, _, ctx| {
            debug!("msr access exit (msr {:#x})", ctx.msr_number);
            false
        })));
        self.register_exit_callback(VpExitHandler::Cpuid(Box::new(|_, _, ctx| {
            debug!("cpuid exit (leaf {:#x})", ctx.rax);
            false
        })));
        self.register_exit_callback(VpExitHandler::Exception(Box::new(|_, _, ctx| {
            debug!("exception exit (type {})", ctx.exception_type);
            false
        })));
        self.register_exit_callback(VpExitHandler::Rdtsc(Box::new(|_, _, _| {
            debug!("rdtsc exit");
            false
        })));
        self.register_exit_callback(VpExitHandler::UserCanceled(Box::new(|_, _, _| {
            debug!("user canceled exit");
            false
        })));
    }
}
