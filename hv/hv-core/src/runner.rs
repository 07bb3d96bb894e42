//! The virtual-processor run loop and synthetic ISR dispatch.
//!
//! One iteration: run the processor, re-read the full register snapshot,
//! dispatch the exit to its callback, loop while the callback asks for a
//! retry. A memory access landing in the IDT trap page is not a normal
//! exit: the faulting address encodes the interrupt vector, and the
//! dispatcher reconstructs the CPU-pushed interrupt frame from the guest
//! stack and hands it to the vector's ISR callback instead.

use crate::callbacks::{BasicCallback, ContextCallback, ExitCallbackSlot, VpExitHandler};
use crate::error::{VmError, VmResult};
use crate::partition::Partition;
use crate::processor::CpuMode;
use hv_addresses::{Gva, Hva};
use hv_descriptors::{ExceptionVector, InterruptFrame};
use hv_platform::{
    MemoryAccessContext, PlatformDriver, VpContext, VpExit, VpExitContext, VpExitReason,
};
use hv_registers::Register;
use log::trace;

impl<P: PlatformDriver> Partition<P> {
    /// Run the virtual processor until an exit its callback does not
    /// retry.
    ///
    /// Returns the exit reason the loop stopped on. Callbacks observe
    /// the register snapshot as of the exit; a callback returning `true`
    /// re-enters the guest without surfacing the exit to the caller.
    pub fn run_processor(&mut self) -> VmResult<VpExitReason> {
        let result = self.run_exit_loop();
        self.record(result)
    }

    fn run_exit_loop(&mut self) -> VmResult<VpExitReason> {
        loop {
            let exit = self
                .driver
                .run_virtual_processor(&self.handle, self.vp.index)?;
            self.vp.exit_context = Some(exit);
            self.get_registers()?;

            let retry = self.dispatch_exit(&exit)?;
            if !retry {
                return Ok(exit.reason());
            }
            trace!("callback requested retry after {:?}", exit.reason());
        }
    }

    fn dispatch_exit(&mut self, exit: &VpExitContext) -> VmResult<bool> {
        let vp_context = exit.vp_context;
        match &exit.exit {
            VpExit::None => Ok(false),

            VpExit::MemoryAccess(ctx) => {
                let trap = self.layout.idt_trap_gva;
                if !trap.is_zero() && ctx.gva.page_base() == trap {
                    self.dispatch_isr(ctx)
                } else {
                    self.invoke(
                        ExitCallbackSlot::MemoryAccess,
                        |h| match h {
                            VpExitHandler::MemoryAccess(cb) => Some(cb),
                            _ => None,
                        },
                        &vp_context,
                        ctx,
                    )
                }
            }

            VpExit::IoPortAccess(ctx) => self.invoke(
                ExitCallbackSlot::IoPortAccess,
                |h| match h {
                    VpExitHandler::IoPortAccess(cb) => Some(cb),
                    _ => None,
                },
                &vp_context,
                ctx,
            ),

            VpExit::UnrecoverableException => {
                // A ring-3 payload cannot take its own faults: retry the
                // exit once with kernel selectors so the ISR machinery
                // can service it, then drop back after the ISR returns.
                if vp_context.execution_state.cpl() == 3 && !self.vp.escalated {
                    self.switch_processor_mode(CpuMode::Kernel);
                    let registers = self.vp.registers;
                    self.set_registers(&registers)?;
                    self.vp.escalated = true;
                    trace!("escalated ring-3 unrecoverable exception");
                    return Ok(true);
                }
                self.invoke_basic(
                    ExitCallbackSlot::UnrecoverableException,
                    |h| match h {
                        VpExitHandler::UnrecoverableException(cb) => Some(cb),
                        _ => None,
                    },
                    &vp_context,
                )
            }

            VpExit::InvalidVpRegisterValue => self.invoke_basic(
                ExitCallbackSlot::InvalidVpRegisterValue,
                |h| match h {
                    VpExitHandler::InvalidVpRegisterValue(cb) => Some(cb),
                    _ => None,
                },
                &vp_context,
            ),

            VpExit::UnsupportedFeature(ctx) => self.invoke(
                ExitCallbackSlot::UnsupportedFeature,
                |h| match h {
                    VpExitHandler::UnsupportedFeature(cb) => Some(cb),
                    _ => None,
                },
                &vp_context,
                ctx,
            ),

            VpExit::InterruptWindow(ctx) => self.invoke(
                ExitCallbackSlot::InterruptWindow,
                |h| match h {
                    VpExitHandler::InterruptWindow(cb) => Some(cb),
                    _ => None,
                },
                &vp_context,
                ctx,
            ),

            VpExit::Halt => self.invoke_basic(
                ExitCallbackSlot::Halt,
                |h| match h {
                    VpExitHandler::Halt(cb) => Some(cb),
                    _ => None,
                },
                &vp_context,
            ),

            VpExit::ApicEoi(ctx) => self.invoke(
                ExitCallbackSlot::ApicEoi,
                |h| match h {
                    VpExitHandler::ApicEoi(cb) => Some(cb),
                    _ => None,
                },
                &vp_context,
                ctx,
            ),

            VpExit::MsrAccess(ctx) => self.invoke(
                ExitCallbackSlot::MsrAccess,
                |h| match h {
                    VpExitHandler::MsrAccess(cb) => Some(cb),
                    _ => None,
                },
                &vp_context,
                ctx,
            ),

            VpExit::Cpuid(ctx) => self.invoke(
                ExitCallbackSlot::Cpuid,
                |h| match h {
                    VpExitHandler::Cpuid(cb) => Some(cb),
                    _ => None,
                },
                &vp_context,
                ctx,
            ),

            VpExit::Exception(ctx) => self.invoke(
                ExitCallbackSlot::Exception,
                |h| match h {
                    VpExitHandler::Exception(cb) => Some(cb),
                    _ => None,
                },
                &vp_context,
                ctx,
            ),

            VpExit::Rdtsc(ctx) => self.invoke(
                ExitCallbackSlot::Rdtsc,
                |h| match h {
                    VpExitHandler::Rdtsc(cb) => Some(cb),
                    _ => None,
                },
                &vp_context,
                ctx,
            ),

            VpExit::Canceled(ctx) => self.invoke(
                ExitCallbackSlot::UserCanceled,
                |h| match h {
                    VpExitHandler::UserCanceled(cb) => Some(cb),
                    _ => None,
                },
                &vp_context,
                ctx,
            ),
        }
    }

    /// Take the handler out of `slot`, call its payload-carrying
    /// callback, and put it back unless the callback replaced itself
    /// meanwhile.
    ///
    /// `pick` projects the slot's handler variant onto its callback;
    /// registration guarantees the variant matches, so a `None` from it
    /// is an internal fault.
    fn invoke<C>(
        &mut self,
        slot: ExitCallbackSlot,
        pick: impl Fn(&mut VpExitHandler<P>) -> Option<&mut ContextCallback<P, C>>,
        vp_context: &VpContext,
        ctx: &C,
    ) -> VmResult<bool> {
        let mut handler = self
            .exit_callbacks
            .take(slot)
            .ok_or(VmError::Internal("no callback registered for exit reason"))?;
        let outcome = pick(&mut handler).map(|callback| callback(self, vp_context, ctx));
        self.exit_callbacks.restore(slot, handler);
        outcome.ok_or(VmError::Internal("exit handler does not match its slot"))
    }

    /// As [`invoke`](Self::invoke), for payload-less callbacks.
    fn invoke_basic(
        &mut self,
        slot: ExitCallbackSlot,
        pick: impl Fn(&mut VpExitHandler<P>) -> Option<&mut BasicCallback<P>>,
        vp_context: &VpContext,
    ) -> VmResult<bool> {
        let mut handler = self
            .exit_callbacks
            .take(slot)
            .ok_or(VmError::Internal("no callback registered for exit reason"))?;
        let outcome = pick(&mut handler).map(|callback| callback(self, vp_context));
        self.exit_callbacks.restore(slot, handler);
        outcome.ok_or(VmError::Internal("exit handler does not match its slot"))
    }

    /// Service a memory access that landed in the IDT trap page.
    ///
    /// The page offset encodes the vector (`offset / 8`). The interrupt
    /// frame the CPU pushed sits on the guest stack; it is read through
    /// the stack allocation's host backing, popped off RSP, and handed to
    /// the vector's ISR callback. Afterwards RIP/CS/RFLAGS/RSP/SS are
    /// restored from the frame, and a pending ring-3 escalation is
    /// unwound.
    #[allow(clippy::cast_possible_truncation)]
    fn dispatch_isr(&mut self, ctx: &MemoryAccessContext) -> VmResult<bool> {
        let vector = (ctx.gva.page_offset() / size_of::<u64>() as u64) as u8;
        if !self.isr_callbacks.is_registered(vector) {
            return Err(VmError::Internal("no ISR callback for trapped vector"));
        }

        // Locate the guest stack's host backing.
        let rsp = self.vp.registers.reg64(Register::Rsp);
        let node = self
            .layout
            .tracker
            .find_by_gva(Gva::new(rsp))
            .ok_or(VmError::NotFound)?;
        let mut stack_hva = Hva::new(node.hva().as_u64() + (rsp - node.gva.as_u64()));

        let error_code = if ExceptionVector::pushes_error_code(vector) {
            // SAFETY: rsp lies inside the tracked stack allocation; the
            // CPU pushed the error code at the interrupted stack top.
            let code = unsafe { stack_hva.as_ptr::<u32>().read_unaligned() };
            stack_hva = stack_hva.add(size_of::<u64>() as u64);
            code
        } else {
            0
        };

        // SAFETY: the frame follows the (optional) error code on the
        // tracked stack.
        let frame = unsafe { stack_hva.as_ptr::<InterruptFrame>().read_unaligned() };

        // Pop the frame before the ISR runs.
        let mut registers = self.vp.registers;
        registers.set_reg64(Register::Rsp, rsp + size_of::<InterruptFrame>() as u64);
        self.set_registers(&registers)?;

        trace!("dispatching ISR vector {vector} (error code {error_code:#x})");
        let mut isr = self
            .isr_callbacks
            .take(vector)
            .ok_or(VmError::Internal("no ISR callback for trapped vector"))?;
        let retry = isr(self, &frame, error_code);
        self.isr_callbacks.restore(vector, isr);

        // Restore the interrupted context from the frame.
        let mut registers = self.vp.registers;
        registers.set_reg64(Register::Rip, frame.rip);
        registers.segment_mut(Register::Cs).selector = frame.cs as u16;
        registers.set_reg64(Register::Rflags, frame.rflags);
        registers.set_reg64(Register::Rsp, frame.rsp);
        registers.segment_mut(Register::Ss).selector = frame.ss as u16;
        self.set_registers(&registers)?;

        // Ring-3 payloads serviced under an escalation drop back to user
        // selectors once the ISR is done.
        if self.vp.escalated {
            self.switch_processor_mode(CpuMode::User);
            let registers = self.vp.registers;
            self.set_registers(&registers)?;
            self.vp.escalated = false;
        }

        Ok(retry)
    }
}
