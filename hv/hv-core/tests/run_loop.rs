//! Exit dispatch, synthetic ISR delivery and cancellation against the
//! software platform driver.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use hv_addresses::{Gva, MIB, PAGE_SIZE};
use hv_core::{CpuMode, Partition, VmError, VpExitHandler};
use hv_descriptors::ExceptionVector;
use hv_mock::{MockDriver, MockHandle};
use hv_platform::{
    ExecutionState, IoPortAccessContext, MemoryAccessContext, MemoryAccessInfo, MemoryAccessType,
    MemoryAccessFlags, VpContext, VpExit, VpExitContext, VpExitReason,
};
use hv_registers::{Register, RegisterName};

fn new_partition(mode: CpuMode) -> (Partition<MockDriver>, MockHandle) {
    let driver = MockDriver::new();
    let mut partition = Partition::create(driver).expect("create partition");
    let handle = partition.platform_handle().clone();
    partition.create_processor(mode).expect("create processor");
    partition
        .initialize_memory_layout()
        .expect("initialize layout");
    partition.register_default_exit_callbacks();
    (partition, handle)
}

fn halt_exit() -> VpExitContext {
    VpExitContext {
        vp_context: VpContext::default(),
        exit: VpExit::Halt,
    }
}

fn memory_access_exit(gva: Gva) -> VpExitContext {
    VpExitContext {
        vp_context: VpContext::default(),
        exit: VpExit::MemoryAccess(MemoryAccessContext {
            access_info: MemoryAccessInfo::new()
                .with_access_type(MemoryAccessType::Execute)
                .with_gva_valid(true),
            gpa: hv_addresses::Gpa::zero(),
            gva,
        }),
    }
}

/// `mov rax, 0x1337`, staged at an explicit base with an explicit
/// stack, the way a front-end drives a user-mode payload.
#[test]
fn staged_code_and_stack_land_where_requested() {
    let (mut partition, handle) = new_partition(CpuMode::User);

    let code = [0x48, 0xC7, 0xC0, 0x37, 0x13, 0x00, 0x00];
    let stack_base = Gva::new(0x7FFF_0000_0000 - 16 * MIB);

    let (_stack_hva, stack_gva) = partition
        .allocate_guest_virtual(Some(stack_base), MIB, MemoryAccessFlags::RW)
        .expect("stack");
    assert_eq!(stack_gva, stack_base);

    let (code_hva, code_gva) = partition
        .allocate_guest_virtual(Some(Gva::new(0x10000)), code.len() as u64, MemoryAccessFlags::RWX)
        .expect("code");
    assert_eq!(code_gva, Gva::new(0x10000));
    unsafe {
        core::ptr::copy_nonoverlapping(code.as_ptr(), code_hva.as_ptr::<u8>(), code.len());
    }

    let mut registers = partition.get_registers().expect("get");
    registers.set_reg64(Register::Rip, code_gva.as_u64());
    registers.set_reg64(Register::Rsp, stack_gva.as_u64() + MIB - PAGE_SIZE);
    partition.set_registers(&registers).expect("set");

    handle.queue_exit(halt_exit());
    let reason = partition.run_payload().expect("run");
    assert_eq!(reason, VpExitReason::Halt);

    // The payload bytes are visible through the guest's own translation.
    let (result, gpa) = partition.translate_gva_to_gpa(code_gva).expect("translate");
    assert!(result.is_success());
    let mut staged = [0u8; 7];
    assert!(handle.read_guest_memory(gpa, &mut staged));
    assert_eq!(staged, code);
}

#[test]
fn stage_payload_programs_rip_and_rsp() {
    let (mut partition, handle) = new_partition(CpuMode::User);

    let layout = partition.stage_payload(&[0x90], None).expect("stage");
    assert_eq!(
        handle.register(RegisterName::Rip).reg64(),
        layout.entrypoint.as_u64()
    );
    assert_eq!(
        handle.register(RegisterName::Rsp).reg64(),
        layout.stack_top.as_u64()
    );
    assert_eq!(
        layout.stack_top.as_u64(),
        layout.stack_base.as_u64() + layout.stack_size - 2 * PAGE_SIZE
    );
}

/// `in al, dx`: the I/O port callback supplies the value and advances
/// RIP past the one-byte instruction.
#[test]
fn io_port_callback_patches_rax() {
    let (mut partition, handle) = new_partition(CpuMode::User);

    partition.register_exit_callback(VpExitHandler::IoPortAccess(Box::new(
        |partition, _vp, ctx| {
            if ctx.port_number != 0x1F0 || ctx.access_info.is_write() {
                return false;
            }
            let mut registers = *partition.registers();
            let rax = (registers.reg64(Register::Rax) & !0xFF) | 0x12;
            registers.set_reg64(Register::Rax, rax);
            let rip = registers.reg64(Register::Rip) + 1;
            registers.set_reg64(Register::Rip, rip);
            partition.set_registers(&registers).is_ok()
        },
    )));

    handle.queue_exit(VpExitContext {
        vp_context: VpContext::default(),
        exit: VpExit::IoPortAccess(IoPortAccessContext {
            port_number: 0x1F0,
            ..IoPortAccessContext::default()
        }),
    });
    handle.queue_exit(halt_exit());

    let reason = partition.run_processor().expect("run");
    assert_eq!(reason, VpExitReason::Halt);
    assert_eq!(handle.register(RegisterName::Rax).reg64() & 0xFF, 0x12);
}

/// A page-fault landing in the IDT trap page reaches the vector-14 ISR,
/// which repairs the fault by mapping the touched page and retrying.
#[test]
fn page_fault_isr_repairs_and_retries() {
    let (mut partition, handle) = new_partition(CpuMode::User);
    let trap = partition.memory_layout().idt_trap_page();

    let layout = partition.stage_payload(&[0x90], None).expect("stage");

    // Simulate the CPU having delivered a page fault: error code and
    // interrupt frame pushed onto the guest stack.
    let interrupted_rsp = layout.stack_top.as_u64();
    let frame_rsp = interrupted_rsp - 48;
    let frame = [
        0x4005u64,          // error code slot (only low 32 bits count)
        layout.entrypoint.as_u64(), // rip
        0x1B,               // cs
        0x202,              // rflags
        interrupted_rsp,    // rsp
        0x23,               // ss
    ];
    let mut bytes = Vec::new();
    for qword in frame {
        bytes.extend_from_slice(&qword.to_le_bytes());
    }
    let (result, stack_gpa) = partition
        .translate_gva_to_gpa(Gva::new(frame_rsp))
        .expect("translate stack");
    assert!(result.is_success());
    assert!(handle.write_guest_memory(stack_gpa, &bytes));

    let mut registers = partition.get_registers().expect("get");
    registers.set_reg64(Register::Rsp, frame_rsp);
    partition.set_registers(&registers).expect("set");

    let fault_gva = Gva::new(0xDEAD_BEEF);
    let isr_calls = Arc::new(AtomicUsize::new(0));
    let isr_seen = Arc::clone(&isr_calls);
    partition.register_isr_callback(
        ExceptionVector::PageFault.number(),
        Box::new(move |partition, frame, error_code| {
            isr_seen.fetch_add(1, Ordering::SeqCst);
            assert_eq!(error_code, 0x4005);
            assert_eq!(frame.cs, 0x1B);
            partition
                .allocate_guest_virtual(Some(Gva::new(0xDEAD_BEEF)), PAGE_SIZE, MemoryAccessFlags::RW)
                .is_ok()
        }),
    );

    handle.queue_exit(memory_access_exit(Gva::new(
        trap.as_u64() + u64::from(ExceptionVector::PageFault.number()) * 8,
    )));
    handle.queue_exit(halt_exit());

    let reason = partition.run_processor().expect("run");
    assert_eq!(reason, VpExitReason::Halt);
    assert_eq!(isr_calls.load(Ordering::SeqCst), 1);

    // The faulting page is now mapped and translates.
    let (result, _) = partition.translate_gva_to_gpa(fault_gva).expect("translate");
    assert!(result.is_success());

    // The interrupted context was restored from the frame.
    assert_eq!(
        handle.register(RegisterName::Rip).reg64(),
        layout.entrypoint.as_u64()
    );
    assert_eq!(handle.register(RegisterName::Rsp).reg64(), interrupted_rsp);
}

/// A ring-3 unrecoverable exception escalates to kernel selectors for
/// one ISR round trip, then drops back to user selectors.
#[test]
fn ring3_escalation_is_unwound_after_the_isr() {
    let (mut partition, handle) = new_partition(CpuMode::User);
    let trap = partition.memory_layout().idt_trap_page();
    let layout = partition.stage_payload(&[0x90], None).expect("stage");

    // Stack: frame without error code (vector 6, invalid opcode).
    let interrupted_rsp = layout.stack_top.as_u64();
    let frame_rsp = interrupted_rsp - 40;
    let frame = [
        layout.entrypoint.as_u64(),
        0x1Bu64,
        0x202,
        interrupted_rsp,
        0x23,
    ];
    let mut bytes = Vec::new();
    for qword in frame {
        bytes.extend_from_slice(&qword.to_le_bytes());
    }
    let (_, stack_gpa) = partition
        .translate_gva_to_gpa(Gva::new(frame_rsp))
        .expect("translate");
    assert!(handle.write_guest_memory(stack_gpa, &bytes));
    let mut registers = partition.get_registers().expect("get");
    registers.set_reg64(Register::Rsp, frame_rsp);
    partition.set_registers(&registers).expect("set");

    partition.register_isr_callback(
        ExceptionVector::InvalidOpcode.number(),
        Box::new(|partition, _frame, _error_code| {
            // The ISR runs with kernel selectors courtesy of the
            // escalation.
            let cs = partition.registers().segment(Register::Cs);
            assert_eq!(cs.selector, 0x08);
            true
        }),
    );

    let ring3 = VpContext {
        execution_state: ExecutionState::new().with_cpl(3),
        ..VpContext::default()
    };
    handle.queue_exit(VpExitContext {
        vp_context: ring3,
        exit: VpExit::UnrecoverableException,
    });
    handle.queue_exit(memory_access_exit(Gva::new(
        trap.as_u64() + u64::from(ExceptionVector::InvalidOpcode.number()) * 8,
    )));
    handle.queue_exit(halt_exit());

    let reason = partition.run_processor().expect("run");
    assert_eq!(reason, VpExitReason::Halt);

    // Back on user selectors after the ISR returned.
    let cs = handle
        .register(RegisterName::Cs)
        .segment()
        .expect("CS shape");
    assert_eq!(cs.selector, 0x18 | 3);
}

#[test]
fn exit_callbacks_can_be_queried_and_removed() {
    let (mut partition, _handle) = new_partition(CpuMode::User);
    let slot = hv_core::ExitCallbackSlot::Halt;

    assert!(matches!(
        partition.get_exit_callback(slot),
        Some(VpExitHandler::Halt(_))
    ));
    assert!(partition.exit_callback_registered(slot));

    partition.unregister_exit_callback(slot).expect("unregister");
    assert!(partition.get_exit_callback(slot).is_none());
    assert!(matches!(
        partition.unregister_exit_callback(slot),
        Err(VmError::NotFound)
    ));
}

#[test]
fn missing_exit_callback_is_an_internal_error() {
    let (mut partition, handle) = new_partition(CpuMode::User);
    partition
        .unregister_exit_callback(hv_core::ExitCallbackSlot::Halt)
        .expect("unregister");

    handle.queue_exit(halt_exit());
    assert!(matches!(
        partition.run_processor(),
        Err(VmError::Internal(_))
    ));
}

#[test]
fn cancellation_surfaces_as_a_user_canceled_exit() {
    let (mut partition, _handle) = new_partition(CpuMode::User);

    let canceled = Arc::new(AtomicUsize::new(0));
    let canceled_seen = Arc::clone(&canceled);
    partition.register_exit_callback(VpExitHandler::UserCanceled(Box::new(
        move |_partition, _vp, _ctx| {
            canceled_seen.fetch_add(1, Ordering::SeqCst);
            false
        },
    )));

    let canceller = partition.canceller();
    let runner = std::thread::spawn(move || {
        let reason = partition.run_processor().expect("run");
        (reason, partition)
    });

    std::thread::sleep(Duration::from_millis(50));
    hv_platform::VpCanceller::cancel(&canceller).expect("cancel");

    let (reason, partition) = runner.join().expect("join");
    assert_eq!(reason, VpExitReason::UserCanceled);
    assert_eq!(canceled.load(Ordering::SeqCst), 1);
    partition.delete().expect("delete");
}
