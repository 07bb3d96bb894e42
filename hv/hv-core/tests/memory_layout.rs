//! Memory subsystem behavior against the software platform driver.

use hv_addresses::{Gva, MIB, PAGE_SIZE};
use hv_core::{BlockType, CpuMode, Partition, VmError};
use hv_mock::{MockDriver, MockHandle};
use hv_platform::{MemoryAccessFlags, TranslationResult};
use hv_registers::{Register, RegisterName};

fn new_partition(mode: CpuMode) -> (Partition<MockDriver>, MockHandle) {
    let driver = MockDriver::new();
    let mut partition = Partition::create(driver).expect("create partition");
    let handle = partition.platform_handle().clone();
    partition.create_processor(mode).expect("create processor");
    partition
        .initialize_memory_layout()
        .expect("initialize layout");
    (partition, handle)
}

#[test]
fn layout_enables_long_mode_paging() {
    let (partition, handle) = new_partition(CpuMode::User);

    let cr0 = handle.register(RegisterName::Cr0).reg64();
    assert_ne!(cr0 & 1, 0, "CR0.PE");
    assert_ne!(cr0 & (1 << 31), 0, "CR0.PG");

    let cr4 = handle.register(RegisterName::Cr4).reg64();
    assert_ne!(cr4 & (1 << 5), 0, "CR4.PAE");

    let efer = handle.register(RegisterName::Efer).reg64();
    assert_ne!(efer & (1 << 8), 0, "EFER.LME");
    assert_ne!(efer & 1, 0, "EFER.SCE");

    let cr3 = handle.register(RegisterName::Cr3).reg64();
    assert_eq!(
        cr3,
        partition.memory_layout().pml4_gpa().as_u64(),
        "CR3 holds the PML4"
    );
}

#[test]
fn layout_loads_descriptor_table_registers() {
    let (_partition, handle) = new_partition(CpuMode::User);

    let gdtr = handle
        .register(RegisterName::Gdtr)
        .table()
        .expect("GDTR shape");
    assert_eq!(gdtr.base, 0xFFFF_8000_0000_0000);
    assert_eq!(gdtr.limit, 5 * 8 + 16 - 1);

    let idtr = handle
        .register(RegisterName::Idtr)
        .table()
        .expect("IDTR shape");
    assert_eq!(idtr.base, 0xFFFF_8000_0000_1000);
    assert_eq!(idtr.limit, 256 * 16 - 1);

    let tr = handle
        .register(RegisterName::Tr)
        .segment()
        .expect("TR shape");
    assert_eq!(tr.selector, 0x28);
}

#[test]
fn idt_gates_point_into_the_trap_page() {
    let (mut partition, handle) = new_partition(CpuMode::User);

    let (result, idt_gpa) = partition
        .translate_gva_to_gpa(Gva::new(0xFFFF_8000_0000_1000))
        .expect("translate IDT");
    assert!(result.is_success());

    // Gate 14 (page fault): offset fields must reassemble to
    // trap_base + 14 * 8.
    let mut gate = [0u8; 16];
    assert!(handle.read_guest_memory(idt_gpa.add(14 * 16), &mut gate));
    let low = u64::from(u16::from_le_bytes([gate[0], gate[1]]));
    let selector = u16::from_le_bytes([gate[2], gate[3]]);
    let attributes = gate[5];
    let mid = u64::from(u16::from_le_bytes([gate[6], gate[7]]));
    let high = u64::from(u32::from_le_bytes([gate[8], gate[9], gate[10], gate[11]]));
    let handler = (high << 32) | (mid << 16) | low;

    let trap = partition.memory_layout().idt_trap_page();
    assert_eq!(handler, trap.as_u64() + 14 * 8);
    assert_eq!(selector, 0x08);
    assert_eq!(attributes, 0x8E);
}

#[test]
fn trap_page_translates_but_is_physically_unmapped() {
    let (mut partition, handle) = new_partition(CpuMode::User);
    let trap = partition.memory_layout().idt_trap_page();

    let node = partition.find_node_by_gva(trap).expect("trap node tracked");
    assert_eq!(node.gva, trap);
    assert!(!node.gpa.is_zero());
    assert_eq!(node.block_type, BlockType::Virtual);

    let gpa = node.gpa;
    assert!(!handle.is_mapped(gpa), "physical layer released");

    let (result, translated) = partition.translate_gva_to_gpa(trap).expect("translate");
    assert_eq!(result, TranslationResult::GpaUnmapped);
    assert_eq!(translated, gpa);
}

#[test]
fn virtual_allocations_translate_to_their_physical_range() {
    let (mut partition, _handle) = new_partition(CpuMode::User);

    let (_hva, gva) = partition
        .allocate_guest_virtual(None, 3 * PAGE_SIZE, MemoryAccessFlags::RW)
        .expect("allocate");
    let node_gpa = partition.find_node_by_gva(gva).expect("tracked").gpa;

    // Every page of the range maps onto the consecutive physical pages.
    for page in 0..3 {
        let (result, gpa) = partition
            .translate_gva_to_gpa(gva.add(page * PAGE_SIZE))
            .expect("translate");
        assert!(result.is_success());
        assert_eq!(gpa, node_gpa.add(page * PAGE_SIZE));
    }
}

#[test]
fn allocate_then_free_restores_the_node_set() {
    let (mut partition, handle) = new_partition(CpuMode::User);
    let nodes_before = partition.node_count();
    let mappings_before = handle.mapping_count();

    let (_hva, gva) = partition
        .allocate_guest_virtual(None, 2 * PAGE_SIZE, MemoryAccessFlags::RW)
        .expect("allocate");
    assert_eq!(partition.node_count(), nodes_before + 1);

    partition.free_guest_virtual(gva).expect("free");
    assert_eq!(partition.node_count(), nodes_before);
    assert_eq!(handle.mapping_count(), mappings_before);

    // The paging entries survive the free: the GVA still walks, its
    // physical layer is gone.
    let (result, _) = partition.translate_gva_to_gpa(gva).expect("translate");
    assert_eq!(result, TranslationResult::GpaUnmapped);
}

#[test]
fn remapping_a_tracked_gpa_is_refused() {
    let (mut partition, _handle) = new_partition(CpuMode::User);

    let (_hva, gpa) = partition
        .allocate_guest_physical(None, PAGE_SIZE, MemoryAccessFlags::RW)
        .expect("allocate");
    let nodes = partition.node_count();

    let second = partition.allocate_guest_physical(Some(gpa), PAGE_SIZE, MemoryAccessFlags::RWX);
    assert!(matches!(second, Err(VmError::AlreadyMapped)));
    assert_eq!(partition.node_count(), nodes, "tracker unchanged");
}

#[test]
fn arena_exhaustion_is_out_of_memory_and_leaves_the_tracker_alone() {
    // 16 MiB of guest physical space; the layout itself consumes most of
    // the low pages.
    let driver = MockDriver::with_memory_kib(16 * 1024);
    let mut partition = Partition::create(driver).expect("create");
    partition
        .create_processor(CpuMode::User)
        .expect("processor");
    partition.initialize_memory_layout().expect("layout");
    let nodes = partition.node_count();

    let huge = partition.allocate_guest_physical(None, 64 * MIB, MemoryAccessFlags::RW);
    assert!(matches!(huge, Err(VmError::OutOfMemory)));
    assert_eq!(partition.node_count(), nodes);
}

#[test]
fn zero_sized_requests_are_invalid() {
    let (mut partition, _handle) = new_partition(CpuMode::User);
    assert!(matches!(
        partition.allocate_guest_physical(None, 0, MemoryAccessFlags::RW),
        Err(VmError::InvalidArgument)
    ));
    assert!(matches!(
        partition.allocate_guest_virtual(None, 0, MemoryAccessFlags::RW),
        Err(VmError::InvalidArgument)
    ));
}

#[test]
fn addresses_in_the_guard_below_the_user_ceiling_are_rejected() {
    let (mut partition, _handle) = new_partition(CpuMode::User);
    let guard = Gva::new(0x0000_8000_0000_0000 - 0x8000);
    assert!(matches!(
        partition.allocate_guest_virtual(Some(guard), PAGE_SIZE, MemoryAccessFlags::RW),
        Err(VmError::InvalidArgument)
    ));
}

#[test]
fn execute_only_flags_are_rejected_by_the_translation_table() {
    let (mut partition, _handle) = new_partition(CpuMode::User);
    assert!(matches!(
        partition.allocate_guest_physical(None, PAGE_SIZE, MemoryAccessFlags::EXECUTE),
        Err(VmError::InvalidArgument)
    ));
}

#[test]
fn reinitializing_the_layout_is_refused() {
    let (mut partition, _handle) = new_partition(CpuMode::User);
    assert!(matches!(
        partition.initialize_memory_layout(),
        Err(VmError::AlreadyInitialized)
    ));
}

#[test]
fn register_round_trip_preserves_the_snapshot() {
    let (mut partition, _handle) = new_partition(CpuMode::User);

    let mut registers = partition.get_registers().expect("get");
    registers.set_reg64(Register::Rax, 0x1122_3344_5566_7788);
    registers.set_reg64(Register::R15, 42);
    registers.segment_mut(Register::Fs).selector = 0x33;
    partition.set_registers(&registers).expect("set");

    let read_back = partition.get_registers().expect("get again");
    assert_eq!(read_back, registers);
}

#[test]
fn teardown_unmaps_every_range() {
    let (mut partition, handle) = new_partition(CpuMode::User);
    partition
        .allocate_guest_virtual(None, 4 * PAGE_SIZE, MemoryAccessFlags::RW)
        .expect("allocate");
    assert!(handle.mapping_count() > 0);

    partition.delete().expect("delete");
    assert_eq!(handle.mapping_count(), 0, "all guest ranges unmapped");
}

#[test]
fn failures_are_cached_for_later_inspection() {
    let (mut partition, _handle) = new_partition(CpuMode::User);
    assert!(partition.last_result().is_none());
    assert!(partition.last_error().is_none());

    let _ = partition.allocate_guest_physical(None, 0, MemoryAccessFlags::RW);
    assert!(matches!(
        partition.last_result(),
        Some(VmError::InvalidArgument)
    ));
    // Library-level failures do not fabricate a platform code.
    assert!(partition.last_error().is_none());

    // The cache is sticky across a subsequent success.
    partition
        .allocate_guest_physical(None, PAGE_SIZE, MemoryAccessFlags::RW)
        .expect("allocate");
    assert!(matches!(
        partition.last_result(),
        Some(VmError::InvalidArgument)
    ));
}

#[test]
fn lifecycle_without_a_processor_tears_down_cleanly() {
    let driver = MockDriver::new();
    let mut partition = Partition::create(driver).expect("create");
    let handle = partition.platform_handle().clone();
    partition.initialize_memory_layout().expect("layout");
    assert!(handle.mapping_count() > 0);

    partition.delete().expect("delete");
    assert_eq!(handle.mapping_count(), 0);
}

#[test]
fn pfn_lookup_resolves_through_the_tracker() {
    let (mut partition, handle) = new_partition(CpuMode::User);

    // Write through the host pointer, read back through the guest
    // physical side: the triple is consistent.
    let (hva, gva) = partition
        .allocate_guest_virtual(None, PAGE_SIZE, MemoryAccessFlags::RW)
        .expect("allocate");
    unsafe {
        hva.as_ptr::<u64>().write(0xFEED_FACE_CAFE_BEEF);
    }
    let (_, gpa) = partition.translate_gva_to_gpa(gva).expect("translate");
    let mut buf = [0u8; 8];
    assert!(handle.read_guest_memory(gpa, &mut buf));
    assert_eq!(u64::from_le_bytes(buf), 0xFEED_FACE_CAFE_BEEF);
}
