//! # Guest Partition Core
//!
//! A thin, embeddable library that drives a host-provided
//! hardware-virtualization platform to execute small code payloads
//! inside a freshly constructed x86-64 guest.
//!
//! The heart of the crate is the memory subsystem: it builds the guest's
//! four-level paging hierarchy from scratch, tracks every allocation's
//! host-virtual / guest-physical / guest-virtual triple, synthesizes a
//! GDT (with TSS) and an IDT whose 256 gates all point into a
//! deliberately unmapped "trap" page, and couples the exit loop to that
//! bookkeeping so a guest interrupt becomes a host-side ISR callback
//! with a reconstructed interrupt frame.
//!
//! ## Usage sketch
//!
//! ```ignore
//! let mut partition = Partition::create(driver)?;
//! partition.create_processor(CpuMode::User)?;
//! partition.initialize_memory_layout()?;
//! partition.register_default_exit_callbacks();
//! partition.stage_payload(&shellcode, None)?;
//! let reason = partition.run_payload()?;
//! partition.delete()?;
//! ```
//!
//! ## Threading
//!
//! One host thread owns the partition and drives
//! [`run_processor`](Partition::run_processor); all callbacks execute
//! synchronously on that thread. A second thread may hold a
//! [`canceller`](Partition::canceller) and interrupt a blocked run at
//! any time, surfacing as a user-canceled exit on the running thread.

mod arena;
mod callbacks;
mod error;
mod host;
mod memory;
mod partition;
mod payload;
mod processor;
mod runner;
mod tracker;

pub use crate::arena::MemoryArena;
pub use crate::callbacks::{
    BasicCallback, ContextCallback, EXIT_CALLBACK_SLOTS, ExitCallbackSlot, ISR_VECTORS,
    IsrCallback, VpExitHandler,
};
pub use crate::error::{VmError, VmResult};
pub use crate::host::{HostAlloc, HostProtection, protection_for_flags};
pub use crate::partition::{MemoryLayout, Partition, is_hypervisor_present};
pub use crate::payload::PayloadLayout;
pub use crate::processor::{CpuMode, VirtualProcessor, selectors};
pub use crate::tracker::{AllocationNode, AllocationTracker, BlockType, HostBacking};
