//! # Descriptor Tables & Interrupt Structures
//!
//! Bit-exact models of the processor structures the memory-layout
//! initializer writes into guest memory:
//!
//! - [`GdtEntry`] — an 8-byte segment descriptor.
//! - [`TssDescriptor`] — the 16-byte system descriptor pointing at the TSS.
//! - [`TaskStateSegment`] — the 104-byte long-mode TSS.
//! - [`IdtEntry`] / [`IdtAttributes`] — a 16-byte interrupt gate.
//! - [`InterruptFrame`] — the five quadwords the CPU pushes on an
//!   interrupt.
//! - [`ExceptionVector`] — the architectural exception numbers and which
//!   of them push an error code.
//!
//! In long mode the base and limit of code/data descriptors are ignored
//! for address calculation, but the access byte still carries the
//! privilege and type information the CPU checks on privilege
//! transitions, and the TSS descriptor is how the CPU finds ring-0 stacks.

mod gdt;
mod idt;
mod tss;
mod vector;

pub use crate::gdt::{GdtEntry, SystemDescriptorHigh, TssDescriptor};
pub use crate::idt::{IDT_ENTRY_COUNT, IdtAttributes, IdtEntry};
pub use crate::tss::TaskStateSegment;
pub use crate::vector::{ExceptionVector, InterruptFrame};
