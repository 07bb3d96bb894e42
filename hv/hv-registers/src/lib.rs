//! # Guest Register Models
//!
//! Everything the virtual-processor state manager moves back and forth:
//!
//! - [`Register`] — the fixed, ordered 33-slot snapshot index.
//! - [`RegisterName`] — the wire names handed to the platform driver
//!   (the snapshot set plus the syscall MSRs).
//! - [`RegisterValue`] — the tagged value shape (integer, segment, table).
//! - [`Registers`] — the snapshot itself.
//! - Architectural bitfields for the control registers this library
//!   programs: [`Cr0`], [`Cr4`], [`Efer`], [`Rflags`], [`Star`].
//!
//! The snapshot is deliberately an ordered array of tagged values rather
//! than a struct of fields: its order must match [`SNAPSHOT_NAMES`], the
//! name array fed verbatim to the platform's bulk get/set calls.

mod cr0;
mod cr4;
mod efer;
mod name;
mod rflags;
mod snapshot;
mod star;
mod value;

pub use crate::cr0::Cr0;
pub use crate::cr4::Cr4;
pub use crate::efer::Efer;
pub use crate::name::{Register, RegisterName, SNAPSHOT_NAMES, SNAPSHOT_REGISTER_COUNT};
pub use crate::rflags::Rflags;
pub use crate::snapshot::Registers;
pub use crate::star::Star;
pub use crate::value::{RegisterValue, SegmentAttributes, SegmentRegister, TableRegister};
