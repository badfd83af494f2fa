//! Call-stack unwinding for local, remote and captured targets.
//!
//! A [`Cursor`] walks the frames of a thread outwards. It reaches the target only through the
//! [`Accessors`] of an [`AddressSpace`], so the same unwinder works on the calling process
//! ([`accessors::Local`]), a stopped process ([`accessors::Remote`]) and a captured state
//! ([`accessors::Snapshot`]). The register files it understands are described in the
//! `rewind-target` crate.
//!
//! ```no_run
//! use rewind::{accessors::{CapturedState, Snapshot}, AddressSpace, Cursor, UnwindTable};
//! use rewind_target::x86_64;
//!
//! # fn main() -> Result<(), rewind::Error> {
//! let table = UnwindTable::new();
//! let space = AddressSpace::new(Snapshot::new(table), &x86_64::REGISTERS)?;
//! let state = CapturedState::new(rewind::MachineContext::new(&x86_64::REGISTERS));
//! let mut cursor = Cursor::init_remote(&space, state)?;
//! for frame in rewind::backtrace(&mut cursor)? {
//!     println!("{frame}");
//! }
//! # Ok(())
//! # }
//! ```

/// Accessor back-ends for the calling process, stopped processes and snapshots.
pub mod accessors;
/// The target handle shared by all cursors unwinding it.
pub mod address_space;
/// Architecture specific unwinding.
pub mod architecture;
mod backtrace;
/// The procedure information cache and its invalidation.
pub mod cache;
/// Loading the unwinder configuration.
pub mod config;
mod context;
/// The unwind cursor.
pub mod cursor;
/// Procedures registered at run time by JIT compilers.
pub mod dyn_info;
mod error;
/// Where a register's value lives in a frame.
pub mod location;
/// Allocation for the unwinder's own records.
pub mod mempool;
/// Procedure information and the unwind rules it carries.
pub mod proc_info;
/// Resuming execution in an unwound frame.
pub mod resume;

pub use self::{
    address_space::{Accessors, AddressSpace},
    backtrace::{backtrace, Frame},
    cache::CachingPolicy,
    config::UnwindConfig,
    context::MachineContext,
    cursor::{ContextOrigin, Cursor, StepOutcome},
    error::{Access, Error, MemoryAccessError},
    location::Location,
    proc_info::{ProcInfo, ProcName, UnwindInfoProvider, UnwindTable},
};
