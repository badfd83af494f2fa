//! Architecture descriptions for the rewind unwinder.
//!
//! This crate only holds data: register identifiers, their roles while unwinding, the default
//! rule applied to a register across a call, and the layout of saved machine contexts. The
//! unwinding algorithms live in the `rewind` crate.

mod registers;

/// The register file of a register-stack machine.
pub mod regstack;
/// The x86_64 register file.
pub mod x86_64;

pub use registers::*;

use serde::{Deserialize, Serialize};

/// The architectures with a register file in this crate.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    /// x86_64, System V ABI.
    X86_64,
    /// A machine with a register stack engine.
    RegisterStack,
}

impl Architecture {
    /// The register file of this architecture.
    pub fn register_file(self) -> &'static RegisterFile {
        match self {
            Architecture::X86_64 => &x86_64::REGISTERS,
            Architecture::RegisterStack => &regstack::REGISTERS,
        }
    }

    /// The architecture of the machine running this code, if it has a register file here.
    pub fn native() -> Option<Self> {
        if cfg!(target_arch = "x86_64") {
            Some(Architecture::X86_64)
        } else {
            None
        }
    }
}
