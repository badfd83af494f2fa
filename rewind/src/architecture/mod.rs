//! Architecture specific parts of stepping and resuming.

pub mod regstack;

use rewind_target::{x86_64, Architecture, RegisterFile};

use crate::proc_info::{CfaRule, RegisterRule, UnwindRow};

/// The rules used for procedures that come without any.
pub fn fallback_row(register_file: &RegisterFile) -> UnwindRow {
    match register_file.architecture {
        Architecture::X86_64 => frame_pointer_row(),
        Architecture::RegisterStack => regstack::fallback_row(),
    }
}

/// A frame record chain: the frame pointer points at the caller's saved frame pointer, with the
/// return address in the slot above it.
fn frame_pointer_row() -> UnwindRow {
    UnwindRow::new(CfaRule::RegisterAndOffset {
        register: x86_64::RBP,
        offset: 16,
    })
    .with_rule(x86_64::RIP, RegisterRule::Offset(-8))
    .with_rule(x86_64::RBP, RegisterRule::Offset(-16))
}
