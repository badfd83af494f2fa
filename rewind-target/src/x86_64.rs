//! x86_64 register file, numbered like the DWARF register columns of the System V ABI.

use std::sync::LazyLock;

use crate::{
    Architecture, ContextLayout, CoreRegister, RegisterFile, RegisterId, RegisterKind,
    RegisterRole, UnwindRule,
};

/// rax, first exception argument.
pub const RAX: RegisterId = RegisterId(0);
/// rdx, second exception argument.
pub const RDX: RegisterId = RegisterId(1);
/// rcx
pub const RCX: RegisterId = RegisterId(2);
/// rbx
pub const RBX: RegisterId = RegisterId(3);
/// rsi
pub const RSI: RegisterId = RegisterId(4);
/// rdi
pub const RDI: RegisterId = RegisterId(5);
/// rbp, the frame pointer.
pub const RBP: RegisterId = RegisterId(6);
/// rsp, the stack pointer.
pub const RSP: RegisterId = RegisterId(7);
/// The instruction pointer, which is also the DWARF return address column.
pub const RIP: RegisterId = RegisterId(16);

/// General purpose register `r8` to `r15`.
pub const fn r(n: u16) -> RegisterId {
    RegisterId(n)
}

const NAMES: [&str; 17] = [
    "rax", "rdx", "rcx", "rbx", "rsi", "rdi", "rbp", "rsp", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15", "rip",
];

const NO_ROLE: &[RegisterRole] = &[];
const FIRST_ARGUMENT: &[RegisterRole] = &[RegisterRole::ExceptionArgument(0)];
const SECOND_ARGUMENT: &[RegisterRole] = &[RegisterRole::ExceptionArgument(1)];
const FRAME_POINTER: &[RegisterRole] = &[RegisterRole::FramePointer];
const STACK_POINTER: &[RegisterRole] = &[RegisterRole::StackPointer];
const INSTRUCTION_POINTER: &[RegisterRole] =
    &[RegisterRole::ProgramCounter, RegisterRole::ReturnAddress];

fn register_name(id: RegisterId) -> String {
    NAMES
        .get(id.index())
        .map(|name| name.to_string())
        .unwrap_or_else(|| format!("{id}"))
}

/// The x86_64 register file.
pub static REGISTERS: LazyLock<RegisterFile> = LazyLock::new(|| {
    let registers = (0..NAMES.len() as u16)
        .map(|n| {
            let id = RegisterId(n);
            let (roles, unwind_rule) = match id {
                RAX => (FIRST_ARGUMENT, UnwindRule::Clear),
                RDX => (SECOND_ARGUMENT, UnwindRule::Clear),
                RBP => (FRAME_POINTER, UnwindRule::Preserve),
                RSP => (STACK_POINTER, UnwindRule::SpecialRule),
                RIP => (INSTRUCTION_POINTER, UnwindRule::SpecialRule),
                // rbx and r12-r15 are callee-saved.
                RBX | RegisterId(12..=15) => (NO_ROLE, UnwindRule::Preserve),
                _ => (NO_ROLE, UnwindRule::Clear),
            };
            CoreRegister {
                id,
                roles,
                kind: RegisterKind::Integer,
                unwind_rule,
            }
        })
        .collect();

    RegisterFile {
        name: "x86_64",
        architecture: Architecture::X86_64,
        registers,
        context: ContextLayout {
            slot_size: 8,
            validity_word: None,
        },
        register_name,
    }
});
