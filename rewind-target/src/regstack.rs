//! Register file of a register-stack machine.
//!
//! General registers `r32` and up are stacked: a call allocates a fresh window of them and the
//! register stack engine spills older windows to a backing store in memory, one 64-bit slot per
//! register with every 64th slot holding the collected validity bits of the 63 slots before it.
//! Each general register carries a validity ("not a thing") flag, exposed as its own logical
//! register so that cursors can read and write it.

use std::sync::LazyLock;

use bitfield::bitfield;

use crate::{
    Architecture, ContextLayout, CoreRegister, RegisterFile, RegisterId, RegisterKind,
    RegisterRole, UnwindRule,
};

/// Number of general registers.
pub const GENERAL_REGISTERS: u16 = 128;
/// First stacked general register.
pub const FIRST_STACKED: u16 = 32;
/// Number of floating-point registers.
pub const FLOATING_POINT_REGISTERS: u16 = 128;
/// Number of branch registers.
pub const BRANCH_REGISTERS: u16 = 8;

const NAT_BASE: u16 = GENERAL_REGISTERS;
const FR_BASE: u16 = NAT_BASE + GENERAL_REGISTERS;
const BR_BASE: u16 = FR_BASE + FLOATING_POINT_REGISTERS;

/// Packed predicate registers.
pub const PR: RegisterId = RegisterId(BR_BASE + BRANCH_REGISTERS);
/// Instruction pointer.
pub const IP: RegisterId = RegisterId(PR.0 + 1);
/// Current frame marker.
pub const CFM: RegisterId = RegisterId(PR.0 + 2);
/// Backing store pointer: where the current frame's first stacked register is spilled.
pub const BSP: RegisterId = RegisterId(PR.0 + 3);
/// Next backing store address the engine writes to.
pub const BSPSTORE: RegisterId = RegisterId(PR.0 + 4);
/// Previous function state.
pub const PFS: RegisterId = RegisterId(PR.0 + 5);
/// Validity collection of the partially spilled backing store group.
pub const RNAT: RegisterId = RegisterId(PR.0 + 6);
/// Validity collection for registers spilled to the memory stack.
pub const UNAT: RegisterId = RegisterId(PR.0 + 7);
/// Loop counter.
pub const LC: RegisterId = RegisterId(PR.0 + 8);
/// Floating-point status register.
pub const FPSR: RegisterId = RegisterId(PR.0 + 9);

const REGISTER_COUNT: u16 = FPSR.0 + 1;

/// Global data pointer, `r1`.
pub const GP: RegisterId = gr(1);
/// Memory stack pointer, `r12`.
pub const SP: RegisterId = gr(12);
/// Return pointer, `b0`.
pub const RP: RegisterId = br(0);

/// Predicates `p6` through `p15` are scratch across calls.
pub const PR_SCRATCH: u64 = 0xffc0;
/// Predicates preserved across calls. `p0` is hardwired and belongs to neither set.
pub const PR_PRESERVED: u64 = !(PR_SCRATCH | 1);

/// General register `r<n>`.
pub const fn gr(n: u16) -> RegisterId {
    RegisterId(n)
}

/// Validity flag of general register `r<n>`.
pub const fn nat(n: u16) -> RegisterId {
    RegisterId(NAT_BASE + n)
}

/// Floating-point register `f<n>`.
pub const fn fr(n: u16) -> RegisterId {
    RegisterId(FR_BASE + n)
}

/// Branch register `b<n>`.
pub const fn br(n: u16) -> RegisterId {
    RegisterId(BR_BASE + n)
}

/// Position of `register` in the stacked part of the general register file, if it is stacked.
pub fn stacked_index(register: RegisterId) -> Option<u16> {
    (FIRST_STACKED..GENERAL_REGISTERS)
        .contains(&register.0)
        .then(|| register.0 - FIRST_STACKED)
}

bitfield! {
    /// Current frame marker.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct Cfm(u64);
    impl Debug;
    /// Size of frame: stacked registers allocated to the frame.
    pub u64, sof, set_sof: 6, 0;
    /// Size of locals: stacked registers that are not outputs.
    pub u64, sol, set_sol: 13, 7;
    /// Size of the rotating region, in groups of eight.
    pub u64, sor, set_sor: 17, 14;
    /// General register rename base.
    pub u64, rrb_gr, set_rrb_gr: 24, 18;
    /// Floating-point register rename base.
    pub u64, rrb_fr, set_rrb_fr: 31, 25;
    /// Predicate rename base.
    pub u64, rrb_pr, set_rrb_pr: 37, 32;
}

impl Cfm {
    /// Mask of the bits that make up a frame marker.
    pub const MASK: u64 = (1 << 38) - 1;
}

bitfield! {
    /// Previous function state, saved by a call.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct Pfs(u64);
    impl Debug;
    /// The caller's frame marker.
    pub u64, pfm, set_pfm: 37, 0;
    /// Previous epilogue count.
    pub u64, pec, set_pec: 57, 52;
    /// Previous privilege level.
    pub u64, ppl, set_ppl: 63, 62;
}

impl Pfs {
    /// Size of locals of the caller frame.
    pub fn sol(&self) -> u64 {
        Cfm(self.pfm()).sol()
    }

    /// Size of frame of the caller frame.
    pub fn sof(&self) -> u64 {
        Cfm(self.pfm()).sof()
    }
}

const NO_ROLE: &[RegisterRole] = &[];
const GLOBAL_POINTER: &[RegisterRole] = &[RegisterRole::GlobalPointer];
const STACK_POINTER: &[RegisterRole] = &[RegisterRole::StackPointer];
const RETURN_POINTER: &[RegisterRole] = &[RegisterRole::ReturnAddress];
const PREDICATES: &[RegisterRole] = &[RegisterRole::Predicates];
const PROGRAM_COUNTER: &[RegisterRole] = &[RegisterRole::ProgramCounter];
const FRAME_MARKER: &[RegisterRole] = &[RegisterRole::FrameMarker];
const BACKING_STORE_POINTER: &[RegisterRole] = &[RegisterRole::BackingStorePointer];
const BACKING_STORE_STORE: &[RegisterRole] = &[RegisterRole::BackingStoreStore];
const PREVIOUS_FUNCTION_STATE: &[RegisterRole] = &[RegisterRole::PreviousFunctionState];
const STACKED_COLLECTION: &[RegisterRole] = &[RegisterRole::StackedValidityCollection];
const SPILLED_COLLECTION: &[RegisterRole] = &[RegisterRole::SpilledValidityCollection];
const EXCEPTION_ARGUMENTS: [&[RegisterRole]; 4] = [
    &[RegisterRole::ExceptionArgument(0)],
    &[RegisterRole::ExceptionArgument(1)],
    &[RegisterRole::ExceptionArgument(2)],
    &[RegisterRole::ExceptionArgument(3)],
];

fn general_register(n: u16) -> CoreRegister {
    let (roles, unwind_rule) = match n {
        1 => (GLOBAL_POINTER, UnwindRule::Clear),
        4..=7 => (NO_ROLE, UnwindRule::Preserve),
        12 => (STACK_POINTER, UnwindRule::SpecialRule),
        15..=18 => (EXCEPTION_ARGUMENTS[(n - 15) as usize], UnwindRule::Clear),
        n if n >= FIRST_STACKED => (NO_ROLE, UnwindRule::SpecialRule),
        _ => (NO_ROLE, UnwindRule::Clear),
    };
    CoreRegister {
        id: gr(n),
        roles,
        kind: RegisterKind::Integer,
        unwind_rule,
    }
}

fn floating_point_register(n: u16) -> CoreRegister {
    let unwind_rule = match n {
        2..=5 | 16..=31 => UnwindRule::Preserve,
        _ => UnwindRule::Clear,
    };
    CoreRegister {
        id: fr(n),
        roles: NO_ROLE,
        kind: RegisterKind::FloatingPoint,
        unwind_rule,
    }
}

fn branch_register(n: u16) -> CoreRegister {
    let (roles, unwind_rule) = match n {
        0 => (RETURN_POINTER, UnwindRule::Clear),
        1..=5 => (NO_ROLE, UnwindRule::Preserve),
        _ => (NO_ROLE, UnwindRule::Clear),
    };
    CoreRegister {
        id: br(n),
        roles,
        kind: RegisterKind::Integer,
        unwind_rule,
    }
}

fn application_register(id: RegisterId) -> CoreRegister {
    let (roles, unwind_rule) = match id {
        PR => (PREDICATES, UnwindRule::Preserve),
        IP => (PROGRAM_COUNTER, UnwindRule::SpecialRule),
        CFM => (FRAME_MARKER, UnwindRule::SpecialRule),
        BSP => (BACKING_STORE_POINTER, UnwindRule::SpecialRule),
        BSPSTORE => (BACKING_STORE_STORE, UnwindRule::SpecialRule),
        PFS => (PREVIOUS_FUNCTION_STATE, UnwindRule::Preserve),
        RNAT => (STACKED_COLLECTION, UnwindRule::SpecialRule),
        UNAT => (SPILLED_COLLECTION, UnwindRule::Preserve),
        _ => (NO_ROLE, UnwindRule::Preserve),
    };
    CoreRegister {
        id,
        roles,
        kind: RegisterKind::Integer,
        unwind_rule,
    }
}

fn register_name(id: RegisterId) -> String {
    let name = match id {
        PR => "pr",
        IP => "ip",
        CFM => "cfm",
        BSP => "bsp",
        BSPSTORE => "bspstore",
        PFS => "pfs",
        RNAT => "rnat",
        UNAT => "unat",
        LC => "lc",
        FPSR => "fpsr",
        RegisterId(n) if n < NAT_BASE => return format!("r{n}"),
        RegisterId(n) if n < FR_BASE => return format!("nat{}", n - NAT_BASE),
        RegisterId(n) if n < BR_BASE => return format!("f{}", n - FR_BASE),
        RegisterId(n) if n < PR.0 => return format!("b{}", n - BR_BASE),
        _ => return format!("{id}"),
    };
    name.to_string()
}

/// Saved contexts hold one 16-byte slot per register id followed by the validity word of the
/// general registers.
pub const CONTEXT_LAYOUT: ContextLayout = ContextLayout {
    slot_size: 16,
    validity_word: Some(REGISTER_COUNT as u64 * 16),
};

/// Size in bytes of a saved context.
pub const CONTEXT_SIZE: u64 = REGISTER_COUNT as u64 * 16 + 8;

/// The register-stack register file.
pub static REGISTERS: LazyLock<RegisterFile> = LazyLock::new(|| {
    let mut registers = Vec::with_capacity(REGISTER_COUNT as usize);
    registers.extend((0..GENERAL_REGISTERS).map(general_register));
    registers.extend((0..GENERAL_REGISTERS).map(|n| CoreRegister {
        id: nat(n),
        roles: NO_ROLE,
        kind: RegisterKind::Validity { of: gr(n) },
        unwind_rule: UnwindRule::SpecialRule,
    }));
    registers.extend((0..FLOATING_POINT_REGISTERS).map(floating_point_register));
    registers.extend((0..BRANCH_REGISTERS).map(branch_register));
    registers.extend((PR.0..REGISTER_COUNT).map(|n| application_register(RegisterId(n))));

    RegisterFile {
        name: "regstack",
        architecture: Architecture::RegisterStack,
        registers,
        context: CONTEXT_LAYOUT,
        register_name,
    }
});
