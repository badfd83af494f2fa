use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

use crate::Architecture;

/// The identifier of a logical register.
///
/// Identifiers are positional: a register file stores the description of register `n` at
/// index `n`, which keeps lookups from an id a plain slice access.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RegisterId(pub u16);

impl RegisterId {
    /// The position of this register in its register file.
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<u16> for RegisterId {
    fn from(value: u16) -> Self {
        RegisterId(value)
    }
}

impl From<RegisterId> for u32 {
    fn from(value: RegisterId) -> Self {
        value.0 as u32
    }
}

impl Display for RegisterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The role a register plays while unwinding.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum RegisterRole {
    /// Instruction pointer of the frame.
    ProgramCounter,
    /// Memory stack pointer. Its value in a caller frame is the canonical frame address.
    StackPointer,
    /// Frame pointer.
    FramePointer,
    /// The register (or unwind column) holding the caller's instruction pointer.
    ReturnAddress,
    /// Global data pointer restored before control returns into a procedure.
    GlobalPointer,
    /// Register used to pass exception data to a landing pad.
    ExceptionArgument(u8),
    /// Pointer to the end of the current frame on the register backing store.
    BackingStorePointer,
    /// Pointer to the next backing-store slot the hardware will spill to.
    BackingStoreStore,
    /// Current frame marker of a register-stack machine.
    FrameMarker,
    /// Previous function state: the caller's frame marker saved by a call.
    PreviousFunctionState,
    /// Validity collection for stacked registers that have not reached memory yet.
    StackedValidityCollection,
    /// Validity collection for registers spilled to the memory stack.
    SpilledValidityCollection,
    /// Predicate registers packed into one word.
    Predicates,
}

/// Storage class of a register.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum RegisterKind {
    /// A plain 64-bit integer register.
    Integer,
    /// The validity ("not a thing") flag of the integer register `of`.
    ///
    /// It has no storage of its own: the flag lives at a bit position described by the
    /// location of the register it belongs to.
    Validity {
        /// The register this flag belongs to.
        of: RegisterId,
    },
    /// A floating-point register, transferred as two 64-bit words.
    FloatingPoint,
}

/// What happens to a register's value across a call boundary when the unwind info does not
/// mention it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum UnwindRule {
    /// Callee-saved: the caller sees the same location as the callee.
    Preserve,
    /// Caller-clobbered: the value in the caller is unknown.
    Clear,
    /// Derived by the architecture specific part of the unwinder (instruction pointer, stack
    /// pointer, backing store pointer, ...).
    SpecialRule,
}

/// The description of one logical register.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoreRegister {
    /// Identifier, equal to the register's position in its file.
    pub id: RegisterId,
    /// Roles of this register. Most registers have none.
    pub roles: &'static [RegisterRole],
    /// How the value is stored.
    pub kind: RegisterKind,
    /// Default rule used when unwind info says nothing about the register.
    pub unwind_rule: UnwindRule,
}

impl CoreRegister {
    /// Identifier of the register.
    pub fn id(&self) -> RegisterId {
        self.id
    }

    /// Test if this register has the given role.
    pub fn register_has_role(&self, role: RegisterRole) -> bool {
        self.roles.contains(&role)
    }

    /// `true` for floating-point registers, which are accessed through the floating-point
    /// accessor.
    pub fn is_floating_point(&self) -> bool {
        self.kind == RegisterKind::FloatingPoint
    }

    /// The register this validity flag belongs to, if this is a validity flag.
    pub fn validity_of(&self) -> Option<RegisterId> {
        match self.kind {
            RegisterKind::Validity { of } => Some(of),
            _ => None,
        }
    }
}

/// Layout of a saved machine context, as written by the kernel on signal delivery or by a
/// context capture routine.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct ContextLayout {
    /// Bytes reserved for every register id, in id order from offset 0.
    pub slot_size: u64,
    /// Offset of the word collecting the validity flags of the integer registers. Bit `n`
    /// belongs to integer register `n`.
    pub validity_word: Option<u64>,
}

impl ContextLayout {
    /// Offset of `register`'s slot from the start of the saved context.
    pub fn offset_of(&self, register: RegisterId) -> u64 {
        register.0 as u64 * self.slot_size
    }

    /// Address of `register`'s slot in a context saved at `context`, or `None` if the slot
    /// would lie past the end of the address space.
    pub fn slot_address(&self, context: u64, register: RegisterId) -> Option<u64> {
        context.checked_add(self.offset_of(register))
    }

    /// Address of the validity word in a context saved at `context`.
    pub fn validity_word_address(&self, context: u64) -> Option<u64> {
        context.checked_add(self.validity_word?)
    }
}

/// A complete register file for one architecture.
#[derive(Debug, Serialize)]
pub struct RegisterFile {
    /// Short architecture name, used in log output.
    pub name: &'static str,
    /// The architecture this file describes.
    pub architecture: Architecture,
    /// All registers, indexed by [`RegisterId`].
    pub registers: Vec<CoreRegister>,
    /// How a saved context stores these registers.
    pub context: ContextLayout,
    #[serde(skip)]
    pub(crate) register_name: fn(RegisterId) -> String,
}

impl RegisterFile {
    /// Number of logical registers.
    pub fn len(&self) -> usize {
        self.registers.len()
    }

    /// `true` if the file has no registers.
    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    /// All registers, in id order.
    pub fn iter(&self) -> impl Iterator<Item = &CoreRegister> {
        self.registers.iter()
    }

    /// Look up a register by id.
    pub fn get(&self, id: RegisterId) -> Option<&CoreRegister> {
        self.registers.get(id.index()).filter(|register| register.id == id)
    }

    /// The first register that has `role`.
    pub fn by_role(&self, role: RegisterRole) -> Option<&CoreRegister> {
        self.registers
            .iter()
            .find(|register| register.register_has_role(role))
    }

    /// The instruction pointer.
    pub fn program_counter(&self) -> RegisterId {
        self.role_or_first(RegisterRole::ProgramCounter)
    }

    /// The memory stack pointer.
    pub fn stack_pointer(&self) -> RegisterId {
        self.role_or_first(RegisterRole::StackPointer)
    }

    /// The register that holds the caller's instruction pointer. On machines where the return
    /// address lives in memory this is the same as the program counter.
    pub fn return_address(&self) -> RegisterId {
        self.by_role(RegisterRole::ReturnAddress)
            .map(CoreRegister::id)
            .unwrap_or_else(|| self.program_counter())
    }

    /// The frame pointer, if the architecture has one.
    pub fn frame_pointer(&self) -> Option<RegisterId> {
        self.by_role(RegisterRole::FramePointer).map(CoreRegister::id)
    }

    /// The registers used to pass exception data to a landing pad, in argument order.
    pub fn exception_arguments(&self) -> Vec<RegisterId> {
        let mut arguments: Vec<(u8, RegisterId)> = self
            .registers
            .iter()
            .flat_map(|register| {
                register.roles.iter().filter_map(|role| match role {
                    RegisterRole::ExceptionArgument(n) => Some((*n, register.id)),
                    _ => None,
                })
            })
            .collect();
        arguments.sort_unstable();
        arguments.into_iter().map(|(_, id)| id).collect()
    }

    /// The validity flag register belonging to `register`, if there is one.
    pub fn validity_flag_of(&self, register: RegisterId) -> Option<RegisterId> {
        self.registers
            .iter()
            .find(|candidate| candidate.validity_of() == Some(register))
            .map(CoreRegister::id)
    }

    /// Human readable name of a register, for diagnostics.
    pub fn register_name(&self, register: RegisterId) -> String {
        if self.get(register).is_some() {
            (self.register_name)(register)
        } else {
            format!("{register}")
        }
    }

    fn role_or_first(&self, role: RegisterRole) -> RegisterId {
        // Every file shipped by this crate declares the program counter and stack pointer; a
        // file without them still unwinds, it just resolves those roles to register 0.
        self.by_role(role)
            .map(CoreRegister::id)
            .unwrap_or(RegisterId(0))
    }
}

impl Display for RegisterFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} registers)", self.name, self.registers.len())
    }
}

/// The value of a floating-point register: the raw 128 bits transferred by the floating-point
/// accessor, low word first.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FpValue(pub [u64; 2]);

impl FpValue {
    /// Build a value from its low and high words.
    pub const fn from_words(low: u64, high: u64) -> Self {
        FpValue([low, high])
    }

    /// The low word.
    pub fn low(&self) -> u64 {
        self.0[0]
    }

    /// The high word.
    pub fn high(&self) -> u64 {
        self.0[1]
    }
}

impl Display for FpValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}:{:#018x}", self.0[1], self.0[0])
    }
}

/// Byte order of the unwound target.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    /// Least significant byte first.
    #[default]
    Little,
    /// Most significant byte first.
    Big,
}

impl ByteOrder {
    /// The byte order of the machine running this code.
    pub const fn native() -> Self {
        if cfg!(target_endian = "big") {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }
}
