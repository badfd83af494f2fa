//! Where the value of a logical register lives in a frame.

use std::fmt::{self, Display};

use rewind_target::{FpValue, RegisterId};
use serde::Serialize;

use crate::{
    address_space::{AddressSpace, Accessors},
    Access, Error,
};

/// Selects one field of a captured machine context. Context fields are addressed by the
/// register they hold.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ContextSelector(pub RegisterId);

/// The storage site of a value.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum LocationKind {
    /// A machine register that still holds the value.
    Register(RegisterId),
    /// A word (or two, for floating-point values) in target memory.
    Memory(u64),
    /// A field of the captured context the unwind started from.
    ContextField(ContextSelector),
    /// The value cannot be recovered in this frame.
    Unknown,
}

/// The position of a validity ("not a thing") flag: bit `bit` of the word stored at `word`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ValidityBit {
    /// Where the word holding the flag lives.
    pub word: LocationKind,
    /// Bit position inside that word.
    pub bit: u8,
}

/// Where the current value of one logical register lives.
///
/// A location only means something to the cursor and address space that produced it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Location {
    /// The storage site.
    pub kind: LocationKind,
    /// Where the register's validity flag is kept, for registers that have one.
    pub validity: Option<ValidityBit>,
    /// The value is a floating-point register image and is accessed as two words.
    pub floating_point: bool,
    /// The storage is a slot of the saved context a signal frame left behind. A resume through
    /// that context finds the value already in place.
    pub backed_by_context: bool,
}

impl Location {
    /// The location of a value that cannot be recovered.
    pub const UNKNOWN: Location = Location::new(LocationKind::Unknown);

    /// A location of the given kind without tags.
    pub const fn new(kind: LocationKind) -> Self {
        Location {
            kind,
            validity: None,
            floating_point: false,
            backed_by_context: false,
        }
    }

    /// The value is still in machine register `register`.
    pub const fn register(register: RegisterId) -> Self {
        Location::new(LocationKind::Register(register))
    }

    /// The value is in target memory at `address`.
    pub const fn memory(address: u64) -> Self {
        Location::new(LocationKind::Memory(address))
    }

    /// The value is in the field of the captured context that holds `register`.
    pub const fn context_field(register: RegisterId) -> Self {
        Location::new(LocationKind::ContextField(ContextSelector(register)))
    }

    /// Attach the position of a validity flag.
    pub const fn with_validity(mut self, word: LocationKind, bit: u8) -> Self {
        self.validity = Some(ValidityBit { word, bit });
        self
    }

    /// Mark this location as holding a floating-point value.
    pub const fn floating_point(mut self) -> Self {
        self.floating_point = true;
        self
    }

    /// Mark this location as a slot of a saved context.
    pub const fn backed_by_context(mut self) -> Self {
        self.backed_by_context = true;
        self
    }

    /// `true` if the value cannot be recovered.
    pub fn is_unknown(&self) -> bool {
        self.kind == LocationKind::Unknown
    }

    /// The memory address of the value, if it lives in memory.
    pub fn address(&self) -> Option<u64> {
        match self.kind {
            LocationKind::Memory(address) => Some(address),
            _ => None,
        }
    }
}

impl Display for LocationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocationKind::Register(register) => write!(f, "reg{register}"),
            LocationKind::Memory(address) => write!(f, "[{address:#018x}]"),
            LocationKind::ContextField(ContextSelector(register)) => write!(f, "ctx{register}"),
            LocationKind::Unknown => write!(f, "<unknown>"),
        }
    }
}

impl Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(ValidityBit { word, bit }) = self.validity {
            write!(f, " nat:{word}.{bit}")?;
        }
        if self.floating_point {
            write!(f, " fp")?;
        }
        if self.backed_by_context {
            write!(f, " sc")?;
        }
        Ok(())
    }
}

/// Reading and writing through locations.
///
/// `register` only names the register being resolved, so that an unknown location reports
/// which value was missing.
impl<A: Accessors> AddressSpace<A> {
    pub(crate) fn read_word(
        &self,
        context: &mut A::Context,
        kind: LocationKind,
        register: RegisterId,
    ) -> Result<u64, Error> {
        let mut value = 0;
        self.access_word(context, kind, register, &mut value, Access::Read)?;
        Ok(value)
    }

    pub(crate) fn write_word(
        &self,
        context: &mut A::Context,
        kind: LocationKind,
        register: RegisterId,
        mut value: u64,
    ) -> Result<(), Error> {
        self.access_word(context, kind, register, &mut value, Access::Write)
    }

    fn access_word(
        &self,
        context: &mut A::Context,
        kind: LocationKind,
        register: RegisterId,
        value: &mut u64,
        access: Access,
    ) -> Result<(), Error> {
        let accessors = self.accessors();
        match kind {
            LocationKind::Register(id) | LocationKind::ContextField(ContextSelector(id)) => {
                accessors.access_reg(context, id, value, access)
            }
            LocationKind::Memory(address) => accessors.access_mem(context, address, value, access),
            LocationKind::Unknown => Err(Error::InvalidContext { register }),
        }
    }

    pub(crate) fn access_fp(
        &self,
        context: &mut A::Context,
        kind: LocationKind,
        register: RegisterId,
        value: &mut FpValue,
        access: Access,
    ) -> Result<(), Error> {
        let accessors = self.accessors();
        match kind {
            LocationKind::Register(id) | LocationKind::ContextField(ContextSelector(id)) => {
                accessors.access_fpreg(context, id, value, access)
            }
            LocationKind::Memory(address) => {
                // Spilled floating-point registers occupy two consecutive words, low word first.
                let [low, high] = &mut value.0;
                accessors.access_mem(context, address, low, access)?;
                accessors.access_mem(context, address.wrapping_add(8), high, access)
            }
            LocationKind::Unknown => Err(Error::InvalidContext { register }),
        }
    }

    /// Read the validity flag tracked by `location`. Registers without a tracked flag are
    /// always valid.
    pub(crate) fn read_validity(
        &self,
        context: &mut A::Context,
        location: &Location,
        register: RegisterId,
    ) -> Result<bool, Error> {
        match location.validity {
            Some(ValidityBit { word, bit }) => {
                let word = self.read_word(context, word, register)?;
                Ok(word & (1 << bit) != 0)
            }
            None => Ok(false),
        }
    }

    /// Update the validity flag tracked by `location`, leaving the other bits of its word alone.
    pub(crate) fn write_validity(
        &self,
        context: &mut A::Context,
        location: &Location,
        register: RegisterId,
        invalid: bool,
    ) -> Result<(), Error> {
        let Some(ValidityBit { word, bit }) = location.validity else {
            return if invalid {
                Err(Error::BadRegister { register })
            } else {
                Ok(())
            };
        };
        let current = self.read_word(context, word, register)?;
        let updated = if invalid {
            current | (1 << bit)
        } else {
            current & !(1 << bit)
        };
        self.write_word(context, word, register, updated)
    }
}
