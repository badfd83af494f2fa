//! The frame-by-frame view of one thread's call stack.

use std::sync::Arc;

use rewind_target::{
    regstack::{self, Cfm},
    CoreRegister, FpValue, RegisterFile, RegisterId, RegisterKind, RegisterRole, UnwindRule,
};

use crate::{
    address_space::{Accessors, AddressSpace},
    architecture::{
        self,
        regstack::{BackingStoreSlot, RegisterStack},
    },
    location::{ContextSelector, Location, LocationKind, ValidityBit},
    proc_info::{CfaRule, ProcInfo, ProcName, RegisterRule, UnwindRow},
    resume, Access, Error,
};

/// Where the registers of the innermost frame are read from.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ContextOrigin {
    /// The accessor context holds a captured copy of the registers.
    Captured,
    /// The registers are read from the stopped target itself.
    Live,
}

impl ContextOrigin {
    fn location(self, register: RegisterId) -> Location {
        match self {
            ContextOrigin::Captured => Location::context_field(register),
            ContextOrigin::Live => Location::register(register),
        }
    }
}

/// The result of a successful [`Cursor::step`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The cursor moved to the caller frame.
    Stepped,
    /// There is no caller frame. The cursor did not move.
    EndOfChain,
}

/// The caller frame computed by a step, before it replaces the current one.
struct CallerFrame {
    locations: Vec<Location>,
    ip: u64,
    sp: u64,
    signal_frame: bool,
    signal_context: Option<u64>,
    register_stack: Option<RegisterStack>,
}

/// A position in the call stack of one thread.
///
/// A cursor starts on the innermost frame of the context it was created with. Each
/// [`Cursor::step`] moves it to the caller. Register values are resolved lazily through the
/// location every register has in the current frame.
pub struct Cursor<'a, A: Accessors> {
    space: &'a AddressSpace<A>,
    context: A::Context,
    origin: ContextOrigin,
    locations: Vec<Location>,
    ip: u64,
    sp: u64,
    frame: usize,
    proc_info: Option<Arc<ProcInfo>>,
    /// `ip` is a return address, procedure lookups use the call instruction before it.
    use_prev_instr: bool,
    /// The saved context the current frame returns through, once a signal frame was passed.
    signal_context: Option<u64>,
    eh_args: Vec<Option<u64>>,
    register_stack: Option<RegisterStack>,
}

impl<'a, A: Accessors> Cursor<'a, A> {
    /// A cursor on the innermost frame of `context`.
    pub fn new(
        space: &'a AddressSpace<A>,
        context: A::Context,
        origin: ContextOrigin,
    ) -> Result<Self, Error> {
        let file = space.register_file();
        let locations = file
            .iter()
            .map(|register| initial_location(file, register, origin))
            .collect();

        let mut cursor = Self {
            space,
            context,
            origin,
            locations,
            ip: 0,
            sp: 0,
            frame: 0,
            proc_info: None,
            use_prev_instr: false,
            signal_context: None,
            eh_args: vec![None; file.exception_arguments().len()],
            register_stack: None,
        };

        cursor.ip = cursor.read_location(file.program_counter())?;
        cursor.sp = cursor.read_location(file.stack_pointer())?;
        if file.architecture == rewind_target::Architecture::RegisterStack {
            cursor.register_stack = Some(architecture::regstack::initial_stack(&mut cursor)?);
        }
        cursor.proc_info = cursor.lookup_proc_info(cursor.ip)?;

        tracing::debug!(
            "New cursor at ip {:#010x}, sp {:#010x} ({:?})",
            cursor.ip,
            cursor.sp,
            origin
        );
        Ok(cursor)
    }

    /// A cursor over a context captured in the thread being unwound.
    pub fn init_local(space: &'a AddressSpace<A>, context: A::Context) -> Result<Self, Error> {
        Self::new(space, context, ContextOrigin::Captured)
    }

    /// A cursor over a stopped target whose registers are read through the accessors.
    pub fn init_remote(space: &'a AddressSpace<A>, context: A::Context) -> Result<Self, Error> {
        Self::new(space, context, ContextOrigin::Live)
    }

    /// The address space the cursor walks.
    pub fn address_space(&self) -> &'a AddressSpace<A> {
        self.space
    }

    /// The accessor context.
    pub fn context(&self) -> &A::Context {
        &self.context
    }

    /// Mutable access to the accessor context.
    pub fn context_mut(&mut self) -> &mut A::Context {
        &mut self.context
    }

    /// Give up the cursor and keep the accessor context.
    pub fn into_context(self) -> A::Context {
        self.context
    }

    /// Register file of the target.
    pub fn register_file(&self) -> &'static RegisterFile {
        self.space.register_file()
    }

    /// Instruction pointer of the current frame.
    pub fn ip(&self) -> u64 {
        self.ip
    }

    /// Stack pointer of the current frame.
    pub fn sp(&self) -> u64 {
        self.sp
    }

    /// Number of steps taken since the innermost frame.
    pub fn frame_index(&self) -> usize {
        self.frame
    }

    /// `true` if the current frame is a signal trampoline.
    pub fn is_signal_frame(&self) -> bool {
        self.proc_info
            .as_ref()
            .is_some_and(|info| info.signal_frame.is_some())
    }

    /// Procedure information of the current frame.
    pub fn proc_info(&self) -> Result<Arc<ProcInfo>, Error> {
        self.proc_info
            .clone()
            .ok_or(Error::ProcInfoNotFound { ip: self.ip })
    }

    /// Name of the procedure of the current frame.
    pub fn proc_name(&mut self) -> Result<ProcName, Error> {
        let space = self.space;
        let address = self.lookup_address();
        let mut name = space
            .accessors()
            .get_proc_name(&mut self.context, address)?;
        if self.use_prev_instr {
            name.offset += 1;
        }
        Ok(name)
    }

    /// Where `register` lives in the current frame.
    pub fn location(&self, register: RegisterId) -> Result<Location, Error> {
        let description = self
            .register_file()
            .get(register)
            .ok_or(Error::BadRegister { register })?;
        if let Some(owner) = description.validity_of() {
            return self.location(owner);
        }
        if let (Some(stack), Some(index)) = (&self.register_stack, regstack::stacked_index(register))
        {
            return Ok(self.stacked_location(stack, index));
        }
        Ok(self.locations[register.index()])
    }

    fn stacked_location(&self, stack: &RegisterStack, index: u16) -> Location {
        if u64::from(index) >= stack.frame_size() {
            return Location::UNKNOWN;
        }
        match stack.stacked_location(u64::from(index)) {
            Ok(location) => location,
            // Registers of the innermost frame that were never spilled are still in the
            // register file.
            Err(_) if self.frame == 0 => {
                let n = regstack::FIRST_STACKED + index;
                self.origin
                    .location(regstack::gr(n))
                    .with_validity(self.origin.location(regstack::nat(n)).kind, 0)
            }
            Err(_) => Location::UNKNOWN,
        }
    }

    /// Read an integer register, or a validity flag as 0 or 1.
    pub fn get_reg(&mut self, register: RegisterId) -> Result<u64, Error> {
        let file = self.register_file();
        let description = file.get(register).ok_or(Error::BadRegister { register })?;
        if description.is_floating_point() {
            return Err(Error::BadRegister { register });
        }

        if register == file.program_counter() {
            return Ok(self.ip);
        }
        if register == file.stack_pointer() {
            return Ok(self.sp);
        }
        if description.register_has_role(RegisterRole::BackingStorePointer) {
            if let Some(stack) = &self.register_stack {
                return Ok(stack.bsp().address());
            }
        }
        if let Some(Some(value)) = exception_argument(description).and_then(|n| self.eh_args.get(n))
        {
            return Ok(*value);
        }

        let location = self.location(register)?;
        if description.validity_of().is_some() {
            let invalid = self
                .space
                .read_validity(&mut self.context, &location, register)?;
            return Ok(invalid as u64);
        }

        let value = self
            .space
            .read_word(&mut self.context, location.kind, register)?;
        if description.register_has_role(RegisterRole::FrameMarker) {
            Ok(value & Cfm::MASK)
        } else {
            Ok(value)
        }
    }

    /// Write an integer register of the current frame.
    ///
    /// Writing the instruction pointer moves the frame to the new address. The stack pointer
    /// and backing store pointer are derived while unwinding and cannot be written.
    pub fn set_reg(&mut self, register: RegisterId, value: u64) -> Result<(), Error> {
        let file = self.register_file();
        let description = file.get(register).ok_or(Error::BadRegister { register })?;
        if description.is_floating_point() {
            return Err(Error::BadRegister { register });
        }
        if register == file.stack_pointer()
            || description.register_has_role(RegisterRole::BackingStorePointer)
        {
            return Err(Error::ReadOnlyRegister { register });
        }

        let location = self.location(register)?;
        if description.validity_of().is_some() {
            return self
                .space
                .write_validity(&mut self.context, &location, register, value != 0);
        }
        if let Some(n) = exception_argument(description) {
            if let Some(argument) = self.eh_args.get_mut(n) {
                *argument = Some(value);
            }
            if location.is_unknown() {
                return Ok(());
            }
        }

        // The new frame's procedure is resolved before anything changes.
        let proc_info = if register == file.program_counter() {
            Some(self.lookup_proc_info(value)?)
        } else {
            None
        };

        self.space
            .write_word(&mut self.context, location.kind, register, value)?;

        if let Some(info) = proc_info {
            if let Some(previous) = std::mem::replace(&mut self.proc_info, info) {
                self.space.release_proc_info(&mut self.context, &previous);
            }
            self.ip = value;
            self.use_prev_instr = false;
        }
        Ok(())
    }

    /// Read a floating-point register.
    pub fn get_fpreg(&mut self, register: RegisterId) -> Result<FpValue, Error> {
        let location = self.fp_location(register)?;
        let mut value = FpValue::default();
        self.space.access_fp(
            &mut self.context,
            location.kind,
            register,
            &mut value,
            Access::Read,
        )?;
        Ok(value)
    }

    /// Write a floating-point register.
    pub fn set_fpreg(&mut self, register: RegisterId, mut value: FpValue) -> Result<(), Error> {
        let location = self.fp_location(register)?;
        self.space.access_fp(
            &mut self.context,
            location.kind,
            register,
            &mut value,
            Access::Write,
        )
    }

    fn fp_location(&self, register: RegisterId) -> Result<Location, Error> {
        match self.register_file().get(register) {
            Some(description) if description.is_floating_point() => self.location(register),
            _ => Err(Error::BadRegister { register }),
        }
    }

    /// Move to the caller of the current frame.
    ///
    /// All reads happen before the cursor changes: on error the cursor is still on the frame
    /// it was on.
    pub fn step(&mut self) -> Result<StepOutcome, Error> {
        if self.ip == 0 {
            return Ok(StepOutcome::EndOfChain);
        }

        let caller = self.unwind_caller()?;

        if caller.ip == 0 {
            tracing::debug!("UNWIND: Caller of {:#010x} has no return address", self.ip);
            return Ok(StepOutcome::EndOfChain);
        }
        if caller.ip == self.ip && caller.sp == self.sp {
            tracing::warn!(
                "UNWIND: Frame at {:#010x} unwinds to itself, preventing infinite loop",
                self.ip
            );
            return Ok(StepOutcome::EndOfChain);
        }

        // Return addresses point after the call, which may be past the end of the caller.
        let use_prev_instr = !caller.signal_frame;
        let lookup = if use_prev_instr {
            caller.ip.wrapping_sub(1)
        } else {
            caller.ip
        };
        let info = match self.space.find_proc_info(&mut self.context, lookup) {
            Ok(info) => info,
            Err(Error::ProcInfoNotFound { .. }) => {
                tracing::debug!("UNWIND: No procedure covers {:#010x}", caller.ip);
                return Ok(StepOutcome::EndOfChain);
            }
            Err(error) => return Err(error),
        };

        if let Some(previous) = self.proc_info.replace(info) {
            self.space.release_proc_info(&mut self.context, &previous);
        }
        self.locations = caller.locations;
        self.ip = caller.ip;
        self.sp = caller.sp;
        self.use_prev_instr = use_prev_instr;
        self.signal_context = caller.signal_context;
        self.register_stack = caller.register_stack;
        self.eh_args.fill(None);
        self.frame += 1;

        if self.register_stack.is_some() {
            architecture::regstack::track_previous_function_state(self);
        }

        tracing::trace!(
            "UNWIND: Frame {} at ip {:#010x}, sp {:#010x}",
            self.frame,
            self.ip,
            self.sp
        );
        Ok(StepOutcome::Stepped)
    }

    fn unwind_caller(&mut self) -> Result<CallerFrame, Error> {
        let file = self.register_file();
        let info = self.proc_info.clone();
        let row = match info.as_deref().and_then(|info| info.unwind.clone()) {
            Some(row) => row,
            None => {
                tracing::debug!(
                    "UNWIND: No unwind rules for {:#010x}, using the {} fallback",
                    self.ip,
                    file.name
                );
                architecture::fallback_row(file)
            }
        };
        let signal = info.as_deref().and_then(|info| info.signal_frame);
        let stack_switch = info.as_deref().is_some_and(|info| info.stack_switch);

        let cfa = self.cfa(&row)?;
        tracing::trace!("UNWIND: CFA {cfa:#010x} from {}", row.cfa);

        let (mut next, signal_context) = match signal {
            Some(signal) => {
                let context = cfa
                    .checked_add_signed(signal.context_offset)
                    .ok_or_else(|| Error::address_overflow(cfa, Access::Read))?;
                (self.signal_context_locations(context)?, Some(context))
            }
            None => (self.caller_locations(&row, cfa)?, self.signal_context),
        };

        let pc = file.program_counter();
        let ip = if signal.is_some() {
            self.read_kind(next[pc.index()].kind, pc)?
        } else {
            let ra = file.return_address();
            let ip = self.read_kind(next[ra.index()].kind, ra)?;
            next[pc.index()] = next[ra.index()];
            if ra != pc {
                next[ra.index()] = Location::UNKNOWN;
            }
            ip
        };

        let sp_register = file.stack_pointer();
        let mut sp = if signal.is_some() {
            self.read_kind(next[sp_register.index()].kind, sp_register)?
        } else {
            next[sp_register.index()] = Location::UNKNOWN;
            cfa
        };

        let register_stack = match self.register_stack.clone() {
            Some(stack) => {
                let step = architecture::regstack::unwind(
                    self,
                    &stack,
                    &mut next,
                    cfa,
                    signal.and(signal_context),
                    stack_switch,
                )?;
                if let Some(previous_sp) = step.previous_sp {
                    sp = previous_sp;
                }
                Some(step.register_stack)
            }
            None => None,
        };

        Ok(CallerFrame {
            locations: next,
            ip,
            sp,
            signal_frame: signal.is_some(),
            signal_context,
            register_stack,
        })
    }

    /// The canonical frame address of the current frame under `row`.
    pub(crate) fn cfa(&mut self, row: &UnwindRow) -> Result<u64, Error> {
        let CfaRule::RegisterAndOffset { register, offset } = row.cfa;
        Ok(self.get_reg(register)?.wrapping_add_signed(offset))
    }

    fn caller_locations(&self, row: &UnwindRow, cfa: u64) -> Result<Vec<Location>, Error> {
        let file = self.register_file();
        let spilled_collection = file
            .by_role(RegisterRole::SpilledValidityCollection)
            .map(|collection| self.location(collection.id))
            .transpose()?;

        file.iter()
            .map(|register| self.caller_location(register, row, cfa, spilled_collection))
            .collect()
    }

    fn caller_location(
        &self,
        register: &CoreRegister,
        row: &UnwindRow,
        cfa: u64,
        spilled_collection: Option<Location>,
    ) -> Result<Location, Error> {
        if register.validity_of().is_some() || self.is_stacked(register.id) {
            return Ok(Location::UNKNOWN);
        }

        let rule = row.rule(register.id).unwrap_or(match register.unwind_rule {
            UnwindRule::Preserve => RegisterRule::SameValue,
            UnwindRule::Clear | UnwindRule::SpecialRule => RegisterRule::Undefined,
        });

        let location = match rule {
            RegisterRule::Undefined => Location::UNKNOWN,
            RegisterRule::SameValue => self.locations[register.id.index()],
            RegisterRule::Offset(offset) => {
                let address = cfa.wrapping_add_signed(offset);
                let location = Location::memory(address);
                match spilled_collection {
                    Some(collection)
                        if register.kind == RegisterKind::Integer
                            && self.register_file().validity_flag_of(register.id).is_some() =>
                    {
                        let bit = BackingStoreSlot(address).slot_number() as u8;
                        location.with_validity(collection.kind, bit)
                    }
                    _ => location,
                }
            }
            RegisterRule::Register(source) => Location {
                floating_point: false,
                ..self.location(source)?
            },
        };

        tracing::trace!(
            "UNWIND - {:>10}: {} ({rule})",
            self.register_file().register_name(register.id),
            location
        );
        Ok(if register.is_floating_point() {
            location.floating_point()
        } else {
            location
        })
    }

    /// Every register of the interrupted frame is in the saved context at `context`.
    fn signal_context_locations(&self, context: u64) -> Result<Vec<Location>, Error> {
        let file = self.register_file();
        let layout = file.context;
        let overflow = || Error::address_overflow(context, Access::Read);
        file.iter()
            .map(|register| {
                if register.validity_of().is_some() || self.is_stacked(register.id) {
                    return Ok(Location::UNKNOWN);
                }
                let slot = layout
                    .slot_address(context, register.id)
                    .ok_or_else(overflow)?;
                let location = Location::memory(slot).backed_by_context();
                if register.is_floating_point() {
                    return Ok(location.floating_point());
                }
                if register.id.0 < 64 && file.validity_flag_of(register.id).is_some() {
                    if let Some(word) = layout.validity_word_address(context) {
                        return Ok(location
                            .with_validity(LocationKind::Memory(word), register.id.0 as u8));
                    }
                    if layout.validity_word.is_some() {
                        return Err(overflow());
                    }
                }
                Ok(location)
            })
            .collect()
    }

    fn is_stacked(&self, register: RegisterId) -> bool {
        self.register_stack.is_some() && regstack::stacked_index(register).is_some()
    }

    fn lookup_address(&self) -> u64 {
        if self.use_prev_instr {
            self.ip.wrapping_sub(1)
        } else {
            self.ip
        }
    }

    /// The procedure covering `ip`, or `None` if no procedure does.
    fn lookup_proc_info(&mut self, ip: u64) -> Result<Option<Arc<ProcInfo>>, Error> {
        match self.space.find_proc_info(&mut self.context, ip) {
            Ok(info) => Ok(Some(info)),
            Err(Error::ProcInfoNotFound { .. }) => {
                tracing::debug!("No procedure information for {ip:#010x}");
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }

    fn read_location(&mut self, register: RegisterId) -> Result<u64, Error> {
        let location = self.location(register)?;
        self.read_kind(location.kind, register)
    }

    /// Read one word from `kind`, reporting failures against `register`.
    pub(crate) fn read_kind(
        &mut self,
        kind: LocationKind,
        register: RegisterId,
    ) -> Result<u64, Error> {
        self.space.read_word(&mut self.context, kind, register)
    }

    /// Write one word of target memory.
    pub(crate) fn write_memory(&mut self, address: u64, mut value: u64) -> Result<(), Error> {
        let space = self.space;
        space
            .accessors()
            .access_mem(&mut self.context, address, &mut value, Access::Write)
    }

    pub(crate) fn current_proc_info(&self) -> Option<&ProcInfo> {
        self.proc_info.as_deref()
    }

    pub(crate) fn set_location(&mut self, register: RegisterId, location: Location) {
        self.locations[register.index()] = location;
    }

    pub(crate) fn register_stack(&self) -> Option<&RegisterStack> {
        self.register_stack.as_ref()
    }

    pub(crate) fn signal_context(&self) -> Option<u64> {
        self.signal_context
    }

    /// The exception arguments set on this frame, in argument order.
    pub(crate) fn exception_argument_values(&self) -> &[Option<u64>] {
        &self.eh_args
    }

    /// Turn locations naming machine registers into locations of the accessor context, which
    /// is where a local resume loads registers from.
    pub(crate) fn memify(&mut self) {
        let memify = |kind: LocationKind| match kind {
            LocationKind::Register(register) => {
                LocationKind::ContextField(ContextSelector(register))
            }
            other => other,
        };
        for location in &mut self.locations {
            location.kind = memify(location.kind);
            if let Some(validity) = &mut location.validity {
                *validity = ValidityBit {
                    word: memify(validity.word),
                    bit: validity.bit,
                };
            }
        }
        self.origin = ContextOrigin::Captured;
    }

    /// Continue execution in the current frame.
    ///
    /// Remote targets get every register that can be resolved written back through the
    /// accessors first. Local targets install the frame's state directly.
    pub fn resume(&mut self) -> Result<(), Error> {
        tracing::debug!("Resuming frame {} at {:#010x}", self.frame, self.ip);
        if A::LOCAL {
            self.memify();
        } else {
            resume::install_remote(self)?;
        }
        let space = self.space;
        space.accessors().resume(self)
    }
}

impl<A: Accessors> std::fmt::Debug for Cursor<'_, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("frame", &self.frame)
            .field("ip", &format_args!("{:#010x}", self.ip))
            .field("sp", &format_args!("{:#010x}", self.sp))
            .field("origin", &self.origin)
            .field("register_stack", &self.register_stack)
            .finish_non_exhaustive()
    }
}

fn initial_location(file: &RegisterFile, register: &CoreRegister, origin: ContextOrigin) -> Location {
    match register.kind {
        RegisterKind::Validity { .. } => Location::UNKNOWN,
        _ if file.architecture == rewind_target::Architecture::RegisterStack
            && regstack::stacked_index(register.id).is_some() =>
        {
            Location::UNKNOWN
        }
        RegisterKind::FloatingPoint => origin.location(register.id).floating_point(),
        RegisterKind::Integer => {
            let location = origin.location(register.id);
            match file.validity_flag_of(register.id) {
                Some(flag) => location.with_validity(origin.location(flag).kind, 0),
                None => location,
            }
        }
    }
}

fn exception_argument(register: &CoreRegister) -> Option<usize> {
    register.roles.iter().find_map(|role| match role {
        RegisterRole::ExceptionArgument(n) => Some(*n as usize),
        _ => None,
    })
}
