//! Handing the state of a frame back to the target.

use rewind_target::{Architecture, FpValue, RegisterId};
use serde::Serialize;

use crate::{
    address_space::Accessors,
    architecture::regstack::{self, FlushedStack},
    cursor::Cursor,
    Access, Error,
};

/// Everything a local resume has to load before jumping to the frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstallState {
    /// Where execution continues.
    pub ip: u64,
    /// Stack pointer of the frame.
    pub sp: u64,
    /// Integer registers with a known value, in register order.
    pub registers: Vec<(RegisterId, u64)>,
    /// Floating-point registers with a known value, in register order.
    pub fp_registers: Vec<(RegisterId, FpValue)>,
    /// Validity collection to load before restoring the preserved registers spilled at
    /// [`ContextInstaller::scratch_address`].
    pub primary_nat: Option<u64>,
    /// The frame's stacked registers, for targets with a register stack.
    pub register_stack: Option<FlushedStack>,
    /// Set when the frame has to be entered by returning through the saved context at this
    /// address. The context has already been updated with the frame's state.
    pub signal_context: Option<u64>,
}

/// Performs the final transfer of control of a local resume.
///
/// Loading a complete register state and jumping to it cannot be expressed in safe code; the
/// installer is the one piece the embedding program provides.
pub trait ContextInstaller: Send + Sync {
    /// Address the installer spills the preserved registers to while loading them. Only
    /// register-stack targets use it, to place the validity bits of those registers.
    fn scratch_address(&self) -> u64 {
        0
    }

    /// Load `state` and continue there.
    fn install(&self, state: InstallState) -> Result<(), Error>;
}

/// The value of one register, as gathered for an install.
#[derive(Debug, Copy, Clone, PartialEq)]
enum RegisterValue {
    Integer(u64),
    FloatingPoint(FpValue),
}

/// Resolve every register of the frame. Registers whose location is unknown are left out.
fn resolve_registers<A: Accessors>(
    cursor: &mut Cursor<'_, A>,
    include_validity: bool,
) -> Vec<(RegisterId, RegisterValue)> {
    let file = cursor.register_file();
    let mut values = Vec::with_capacity(file.len());
    for register in file.iter() {
        if register.validity_of().is_some() && !include_validity {
            continue;
        }
        let value = if register.is_floating_point() {
            cursor.get_fpreg(register.id).map(RegisterValue::FloatingPoint)
        } else {
            cursor.get_reg(register.id).map(RegisterValue::Integer)
        };
        match value {
            Ok(value) => values.push((register.id, value)),
            Err(error) => tracing::trace!(
                "Not restoring {}: {error}",
                file.register_name(register.id)
            ),
        }
    }
    values
}

/// Write every register of the cursor's frame back through the accessors.
///
/// Values are resolved before the first write, since writing a register may change what other
/// locations read. Writes happen in register order and stop at the first failure: the
/// registers before it have their new value, the rest keep their old one.
pub(crate) fn install_remote<A: Accessors>(cursor: &mut Cursor<'_, A>) -> Result<(), Error> {
    let values = resolve_registers(cursor, true);
    let accessors = cursor.address_space().accessors();
    tracing::debug!("Writing back {} registers", values.len());

    for (register, value) in values {
        match value {
            RegisterValue::Integer(mut value) => {
                accessors.access_reg(cursor.context_mut(), register, &mut value, Access::Write)?
            }
            RegisterValue::FloatingPoint(mut value) => accessors.access_fpreg(
                cursor.context_mut(),
                register,
                &mut value,
                Access::Write,
            )?,
        }
    }
    Ok(())
}

/// The state a local resume into the cursor's frame has to install.
///
/// When the resume goes through a saved signal context, registers that do not already live in
/// that context are written into it. `scratch` is the installer's
/// [`ContextInstaller::scratch_address`].
pub fn install_state<A: Accessors>(
    cursor: &mut Cursor<'_, A>,
    scratch: u64,
) -> Result<InstallState, Error> {
    if cursor.register_file().architecture == Architecture::RegisterStack {
        return regstack::resume::install_state(cursor, scratch);
    }

    let (registers, fp_registers) = split(resolve_registers(cursor, false));
    let signal_context = cursor.signal_context();

    if let Some(context) = signal_context {
        let layout = cursor.register_file().context;
        for (register, value) in &registers {
            let slot = layout
                .slot_address(context, *register)
                .ok_or_else(|| Error::address_overflow(context, Access::Write))?;
            let in_place = cursor.location(*register).is_ok_and(|location| {
                location.backed_by_context && location.address() == Some(slot)
            });
            if in_place {
                continue;
            }
            cursor.write_memory(slot, *value)?;
        }
    }

    Ok(InstallState {
        ip: cursor.ip(),
        sp: cursor.sp(),
        registers,
        fp_registers,
        primary_nat: None,
        register_stack: None,
        signal_context,
    })
}

fn split(
    values: Vec<(RegisterId, RegisterValue)>,
) -> (Vec<(RegisterId, u64)>, Vec<(RegisterId, FpValue)>) {
    let mut registers = Vec::new();
    let mut fp_registers = Vec::new();
    for (register, value) in values {
        match value {
            RegisterValue::Integer(value) => registers.push((register, value)),
            RegisterValue::FloatingPoint(value) => fp_registers.push((register, value)),
        }
    }
    (registers, fp_registers)
}
