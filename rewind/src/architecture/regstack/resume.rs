//! Local resume on a register-stack machine.

use rewind_target::{
    regstack::{self, Cfm, Pfs, CFM, FPSR, GP, IP, PFS, PR, PR_PRESERVED, PR_SCRATCH, SP, UNAT},
    FpValue, RegisterId, UnwindRule,
};

use super::{primary_unat, FlushedStack};
use crate::{
    address_space::Accessors, cursor::Cursor, location::LocationKind, resume::InstallState,
    Access, Error,
};

/// Registers besides `r4`-`r7` that are restored when they can be resolved.
const RESTORED: [RegisterId; 10] = [
    PR,
    UNAT,
    regstack::LC,
    FPSR,
    regstack::br(1),
    regstack::br(2),
    regstack::br(3),
    regstack::br(4),
    regstack::br(5),
    CFM,
];

fn flush<A: Accessors>(
    cursor: &mut Cursor<'_, A>,
    registers: u64,
) -> Result<FlushedStack, Error> {
    let stack = cursor
        .register_stack()
        .cloned()
        .ok_or(Error::NotSupported("resume without a register stack"))?;
    stack.cover_and_flush(registers, |kind: LocationKind| {
        cursor.read_kind(kind, regstack::BSPSTORE)
    })
}

/// The preserved floating-point registers that can be resolved.
fn preserved_fp_registers<A: Accessors>(cursor: &mut Cursor<'_, A>) -> Vec<(RegisterId, FpValue)> {
    let file = cursor.register_file();
    file.iter()
        .filter(|register| {
            register.is_floating_point() && register.unwind_rule == UnwindRule::Preserve
        })
        .filter_map(|register| match cursor.get_fpreg(register.id) {
            Ok(value) => Some((register.id, value)),
            Err(error) => {
                tracing::trace!(
                    "Not restoring {}: {error}",
                    file.register_name(register.id)
                );
                None
            }
        })
        .collect()
}

/// The state of a local resume into the cursor's frame.
///
/// When the frame was interrupted by a signal, directly or further down the stack, the resume
/// has to go through the saved context: the frame's state is written into it here.
pub(crate) fn install_state<A: Accessors>(
    cursor: &mut Cursor<'_, A>,
    scratch: u64,
) -> Result<InstallState, Error> {
    let gp = cursor.proc_info()?.gp;
    let file = cursor.register_file();

    let mut registers = Vec::with_capacity(RESTORED.len() + 8);
    let mut nats = [false; 4];
    for (n, nat) in (4..=7).zip(nats.iter_mut()) {
        registers.push((regstack::gr(n), cursor.get_reg(regstack::gr(n))?));
        *nat = cursor.get_reg(regstack::nat(n))? != 0;
    }
    let primary_nat = primary_unat(nats, scratch);

    let exception_arguments: Vec<(RegisterId, u64)> = file
        .exception_arguments()
        .into_iter()
        .zip(cursor.exception_argument_values().to_vec())
        .filter_map(|(register, value)| Some((register, value?)))
        .collect();
    let fp_registers = preserved_fp_registers(cursor);

    if let Some(context) = cursor.signal_context() {
        let slot = |register: RegisterId| {
            regstack::CONTEXT_LAYOUT
                .slot_address(context, register)
                .ok_or_else(|| Error::address_overflow(context, Access::Write))
        };

        let sp = cursor.sp();
        cursor.write_memory(slot(SP)?, sp)?;

        let cfm = cursor.get_reg(CFM)?;
        let register_stack = flush(cursor, Cfm(cfm).sof())?;

        let ip = cursor.ip();
        cursor.write_memory(slot(IP)?, ip)?;
        cursor.write_memory(slot(CFM)?, cfm & Cfm::MASK)?;

        // Scratch predicates keep the values of the interrupted code.
        let pr = cursor.get_reg(PR)?;
        let saved_pr = cursor.read_kind(LocationKind::Memory(slot(PR)?), PR)?;
        cursor.write_memory(slot(PR)?, (pr & !PR_SCRATCH) | (saved_pr & !PR_PRESERVED))?;

        for register in [PFS, FPSR, UNAT] {
            let value = cursor.get_reg(register)?;
            cursor.write_memory(slot(register)?, value)?;
        }
        cursor.write_memory(slot(GP)?, gp)?;
        for (register, value) in &exception_arguments {
            cursor.write_memory(slot(*register)?, *value)?;
        }

        tracing::debug!("Resuming {ip:#010x} through the saved context at {context:#010x}");
        return Ok(InstallState {
            ip,
            sp,
            registers,
            fp_registers,
            primary_nat: Some(primary_nat),
            register_stack: Some(register_stack),
            signal_context: Some(context),
        });
    }

    let pfs = cursor.get_reg(PFS)?;
    let register_stack = flush(cursor, Pfs(pfs).sol())?;

    for register in RESTORED {
        match cursor.get_reg(register) {
            Ok(value) => registers.push((register, value)),
            Err(error) => tracing::trace!(
                "Not restoring {}: {error}",
                file.register_name(register)
            ),
        }
    }
    registers.push((PFS, pfs));
    registers.push((GP, gp));
    registers.extend(exception_arguments);
    registers.sort_by_key(|(register, _)| *register);

    Ok(InstallState {
        ip: cursor.ip(),
        sp: cursor.sp(),
        registers,
        fp_registers,
        primary_nat: Some(primary_nat),
        register_stack: Some(register_stack),
        signal_context: None,
    })
}
