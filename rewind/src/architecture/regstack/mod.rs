//! Stepping over the register stack.
//!
//! Stacked registers are not described by unwind rules. Their locations follow from the
//! backing store pointer of each frame, which a step moves down by the caller's size of locals
//! (found in the previous function state) or, for stack switching procedures, to the end of
//! the caller's backing store.

pub(crate) mod resume;
mod rse;

pub use rse::{
    primary_unat, BackingStoreArea, BackingStoreSlot, FlushedStack, RegisterStack, AREA_COUNT,
    NAT_COLLECTION_SLOT,
};

use rewind_target::regstack::{self, Cfm, Pfs};

use crate::{
    address_space::Accessors,
    cursor::Cursor,
    location::{Location, LocationKind},
    proc_info::{CfaRule, RegisterRule, UnwindRow},
    Access, Error,
};

/// Number of words in the marker a stack switching procedure leaves at its CFA:
/// `[end, size, nat collection address, previous stack pointer]`.
pub const SWITCH_MARKER_WORDS: u64 = 4;

pub(super) fn fallback_row() -> UnwindRow {
    UnwindRow::new(CfaRule::RegisterAndOffset {
        register: regstack::SP,
        offset: 0,
    })
    .with_rule(regstack::RP, RegisterRule::SameValue)
    .with_rule(regstack::PFS, RegisterRule::SameValue)
}

/// The register stack of the innermost frame.
pub(crate) fn initial_stack<A: Accessors>(
    cursor: &mut Cursor<'_, A>,
) -> Result<RegisterStack, Error> {
    let bsp = cursor.get_reg(regstack::BSP)?;
    let bspstore = cursor.get_reg(regstack::BSPSTORE).unwrap_or_else(|error| {
        tracing::debug!("No backing store store pointer ({error}), assuming a flushed stack");
        bsp
    });
    let cfm = Cfm(cursor.get_reg(regstack::CFM)?);
    let nat_collection = cursor.location(regstack::RNAT)?.kind;

    let mut stack = RegisterStack::new(bsp, bspstore, nat_collection);
    stack.set_frame_size(cfm.sof());
    Ok(stack)
}

/// How a step left the register stack.
pub(crate) struct StackStep {
    pub register_stack: RegisterStack,
    /// The caller's stack pointer, when a stack switch recorded it.
    pub previous_sp: Option<u64>,
}

/// Move the register stack from the current frame to its caller.
///
/// `next` holds the caller's locations. On return the caller's frame marker location is filled
/// in. `signal_context` is the saved context of a signal frame being stepped through.
pub(crate) fn unwind<A: Accessors>(
    cursor: &mut Cursor<'_, A>,
    current: &RegisterStack,
    next: &mut [Location],
    cfa: u64,
    signal_context: Option<u64>,
    stack_switch: bool,
) -> Result<StackStep, Error> {
    let mut stack = current.clone();

    if let Some(context) = signal_context {
        let layout = regstack::CONTEXT_LAYOUT;
        let saved = |register| {
            layout
                .slot_address(context, register)
                .map(LocationKind::Memory)
                .ok_or_else(|| Error::address_overflow(context, Access::Read))
        };
        let bsp = cursor.read_kind(saved(regstack::BSP)?, regstack::BSP)?;
        let bspstore = cursor.read_kind(saved(regstack::BSPSTORE)?, regstack::BSPSTORE)?;
        let cfm = Cfm(cursor.read_kind(next[regstack::CFM.index()].kind, regstack::CFM)?
            & Cfm::MASK);

        if stack.current_area().contains(bsp) {
            stack.set_bsp(BackingStoreSlot(bsp));
        } else {
            tracing::trace!("UNWIND: Signal frame interrupted a different backing store");
            let area = BackingStoreArea {
                end: bspstore,
                size: BackingStoreArea::UNBOUNDED,
                nat_collection: saved(regstack::RNAT)?,
            };
            stack.switch(area, BackingStoreSlot(bsp));
        }
        stack.set_frame_size(cfm.sof());
        return Ok(StackStep {
            register_stack: stack,
            previous_sp: None,
        });
    }

    // The previous function state of this frame is the caller's frame marker.
    let pfs_location = next[regstack::PFS.index()];
    let pfs = Pfs(cursor.read_kind(pfs_location.kind, regstack::PFS)?);
    next[regstack::CFM.index()] = pfs_location;
    next[regstack::PFS.index()] = Location::UNKNOWN;
    let sol = pfs.sol() as i64;

    let mut previous_sp = None;
    if stack_switch {
        let mut marker = [0u64; SWITCH_MARKER_WORDS as usize];
        for (index, word) in marker.iter_mut().enumerate() {
            let address = cfa
                .checked_add(8 * index as u64)
                .ok_or_else(|| Error::address_overflow(cfa, Access::Read))?;
            *word = cursor.read_kind(LocationKind::Memory(address), regstack::BSP)?;
        }
        let [end, size, nat_address, sp] = marker;
        let area = BackingStoreArea {
            end,
            size: if size == 0 {
                BackingStoreArea::UNBOUNDED
            } else {
                size
            },
            nat_collection: if nat_address == 0 {
                LocationKind::Unknown
            } else {
                LocationKind::Memory(nat_address)
            },
        };
        stack.switch(area, BackingStoreSlot(end).skip(-sol));
        previous_sp = Some(sp);
    } else {
        stack.set_bsp(stack.bsp().skip(-sol));
    }
    stack.set_frame_size(pfs.sof());

    Ok(StackStep {
        register_stack: stack,
        previous_sp,
    })
}

/// Point the frame's previous function state at the place its unwind rules say it was saved.
///
/// The rule for the previous function state in a procedure's own row locates the procedure's
/// copy of it, which the next step needs to find the caller's frame marker.
pub(crate) fn track_previous_function_state<A: Accessors>(cursor: &mut Cursor<'_, A>) {
    let Some(row) = cursor
        .current_proc_info()
        .and_then(|info| info.unwind.clone())
    else {
        return;
    };

    let location = match row.rule(regstack::PFS) {
        Some(RegisterRule::Register(source)) => cursor.location(source),
        Some(RegisterRule::Offset(offset)) => cursor
            .cfa(&row)
            .map(|cfa| Location::memory(cfa.wrapping_add_signed(offset))),
        _ => return,
    };
    match location {
        Ok(location) => cursor.set_location(regstack::PFS, location),
        Err(error) => tracing::debug!("UNWIND: Previous function state not found: {error}"),
    }
}
