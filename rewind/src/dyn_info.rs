//! Reading the target's list of dynamically registered procedures.
//!
//! JIT compilers announce generated code through an intrusive doubly linked list in the target's
//! memory. The list head lives at the address returned by
//! [`Accessors::get_dyn_info_list_addr`] and consists of two words, `[generation, first]`. Every
//! node consists of eight words:
//!
//! | word | content |
//! |------|---------|
//! | 0 | next node, or 0 |
//! | 1 | previous node, or 0 |
//! | 2 | first instruction address |
//! | 3 | first address past the procedure |
//! | 4 | global pointer |
//! | 5 | format, [`FORMAT_PROC_INFO`] for nodes this reader understands |
//! | 6 | personality routine |
//! | 7 | language specific data |
//!
//! The list is only ever read.

use std::collections::HashSet;

use crate::{
    address_space::{AddressSpace, Accessors},
    proc_info::ProcInfo,
    Access, Error,
};

/// Format of a node describing a plain procedure.
pub const FORMAT_PROC_INFO: u64 = 0;

/// Number of words in a list node.
pub const NODE_WORDS: u64 = 8;

/// Upper bound on the nodes visited in one walk.
const MAX_NODES: usize = 1 << 16;

fn read<A: Accessors>(
    space: &AddressSpace<A>,
    context: &mut A::Context,
    address: u64,
) -> Result<u64, Error> {
    let mut value = 0;
    space
        .accessors()
        .access_mem(context, address, &mut value, Access::Read)?;
    Ok(value)
}

fn read_node<A: Accessors>(
    space: &AddressSpace<A>,
    context: &mut A::Context,
    node: u64,
) -> Result<(u64, Option<ProcInfo>), Error> {
    let mut words = [0u64; NODE_WORDS as usize];
    for (index, word) in words.iter_mut().enumerate() {
        let address = node
            .checked_add(8 * index as u64)
            .ok_or_else(|| Error::address_overflow(node, Access::Read))?;
        *word = read(space, context, address)?;
    }
    let [next, _prev, start_ip, end_ip, gp, format, handler, lsda] = words;

    if format != FORMAT_PROC_INFO {
        tracing::trace!("Skipping dynamic procedure at {start_ip:#x} with format {format}");
        return Ok((next, None));
    }
    Ok((
        next,
        Some(ProcInfo {
            gp,
            handler,
            lsda,
            ..ProcInfo::new(start_ip, end_ip)
        }),
    ))
}

/// Visit the procedures on the list until `visit` returns `true`.
fn walk<A: Accessors>(
    space: &AddressSpace<A>,
    context: &mut A::Context,
    mut visit: impl FnMut(ProcInfo) -> bool,
) -> Result<(), Error> {
    let head = match space.dyn_info_list_addr(context) {
        Ok(0) | Err(Error::NotSupported(_)) => return Ok(()),
        Ok(head) => head,
        Err(error) => return Err(error),
    };

    let first_slot = head
        .checked_add(8)
        .ok_or_else(|| Error::address_overflow(head, Access::Read))?;
    let mut node = read(space, context, first_slot)?;
    let mut visited = HashSet::new();
    for _ in 0..MAX_NODES {
        if node == 0 {
            return Ok(());
        }
        if !visited.insert(node) {
            tracing::warn!("Dynamic procedure list at {head:#x} loops back to {node:#x}");
            return Ok(());
        }
        let (next, info) = read_node(space, context, node)?;
        if info.is_some_and(&mut visit) {
            return Ok(());
        }
        node = next;
    }
    tracing::warn!("Gave up walking the dynamic procedure list after {MAX_NODES} nodes");
    Ok(())
}

/// Find the dynamically registered procedure covering `ip`.
pub(crate) fn find_proc_info<A: Accessors>(
    space: &AddressSpace<A>,
    context: &mut A::Context,
    ip: u64,
) -> Result<ProcInfo, Error> {
    let mut found = None;
    walk(space, context, |info| {
        if info.contains(ip) {
            found = Some(info);
            true
        } else {
            false
        }
    })?;
    found.ok_or(Error::ProcInfoNotFound { ip })
}

/// All procedures on the target's dynamic procedure list.
pub fn dynamic_procedures<A: Accessors>(
    space: &AddressSpace<A>,
    context: &mut A::Context,
) -> Result<Vec<ProcInfo>, Error> {
    let mut procedures = Vec::new();
    walk(space, context, |info| {
        procedures.push(info);
        false
    })?;
    Ok(procedures)
}
