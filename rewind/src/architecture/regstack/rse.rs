//! Backing store arithmetic of the register stack engine.
//!
//! Stacked registers are spilled to the backing store one 8-byte slot per register. Slot 63 of
//! every 64-slot group does not hold a register: the engine stores the collected validity bits
//! of the 63 slots before it there. All register counting has to step over these slots.
//!
//! A thread's backing store is not always one contiguous area. Procedures that switch stacks
//! (kernel entry, user level thread switches) leave the older frames in a different area, so a
//! [`RegisterStack`] keeps a small ring of the areas seen while unwinding.

use serde::Serialize;

use crate::{location::LocationKind, Error, Location};

/// Slot number of the validity collection inside a 64-slot group.
pub const NAT_COLLECTION_SLOT: u64 = 0x3f;

/// Number of backing store areas a cursor remembers. Older areas are forgotten.
pub const AREA_COUNT: usize = 16;

/// The address of one slot on a backing store.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct BackingStoreSlot(pub u64);

impl BackingStoreSlot {
    /// Address of the slot.
    pub fn address(self) -> u64 {
        self.0
    }

    /// Position of the slot inside its 64-slot group.
    pub fn slot_number(self) -> u64 {
        (self.0 >> 3) & 0x3f
    }

    /// `true` if this slot holds a validity collection rather than a register.
    pub fn is_nat_collection(self) -> bool {
        self.slot_number() == NAT_COLLECTION_SLOT
    }

    /// The slot holding the validity bits of this slot's group.
    pub fn nat_collection(self) -> BackingStoreSlot {
        BackingStoreSlot(self.0 | (NAT_COLLECTION_SLOT << 3))
    }

    /// The slot `registers` registers away, stepping over collection slots. Negative counts
    /// move towards older frames.
    pub fn skip(self, registers: i64) -> BackingStoreSlot {
        let mut delta = self.slot_number() as i64 + registers;
        if registers < 0 {
            delta -= 0x3e;
        }
        BackingStoreSlot(
            self.0
                .wrapping_add_signed((registers + delta / NAT_COLLECTION_SLOT as i64) << 3),
        )
    }

    /// Number of registers stored between this slot and `end`.
    pub fn registers_until(self, end: BackingStoreSlot) -> i64 {
        let slots = (end.0 as i64).wrapping_sub(self.0 as i64) >> 3;
        slots - (self.slot_number() as i64 + slots) / 0x40
    }
}

/// One contiguous backing store.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct BackingStoreArea {
    /// First address past the slots that were written to memory.
    pub end: u64,
    /// Size of the area in bytes, counted back from `end`.
    pub size: u64,
    /// Where the validity bits of the partially written last group are kept.
    pub nat_collection: LocationKind,
}

impl BackingStoreArea {
    /// Size of an area whose start is not known.
    pub const UNBOUNDED: u64 = 1 << 63;

    /// Lowest address of the area.
    pub fn base(&self) -> u64 {
        self.end.saturating_sub(self.size)
    }

    /// `true` if `address` is inside the area or right at its end.
    pub fn contains(&self, address: u64) -> bool {
        (self.base()..=self.end).contains(&address)
    }

    /// `true` if the slot at `address` was written to memory.
    fn holds(&self, address: u64) -> bool {
        (self.base()..self.end).contains(&address)
    }
}

/// The stacked registers of a cover and flush: the frame that was covered, and the register
/// words that now have to be loaded back by whoever installs the context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlushedStack {
    /// Backing store pointer after the cover.
    pub bsp: u64,
    /// Where the words of the dirty partition go. Everything below is in memory.
    pub bspstore: u64,
    /// The dirty partition, starting at `bspstore`, collection slots included.
    pub words: Vec<u64>,
    /// Validity collection of the group the dirty partition ends in.
    pub rnat: u64,
}

/// The backing store state of one frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegisterStack {
    bsp: BackingStoreSlot,
    frame_size: u64,
    areas: [BackingStoreArea; AREA_COUNT],
    current: usize,
    left_edge: usize,
}

impl RegisterStack {
    /// The state of the innermost frame. Its registers start at `bsp`, memory holds everything
    /// below `bspstore` and the remaining validity bits are at `nat_collection`.
    pub fn new(bsp: u64, bspstore: u64, nat_collection: LocationKind) -> Self {
        let area = BackingStoreArea {
            end: bspstore,
            size: BackingStoreArea::UNBOUNDED,
            nat_collection,
        };
        Self {
            bsp: BackingStoreSlot(bsp),
            frame_size: 0,
            areas: [area; AREA_COUNT],
            current: 0,
            left_edge: 0,
        }
    }

    /// Backing store pointer of the frame.
    pub fn bsp(&self) -> BackingStoreSlot {
        self.bsp
    }

    /// Move the frame within the current area.
    pub fn set_bsp(&mut self, bsp: BackingStoreSlot) {
        self.bsp = bsp;
    }

    /// Number of stacked registers the frame owns.
    pub fn frame_size(&self) -> u64 {
        self.frame_size
    }

    pub fn set_frame_size(&mut self, frame_size: u64) {
        self.frame_size = frame_size;
    }

    /// The area the frame's registers live in.
    pub fn current_area(&self) -> &BackingStoreArea {
        &self.areas[self.current]
    }

    /// Number of areas remembered, the current one included.
    pub fn depth(&self) -> usize {
        (self.current + AREA_COUNT - self.left_edge) % AREA_COUNT + 1
    }

    /// Continue in an older area, as a caller frame of a stack switching procedure does.
    pub fn switch(&mut self, area: BackingStoreArea, bsp: BackingStoreSlot) {
        // The frame that switched is the oldest one of the area it leaves.
        let leaving = &mut self.areas[self.current];
        leaving.size = leaving.end.saturating_sub(self.bsp.0);
        tracing::trace!(
            "UNWIND: Leaving backing store {:#x}..{:#x} for one ending at {:#x}",
            leaving.base(),
            leaving.end,
            area.end
        );

        self.current = (self.current + 1) % AREA_COUNT;
        if self.current == self.left_edge {
            self.left_edge = (self.left_edge + 1) % AREA_COUNT;
        }
        self.areas[self.current] = area;
        self.bsp = bsp;
    }

    /// Find where `slot` (an address in the current area's numbering) was actually written.
    ///
    /// Slots past the end of an area are the registers that were still in the register file
    /// when the stack was switched; they were spilled to the start of the newer area.
    fn locate(&self, slot: BackingStoreSlot) -> Result<(BackingStoreSlot, usize), Error> {
        let mut index = self.current;
        let mut slot = slot;
        loop {
            let area = &self.areas[index];
            if area.holds(slot.0) {
                return Ok((slot, index));
            }
            if index == self.left_edge || slot.0 < area.base() {
                return Err(Error::RegisterStackUnderflow);
            }
            let overflow = BackingStoreSlot(area.end).registers_until(slot);
            index = (index + AREA_COUNT - 1) % AREA_COUNT;
            slot = BackingStoreSlot(self.areas[index].base()).skip(overflow);
        }
    }

    fn nat_collection_of(&self, slot: BackingStoreSlot, index: usize) -> LocationKind {
        let area = &self.areas[index];
        let collection = slot.nat_collection();
        if collection.0 < area.end {
            LocationKind::Memory(collection.0)
        } else {
            area.nat_collection
        }
    }

    /// Location of stacked register `index` of the frame.
    ///
    /// Fails with [`Error::RegisterStackUnderflow`] if the register never reached memory.
    pub fn stacked_location(&self, index: u64) -> Result<Location, Error> {
        let (slot, area) = self.locate(self.bsp.skip(index as i64))?;
        Ok(Location::memory(slot.0)
            .with_validity(self.nat_collection_of(slot, area), slot.slot_number() as u8))
    }

    /// Cover the first `registers` stacked registers of the frame and make sure their values
    /// can be loaded from the current area.
    ///
    /// Registers that live past the end of the current area are gathered from the newer areas
    /// into a dirty partition, with their validity bits regrouped for their new slots.
    pub fn cover_and_flush(
        &self,
        registers: u64,
        mut read: impl FnMut(LocationKind) -> Result<u64, Error>,
    ) -> Result<FlushedStack, Error> {
        let area = *self.current_area();
        let end = self.bsp.skip(registers as i64);

        if end.0 <= area.end {
            let rnat = if end.nat_collection().0 < area.end || end.slot_number() == 0 {
                0
            } else {
                read(area.nat_collection)?
            };
            return Ok(FlushedStack {
                bsp: end.0,
                bspstore: end.0,
                words: Vec::new(),
                rnat,
            });
        }

        let mut dest = BackingStoreSlot(area.end);
        let mut rnat = match dest.slot_number() {
            0 => 0,
            bits => read(area.nat_collection)? & ((1 << bits) - 1),
        };
        let mut words = Vec::with_capacity(dest.registers_until(end).max(0) as usize);

        while dest != end {
            if dest.is_nat_collection() {
                words.push(rnat);
                rnat = 0;
            } else {
                let (source, index) = self.locate(dest)?;
                words.push(read(LocationKind::Memory(source.0))?);
                let collection = read(self.nat_collection_of(source, index))?;
                if collection & (1 << source.slot_number()) != 0 {
                    rnat |= 1 << dest.slot_number();
                }
            }
            dest = BackingStoreSlot(dest.0 + 8);
        }

        tracing::trace!(
            "UNWIND: Flushed {} words to {:#x}, bsp now {:#x}",
            words.len(),
            area.end,
            end.0
        );
        Ok(FlushedStack {
            bsp: end.0,
            bspstore: area.end,
            words,
            rnat,
        })
    }
}

/// Collect the validity flags of the preserved registers `r4` to `r7` for a spill of `r4` to
/// `scratch`.
///
/// The spilled-register collection is indexed by the slot number of the spill address, so
/// the flag of `r4` ends up at bit `(scratch >> 3) & 0x3f` and the others follow it.
pub fn primary_unat(nats: [bool; 4], scratch: u64) -> u64 {
    let bits = nats
        .iter()
        .enumerate()
        .filter(|(_, nat)| **nat)
        .fold(0u64, |bits, (n, _)| bits | (1 << (4 + n)));
    let rotation = ((scratch / 8).wrapping_sub(4)) % 64;
    bits.rotate_left(rotation as u32)
}
