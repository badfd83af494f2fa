use rewind_target::{ByteOrder, FpValue, RegisterId};
use scroll::{Endian, Pread, Pwrite};
use serde::Serialize;

use crate::{
    address_space::Accessors,
    context::MachineContext,
    cursor::Cursor,
    proc_info::{ProcInfo, ProcName, UnwindInfoProvider},
    Access, Error,
};

/// A range of captured target memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryRegion {
    /// Address of the first byte.
    pub base: u64,
    /// The captured bytes.
    pub bytes: Vec<u8>,
}

impl MemoryRegion {
    fn offset_of(&self, address: u64, len: u64) -> Option<usize> {
        let offset = address.checked_sub(self.base)?;
        (offset.checked_add(len)? <= self.bytes.len() as u64).then_some(offset as usize)
    }
}

/// Registers and memory of a target, captured earlier.
///
/// This is the per-cursor context of [`Snapshot`] accessors. Writes change the captured copy.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedState {
    /// The captured registers.
    pub registers: MachineContext,
    /// The captured memory, in no particular order.
    pub memory: Vec<MemoryRegion>,
    /// Set once a cursor resumed the snapshot.
    pub resumed: bool,
}

impl CapturedState {
    /// A snapshot of `registers` without memory.
    pub fn new(registers: MachineContext) -> Self {
        Self {
            registers,
            memory: Vec::new(),
            resumed: false,
        }
    }

    /// Add a memory region.
    pub fn with_region(mut self, base: u64, bytes: Vec<u8>) -> Self {
        self.memory.push(MemoryRegion { base, bytes });
        self
    }

    /// Add a memory region made of `words` in `byte_order`.
    pub fn with_words(self, base: u64, words: &[u64], byte_order: ByteOrder) -> Self {
        let endian = endian(byte_order);
        let mut bytes = vec![0u8; words.len() * 8];
        for (index, word) in words.iter().enumerate() {
            // The buffer was sized for every word.
            let _ = bytes.pwrite_with(*word, index * 8, endian);
        }
        self.with_region(base, bytes)
    }

    fn region(&mut self, address: u64) -> Option<(&mut MemoryRegion, usize)> {
        self.memory
            .iter_mut()
            .find_map(|region| {
                let offset = region.offset_of(address, 8)?;
                Some((region, offset))
            })
    }
}

fn endian(byte_order: ByteOrder) -> Endian {
    match byte_order {
        ByteOrder::Little => Endian::Little,
        ByteOrder::Big => Endian::Big,
    }
}

/// Accessors for a [`CapturedState`], e.g. read from a core dump.
#[derive(Debug)]
pub struct Snapshot<P> {
    provider: P,
    byte_order: ByteOrder,
}

impl<P: UnwindInfoProvider> Snapshot<P> {
    /// Accessors over procedures known to `provider`. Captured memory is decoded in the byte
    /// order the address space is configured with.
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            byte_order: ByteOrder::native(),
        }
    }
}

impl<P: UnwindInfoProvider> Accessors for Snapshot<P> {
    type Context = CapturedState;

    fn set_byte_order(&mut self, byte_order: ByteOrder) {
        self.byte_order = byte_order;
    }

    fn find_proc_info(
        &self,
        _state: &mut CapturedState,
        ip: u64,
        need_unwind_info: bool,
    ) -> Result<ProcInfo, Error> {
        super::find_proc_info(&self.provider, ip, need_unwind_info)
    }

    fn get_dyn_info_list_addr(&self, _state: &mut CapturedState) -> Result<u64, Error> {
        super::dyn_info_list_addr(&self.provider)
    }

    fn access_mem(
        &self,
        state: &mut CapturedState,
        address: u64,
        value: &mut u64,
        access: Access,
    ) -> Result<(), Error> {
        let endian = endian(self.byte_order);
        let (region, offset) = state
            .region(address)
            .ok_or_else(|| Error::memory(address, access, "not part of the snapshot"))?;

        let result = match access {
            Access::Read => region
                .bytes
                .pread_with::<u64>(offset, endian)
                .map(|word| *value = word),
            Access::Write => region.bytes.pwrite_with(*value, offset, endian).map(|_| ()),
        };
        result.map_err(|error| Error::memory(address, access, error.to_string()))
    }

    fn access_reg(
        &self,
        state: &mut CapturedState,
        register: RegisterId,
        value: &mut u64,
        access: Access,
    ) -> Result<(), Error> {
        state.registers.access(register, value, access)
    }

    fn access_fpreg(
        &self,
        state: &mut CapturedState,
        register: RegisterId,
        value: &mut FpValue,
        access: Access,
    ) -> Result<(), Error> {
        state.registers.access_fp(register, value, access)
    }

    fn resume(&self, cursor: &mut Cursor<'_, Self>) -> Result<(), Error> {
        tracing::debug!("Snapshot resumed at {:#010x}", cursor.ip());
        cursor.context_mut().resumed = true;
        Ok(())
    }

    fn get_proc_name(&self, _state: &mut CapturedState, ip: u64) -> Result<ProcName, Error> {
        super::proc_name(&self.provider, ip)
    }
}
