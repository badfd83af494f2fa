//! Synthetic targets shared by the integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};

use rewind::{
    accessors::{CapturedState, Snapshot},
    Access, Accessors, Cursor, Error, MachineContext, ProcInfo, ProcName, UnwindTable,
};
use rewind_target::{x86_64, ByteOrder, FpValue, RegisterId};
use tracing_subscriber::EnvFilter;

/// Log to the test output, filtered by `RUST_LOG`.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Words of target memory starting at `base`.
#[derive(Debug, Clone)]
pub struct Stack {
    pub base: u64,
    pub words: Vec<u64>,
}

impl Stack {
    pub fn new(base: u64, len: usize) -> Self {
        Self {
            base,
            words: vec![0; len],
        }
    }

    pub fn set(&mut self, address: u64, value: u64) -> &mut Self {
        let index = ((address - self.base) / 8) as usize;
        self.words[index] = value;
        self
    }

    pub fn get(&self, address: u64) -> u64 {
        self.words[((address - self.base) / 8) as usize]
    }
}

// A frame record chain start -> main -> middle -> leaf. Every procedure is unwound with the
// frame pointer fallback.
pub const START: (u64, u64) = (0x1000, 0x1100);
pub const MAIN: (u64, u64) = (0x2000, 0x2100);
pub const MIDDLE: (u64, u64) = (0x3000, 0x3100);
pub const LEAF: (u64, u64) = (0x4000, 0x4100);

pub const LEAF_IP: u64 = 0x4010;
pub const MIDDLE_RET: u64 = 0x3020;
pub const MAIN_RET: u64 = 0x2020;
pub const START_RET: u64 = 0x1020;

pub const STACK_BASE: u64 = 0x7f00;
pub const LEAF_SP: u64 = 0x7f00;
pub const LEAF_FP: u64 = 0x7f10;
pub const MIDDLE_FP: u64 = 0x7f40;
pub const MAIN_FP: u64 = 0x7f80;
pub const START_FP: u64 = 0x7fc0;

/// Value of the callee-saved rbx, which no procedure saves.
pub const RBX_VALUE: u64 = 0xb0b;

pub fn x86_table() -> UnwindTable {
    UnwindTable::new()
        .with(ProcInfo::new(START.0, START.1), "start")
        .with(ProcInfo::new(MAIN.0, MAIN.1), "main")
        .with(ProcInfo::new(MIDDLE.0, MIDDLE.1), "middle")
        .with(ProcInfo::new(LEAF.0, LEAF.1), "leaf")
}

pub fn x86_stack() -> Stack {
    let mut stack = Stack::new(STACK_BASE, 32);
    stack
        .set(LEAF_FP, MIDDLE_FP)
        .set(LEAF_FP + 8, MIDDLE_RET)
        .set(MIDDLE_FP, MAIN_FP)
        .set(MIDDLE_FP + 8, MAIN_RET)
        .set(MAIN_FP, START_FP)
        .set(MAIN_FP + 8, START_RET)
        .set(START_FP, 0)
        .set(START_FP + 8, 0);
    stack
}

pub fn x86_registers() -> MachineContext {
    MachineContext::new(&x86_64::REGISTERS)
        .with(x86_64::RIP, LEAF_IP)
        .with(x86_64::RSP, LEAF_SP)
        .with(x86_64::RBP, LEAF_FP)
        .with(x86_64::RBX, RBX_VALUE)
}

pub fn x86_state(stack: &Stack) -> CapturedState {
    CapturedState::new(x86_registers()).with_words(stack.base, &stack.words, ByteOrder::Little)
}

/// A chain of `frames` procedures `f0` (innermost) to `f<frames - 1>`.
pub struct Chain {
    pub table: UnwindTable,
    pub state: CapturedState,
    pub ips: Vec<u64>,
}

pub fn x86_chain(frames: usize) -> Chain {
    const CODE: u64 = 0x10_0000;
    const STACK: u64 = 0x20_0000;

    let start = |i: usize| CODE + 0x100 * i as u64;
    let fp = |i: usize| STACK + 0x10 + 0x20 * i as u64;

    let mut table = UnwindTable::new();
    let mut stack = Stack::new(STACK, 4 * frames + 4);
    let mut ips = Vec::with_capacity(frames);
    for i in 0..frames {
        table.insert(ProcInfo::new(start(i), start(i) + 0x100), Some(&format!("f{i}")));
        ips.push(start(i) + if i == 0 { 0x8 } else { 0x10 });
        if i + 1 < frames {
            stack.set(fp(i), fp(i + 1)).set(fp(i) + 8, start(i + 1) + 0x10);
        }
    }

    let registers = MachineContext::new(&x86_64::REGISTERS)
        .with(x86_64::RIP, ips[0])
        .with(x86_64::RSP, STACK)
        .with(x86_64::RBP, fp(0));
    let state =
        CapturedState::new(registers).with_words(stack.base, &stack.words, ByteOrder::Little);
    Chain { table, state, ips }
}

/// A little-endian word of captured memory.
pub fn read_word(state: &CapturedState, address: u64) -> u64 {
    let region = state
        .memory
        .iter()
        .find(|region| {
            address >= region.base && address + 8 <= region.base + region.bytes.len() as u64
        })
        .expect("address is not captured");
    let offset = (address - region.base) as usize;
    u64::from_le_bytes(region.bytes[offset..offset + 8].try_into().unwrap())
}

/// Snapshot accessors that count how often the unwinder asks them for procedures and memory.
pub struct Counting {
    inner: Snapshot<UnwindTable>,
    lookups: AtomicUsize,
    list_queries: AtomicUsize,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl Counting {
    pub fn new(table: UnwindTable) -> Self {
        Self {
            inner: Snapshot::new(table),
            lookups: AtomicUsize::new(0),
            list_queries: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn list_queries(&self) -> usize {
        self.list_queries.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl Accessors for Counting {
    type Context = CapturedState;

    fn set_byte_order(&mut self, byte_order: ByteOrder) {
        self.inner.set_byte_order(byte_order);
    }

    fn find_proc_info(
        &self,
        state: &mut CapturedState,
        ip: u64,
        need_unwind_info: bool,
    ) -> Result<ProcInfo, Error> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.inner.find_proc_info(state, ip, need_unwind_info)
    }

    fn get_dyn_info_list_addr(&self, state: &mut CapturedState) -> Result<u64, Error> {
        self.list_queries.fetch_add(1, Ordering::SeqCst);
        self.inner.get_dyn_info_list_addr(state)
    }

    fn access_mem(
        &self,
        state: &mut CapturedState,
        address: u64,
        value: &mut u64,
        access: Access,
    ) -> Result<(), Error> {
        match access {
            Access::Read => self.reads.fetch_add(1, Ordering::SeqCst),
            Access::Write => self.writes.fetch_add(1, Ordering::SeqCst),
        };
        self.inner.access_mem(state, address, value, access)
    }

    fn access_reg(
        &self,
        state: &mut CapturedState,
        register: RegisterId,
        value: &mut u64,
        access: Access,
    ) -> Result<(), Error> {
        self.inner.access_reg(state, register, value, access)
    }

    fn access_fpreg(
        &self,
        state: &mut CapturedState,
        register: RegisterId,
        value: &mut FpValue,
        access: Access,
    ) -> Result<(), Error> {
        self.inner.access_fpreg(state, register, value, access)
    }

    fn resume(&self, _cursor: &mut Cursor<'_, Self>) -> Result<(), Error> {
        Err(Error::NotSupported("resuming a counting snapshot"))
    }

    fn get_proc_name(&self, state: &mut CapturedState, ip: u64) -> Result<ProcName, Error> {
        self.inner.get_proc_name(state, ip)
    }
}
