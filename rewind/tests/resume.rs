mod common;

use std::{collections::HashMap, sync::Mutex};

use common::*;
use pretty_assertions::assert_eq;
use rewind::{
    accessors::{Local, Remote, Snapshot, TargetControl},
    proc_info::SignalFrame,
    resume::{install_state, ContextInstaller, InstallState},
    Access, AddressSpace, Cursor, Error, ProcInfo, StepOutcome, UnwindTable,
};
use rewind_target::{x86_64, ByteOrder, RegisterId};
use test_case::test_case;

/// A stopped process that remembers everything done to it.
#[derive(Debug, Default)]
struct RecordingTarget {
    registers: HashMap<RegisterId, u64>,
    memory: HashMap<u64, u64>,
    writes: Vec<(RegisterId, u64)>,
    continued: bool,
}

impl RecordingTarget {
    fn stopped_in_leaf() -> Self {
        let stack = x86_stack();
        let memory = stack
            .words
            .iter()
            .enumerate()
            .map(|(index, word)| (stack.base + 8 * index as u64, *word))
            .collect();
        let registers = x86_registers().captured().collect();
        Self {
            registers,
            memory,
            ..Default::default()
        }
    }
}

impl TargetControl for RecordingTarget {
    fn read_word(&mut self, address: u64) -> Result<u64, Error> {
        self.memory
            .get(&address)
            .copied()
            .ok_or_else(|| Error::memory(address, Access::Read, "unmapped"))
    }

    fn write_word(&mut self, address: u64, value: u64) -> Result<(), Error> {
        self.memory.insert(address, value);
        Ok(())
    }

    fn read_register(&mut self, register: RegisterId) -> Result<u64, Error> {
        self.registers
            .get(&register)
            .copied()
            .ok_or(Error::BadRegister { register })
    }

    fn write_register(&mut self, register: RegisterId, value: u64) -> Result<(), Error> {
        self.writes.push((register, value));
        self.registers.insert(register, value);
        Ok(())
    }

    fn continue_execution(&mut self) -> Result<(), Error> {
        self.continued = true;
        Ok(())
    }
}

type RemoteTarget = Remote<UnwindTable, RecordingTarget>;

#[test]
fn remote_resume_writes_back_the_caller_frame() {
    init_logging();
    let space = AddressSpace::<RemoteTarget>::new(Remote::new(x86_table()), &x86_64::REGISTERS)
        .unwrap();
    let mut cursor = Cursor::init_remote(&space, RecordingTarget::stopped_in_leaf()).unwrap();
    assert_eq!(cursor.step().unwrap(), StepOutcome::Stepped);

    // rax does not survive the call, but is recorded as the first exception argument.
    cursor.set_reg(x86_64::RAX, 0x42).unwrap();
    assert_eq!(cursor.get_reg(x86_64::RAX).unwrap(), 0x42);

    cursor.resume().unwrap();
    let target = cursor.into_context();

    assert_eq!(
        target.writes,
        vec![
            (x86_64::RAX, 0x42),
            (x86_64::RBX, RBX_VALUE),
            (x86_64::RBP, MIDDLE_FP),
            (x86_64::RSP, LEAF_FP + 16),
            (x86_64::RIP, MIDDLE_RET),
        ]
    );
    assert!(target.continued);
}

#[test]
fn derived_registers_are_read_only() {
    let space = AddressSpace::<RemoteTarget>::new(Remote::new(x86_table()), &x86_64::REGISTERS)
        .unwrap();
    let mut cursor = Cursor::init_remote(&space, RecordingTarget::stopped_in_leaf()).unwrap();

    assert!(matches!(
        cursor.set_reg(x86_64::RSP, 0),
        Err(Error::ReadOnlyRegister { register }) if register == x86_64::RSP
    ));
    assert!(matches!(
        cursor.get_reg(RegisterId(99)),
        Err(Error::BadRegister { .. })
    ));
}

#[test]
fn writing_the_ip_moves_the_frame() {
    let space = AddressSpace::<RemoteTarget>::new(Remote::new(x86_table()), &x86_64::REGISTERS)
        .unwrap();
    let mut cursor = Cursor::init_remote(&space, RecordingTarget::stopped_in_leaf()).unwrap();
    assert_eq!(cursor.step().unwrap(), StepOutcome::Stepped);

    cursor.set_reg(x86_64::RIP, MAIN.0 + 0x50).unwrap();

    assert_eq!(cursor.ip(), MAIN.0 + 0x50);
    assert_eq!(cursor.proc_info().unwrap().start_ip, MAIN.0);
    // The return address slot of the frame record was updated.
    assert_eq!(cursor.context().memory[&(LEAF_FP + 8)], MAIN.0 + 0x50);
}

#[test]
fn snapshot_resume_updates_the_snapshot() {
    let space = AddressSpace::new(Snapshot::new(x86_table()), &x86_64::REGISTERS).unwrap();
    let mut cursor = Cursor::init_remote(&space, x86_state(&x86_stack())).unwrap();
    assert_eq!(cursor.step().unwrap(), StepOutcome::Stepped);
    assert_eq!(cursor.step().unwrap(), StepOutcome::Stepped);

    cursor.resume().unwrap();
    let state = cursor.into_context();

    assert!(state.resumed);
    assert_eq!(state.registers.get(x86_64::RIP).unwrap(), MAIN_RET);
    assert_eq!(state.registers.get(x86_64::RBP).unwrap(), MAIN_FP);
    assert_eq!(state.registers.get(x86_64::RSP).unwrap(), MIDDLE_FP + 16);
}

#[derive(Debug, Default)]
struct RecordingInstaller {
    installed: Mutex<Option<InstallState>>,
}

impl ContextInstaller for RecordingInstaller {
    fn install(&self, state: InstallState) -> Result<(), Error> {
        *self.installed.lock().unwrap() = Some(state);
        Ok(())
    }
}

#[test]
fn local_resume_hands_the_frame_to_the_installer() {
    let space = AddressSpace::new(
        Local::new(x86_table(), RecordingInstaller::default()),
        &x86_64::REGISTERS,
    )
    .unwrap();
    let mut cursor = Cursor::init_local(&space, x86_registers()).unwrap();
    cursor.set_reg(x86_64::RAX, 7).unwrap();

    cursor.resume().unwrap();

    let installed = space.accessors().installer().installed.lock().unwrap().take();
    assert_eq!(
        installed,
        Some(InstallState {
            ip: LEAF_IP,
            sp: LEAF_SP,
            registers: vec![
                (x86_64::RAX, 7),
                (x86_64::RBX, RBX_VALUE),
                (x86_64::RBP, LEAF_FP),
                (x86_64::RSP, LEAF_SP),
                (x86_64::RIP, LEAF_IP),
            ],
            fp_registers: vec![],
            primary_nat: None,
            register_stack: None,
            signal_context: None,
        })
    );
}

const SIGTRAMP: (u64, u64) = (0x5000, 0x5100);
const SIGNAL_STACK: u64 = 0x6000;
const SAVED_CONTEXT: u64 = SIGNAL_STACK + 16;
const INTERRUPTED_IP: u64 = MIDDLE.0 + 0x30;
const INTERRUPTED_SP: u64 = 0x6800;

fn saved_value(register: RegisterId) -> u64 {
    match register {
        x86_64::RSP => INTERRUPTED_SP,
        x86_64::RIP => INTERRUPTED_IP,
        RegisterId(n) => 0x100 + u64::from(n),
    }
}

#[test]
fn signal_frames_resume_through_the_saved_context() {
    let table = x86_table().with(
        ProcInfo {
            signal_frame: Some(SignalFrame { context_offset: 0 }),
            ..ProcInfo::new(SIGTRAMP.0, SIGTRAMP.1)
        },
        "sigtramp",
    );
    let space = AddressSpace::new(Snapshot::new(table), &x86_64::REGISTERS).unwrap();

    let registers: Vec<u64> = (0..17).map(|n| saved_value(RegisterId(n))).collect();
    let state = rewind::accessors::CapturedState::new(
        rewind::MachineContext::new(&x86_64::REGISTERS)
            .with(x86_64::RIP, SIGTRAMP.0 + 8)
            .with(x86_64::RSP, SIGNAL_STACK)
            .with(x86_64::RBP, SIGNAL_STACK),
    )
    .with_words(SAVED_CONTEXT, &registers, ByteOrder::Little);

    let mut cursor = Cursor::init_remote(&space, state).unwrap();
    assert!(cursor.is_signal_frame());
    assert_eq!(cursor.step().unwrap(), StepOutcome::Stepped);
    assert!(!cursor.is_signal_frame());
    assert_eq!(cursor.ip(), INTERRUPTED_IP);
    assert_eq!(cursor.sp(), INTERRUPTED_SP);
    // The interrupted code was not at a call: scratch registers are intact.
    assert_eq!(cursor.get_reg(x86_64::RCX).unwrap(), 0x102);

    cursor.set_reg(x86_64::RBX, 0x99).unwrap();
    let installed = install_state(&mut cursor, 0).unwrap();

    assert_eq!(installed.signal_context, Some(SAVED_CONTEXT));
    assert_eq!(installed.registers.len(), 17);
    assert_eq!(installed.registers[3], (x86_64::RBX, 0x99));
    assert_eq!(
        read_word(cursor.context(), SAVED_CONTEXT + 3 * 8),
        0x99
    );
    assert_eq!(
        read_word(cursor.context(), SAVED_CONTEXT + 16 * 8),
        INTERRUPTED_IP
    );
}

/// The frame pointer puts the saved context so close to the end of the address space that its
/// slots, or the context itself, would wrap around.
#[test_case(0xffff_ffff_ffff_ffe0, 0; "slots past the end")]
#[test_case(0xffff_ffff_ffff_ff00, 0x100; "context past the end")]
fn saved_context_at_the_end_of_memory_is_an_error(frame_pointer: u64, context_offset: i64) {
    let table = x86_table().with(
        ProcInfo {
            signal_frame: Some(SignalFrame { context_offset }),
            ..ProcInfo::new(SIGTRAMP.0, SIGTRAMP.1)
        },
        "sigtramp",
    );
    let space = AddressSpace::new(Snapshot::new(table), &x86_64::REGISTERS).unwrap();
    let state = rewind::accessors::CapturedState::new(
        rewind::MachineContext::new(&x86_64::REGISTERS)
            .with(x86_64::RIP, SIGTRAMP.0 + 8)
            .with(x86_64::RSP, SIGNAL_STACK)
            .with(x86_64::RBP, frame_pointer),
    )
    .with_words(u64::MAX - 15, &[0, 0], ByteOrder::Little);

    let mut cursor = Cursor::init_remote(&space, state).unwrap();
    let error = cursor.step().unwrap_err();
    assert!(
        matches!(error, Error::MemoryAccess(_)),
        "unexpected error: {error}"
    );
    assert_eq!(cursor.ip(), SIGTRAMP.0 + 8);
    assert_eq!(cursor.frame_index(), 0);
}

#[test]
fn registers_already_in_the_saved_context_are_not_rewritten() {
    let table = x86_table().with(
        ProcInfo {
            signal_frame: Some(SignalFrame { context_offset: 0 }),
            ..ProcInfo::new(SIGTRAMP.0, SIGTRAMP.1)
        },
        "sigtramp",
    );
    let space = AddressSpace::new(Counting::new(table), &x86_64::REGISTERS).unwrap();

    // The interrupted code runs in `middle`, whose frame record continues the usual chain.
    let registers: Vec<u64> = (0..17)
        .map(|n| match RegisterId(n) {
            x86_64::RBP => MIDDLE_FP,
            register => saved_value(register),
        })
        .collect();
    let stack = x86_stack();
    let state = rewind::accessors::CapturedState::new(
        rewind::MachineContext::new(&x86_64::REGISTERS)
            .with(x86_64::RIP, SIGTRAMP.0 + 8)
            .with(x86_64::RSP, SIGNAL_STACK)
            .with(x86_64::RBP, SIGNAL_STACK),
    )
    .with_words(SAVED_CONTEXT, &registers, ByteOrder::Little)
    .with_words(stack.base, &stack.words, ByteOrder::Little);
    let slot = |register: RegisterId| SAVED_CONTEXT + 8 * u64::from(register.0);

    let mut cursor = Cursor::init_remote(&space, state).unwrap();
    assert_eq!(cursor.step().unwrap(), StepOutcome::Stepped);
    assert!(cursor.location(x86_64::RBX).unwrap().backed_by_context);

    cursor.set_reg(x86_64::RBX, 0x99).unwrap();
    assert_eq!(space.accessors().writes(), 1);
    let installed = install_state(&mut cursor, 0).unwrap();
    assert_eq!(installed.registers.len(), 17);
    assert_eq!(space.accessors().writes(), 1);
    assert_eq!(read_word(cursor.context(), slot(x86_64::RBX)), 0x99);

    // One frame further out, the frame record holds the frame and instruction pointers.
    assert_eq!(cursor.step().unwrap(), StepOutcome::Stepped);
    assert_eq!(cursor.ip(), MAIN_RET);
    assert!(!cursor.location(x86_64::RBP).unwrap().backed_by_context);
    let installed = install_state(&mut cursor, 0).unwrap();

    assert_eq!(installed.signal_context, Some(SAVED_CONTEXT));
    // rip, rsp and rbp; the callee-saved registers are still in the context.
    assert_eq!(space.accessors().writes(), 4);
    let context = cursor.context();
    assert_eq!(read_word(context, slot(x86_64::RIP)), MAIN_RET);
    assert_eq!(read_word(context, slot(x86_64::RSP)), MIDDLE_FP + 16);
    assert_eq!(read_word(context, slot(x86_64::RBP)), MAIN_FP);
    assert_eq!(read_word(context, slot(x86_64::RBX)), 0x99);
}
