mod common;

use common::*;
use pretty_assertions::assert_eq;
use rewind::{
    accessors::{CapturedState, Snapshot},
    backtrace, AddressSpace, Cursor, Error, ProcName, StepOutcome, UnwindConfig,
};
use rewind_target::{x86_64, ByteOrder};
use test_case::test_case;

fn space(table: rewind::UnwindTable) -> AddressSpace<Snapshot<rewind::UnwindTable>> {
    AddressSpace::new(Snapshot::new(table), &x86_64::REGISTERS).unwrap()
}

#[test]
fn walks_the_frame_record_chain() {
    init_logging();
    let space = space(x86_table());
    let mut cursor = Cursor::init_remote(&space, x86_state(&x86_stack())).unwrap();

    let mut ips = vec![cursor.ip()];
    while cursor.step().unwrap() == StepOutcome::Stepped {
        ips.push(cursor.ip());
    }

    assert_eq!(ips, vec![LEAF_IP, MIDDLE_RET, MAIN_RET, START_RET]);
    assert_eq!(cursor.frame_index(), 3);
    // The end of the chain leaves the cursor on the outermost frame.
    assert_eq!(cursor.ip(), START_RET);
    assert_eq!(cursor.sp(), MAIN_FP + 16);
}

#[test]
fn caller_registers_follow_the_rules() {
    let space = space(x86_table());
    let mut cursor = Cursor::init_remote(&space, x86_state(&x86_stack())).unwrap();
    assert_eq!(cursor.step().unwrap(), StepOutcome::Stepped);

    assert_eq!(cursor.sp(), LEAF_FP + 16);
    assert_eq!(cursor.get_reg(x86_64::RSP).unwrap(), LEAF_FP + 16);
    assert_eq!(cursor.get_reg(x86_64::RIP).unwrap(), MIDDLE_RET);
    assert_eq!(cursor.get_reg(x86_64::RBP).unwrap(), MIDDLE_FP);
    // Callee-saved and never spilled: still in the register.
    assert_eq!(cursor.get_reg(x86_64::RBX).unwrap(), RBX_VALUE);
    // Scratch registers do not survive the call.
    assert!(matches!(
        cursor.get_reg(x86_64::RCX),
        Err(Error::InvalidContext { register }) if register == x86_64::RCX
    ));
    assert_eq!(
        cursor.location(x86_64::RBP).unwrap().address(),
        Some(LEAF_FP)
    );
}

#[test]
fn failed_step_leaves_the_cursor_alone() {
    let mut stack = x86_stack();
    stack.set(LEAF_FP, 0xdead_0000);
    let space = space(x86_table());
    let mut cursor = Cursor::init_remote(&space, x86_state(&stack)).unwrap();

    assert_eq!(cursor.step().unwrap(), StepOutcome::Stepped);
    assert_eq!(cursor.ip(), MIDDLE_RET);

    let error = cursor.step().unwrap_err();
    assert!(
        matches!(&error, Error::MemoryAccess(access) if access.address == 0xdead_0008),
        "unexpected error: {error}"
    );
    assert_eq!(cursor.ip(), MIDDLE_RET);
    assert_eq!(cursor.sp(), LEAF_FP + 16);
    assert_eq!(cursor.frame_index(), 1);
}

#[test]
fn unknown_caller_ends_the_chain() {
    let mut stack = x86_stack();
    stack.set(MAIN_FP + 8, 0x9000);
    let space = space(x86_table());
    let mut cursor = Cursor::init_remote(&space, x86_state(&stack)).unwrap();

    assert_eq!(cursor.step().unwrap(), StepOutcome::Stepped);
    assert_eq!(cursor.step().unwrap(), StepOutcome::Stepped);
    assert_eq!(cursor.step().unwrap(), StepOutcome::EndOfChain);
    assert_eq!(cursor.ip(), MAIN_RET);
}

#[test]
fn zero_ip_has_no_caller() {
    let space = space(x86_table());
    let mut state = x86_state(&x86_stack());
    state.registers.set(x86_64::RIP, 0).unwrap();
    let mut cursor = Cursor::init_remote(&space, state).unwrap();

    assert!(cursor.proc_info().is_err());
    assert_eq!(cursor.step().unwrap(), StepOutcome::EndOfChain);
    assert_eq!(cursor.frame_index(), 0);
}

#[test]
fn frame_that_unwinds_to_itself_ends_the_chain() {
    // A frame record pointing at itself with a return address into the same procedure.
    let mut stack = x86_stack();
    stack.set(LEAF_FP, LEAF_FP).set(LEAF_FP + 8, MIDDLE_RET);
    let space = space(x86_table());
    let mut state = x86_state(&stack);
    state.registers.set(x86_64::RIP, MIDDLE_RET).unwrap();
    state.registers.set(x86_64::RSP, LEAF_FP + 16).unwrap();
    let mut cursor = Cursor::init_remote(&space, state).unwrap();

    assert_eq!(cursor.step().unwrap(), StepOutcome::EndOfChain);
}

#[test_case(1; "single frame")]
#[test_case(8; "short chain")]
#[test_case(40; "long chain")]
fn chains_of_any_length(frames: usize) {
    let chain = x86_chain(frames);
    let space = space(chain.table);
    let mut cursor = Cursor::init_remote(&space, chain.state).unwrap();

    let trace = backtrace(&mut cursor).unwrap();

    let ips: Vec<u64> = trace.iter().map(|frame| frame.ip).collect();
    assert_eq!(ips, chain.ips);
    let last = trace.last().unwrap();
    assert_eq!(last.index, frames - 1);
    assert_eq!(
        last.procedure.as_ref().map(|name| name.name.as_str()),
        Some(format!("f{}", frames - 1).as_str())
    );
}

#[test]
fn backtrace_stops_at_the_configured_limit() {
    let chain = x86_chain(8);
    let config = UnwindConfig {
        max_frames: 3,
        ..UnwindConfig::default()
    };
    let space =
        AddressSpace::with_config(Snapshot::new(chain.table), &x86_64::REGISTERS, &config)
            .unwrap();
    assert_eq!(space.max_frames(), 3);
    let mut cursor = Cursor::init_remote(&space, chain.state).unwrap();

    let trace = backtrace(&mut cursor).unwrap();
    assert_eq!(trace.len(), 3);
    assert_eq!(trace[2].ip, chain.ips[2]);
}

#[test]
fn snapshots_decode_memory_in_the_configured_byte_order() {
    let stack = x86_stack();
    let state =
        CapturedState::new(x86_registers()).with_words(stack.base, &stack.words, ByteOrder::Big);
    let config = UnwindConfig {
        byte_order: ByteOrder::Big,
        ..UnwindConfig::default()
    };
    let space =
        AddressSpace::with_config(Snapshot::new(x86_table()), &x86_64::REGISTERS, &config)
            .unwrap();
    assert_eq!(space.byte_order(), ByteOrder::Big);
    let mut cursor = Cursor::init_remote(&space, state).unwrap();

    let ips: Vec<u64> = backtrace(&mut cursor)
        .unwrap()
        .iter()
        .map(|frame| frame.ip)
        .collect();
    assert_eq!(ips, vec![LEAF_IP, MIDDLE_RET, MAIN_RET, START_RET]);
}

#[test]
fn frames_are_named() {
    let space = space(x86_table());
    let mut cursor = Cursor::init_remote(&space, x86_state(&x86_stack())).unwrap();

    let trace = backtrace(&mut cursor).unwrap();

    assert_eq!(
        trace[0].procedure,
        Some(ProcName {
            name: "leaf".to_string(),
            offset: 0x10
        })
    );
    // Return addresses are attributed to the calling procedure, offset from the real address.
    assert_eq!(
        trace[1].procedure,
        Some(ProcName {
            name: "middle".to_string(),
            offset: 0x20
        })
    );
    assert_eq!(trace[1].start_ip, Some(MIDDLE.0));
    assert_eq!(
        trace[1].to_string(),
        "#1   0x0000000000003020 in middle+0x20"
    );
}

#[test]
fn failed_ip_write_leaves_the_frame_alone() {
    // Addresses no procedure covers send the lookup to an unreadable dynamic list.
    let space = space(x86_table().with_dyn_info_list(0xdead_0000));
    let mut cursor = Cursor::init_remote(&space, x86_state(&x86_stack())).unwrap();
    assert_eq!(cursor.step().unwrap(), StepOutcome::Stepped);

    let error = cursor.set_reg(x86_64::RIP, 0x9999).unwrap_err();
    assert!(
        matches!(error, Error::MemoryAccess(_)),
        "unexpected error: {error}"
    );
    assert_eq!(cursor.ip(), MIDDLE_RET);
    assert_eq!(cursor.proc_info().unwrap().start_ip, MIDDLE.0);
    assert_eq!(read_word(cursor.context(), LEAF_FP + 8), MIDDLE_RET);

    cursor.set_reg(x86_64::RIP, MAIN.0 + 0x50).unwrap();
    assert_eq!(cursor.ip(), MAIN.0 + 0x50);
    assert_eq!(cursor.proc_info().unwrap().start_ip, MAIN.0);
    assert_eq!(read_word(cursor.context(), LEAF_FP + 8), MAIN.0 + 0x50);
}
