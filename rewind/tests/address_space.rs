mod common;

use common::*;
use pretty_assertions::assert_eq;
use rewind::{
    accessors::{CapturedState, Snapshot},
    dyn_info::{dynamic_procedures, FORMAT_PROC_INFO, NODE_WORDS},
    AddressSpace, CachingPolicy, Cursor, Error, StepOutcome, UnwindConfig, UnwindTable,
};
use rewind_target::{x86_64, ByteOrder};

const LIST_HEAD: u64 = 0x9000;
const FIRST_NODE: u64 = 0x9010;
const SECOND_NODE: u64 = 0x9050;

/// A dynamic procedure list registering `middle`, followed by a node in a foreign format.
fn dynamic_list() -> Stack {
    let mut list = Stack::new(LIST_HEAD, 18);
    list.set(LIST_HEAD, 1).set(LIST_HEAD + 8, FIRST_NODE);
    let first = [SECOND_NODE, 0, MIDDLE.0, MIDDLE.1, 0x600, FORMAT_PROC_INFO, 0x77, 0x88];
    let second = [0, FIRST_NODE, 0x5000, 0x5100, 0, 1, 0, 0];
    for (index, word) in first.into_iter().enumerate() {
        list.set(FIRST_NODE + 8 * index as u64, word);
    }
    for (index, word) in second.into_iter().enumerate() {
        list.set(SECOND_NODE + 8 * index as u64, word);
    }
    list
}

fn table_without_middle() -> UnwindTable {
    let mut table = x86_table().with_dyn_info_list(LIST_HEAD);
    table.remove(MIDDLE.0);
    table
}

fn state_with_list(list: &Stack) -> CapturedState {
    x86_state(&x86_stack()).with_words(list.base, &list.words, ByteOrder::Little)
}

#[test]
fn lookups_are_cached_until_flushed() {
    init_logging();
    let space = AddressSpace::new(Counting::new(x86_table()), &x86_64::REGISTERS).unwrap();
    let mut state = x86_state(&x86_stack());

    let first = space.find_proc_info(&mut state, 0x3010).unwrap();
    let second = space.find_proc_info(&mut state, 0x30f0).unwrap();
    assert_eq!(first.start_ip, MIDDLE.0);
    assert_eq!(second.start_ip, MIDDLE.0);
    assert_eq!(space.accessors().lookups(), 1);

    let before = space.generation();
    let after = space.flush_cache(MIDDLE.0, MIDDLE.1);
    assert!(after > before);
    assert_eq!(space.generation(), after);

    space.find_proc_info(&mut state, 0x3010).unwrap();
    assert_eq!(space.accessors().lookups(), 2);
}

#[test]
fn caching_can_be_turned_off() {
    let space = AddressSpace::new(Counting::new(x86_table()), &x86_64::REGISTERS).unwrap();
    let mut state = x86_state(&x86_stack());
    assert_eq!(space.caching_policy(), CachingPolicy::Global);

    let generation = space.generation();
    space.set_caching_policy(CachingPolicy::None);
    assert!(space.generation() > generation);

    space.find_proc_info(&mut state, 0x3010).unwrap();
    space.find_proc_info(&mut state, 0x3010).unwrap();
    assert_eq!(space.accessors().lookups(), 2);
}

#[test]
fn configuration_selects_the_policy() {
    let config = UnwindConfig {
        caching_policy: CachingPolicy::None,
        ..UnwindConfig::default()
    };
    let space =
        AddressSpace::with_config(Counting::new(x86_table()), &x86_64::REGISTERS, &config)
            .unwrap();
    assert_eq!(space.caching_policy(), CachingPolicy::None);
    assert_eq!(space.byte_order(), ByteOrder::Little);
}

#[test]
fn unknown_procedures_are_found_on_the_dynamic_list() {
    let space =
        AddressSpace::new(Counting::new(table_without_middle()), &x86_64::REGISTERS).unwrap();
    let mut state = state_with_list(&dynamic_list());

    let info = space.find_proc_info(&mut state, 0x3010).unwrap();
    assert_eq!((info.start_ip, info.end_ip), MIDDLE);
    assert_eq!((info.gp, info.handler, info.lsda), (0x600, 0x77, 0x88));

    // Nodes in other formats are skipped.
    assert!(matches!(
        space.find_proc_info(&mut state, 0x5010),
        Err(Error::ProcInfoNotFound { ip: 0x5010 })
    ));
}

#[test]
fn list_address_is_cached_until_flushed() {
    let space =
        AddressSpace::new(Counting::new(table_without_middle()), &x86_64::REGISTERS).unwrap();
    space.set_caching_policy(CachingPolicy::None);
    let mut state = state_with_list(&dynamic_list());

    space.find_proc_info(&mut state, 0x3010).unwrap();
    space.find_proc_info(&mut state, 0x3020).unwrap();
    assert_eq!(space.dyn_info_list_addr(&mut state).unwrap(), LIST_HEAD);
    assert_eq!(space.accessors().list_queries(), 1);

    space.flush_cache(0, u64::MAX);
    space.find_proc_info(&mut state, 0x3010).unwrap();
    assert_eq!(space.accessors().list_queries(), 2);
}

#[test]
fn dynamic_procedures_are_listed() {
    let space =
        AddressSpace::new(Counting::new(table_without_middle()), &x86_64::REGISTERS).unwrap();
    let mut state = state_with_list(&dynamic_list());

    let procedures = dynamic_procedures(&space, &mut state).unwrap();
    let ranges: Vec<(u64, u64)> = procedures
        .iter()
        .map(|info| (info.start_ip, info.end_ip))
        .collect();
    assert_eq!(ranges, vec![MIDDLE]);
}

#[test]
fn circular_list_terminates() {
    let mut list = dynamic_list();
    list.set(SECOND_NODE, FIRST_NODE);
    let space =
        AddressSpace::new(Counting::new(table_without_middle()), &x86_64::REGISTERS).unwrap();
    let mut state = state_with_list(&list);

    assert!(matches!(
        space.find_proc_info(&mut state, 0x6000),
        Err(Error::ProcInfoNotFound { .. })
    ));
    assert_eq!(dynamic_procedures(&space, &mut state).unwrap().len(), 1);
}

#[test]
fn loops_behind_the_first_node_terminate() {
    let mut list = dynamic_list();
    list.set(SECOND_NODE, SECOND_NODE);
    let space =
        AddressSpace::new(Counting::new(table_without_middle()), &x86_64::REGISTERS).unwrap();
    let mut state = state_with_list(&list);

    assert_eq!(dynamic_procedures(&space, &mut state).unwrap().len(), 1);
    // The head's first pointer, then every word of both nodes once.
    assert_eq!(space.accessors().reads(), 1 + 2 * NODE_WORDS as usize);
}

#[test]
fn node_at_the_end_of_memory_is_an_error() {
    const LAST_WORD: u64 = u64::MAX - 7;
    let mut list = dynamic_list();
    list.set(LIST_HEAD + 8, LAST_WORD);
    let space =
        AddressSpace::new(Counting::new(table_without_middle()), &x86_64::REGISTERS).unwrap();
    let mut state = state_with_list(&list).with_words(LAST_WORD, &[0], ByteOrder::Little);

    let error = dynamic_procedures(&space, &mut state).unwrap_err();
    assert!(
        matches!(&error, Error::MemoryAccess(access) if access.address == LAST_WORD),
        "unexpected error: {error}"
    );
}

#[test]
fn list_head_at_the_end_of_memory_is_an_error() {
    let table = x86_table().with_dyn_info_list(u64::MAX - 3);
    let space = AddressSpace::new(Counting::new(table), &x86_64::REGISTERS).unwrap();
    let mut state = x86_state(&x86_stack());

    assert!(matches!(
        dynamic_procedures(&space, &mut state),
        Err(Error::MemoryAccess(_))
    ));
}

#[test]
fn targets_without_a_list_have_no_dynamic_procedures() {
    let space = AddressSpace::new(Counting::new(x86_table()), &x86_64::REGISTERS).unwrap();
    let mut state = x86_state(&x86_stack());

    assert!(dynamic_procedures(&space, &mut state).unwrap().is_empty());
    assert!(matches!(
        space.find_proc_info(&mut state, 0x6000),
        Err(Error::ProcInfoNotFound { .. })
    ));
}

#[test]
fn cursors_step_through_dynamic_procedures() {
    let space =
        AddressSpace::new(Counting::new(table_without_middle()), &x86_64::REGISTERS).unwrap();
    let mut cursor = Cursor::init_remote(&space, state_with_list(&dynamic_list())).unwrap();

    let mut ips = vec![cursor.ip()];
    while cursor.step().unwrap() == StepOutcome::Stepped {
        ips.push(cursor.ip());
    }
    assert_eq!(ips, vec![LEAF_IP, MIDDLE_RET, MAIN_RET, START_RET]);
}

#[test]
fn address_spaces_are_shared_between_threads() {
    let space = AddressSpace::new(Snapshot::new(x86_table()), &x86_64::REGISTERS).unwrap();

    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                let mut cursor = Cursor::init_remote(&space, x86_state(&x86_stack())).unwrap();
                let mut frames = 1;
                while cursor.step().unwrap() == StepOutcome::Stepped {
                    frames += 1;
                    space.flush_cache(0, u64::MAX);
                }
                assert_eq!(frames, 4);
            });
        }
    });
}
