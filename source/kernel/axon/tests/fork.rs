// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: sys_fork scenarios on the host machine
//! OWNERS: @kernel-team
//!
//! TEST_SCENARIOS:
//!   - child takes the lowest free slot with the parent's registers and %eax = 0
//!   - writable pages are copied, read-only pages shared with one more reference
//!   - writes on either side after fork stay invisible to the other
//!   - a full process table or exhausted memory fails with -1 and changes nothing

mod common;

use axon::config::{BootCommand, MEMSIZE_VIRTUAL, NPROC};
use axon::hal::PhysMem;
use axon::mm::{Owner, PageFlags, PAGE_SIZE};
use axon::syscall::SYSCALL_FAILED;
use axon::task::ProcState;
use axon::trap::{Dispatch, TrapFrame, INT_SYS_FORK, INT_SYS_PAGE_ALLOC};
use axon::{PhysAddr, Pid, VirtAddr};
use common::{boot, eax, trap, HostKernel, CODE_VA, DATA_VA, GREETING};
use proptest::prelude::*;

fn pid(raw: u32) -> Pid {
    Pid::from_raw(raw)
}

fn mapping(kernel: &HostKernel, owner: Pid, va: usize) -> (PhysAddr, PageFlags) {
    let space = kernel.tasks().get(owner).unwrap().private_space().unwrap();
    let m = space.lookup(&kernel.memory().ram, VirtAddr::new(va)).expect("mapped");
    (m.pa, m.flags)
}

#[test]
fn child_copies_parent_registers() {
    let (mut kernel, parent) = boot(BootCommand::Fork);
    let mut frame = kernel.switch_to(parent);
    frame.intno = INT_SYS_FORK;
    frame.ebx = 0xdead_beef;
    frame.esi = 0x1234;
    frame.eip += 2;
    let free_before = kernel.memory().ledger.free_pages();

    assert_eq!(kernel.handle_trap(&frame), Ok(Dispatch::Resume(parent)));
    let child = pid(2);
    assert_eq!(eax(&kernel, parent), 2);
    let child_proc = kernel.tasks().get(child).unwrap();
    assert_eq!(child_proc.state(), ProcState::Runnable);
    assert_eq!(child_proc.frame, TrapFrame { eax: 0, ..frame });

    // Root, page table, data page and stack page.
    assert_eq!(free_before - kernel.memory().ledger.free_pages(), 4);
    assert_eq!(kernel.check(), Ok(()));
}

#[test]
fn child_takes_lowest_free_slot() {
    let (mut kernel, _) = boot(BootCommand::Default);
    assert_eq!(trap(&mut kernel, pid(3), INT_SYS_FORK, 0), Ok(Dispatch::Resume(pid(3))));
    assert_eq!(eax(&kernel, pid(3)), 5);
    assert_eq!(eax(&kernel, pid(5)), 0);
}

#[test]
fn writable_pages_are_copied_read_only_pages_shared() {
    let (mut kernel, parent) = boot(BootCommand::Fork);
    trap(&mut kernel, parent, INT_SYS_FORK, 0).unwrap();
    let child = pid(2);

    let (parent_code, _) = mapping(&kernel, parent, CODE_VA);
    let (child_code, child_code_flags) = mapping(&kernel, child, CODE_VA);
    assert_eq!(parent_code, child_code);
    assert_eq!(child_code_flags, PageFlags::USER_RO);
    let info = kernel.memory().ledger.info(child_code).unwrap();
    assert_eq!(info.refcount, 2);
    assert_eq!(info.owner, Owner::Process(parent));

    for va in [DATA_VA, MEMSIZE_VIRTUAL - PAGE_SIZE] {
        let (parent_pa, _) = mapping(&kernel, parent, va);
        let (child_pa, child_flags) = mapping(&kernel, child, va);
        assert_ne!(parent_pa, child_pa);
        assert_eq!(child_flags, PageFlags::USER_RW);
        assert_eq!(kernel.memory().ledger.info(child_pa).unwrap().owner, Owner::Process(child));
    }

    let (child_data, _) = mapping(&kernel, child, DATA_VA);
    let mut buf = [0u8; 16];
    kernel.memory().ram.read(child_data, &mut buf);
    assert_eq!(&buf[..GREETING.len()], GREETING);
}

#[test]
fn writes_after_fork_stay_private() {
    let (mut kernel, parent) = boot(BootCommand::Fork);
    trap(&mut kernel, parent, INT_SYS_FORK, 0).unwrap();
    let child = pid(2);
    let (parent_data, _) = mapping(&kernel, parent, DATA_VA);
    let (child_data, _) = mapping(&kernel, child, DATA_VA);
    let read = |kernel: &HostKernel, pa: PhysAddr| {
        let mut buf = [0u8; 16];
        kernel.memory().ram.read(pa, &mut buf);
        buf
    };

    kernel.memory_mut().ram.write(child_data, b"child wrote\0");
    assert_eq!(&read(&kernel, parent_data)[..GREETING.len()], GREETING);
    assert_eq!(&read(&kernel, child_data)[..12], b"child wrote\0");

    kernel.memory_mut().ram.write(parent_data, b"parent wrote\0");
    assert_eq!(&read(&kernel, child_data)[..12], b"child wrote\0");
    assert_eq!(&read(&kernel, parent_data)[..13], b"parent wrote\0");
}

#[test]
fn fork_fails_when_table_full() {
    let (mut kernel, _) = boot(BootCommand::Default);
    for expected in 5..NPROC as u32 {
        trap(&mut kernel, pid(1), INT_SYS_FORK, 0).unwrap();
        assert_eq!(eax(&kernel, pid(1)), expected);
    }
    let ledger_before: Vec<_> = kernel.memory().ledger.iter().collect();
    assert_eq!(trap(&mut kernel, pid(1), INT_SYS_FORK, 0), Ok(Dispatch::Resume(pid(1))));
    assert_eq!(eax(&kernel, pid(1)), SYSCALL_FAILED);
    let ledger_after: Vec<_> = kernel.memory().ledger.iter().collect();
    assert_eq!(ledger_before, ledger_after);
}

#[test]
fn fork_out_of_memory_changes_nothing() {
    let (mut kernel, parent) = boot(BootCommand::Fork);
    // Leave exactly three free pages: enough for root, table and one copy, not two.
    let mut va = 0x10_2000;
    while kernel.memory().ledger.free_pages() > 3 {
        trap(&mut kernel, parent, INT_SYS_PAGE_ALLOC, va as u32).unwrap();
        assert_eq!(eax(&kernel, parent), 0);
        va += PAGE_SIZE;
    }
    let ledger_before: Vec<_> = kernel.memory().ledger.iter().collect();
    assert_eq!(trap(&mut kernel, parent, INT_SYS_FORK, 0), Ok(Dispatch::Resume(parent)));
    assert_eq!(eax(&kernel, parent), SYSCALL_FAILED);
    let ledger_after: Vec<_> = kernel.memory().ledger.iter().collect();
    assert_eq!(ledger_before, ledger_after);
    assert_eq!(kernel.tasks().state(pid(2)), Some(ProcState::Free));
    assert_eq!(kernel.check(), Ok(()));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn fork_ledger_delta_matches_writable_pages(extra in 0usize..8) {
        let (mut kernel, parent) = boot(BootCommand::Fork);
        for i in 0..extra {
            trap(&mut kernel, parent, INT_SYS_PAGE_ALLOC, (0x20_0000 + i * PAGE_SIZE) as u32)
                .unwrap();
        }
        let free_before = kernel.memory().ledger.free_pages();
        trap(&mut kernel, parent, INT_SYS_FORK, 0).unwrap();
        prop_assert_eq!(eax(&kernel, parent), 2);
        // Root and table, plus data, stack and every extra page.
        prop_assert_eq!(free_before - kernel.memory().ledger.free_pages(), 2 + 2 + extra);
        prop_assert_eq!(kernel.check(), Ok(()));
    }
}
