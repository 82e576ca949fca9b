// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Boot and trap-dispatch scenarios on the host machine
//! OWNERS: @kernel-team
//!
//! TEST_SCENARIOS:
//!   - boot builds four isolated processes sharing the kernel range
//!   - getpid/yield/timer resume the right process
//!   - page_alloc maps fresh pages and fails cleanly once memory runs out
//!   - user page faults break the process; kernel faults, panics and stray vectors are fatal
//!   - nothing runnable leaves the dispatcher idle

mod common;

use axon::config::{BootCommand, MEMSIZE_VIRTUAL, NPROC, PROC_START_ADDR, TIMER_HZ};
use axon::mm::{Owner, PageFlags, PAGE_SIZE};
use axon::syscall::SYSCALL_FAILED;
use axon::task::ProcState;
use axon::trap::{
    Dispatch, Fatal, INT_PAGEFAULT, INT_SYS_GETPID, INT_SYS_PAGE_ALLOC, INT_SYS_PANIC,
    INT_SYS_YIELD, INT_TIMER,
};
use axon::{Pid, VirtAddr};
use common::{boot, eax, trap, DATA_VA};

fn pid(raw: u32) -> Pid {
    Pid::from_raw(raw)
}

#[test]
fn default_boot_creates_isolated_processes() {
    let (kernel, first) = boot(BootCommand::Default);
    assert_eq!(first, pid(1));
    assert_eq!(kernel.machine().timer_hz, Some(TIMER_HZ));
    assert_eq!(kernel.tasks().state(Pid::RESERVED), Some(ProcState::Free));

    let memory = kernel.memory();
    let kernel_space = kernel.kernel_space();
    let mut roots = Vec::new();
    for raw in 1..=4 {
        let process = kernel.tasks().get(pid(raw)).unwrap();
        assert_eq!(process.state(), ProcState::Runnable);
        let space = process.private_space().expect("private space");
        assert_ne!(space.root(), kernel_space.root());
        roots.push(space.root());

        let stack = space.lookup(&memory.ram, VirtAddr::new(MEMSIZE_VIRTUAL - PAGE_SIZE)).unwrap();
        assert_eq!(stack.flags, PageFlags::USER_RW);
        assert_eq!(memory.ledger.info(stack.pa).unwrap().owner, Owner::Process(pid(raw)));
        assert_eq!(process.frame.esp as usize, MEMSIZE_VIRTUAL);
        assert_eq!(process.frame.eip as usize, PROC_START_ADDR);

        for va in (0..PROC_START_ADDR).step_by(PAGE_SIZE) {
            let va = VirtAddr::new(va);
            assert_eq!(space.lookup(&memory.ram, va), kernel_space.lookup(&memory.ram, va));
        }
    }
    roots.sort();
    roots.dedup();
    assert_eq!(roots.len(), 4);
    for raw in 5..NPROC as u32 {
        assert_eq!(kernel.tasks().state(pid(raw)), Some(ProcState::Free));
    }
    assert_eq!(kernel.check(), Ok(()));
}

#[test]
fn getpid_returns_caller_and_resumes_it() {
    let (mut kernel, _) = boot(BootCommand::Default);
    assert_eq!(trap(&mut kernel, pid(3), INT_SYS_GETPID, 0), Ok(Dispatch::Resume(pid(3))));
    assert_eq!(eax(&kernel, pid(3)), 3);
}

#[test]
fn yield_and_timer_rotate_round_robin() {
    let (mut kernel, _) = boot(BootCommand::Default);
    assert_eq!(trap(&mut kernel, pid(1), INT_SYS_YIELD, 0), Ok(Dispatch::Resume(pid(2))));
    assert_eq!(trap(&mut kernel, pid(2), INT_TIMER, 0), Ok(Dispatch::Resume(pid(3))));
    assert_eq!(trap(&mut kernel, pid(3), INT_TIMER, 0), Ok(Dispatch::Resume(pid(4))));
    assert_eq!(trap(&mut kernel, pid(4), INT_SYS_YIELD, 0), Ok(Dispatch::Resume(pid(1))));
    assert_eq!(kernel.ticks(), 2);
}

#[test]
fn page_alloc_maps_zeroed_private_page() {
    let (mut kernel, _) = boot(BootCommand::Default);
    let va = VirtAddr::new(0x20_0000);
    let before = kernel.memory().ledger.free_pages();
    assert_eq!(
        trap(&mut kernel, pid(2), INT_SYS_PAGE_ALLOC, va.raw() as u32),
        Ok(Dispatch::Resume(pid(2)))
    );
    assert_eq!(eax(&kernel, pid(2)), 0);
    assert_eq!(kernel.memory().ledger.free_pages(), before - 1);

    let space = kernel.tasks().get(pid(2)).unwrap().private_space().unwrap();
    let mapping = space.lookup(&kernel.memory().ram, va).unwrap();
    assert_eq!(mapping.flags, PageFlags::USER_RW);
    assert_eq!(kernel.memory().ledger.info(mapping.pa).unwrap().owner, Owner::Process(pid(2)));
    let other = kernel.tasks().get(pid(1)).unwrap().private_space().unwrap();
    assert_eq!(other.lookup(&kernel.memory().ram, va), None);
}

#[test]
fn page_alloc_rejects_bad_addresses() {
    let (mut kernel, _) = boot(BootCommand::Default);
    let before = kernel.memory().ledger.free_pages();
    for va in [0x20_0010, 0x4_0000, MEMSIZE_VIRTUAL, DATA_VA] {
        trap(&mut kernel, pid(1), INT_SYS_PAGE_ALLOC, va as u32).unwrap();
        assert_eq!(eax(&kernel, pid(1)), SYSCALL_FAILED, "va {va:#x}");
    }
    assert_eq!(kernel.memory().ledger.free_pages(), before);
}

#[test]
fn page_alloc_exhaustion_changes_nothing() {
    let (mut kernel, _) = boot(BootCommand::Fork);
    let caller = pid(1);
    let mut failed_at = None;
    for va in (0x10_2000..MEMSIZE_VIRTUAL - PAGE_SIZE).step_by(PAGE_SIZE) {
        let ledger_before: Vec<_> = kernel.memory().ledger.iter().collect();
        trap(&mut kernel, caller, INT_SYS_PAGE_ALLOC, va as u32).unwrap();
        if eax(&kernel, caller) == SYSCALL_FAILED {
            let ledger_after: Vec<_> = kernel.memory().ledger.iter().collect();
            assert_eq!(ledger_before, ledger_after);
            failed_at = Some(VirtAddr::new(va));
            break;
        }
    }
    let va = failed_at.expect("memory should run out before the address range does");
    assert_eq!(kernel.memory().ledger.free_pages(), 0);
    let space = kernel.tasks().get(caller).unwrap().private_space().unwrap();
    assert_eq!(space.lookup(&kernel.memory().ram, va), None);
    assert_eq!(kernel.tasks().state(caller), Some(ProcState::Runnable));
    assert_eq!(kernel.check(), Ok(()));
}

#[test]
fn user_page_fault_breaks_process_and_reschedules() {
    let (mut kernel, _) = boot(BootCommand::Default);
    kernel.machine_mut().cr2 = 0x2f_0000;
    // User-mode write to a missing page.
    let mut frame = kernel.switch_to(pid(2));
    frame.intno = INT_PAGEFAULT;
    frame.err = 0b110;
    assert_eq!(kernel.handle_trap(&frame), Ok(Dispatch::Resume(pid(3))));
    assert_eq!(kernel.tasks().state(pid(2)), Some(ProcState::Broken));

    // A broken process is never picked again.
    assert_eq!(trap(&mut kernel, pid(1), INT_SYS_YIELD, 0), Ok(Dispatch::Resume(pid(3))));
}

#[test]
fn kernel_page_fault_is_fatal() {
    let (mut kernel, _) = boot(BootCommand::Default);
    kernel.machine_mut().cr2 = 0x1000;
    let mut frame = kernel.switch_to(pid(1));
    frame.intno = INT_PAGEFAULT;
    frame.err = 0b001;
    match kernel.handle_trap(&frame) {
        Err(Fatal::KernelPageFault(fault)) => {
            assert_eq!(fault.addr, VirtAddr::new(0x1000));
            assert!(!fault.is_user());
        }
        other => panic!("expected kernel page fault, got {other:?}"),
    }
}

#[test]
fn panic_reports_user_message() {
    let (mut kernel, _) = boot(BootCommand::Default);
    assert_eq!(
        trap(&mut kernel, pid(4), INT_SYS_PANIC, DATA_VA as u32),
        Err(Fatal::Panic { pid: pid(4), message: "hello from user".into() })
    );
    match trap(&mut kernel, pid(4), INT_SYS_PANIC, 0x2f_0000) {
        Err(Fatal::Panic { message, .. }) => assert!(message.starts_with("<unreadable message")),
        other => panic!("expected panic, got {other:?}"),
    }
}

#[test]
fn unknown_vector_is_fatal() {
    let (mut kernel, _) = boot(BootCommand::Default);
    assert_eq!(
        trap(&mut kernel, pid(1), 13, 0),
        Err(Fatal::UnexpectedInterrupt { intno: 13 })
    );
}

#[test]
fn idle_once_every_process_is_broken() {
    let (mut kernel, _) = boot(BootCommand::Default);
    kernel.machine_mut().cr2 = 0x2f_0000;
    let mut last = None;
    for raw in 1..=4 {
        let mut frame = kernel.switch_to(pid(raw));
        frame.intno = INT_PAGEFAULT;
        frame.err = 0b100;
        last = Some(kernel.handle_trap(&frame));
    }
    assert_eq!(last, Some(Ok(Dispatch::Idle)));
    assert_eq!(kernel.check(), Ok(()));
}
