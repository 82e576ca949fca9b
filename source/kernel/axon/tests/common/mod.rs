// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Shared fixture for host scenario tests
//! OWNERS: @kernel-team
//! NOTE: Every program is one read-only code page plus one writable data page holding a
//!       NUL-terminated greeting

#![allow(dead_code)]

use axon::config::{BootCommand, MemoryLayout, PROC_START_ADDR};
use axon::hal::host::{HostMachine, HostRam};
use axon::loader::{ImageTable, ProgramImage, Segment};
use axon::mm::PAGE_SIZE;
use axon::trap::{Dispatch, Fatal, TrapFrame};
use axon::{Kernel, Pid};

pub type HostKernel = Kernel<HostMachine, HostRam, ImageTable>;

pub const CODE_VA: usize = PROC_START_ADDR;
pub const DATA_VA: usize = PROC_START_ADDR + PAGE_SIZE;
pub const GREETING: &[u8] = b"hello from user\0";

static CODE: [u8; 4] = [0xcd, 0x31, 0xeb, 0xfe];
static SEGMENTS: [Segment; 2] = [
    Segment { va: CODE_VA, data: &CODE, mem_size: PAGE_SIZE, writable: false },
    Segment { va: DATA_VA, data: GREETING, mem_size: PAGE_SIZE, writable: true },
];

macro_rules! program {
    ($name:literal) => {
        ProgramImage { name: $name, entry: CODE_VA, segments: &SEGMENTS }
    };
}

static IMAGES: [ProgramImage; 6] = [
    program!("p-allocator"),
    program!("p-allocator2"),
    program!("p-allocator3"),
    program!("p-allocator4"),
    program!("p-fork"),
    program!("p-forkexit"),
];

/// Kernel booted with `command`, not yet running anything.
pub fn boot(command: BootCommand) -> (HostKernel, Pid) {
    let mut kernel = Kernel::new(
        HostMachine::new(),
        HostRam::new(),
        ImageTable::new(&IMAGES),
        MemoryLayout::DEFAULT,
    )
    .expect("kernel space");
    let first = kernel.start(command).expect("boot");
    (kernel, first)
}

/// Resumes `pid` and delivers trap `intno` with `%eax = eax` from it.
pub fn trap(kernel: &mut HostKernel, pid: Pid, intno: u32, eax: u32) -> Result<Dispatch, Fatal> {
    let mut frame: TrapFrame = kernel.switch_to(pid);
    frame.intno = intno;
    frame.eax = eax;
    kernel.handle_trap(&frame)
}

/// `%eax` the process will see when next resumed.
pub fn eax(kernel: &HostKernel, pid: Pid) -> u32 {
    kernel.tasks().get(pid).expect("pid in range").frame.eax
}
