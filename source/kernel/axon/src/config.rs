// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Machine layout constants and boot configuration.
//!
//! ```text
//!  +-----+--------------------+----------------+----------------------------/
//!  |     | Kernel      Kernel |       :    I/O | process-addressable range
//!  |     | Code + Data  Stack |  ...  : Memory | (code, data, heap, stack)
//!  +-----+--------------------+----------------+----------------------------/
//!  0  0x40000              0x80000 0xA0000 0x100000           MEMSIZE_VIRTUAL
//! ```

use static_assertions::const_assert;

use crate::mm::{PageFlags, PAGE_SIZE, PT_ENTRIES};
use crate::types::{PhysAddr, Pid};

/// Bytes of physical memory managed by the ledger.
pub const MEMSIZE_PHYSICAL: usize = 0x20_0000;
/// Number of physical pages.
pub const NPAGES: usize = MEMSIZE_PHYSICAL / PAGE_SIZE;
/// Size of every process virtual address space.
pub const MEMSIZE_VIRTUAL: usize = 0x30_0000;
/// First process-addressable virtual address; everything below is the shared kernel range.
pub const PROC_START_ADDR: usize = 0x10_0000;
/// Page holding each process's initial stack; program segments must stay below it.
pub const PROC_STACK_ADDR: usize = MEMSIZE_VIRTUAL - PAGE_SIZE;
/// Number of process-table slots, including the reserved slot 0.
pub const NPROC: usize = 16;
/// Timer interrupt frequency (interrupts per second).
pub const TIMER_HZ: u32 = 100;
/// Start of the memory-mapped I/O hole.
pub const IO_PHYS_MIN: usize = 0xA_0000;
/// End of the memory-mapped I/O hole.
pub const IO_PHYS_MAX: usize = 0x10_0000;
/// CGA console text buffer; the only user-accessible page of the kernel range.
pub const CONSOLE_ADDR: usize = 0xB_8000;

const_assert!(MEMSIZE_VIRTUAL / PAGE_SIZE <= PT_ENTRIES * PT_ENTRIES);
const_assert!(PROC_START_ADDR % PAGE_SIZE == 0 && MEMSIZE_VIRTUAL % PAGE_SIZE == 0);
const_assert!(PROC_START_ADDR <= PT_ENTRIES * PAGE_SIZE);
const_assert!(NPROC <= i8::MAX as usize);

/// Where the kernel image and stack live in physical memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryLayout {
    /// First byte of kernel code.
    pub kernel_start: usize,
    /// One past the last byte of kernel code, data and bss.
    pub kernel_end: usize,
    /// Top of the kernel stack; the page just below it belongs to the kernel.
    pub kernel_stack_top: usize,
}

impl MemoryLayout {
    /// Layout of the stock kernel image.
    pub const DEFAULT: Self =
        Self { kernel_start: 0x4_0000, kernel_end: 0x5_8000, kernel_stack_top: 0x8_0000 };

    /// Hardware-reserved pages: page 0 and the I/O hole.
    pub const fn is_reserved(&self, pa: PhysAddr) -> bool {
        let pa = pa.raw();
        pa < PAGE_SIZE || (pa >= IO_PHYS_MIN && pa < IO_PHYS_MAX)
    }

    /// Pages occupied by the kernel image or kernel stack.
    pub const fn is_kernel(&self, pa: PhysAddr) -> bool {
        let pa = pa.raw();
        (pa >= self.kernel_start && pa < self.kernel_end)
            || pa == self.kernel_stack_top - PAGE_SIZE
    }

    /// Permissions the kernel's own directory uses for physical page `pa`.
    pub const fn kernel_mapping_flags(&self, pa: PhysAddr) -> PageFlags {
        if pa.raw() == CONSOLE_ADDR {
            PageFlags::USER_RW
        } else {
            PageFlags::KERNEL_RW
        }
    }
}

impl Default for MemoryLayout {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Workload selected by the boot loader's command string.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootCommand {
    /// Four processes running programs 0 through 3.
    Default,
    /// One process running the fork demo.
    Fork,
    /// One process running the fork-and-exit demo.
    ForkExit,
}

const DEFAULT_PROCESSES: [(Pid, usize); 4] =
    [(Pid::from_raw(1), 0), (Pid::from_raw(2), 1), (Pid::from_raw(3), 2), (Pid::from_raw(4), 3)];
const FORK_PROCESSES: [(Pid, usize); 1] = [(Pid::from_raw(1), 4)];
const FORKEXIT_PROCESSES: [(Pid, usize); 1] = [(Pid::from_raw(1), 5)];

impl BootCommand {
    /// Parses the boot command; anything unrecognised selects the default workload.
    pub fn parse(command: Option<&str>) -> Self {
        match command.map(str::trim) {
            Some("fork") => Self::Fork,
            Some("forkexit") => Self::ForkExit,
            _ => Self::Default,
        }
    }

    /// `(pid, program number)` pairs created at boot, in creation order.
    pub fn processes(self) -> &'static [(Pid, usize)] {
        match self {
            Self::Default => &DEFAULT_PROCESSES,
            Self::Fork => &FORK_PROCESSES,
            Self::ForkExit => &FORKEXIT_PROCESSES,
        }
    }
}
