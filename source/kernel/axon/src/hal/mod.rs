// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Hardware abstraction layer traits.
//!
//! The kernel core never touches the CPU or physical memory directly. Bare-metal builds
//! implement these traits in `arch::x86`; host builds use [`host`].

#[cfg(not(target_os = "none"))]
pub mod host;

use crate::trap::TrapFrame;
use crate::types::PhysAddr;

/// Byte-addressable view of physical memory.
///
/// Callers only pass addresses below `MEMSIZE_PHYSICAL`; implementations may panic on
/// anything else.
pub trait PhysMem {
    /// Copies `buf.len()` bytes starting at `pa` into `buf`.
    fn read(&self, pa: PhysAddr, buf: &mut [u8]);
    /// Copies `bytes` to physical memory starting at `pa`.
    fn write(&mut self, pa: PhysAddr, bytes: &[u8]);
    /// Sets `len` bytes starting at `pa` to `byte`.
    fn fill(&mut self, pa: PhysAddr, len: usize, byte: u8);
    /// Copies one page from `src` to `dst`. Both must be page aligned.
    fn copy_page(&mut self, src: PhysAddr, dst: PhysAddr);

    /// Reads a little-endian 32-bit word.
    fn read_u32(&self, pa: PhysAddr) -> u32 {
        let mut buf = [0u8; 4];
        self.read(pa, &mut buf);
        u32::from_le_bytes(buf)
    }

    /// Writes a little-endian 32-bit word.
    fn write_u32(&mut self, pa: PhysAddr, value: u32) {
        self.write(pa, &value.to_le_bytes());
    }
}

/// CPU services the dispatcher consumes.
pub trait Machine {
    /// Installs `root` as the active page directory (`%cr3`).
    fn load_page_directory(&mut self, root: PhysAddr);
    /// Faulting linear address of the most recent page fault (`%cr2`).
    fn fault_address(&self) -> usize;
    /// Whether the operator asked the machine to stop.
    fn abort_requested(&mut self) -> bool;
    /// Programs the interval timer to fire `hz` times per second.
    fn start_timer(&mut self, hz: u32);
    /// Restores `frame` and returns to user mode.
    fn resume(&mut self, frame: &TrapFrame) -> !;
    /// Stops the machine.
    fn halt(&mut self) -> !;
}
