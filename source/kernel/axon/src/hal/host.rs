// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Host-side stand-ins for the hardware seams, used by unit and scenario tests.

use alloc::vec;
use alloc::vec::Vec;

use super::{Machine, PhysMem};
use crate::config::MEMSIZE_PHYSICAL;
use crate::mm::PAGE_SIZE;
use crate::trap::TrapFrame;
use crate::types::PhysAddr;

/// Physical memory backed by a heap buffer of `MEMSIZE_PHYSICAL` bytes.
pub struct HostRam {
    bytes: Vec<u8>,
}

impl HostRam {
    pub fn new() -> Self {
        Self { bytes: vec![0; MEMSIZE_PHYSICAL] }
    }

    fn range(pa: PhysAddr, len: usize) -> core::ops::Range<usize> {
        let start = pa.raw();
        let end = start.checked_add(len).filter(|&end| end <= MEMSIZE_PHYSICAL);
        match end {
            Some(end) => start..end,
            None => panic!("physical access {pa}+{len:#x} beyond RAM"),
        }
    }
}

impl Default for HostRam {
    fn default() -> Self {
        Self::new()
    }
}

impl PhysMem for HostRam {
    fn read(&self, pa: PhysAddr, buf: &mut [u8]) {
        buf.copy_from_slice(&self.bytes[Self::range(pa, buf.len())]);
    }

    fn write(&mut self, pa: PhysAddr, bytes: &[u8]) {
        self.bytes[Self::range(pa, bytes.len())].copy_from_slice(bytes);
    }

    fn fill(&mut self, pa: PhysAddr, len: usize, byte: u8) {
        self.bytes[Self::range(pa, len)].fill(byte);
    }

    fn copy_page(&mut self, src: PhysAddr, dst: PhysAddr) {
        debug_assert!(src.is_page_aligned() && dst.is_page_aligned());
        let src = Self::range(src, PAGE_SIZE);
        Self::range(dst, PAGE_SIZE);
        self.bytes.copy_within(src, dst.raw());
    }
}

/// Records what the dispatcher asked of the CPU.
///
/// `resume` and `halt` cannot return on the host, so scenario tests drive
/// [`crate::Kernel::handle_trap`] directly and only use this for the non-divergent calls.
#[derive(Debug, Default)]
pub struct HostMachine {
    /// Every directory root loaded, oldest first.
    pub loaded_roots: Vec<PhysAddr>,
    /// Value reported by `fault_address`.
    pub cr2: usize,
    /// Value reported by `abort_requested`.
    pub abort: bool,
    /// Frequency passed to the last `start_timer` call.
    pub timer_hz: Option<u32>,
}

impl HostMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Root most recently loaded into `%cr3`.
    pub fn active_root(&self) -> Option<PhysAddr> {
        self.loaded_roots.last().copied()
    }
}

impl Machine for HostMachine {
    fn load_page_directory(&mut self, root: PhysAddr) {
        self.loaded_roots.push(root);
    }

    fn fault_address(&self) -> usize {
        self.cr2
    }

    fn abort_requested(&mut self) -> bool {
        self.abort
    }

    fn start_timer(&mut self, hz: u32) {
        self.timer_hz = Some(hz);
    }

    fn resume(&mut self, frame: &TrapFrame) -> ! {
        panic!("host machine cannot resume user mode (eip={:#x})", frame.eip)
    }

    fn halt(&mut self) -> ! {
        panic!("host machine halted")
    }
}
