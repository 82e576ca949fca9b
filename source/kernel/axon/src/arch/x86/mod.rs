// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! x86 (32-bit, protected mode) backend.
//!
//! Implements [`Machine`] and [`PhysMem`] for the real CPU. Physical memory is identity
//! mapped in the kernel's directory and in the kernel range of every process directory,
//! so physical addresses double as kernel pointers.

pub mod entry;

use core::arch::asm;

use crate::config::MEMSIZE_PHYSICAL;
use crate::hal::{Machine, PhysMem};
use crate::mm::PAGE_SIZE;
use crate::trap::TrapFrame;
use crate::types::PhysAddr;
use crate::uart::KernelUart;

/// Input frequency of the 8253/8254 programmable interval timer.
const PIT_FREQUENCY: u32 = 1_193_182;
const PIT_CHANNEL0: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;
/// Channel 0, lobyte/hibyte access, mode 2 (rate generator).
const PIT_RATE_GENERATOR: u8 = 0x34;
/// Byte an operator sends over the serial line to stop the machine (Ctrl-C).
const ABORT_BYTE: u8 = 0x03;

#[inline]
pub fn inb(port: u16) -> u8 {
    let value: u8;
    // SAFETY: port I/O has no memory effects; callers only touch ports owned by the kernel.
    unsafe { asm!("in al, dx", out("al") value, in("dx") port, options(nomem, nostack, preserves_flags)) };
    value
}

#[inline]
pub fn outb(port: u16, value: u8) {
    // SAFETY: see `inb`.
    unsafe { asm!("out dx, al", in("dx") port, in("al") value, options(nomem, nostack, preserves_flags)) };
}

/// Loads `%cr3`, flushing the TLB.
#[inline]
fn lcr3(root: usize) {
    // SAFETY: `root` is a page directory built by the address-space manager; every
    // directory maps the kernel range identically, so execution continues after the load.
    unsafe { asm!("mov cr3, {}", in(reg) root, options(nostack, preserves_flags)) };
}

#[inline]
fn rcr2() -> usize {
    let value: usize;
    // SAFETY: reading %cr2 has no side effects.
    unsafe { asm!("mov {}, cr2", out(reg) value, options(nomem, nostack, preserves_flags)) };
    value
}

/// The running CPU.
pub struct X86Machine {
    _private: (),
}

impl X86Machine {
    /// # Safety
    ///
    /// Only one instance may exist; it owns the CPU's control registers and the PIT.
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }
}

impl Machine for X86Machine {
    fn load_page_directory(&mut self, root: PhysAddr) {
        lcr3(root.raw());
    }

    fn fault_address(&self) -> usize {
        rcr2()
    }

    fn abort_requested(&mut self) -> bool {
        KernelUart::lock().try_read_byte() == Some(ABORT_BYTE)
    }

    fn start_timer(&mut self, hz: u32) {
        let divisor = (PIT_FREQUENCY / hz.max(1)).clamp(1, u32::from(u16::MAX));
        outb(PIT_COMMAND, PIT_RATE_GENERATOR);
        outb(PIT_CHANNEL0, (divisor & 0xff) as u8);
        outb(PIT_CHANNEL0, (divisor >> 8) as u8);
    }

    fn resume(&mut self, frame: &TrapFrame) -> ! {
        // SAFETY: `frame` is a complete user frame laid out exactly as the trap entry pushes
        // it. The stack is abandoned; the next trap enters on the TSS kernel stack.
        unsafe {
            asm!(
                "mov esp, {frame}",
                "popad",
                "pop es",
                "pop ds",
                // Skip intno and err.
                "add esp, 8",
                "iretd",
                frame = in(reg) frame as *const TrapFrame,
                options(noreturn)
            )
        }
    }

    fn halt(&mut self) -> ! {
        loop {
            // SAFETY: stopping the CPU with interrupts masked is always sound.
            unsafe { asm!("cli", "hlt", options(nomem, nostack)) };
        }
    }
}

/// Physical memory through the kernel's identity map.
pub struct PhysRam {
    _private: (),
}

impl PhysRam {
    /// # Safety
    ///
    /// `[0, MEMSIZE_PHYSICAL)` must be identity mapped in every directory the kernel runs
    /// on, and only one instance may exist.
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }

    fn ptr(pa: PhysAddr, len: usize) -> *mut u8 {
        debug_assert!(pa.raw().checked_add(len).is_some_and(|end| end <= MEMSIZE_PHYSICAL));
        pa.raw() as *mut u8
    }
}

impl PhysMem for PhysRam {
    fn read(&self, pa: PhysAddr, buf: &mut [u8]) {
        let src = Self::ptr(pa, buf.len());
        // SAFETY: identity mapped, in range (see `new`).
        unsafe { core::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), buf.len()) };
    }

    fn write(&mut self, pa: PhysAddr, bytes: &[u8]) {
        let dst = Self::ptr(pa, bytes.len());
        // SAFETY: identity mapped, in range (see `new`).
        unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len()) };
    }

    fn fill(&mut self, pa: PhysAddr, len: usize, byte: u8) {
        let dst = Self::ptr(pa, len);
        // SAFETY: identity mapped, in range (see `new`).
        unsafe { core::ptr::write_bytes(dst, byte, len) };
    }

    fn copy_page(&mut self, src: PhysAddr, dst: PhysAddr) {
        let from = Self::ptr(src, PAGE_SIZE);
        let to = Self::ptr(dst, PAGE_SIZE);
        // SAFETY: distinct ledger pages never overlap.
        unsafe { core::ptr::copy_nonoverlapping(from, to, PAGE_SIZE) };
    }
}
