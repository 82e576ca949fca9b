// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Rust entry points called by the boot and trap assembly
//! OWNERS: @kernel-arch-team
//! PUBLIC API: kernel_start (boot), exception (every trap vector)
//! DEPENDS_ON: kmain::Kernel, arch::x86::{X86Machine, PhysRam}
//! INVARIANTS: kernel_start runs once with interrupts masked; exception runs with
//!             interrupts masked and never nests

use core::cell::UnsafeCell;
use core::ffi::{c_char, CStr};

use super::{PhysRam, X86Machine};
use crate::config::{BootCommand, MemoryLayout};
use crate::hal::Machine;
use crate::kmain::{BootError, Kernel};
use crate::loader::ImageTable;
use crate::trap::TrapFrame;

type BareKernel = Kernel<X86Machine, PhysRam, ImageTable>;

extern "C" {
    static __kernel_start: u8;
    static __kernel_end: u8;
}

extern "Rust" {
    /// Program images linked into the kernel binary.
    static AXON_PROGRAMS: ImageTable;
}

/// Storage for the single kernel instance.
struct KernelCell(UnsafeCell<Option<BareKernel>>);

// SAFETY: uniprocessor; the cell is written once in `kernel_start` before interrupts are
// enabled and afterwards only touched from `exception`, which never nests.
unsafe impl Sync for KernelCell {}

static KERNEL: KernelCell = KernelCell(UnsafeCell::new(None));

fn layout() -> MemoryLayout {
    // SAFETY: linker symbols; only their addresses are taken.
    let (start, end) = unsafe {
        (core::ptr::addr_of!(__kernel_start) as usize, core::ptr::addr_of!(__kernel_end) as usize)
    };
    MemoryLayout { kernel_start: start, kernel_end: end, ..MemoryLayout::DEFAULT }
}

/// Boot entry. `command` is the boot loader's NUL-terminated command line, or null.
#[no_mangle]
pub extern "C" fn kernel_start(command: *const c_char) -> ! {
    let command = if command.is_null() {
        None
    } else {
        // SAFETY: the boot loader passes a NUL-terminated string in low memory.
        unsafe { CStr::from_ptr(command) }.to_str().ok()
    };
    let command = BootCommand::parse(command);

    // SAFETY: first and only construction of the CPU and RAM handles.
    let (machine, ram) = unsafe { (X86Machine::new(), PhysRam::new()) };
    // SAFETY: provided by the image that links this crate.
    let programs = unsafe { AXON_PROGRAMS };

    // SAFETY: see `KernelCell`; no trap can arrive before the first `run`.
    let slot = unsafe { &mut *KERNEL.0.get() };
    let kernel = match BareKernel::new(machine, ram, programs, layout()) {
        Ok(kernel) => slot.insert(kernel),
        Err(err) => boot_failed(&err),
    };
    match kernel.start(command) {
        Ok(first) => kernel.run(first),
        Err(err) => {
            log_error!(target: "boot", "{}", err);
            kernel.machine_mut().halt()
        }
    }
}

fn boot_failed(err: &BootError) -> ! {
    log_error!(target: "boot", "{}", err);
    // SAFETY: the machine handle built in `kernel_start` was consumed by the failed `new`.
    let mut machine = unsafe { X86Machine::new() };
    machine.halt()
}

/// Trap entry. `frame` points at the registers the trap assembly pushed.
#[no_mangle]
pub extern "C" fn exception(frame: *const TrapFrame) -> ! {
    // SAFETY: the trap assembly passes a pointer to a fully pushed frame on the kernel stack.
    let frame = unsafe { *frame };
    // SAFETY: see `KernelCell`.
    match unsafe { (*KERNEL.0.get()).as_mut() } {
        Some(kernel) => kernel.interrupt(&frame),
        None => {
            log_error!(target: "trap", "trap {} before boot", frame.intno);
            // SAFETY: no kernel exists to own the CPU handle.
            let mut machine = unsafe { X86Machine::new() };
            machine.halt()
        }
    }
}
