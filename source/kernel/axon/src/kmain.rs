// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel context, boot sequence and trap dispatch
//! OWNERS: @kernel-team
//! PUBLIC API: Kernel (new/start/handle_trap/switch_to/interrupt/schedule/run), BootError
//! DEPENDS_ON: hal, mm, task, sched, syscall, loader, trap
//! INVARIANTS: All kernel state lives in one Kernel value mutated only from the trap path;
//!             dispatch runs on the kernel directory; run/schedule/interrupt never return
//!
//! [`Kernel::handle_trap`] holds every dispatch decision and returns it as a [`Dispatch`];
//! [`Kernel::interrupt`] wraps it with the one-way transfers the hardware needs. Host tests
//! drive the former.

use alloc::format;
use alloc::string::String;
use core::fmt;

use crate::config::{BootCommand, MemoryLayout, TIMER_HZ};
use crate::hal::{Machine, PhysMem};
use crate::loader::ProgramLoader;
use crate::mm::{
    check_invariants, AddressSpace, AddressSpaceError, InvariantViolation, Memory, PageLedger,
};
use crate::sched::Scheduler;
use crate::syscall::{api, encode_result, Args, SyscallTable};
use crate::task::{ProcState, ProcessTable, SpawnError};
use crate::trap::{
    Dispatch, Fatal, PageFault, TrapFrame, INT_PAGEFAULT, INT_SYS_PANIC, INT_SYS_YIELD,
    INT_TIMER,
};
use crate::types::{Pid, VirtAddr};

/// Longest panic message copied out of user memory.
const PANIC_MESSAGE_MAX: usize = 160;

/// Reasons the kernel cannot finish booting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootError {
    /// The kernel's own directory could not be built.
    KernelSpace(AddressSpaceError),
    /// A boot-time process could not be created.
    Spawn { pid: Pid, program: usize, source: SpawnError },
    /// Boot left virtual-memory bookkeeping inconsistent.
    Invariant(InvariantViolation),
}

impl From<InvariantViolation> for BootError {
    fn from(value: InvariantViolation) -> Self {
        Self::Invariant(value)
    }
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KernelSpace(err) => write!(f, "kernel address space: {err}"),
            Self::Spawn { pid, program, source } => {
                write!(f, "process {pid} (program {program}): {source}")
            }
            Self::Invariant(violation) => write!(f, "virtual memory check failed: {violation}"),
        }
    }
}

/// Aggregated kernel state initialised during boot.
pub struct Kernel<M: Machine, R: PhysMem, L: ProgramLoader> {
    machine: M,
    memory: Memory<R>,
    programs: L,
    kernel_space: AddressSpace,
    tasks: ProcessTable,
    scheduler: Scheduler,
    syscalls: SyscallTable<R>,
}

impl<M: Machine, R: PhysMem, L: ProgramLoader> Kernel<M, R, L> {
    /// Partitions physical memory and builds the kernel's directory.
    pub fn new(machine: M, ram: R, programs: L, layout: MemoryLayout) -> Result<Self, BootError> {
        let mut memory = Memory::new(PageLedger::new(&layout), ram);
        let kernel_space =
            AddressSpace::kernel(&mut memory, &layout).map_err(BootError::KernelSpace)?;
        log_info!(
            target: "boot",
            "kernel {:#x}..{:#x} stack top {:#x}, {} free pages, kernel root {}",
            layout.kernel_start,
            layout.kernel_end,
            layout.kernel_stack_top,
            memory.ledger.free_pages(),
            kernel_space.root()
        );
        Ok(Self {
            machine,
            memory,
            programs,
            kernel_space,
            tasks: ProcessTable::new(),
            scheduler: Scheduler::new(),
            syscalls: SyscallTable::with_default_handlers(),
        })
    }

    /// Starts the timer and creates the processes `command` selects.
    ///
    /// Returns the pid to run first. Any setup failure is a boot failure.
    pub fn start(&mut self, command: BootCommand) -> Result<Pid, BootError> {
        self.machine.start_timer(TIMER_HZ);
        let processes = command.processes();
        for &(pid, program) in processes {
            self.tasks
                .setup(&mut self.memory, &self.kernel_space, &self.programs, pid, program)
                .map_err(|source| BootError::Spawn { pid, program, source })?;
        }
        self.check()?;
        log_info!(target: "boot", "{:?} workload: {} processes", command, processes.len());
        // Every workload creates at least one process.
        Ok(processes.first().map_or(Pid::from_raw(1), |&(pid, _)| pid))
    }

    pub fn memory(&self) -> &Memory<R> {
        &self.memory
    }

    /// Physical memory, for loaders and test harnesses that play the part of user code.
    pub fn memory_mut(&mut self) -> &mut Memory<R> {
        &mut self.memory
    }

    pub fn tasks(&self) -> &ProcessTable {
        &self.tasks
    }

    pub fn kernel_space(&self) -> &AddressSpace {
        &self.kernel_space
    }

    pub fn machine(&self) -> &M {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut M {
        &mut self.machine
    }

    pub fn current(&self) -> Pid {
        self.scheduler.current()
    }

    pub fn ticks(&self) -> u64 {
        self.scheduler.ticks()
    }

    /// Cross-checks the ledger, the process table and every live directory.
    pub fn check(&self) -> Result<(), InvariantViolation> {
        check_invariants(&self.memory, &self.kernel_space, &self.tasks)
    }

    /// Makes `pid` current and installs its directory; returns the frame to restore.
    pub fn switch_to(&mut self, pid: Pid) -> TrapFrame {
        debug_assert_eq!(
            self.tasks.state(pid),
            Some(ProcState::Runnable),
            "switch_to: pid {pid} is not runnable"
        );
        self.scheduler.set_current(pid);
        match self.tasks.get(pid) {
            Some(process) => {
                self.machine.load_page_directory(process.root(&self.kernel_space));
                process.frame
            }
            None => TrapFrame::user(),
        }
    }

    /// Handles one trap taken by the current process.
    ///
    /// Saves `frame` into the current descriptor, switches to the kernel directory and
    /// acts on the vector. Debug builds (and `vm_check`) verify memory invariants before
    /// returning.
    pub fn handle_trap(&mut self, frame: &TrapFrame) -> Result<Dispatch, Fatal> {
        let pid = self.scheduler.current();
        if let Some(process) = self.tasks.get_mut(pid) {
            process.frame = *frame;
        }
        self.machine.load_page_directory(self.kernel_space.root());

        let dispatch = self.dispatch(pid, frame)?;
        #[cfg(any(debug_assertions, feature = "vm_check"))]
        self.check()?;
        Ok(dispatch)
    }

    fn dispatch(&mut self, pid: Pid, frame: &TrapFrame) -> Result<Dispatch, Fatal> {
        match frame.intno {
            INT_SYS_PANIC => Err(Fatal::Panic { pid, message: self.user_message(pid, frame.eax) }),
            INT_SYS_YIELD => Ok(self.schedule_next()),
            INT_TIMER => {
                self.scheduler.tick();
                Ok(self.schedule_next())
            }
            INT_PAGEFAULT => self.page_fault(pid, frame),
            vector if self.syscalls.handles(vector) => {
                let mut ctx =
                    api::Context::new(pid, &mut self.tasks, &mut self.memory, &self.kernel_space);
                let result = self.syscalls.dispatch(vector, &mut ctx, &Args::new(frame.eax));
                if let Err(err) = &result {
                    log_debug!(target: "syscall", "pid {} vector {} failed: {}", pid, vector, err);
                }
                if let Some(process) = self.tasks.get_mut(pid) {
                    process.frame.eax = encode_result(result);
                }
                Ok(Dispatch::Resume(pid))
            }
            intno => Err(Fatal::UnexpectedInterrupt { intno }),
        }
    }

    fn page_fault(&mut self, pid: Pid, frame: &TrapFrame) -> Result<Dispatch, Fatal> {
        let fault = PageFault::new(self.machine.fault_address(), frame.err, frame.eip);
        if !fault.is_user() {
            return Err(Fatal::KernelPageFault(fault));
        }
        log_warn!(target: "trap", "Process {} page fault for {}!", pid, fault);
        if let Some(process) = self.tasks.get_mut(pid) {
            process.state = ProcState::Broken;
        }
        Ok(self.schedule_next())
    }

    fn schedule_next(&self) -> Dispatch {
        match self.scheduler.pick_next(&self.tasks) {
            Some(pid) => Dispatch::Resume(pid),
            None => Dispatch::Idle,
        }
    }

    /// Copies the NUL-terminated string at user address `ptr` out of `pid`'s space.
    fn user_message(&self, pid: Pid, ptr: u32) -> String {
        let space = self
            .tasks
            .get(pid)
            .and_then(|p| p.private_space())
            .unwrap_or(&self.kernel_space);
        let mut buf = [0u8; PANIC_MESSAGE_MAX];
        match space.read_user_cstr(&self.memory.ram, VirtAddr::new(ptr as usize), &mut buf) {
            Ok(len) => String::from_utf8_lossy(&buf[..len]).into_owned(),
            Err(err) => format!("<unreadable message: {err}>"),
        }
    }

    /// Resumes `pid` in user mode.
    pub fn run(&mut self, pid: Pid) -> ! {
        let frame = self.switch_to(pid);
        self.machine.resume(&frame)
    }

    /// Runs the next runnable process, spinning (and polling for abort) until one exists.
    pub fn schedule(&mut self) -> ! {
        loop {
            if let Some(pid) = self.scheduler.pick_next(&self.tasks) {
                self.run(pid);
            }
            if self.machine.abort_requested() {
                log_info!(target: "sched", "abort requested while idle");
                self.machine.halt();
            }
            core::hint::spin_loop();
        }
    }

    /// Trap entry: dispatches `frame` and transfers control accordingly.
    pub fn interrupt(&mut self, frame: &TrapFrame) -> ! {
        if self.machine.abort_requested() {
            log_info!(target: "trap", "abort requested");
            self.machine.halt();
        }
        match self.handle_trap(frame) {
            Ok(Dispatch::Resume(pid)) => self.run(pid),
            Ok(Dispatch::Idle) => self.schedule(),
            Err(fatal) => self.fatal(&fatal),
        }
    }

    /// Reports `err` on the console and stops the machine.
    pub fn fatal(&mut self, err: &Fatal) -> ! {
        log_error!(target: "kernel", "{}", err);
        self.machine.halt()
    }
}
