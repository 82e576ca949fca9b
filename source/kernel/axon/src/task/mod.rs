// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Process table and process setup
//! OWNERS: @kernel-sched-team
//! PUBLIC API: ProcessTable (new/get/state/first_free/process_init/setup/insert_forked),
//!             Process, ProcState, SpaceRef, SpawnError
//! DEPENDS_ON: mm::{AddressSpace, Memory}, loader, trap::TrapFrame
//! INVARIANTS: Slot 0 never leaves FREE; a slot becomes RUNNABLE only once its program and
//!             stack are in place; BROKEN is terminal; failed setup leaves no pages behind

use core::fmt;

use crate::config::{MEMSIZE_VIRTUAL, NPROC, PROC_STACK_ADDR};
use crate::hal::PhysMem;
use crate::loader::{self, LoadError, ProgramLoader};
use crate::mm::{AddressSpace, AddressSpaceError, Memory, PageFlags};
use crate::trap::TrapFrame;
use crate::types::{Pid, VirtAddr};

/// Lifecycle state of a process slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Free,
    Runnable,
    /// Took a fatal fault; never scheduled again.
    Broken,
}

/// The address space a process runs in.
#[derive(Debug, PartialEq, Eq)]
pub enum SpaceRef {
    /// Shares the kernel's directory (counted in the kernel root's refcount).
    Kernel,
    /// Owns a private directory.
    Private(AddressSpace),
}

/// Errors returned while creating a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    /// Pid is slot 0 or beyond the table.
    InvalidPid(Pid),
    /// Target slot is not FREE.
    SlotInUse(Pid),
    /// Program could not be loaded.
    Load(LoadError),
    /// Address space or stack could not be built.
    Space(AddressSpaceError),
}

impl From<LoadError> for SpawnError {
    fn from(value: LoadError) -> Self {
        Self::Load(value)
    }
}

impl From<AddressSpaceError> for SpawnError {
    fn from(value: AddressSpaceError) -> Self {
        Self::Space(value)
    }
}

impl From<crate::mm::AllocError> for SpawnError {
    fn from(value: crate::mm::AllocError) -> Self {
        Self::Space(value.into())
    }
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPid(pid) => write!(f, "invalid pid {pid}"),
            Self::SlotInUse(pid) => write!(f, "process slot {pid} in use"),
            Self::Load(err) => write!(f, "program load failed: {err}"),
            Self::Space(err) => write!(f, "{err}"),
        }
    }
}

/// Process descriptor.
#[derive(Debug)]
pub struct Process {
    pid: Pid,
    pub state: ProcState,
    pub frame: TrapFrame,
    space: Option<SpaceRef>,
}

impl Process {
    const fn free(pid: Pid) -> Self {
        Self { pid, state: ProcState::Free, frame: TrapFrame::user(), space: None }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn state(&self) -> ProcState {
        self.state
    }

    pub fn space(&self) -> Option<&SpaceRef> {
        self.space.as_ref()
    }

    /// The private address space, if the process has one.
    pub fn private_space(&self) -> Option<&AddressSpace> {
        match &self.space {
            Some(SpaceRef::Private(space)) => Some(space),
            _ => None,
        }
    }

    pub fn private_space_mut(&mut self) -> Option<&mut AddressSpace> {
        match &mut self.space {
            Some(SpaceRef::Private(space)) => Some(space),
            _ => None,
        }
    }

    /// Directory root to load when this process runs.
    pub fn root(&self, kernel: &AddressSpace) -> crate::PhysAddr {
        match &self.space {
            Some(SpaceRef::Private(space)) => space.root(),
            _ => kernel.root(),
        }
    }
}

/// Fixed table of `NPROC` process slots indexed by pid.
pub struct ProcessTable {
    slots: [Process; NPROC],
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable {
    /// Every slot FREE, slot `i` carrying pid `i`.
    pub fn new() -> Self {
        Self { slots: core::array::from_fn(|i| Process::free(Pid::from_raw(i as u32))) }
    }

    pub fn get(&self, pid: Pid) -> Option<&Process> {
        self.slots.get(pid.as_index())
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.slots.get_mut(pid.as_index())
    }

    pub fn state(&self, pid: Pid) -> Option<ProcState> {
        self.get(pid).map(Process::state)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Process> + '_ {
        self.slots.iter()
    }

    /// Lowest FREE slot other than slot 0.
    pub fn first_free(&self) -> Option<Pid> {
        self.slots.iter().skip(1).find(|p| p.state == ProcState::Free).map(|p| p.pid)
    }

    fn free_slot_mut(&mut self, pid: Pid) -> Result<&mut Process, SpawnError> {
        if pid == Pid::RESERVED {
            return Err(SpawnError::InvalidPid(pid));
        }
        let slot = self.slots.get_mut(pid.as_index()).ok_or(SpawnError::InvalidPid(pid))?;
        if slot.state != ProcState::Free || slot.space.is_some() {
            return Err(SpawnError::SlotInUse(pid));
        }
        Ok(slot)
    }

    /// Resets `pid`'s registers and attaches it to the kernel's address space.
    ///
    /// The slot stays FREE; the kernel root's refcount grows by one.
    pub fn process_init<R: PhysMem>(
        &mut self,
        memory: &mut Memory<R>,
        kernel: &AddressSpace,
        pid: Pid,
    ) -> Result<(), SpawnError> {
        let slot = self.free_slot_mut(pid)?;
        memory.ledger.share(kernel.root())?;
        slot.frame = TrapFrame::user();
        slot.space = Some(SpaceRef::Kernel);
        Ok(())
    }

    /// Creates process `pid` running `program` and marks it RUNNABLE.
    ///
    /// The process gets a private copy of the kernel template, its program, and one stack
    /// page at `PROC_STACK_ADDR`. On failure the slot is FREE again and every page
    /// taken for it is released.
    pub fn setup<R: PhysMem, L: ProgramLoader + ?Sized>(
        &mut self,
        memory: &mut Memory<R>,
        kernel: &AddressSpace,
        programs: &L,
        pid: Pid,
        program: usize,
    ) -> Result<(), SpawnError> {
        self.process_init(memory, kernel, pid)?;
        match build_private_space(memory, kernel, programs, pid, program) {
            Ok((space, entry)) => {
                memory.ledger.release(kernel.root())?;
                let slot = &mut self.slots[pid.as_index()];
                slot.frame.eip = entry.raw() as u32;
                slot.frame.esp = MEMSIZE_VIRTUAL as u32;
                slot.space = Some(SpaceRef::Private(space));
                slot.state = ProcState::Runnable;
                log_info!(target: "task", "pid {} runs program {} root={}", pid, program,
                    slot.root(kernel));
                Ok(())
            }
            Err(err) => {
                memory.ledger.release(kernel.root())?;
                self.slots[pid.as_index()] = Process::free(pid);
                Err(err)
            }
        }
    }

    /// Installs a forked child in its FREE slot and marks it RUNNABLE.
    pub fn insert_forked(
        &mut self,
        child: Pid,
        frame: TrapFrame,
        space: AddressSpace,
    ) -> Result<(), SpawnError> {
        let slot = self.free_slot_mut(child)?;
        slot.frame = frame;
        slot.space = Some(SpaceRef::Private(space));
        slot.state = ProcState::Runnable;
        Ok(())
    }
}

fn build_private_space<R: PhysMem, L: ProgramLoader + ?Sized>(
    memory: &mut Memory<R>,
    kernel: &AddressSpace,
    programs: &L,
    pid: Pid,
    program: usize,
) -> Result<(AddressSpace, VirtAddr), SpawnError> {
    let image = programs.image(program).ok_or(LoadError::UnknownProgram(program))?;
    let mut space = AddressSpace::new_from_kernel_template(memory, kernel, pid)?;
    let populated = loader::load(memory, &mut space, image)
        .map_err(SpawnError::from)
        .and_then(|entry| {
            let stack = VirtAddr::new(PROC_STACK_ADDR);
            space.map_fresh_page(memory, stack, PageFlags::USER_RW)?;
            Ok(entry)
        });
    match populated {
        Ok(entry) => Ok((space, entry)),
        Err(err) => {
            space.release(memory)?;
            Err(err)
        }
    }
}
