// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall handlers exposed to the dispatcher
//! OWNERS: @kernel-team
//! PUBLIC API: Context, sys_getpid, sys_page_alloc, sys_fork
//! DEPENDS_ON: task::ProcessTable, mm::{Memory, AddressSpace}
//! INVARIANTS: Decode -> check -> execute; a failed call leaves ledger and process table
//!             untouched

use super::{Args, Error, SysResult};
use crate::config::{MEMSIZE_VIRTUAL, PROC_START_ADDR};
use crate::hal::PhysMem;
use crate::mm::{AddressSpace, AllocError, Memory, PageFlags};
use crate::task::ProcessTable;
use crate::types::{Pid, VirtAddr};

/// Kernel state a handler may touch on behalf of the calling process.
pub struct Context<'a, R: PhysMem> {
    pub pid: Pid,
    pub tasks: &'a mut ProcessTable,
    pub memory: &'a mut Memory<R>,
    pub kernel: &'a AddressSpace,
}

impl<'a, R: PhysMem> Context<'a, R> {
    pub fn new(
        pid: Pid,
        tasks: &'a mut ProcessTable,
        memory: &'a mut Memory<R>,
        kernel: &'a AddressSpace,
    ) -> Self {
        Self { pid, tasks, memory, kernel }
    }
}

/// Returns the caller's pid.
pub fn sys_getpid<R: PhysMem>(ctx: &mut Context<'_, R>, _args: &Args) -> SysResult<u32> {
    Ok(ctx.pid.as_raw())
}

/// Typed decode of the page-allocation request.
#[derive(Clone, Copy)]
struct PageAllocArgs {
    va: VirtAddr,
}

impl PageAllocArgs {
    fn decode(args: &Args) -> SysResult<Self> {
        let raw = args.get() as usize;
        let va = VirtAddr::page_aligned(raw).ok_or(Error::BadAddress(VirtAddr::new(raw)))?;
        if va.raw() < PROC_START_ADDR || va.raw() >= MEMSIZE_VIRTUAL {
            return Err(Error::BadAddress(va));
        }
        Ok(Self { va })
    }
}

/// Backs the caller's page at `%eax` with a fresh zeroed page, user read/write.
pub fn sys_page_alloc<R: PhysMem>(ctx: &mut Context<'_, R>, args: &Args) -> SysResult<u32> {
    let PageAllocArgs { va } = PageAllocArgs::decode(args)?;
    let space = ctx
        .tasks
        .get_mut(ctx.pid)
        .and_then(|p| p.private_space_mut())
        .ok_or(Error::NoAddressSpace)?;
    if space.lookup(&ctx.memory.ram, va).is_some() {
        return Err(Error::AlreadyMapped(va));
    }
    if ctx.memory.ledger.find_free().is_none() {
        return Err(AllocError::OutOfMemory.into());
    }
    let pa = space.map_fresh_page(ctx.memory, va, PageFlags::USER_RW)?;
    log_debug!(target: "syscall", "page_alloc pid={} va={} pa={}", ctx.pid, va, pa);
    Ok(0)
}

/// Duplicates the caller into the lowest FREE slot and returns the child's pid.
///
/// The child's saved registers equal the parent's except `%eax`, which reads 0. The caller
/// is resumed; the child runs on a later scheduling pass.
pub fn sys_fork<R: PhysMem>(ctx: &mut Context<'_, R>, _args: &Args) -> SysResult<u32> {
    let child = ctx.tasks.first_free().ok_or(Error::ProcessTableFull)?;
    let parent = ctx.tasks.get(ctx.pid).ok_or(Error::NoAddressSpace)?;
    let mut frame = parent.frame;
    let space = parent
        .private_space()
        .ok_or(Error::NoAddressSpace)?
        .duplicate_for_fork(ctx.memory, ctx.kernel, child)?;
    frame.eax = 0;
    ctx.tasks.insert_forked(child, frame, space)?;
    log_info!(target: "syscall", "fork pid={} -> child={}", ctx.pid, child);
    Ok(child.as_raw())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryLayout;
    use crate::hal::host::HostRam;
    use crate::loader::{ImageTable, ProgramImage, Segment};
    use crate::mm::{Owner, PageLedger, PAGE_SIZE};
    use crate::task::ProcState;

    static CODE: [u8; 2] = [0xeb, 0xfe];
    static SEGMENTS: [Segment; 1] =
        [Segment { va: PROC_START_ADDR, data: &CODE, mem_size: 2, writable: false }];
    static IMAGES: [ProgramImage; 1] =
        [ProgramImage { name: "spin", entry: PROC_START_ADDR, segments: &SEGMENTS }];

    struct World {
        memory: Memory<HostRam>,
        kernel: AddressSpace,
        tasks: ProcessTable,
    }

    impl World {
        fn new() -> Self {
            let mut memory = Memory::new(PageLedger::new(&MemoryLayout::DEFAULT), HostRam::new());
            let kernel = AddressSpace::kernel(&mut memory, &MemoryLayout::DEFAULT).unwrap();
            let mut tasks = ProcessTable::new();
            tasks
                .setup(&mut memory, &kernel, &ImageTable::new(&IMAGES), Pid::from_raw(1), 0)
                .unwrap();
            Self { memory, kernel, tasks }
        }

        fn ctx(&mut self, pid: u32) -> Context<'_, HostRam> {
            Context::new(Pid::from_raw(pid), &mut self.tasks, &mut self.memory, &self.kernel)
        }
    }

    #[test]
    fn getpid_reports_caller() {
        let mut world = World::new();
        assert_eq!(sys_getpid(&mut world.ctx(1), &Args::default()), Ok(1));
    }

    #[test]
    fn page_alloc_validates_request() {
        let mut world = World::new();
        let mut ctx = world.ctx(1);
        let unaligned = Args::new(PROC_START_ADDR as u32 + 1);
        assert!(matches!(sys_page_alloc(&mut ctx, &unaligned), Err(Error::BadAddress(_))));
        let kernel_range = Args::new(0x4_0000);
        assert!(matches!(sys_page_alloc(&mut ctx, &kernel_range), Err(Error::BadAddress(_))));
        let too_high = Args::new(MEMSIZE_VIRTUAL as u32);
        assert!(matches!(sys_page_alloc(&mut ctx, &too_high), Err(Error::BadAddress(_))));
        let code = Args::new(PROC_START_ADDR as u32);
        assert_eq!(
            sys_page_alloc(&mut ctx, &code),
            Err(Error::AlreadyMapped(VirtAddr::new(PROC_START_ADDR)))
        );
    }

    #[test]
    fn page_alloc_maps_zeroed_user_page() {
        let mut world = World::new();
        let va = VirtAddr::new(0x20_0000);
        // Dirty the page the allocator is about to hand out.
        let next = world.memory.ledger.find_free().unwrap();
        world.memory.ram.fill(next, PAGE_SIZE, 0xcc);
        assert_eq!(sys_page_alloc(&mut world.ctx(1), &Args::new(va.raw() as u32)), Ok(0));
        let space = world.tasks.get(Pid::from_raw(1)).unwrap().private_space().unwrap();
        let mapping = space.lookup(&world.memory.ram, va).unwrap();
        assert_eq!(mapping.pa, next);
        assert_eq!(mapping.flags, PageFlags::USER_RW);
        assert_eq!(world.memory.ledger.info(next).unwrap().owner, Owner::Process(Pid::from_raw(1)));
        assert_eq!(world.memory.ram.read_u32(next), 0);
    }

    #[test]
    fn fork_fills_lowest_free_slot() {
        let mut world = World::new();
        world.tasks.get_mut(Pid::from_raw(1)).unwrap().frame.ebx = 0x1234;
        let child = sys_fork(&mut world.ctx(1), &Args::default()).unwrap();
        assert_eq!(child, 2);
        let child = world.tasks.get(Pid::from_raw(2)).unwrap();
        assert_eq!(child.state(), ProcState::Runnable);
        assert_eq!(child.frame.eax, 0);
        assert_eq!(child.frame.ebx, 0x1234);
    }

    #[test]
    fn fork_fails_when_table_full() {
        let mut world = World::new();
        for pid in 2..crate::config::NPROC as u32 {
            world.tasks.get_mut(Pid::from_raw(pid)).unwrap().state = ProcState::Broken;
        }
        let free_before = world.memory.ledger.free_pages();
        assert_eq!(sys_fork(&mut world.ctx(1), &Args::default()), Err(Error::ProcessTableFull));
        assert_eq!(world.memory.ledger.free_pages(), free_before);
    }
}
