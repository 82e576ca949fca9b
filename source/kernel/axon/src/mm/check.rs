// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Virtual-memory consistency checker.
//!
//! Cross-checks the ledger against the process table and every live page directory. Any
//! violation means kernel state is corrupt and is reported as a fatal error by the caller.

use core::fmt;

use super::{AddressSpace, Memory, Owner, PageDir};
use crate::config::NPROC;
use crate::hal::PhysMem;
use crate::task::{ProcState, ProcessTable, SpaceRef};
use crate::types::{PhysAddr, Pid};

/// Which directory a structural-page violation was found in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DirKind {
    Kernel,
    Process(Pid),
}

impl fmt::Display for DirKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kernel => f.write_str("kernel directory"),
            Self::Process(pid) => write!(f, "directory of pid {pid}"),
        }
    }
}

/// First inconsistency found by [`check_invariants`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvariantViolation {
    /// Process slot 0 left the FREE state.
    ReservedSlotInUse,
    /// A directory or page-table page has the wrong owner.
    Owner { dir: DirKind, page: PhysAddr, expected: Owner, found: Owner },
    /// A directory or page-table page has the wrong reference count.
    Refcount { dir: DirKind, page: PhysAddr, expected: u8, found: u8 },
    /// A live page is charged to a process whose slot is FREE.
    Orphan { page: PhysAddr, pid: Pid },
    /// A page is free by refcount but not by owner, or vice versa.
    FreeMismatch { page: PhysAddr },
    /// A directory entry points outside physical memory.
    BadPage { dir: DirKind, page: PhysAddr },
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReservedSlotInUse => f.write_str("process slot 0 is in use"),
            Self::Owner { dir, page, expected, found } => {
                write!(f, "{dir}: page {page} owned by {found}, expected {expected}")
            }
            Self::Refcount { dir, page, expected, found } => {
                write!(f, "{dir}: page {page} has refcount {found}, expected {expected}")
            }
            Self::Orphan { page, pid } => write!(f, "page {page} belongs to free pid {pid}"),
            Self::FreeMismatch { page } => {
                write!(f, "page {page} refcount and owner disagree about being free")
            }
            Self::BadPage { dir, page } => write!(f, "{dir}: page {page} is not physical memory"),
        }
    }
}

/// Verifies ledger, process table and page directories against each other.
pub fn check_invariants<R: PhysMem>(
    memory: &Memory<R>,
    kernel: &AddressSpace,
    tasks: &ProcessTable,
) -> Result<(), InvariantViolation> {
    if tasks.state(Pid::RESERVED) != Some(ProcState::Free) {
        return Err(InvariantViolation::ReservedSlotInUse);
    }

    let sharers = tasks
        .iter()
        .filter(|p| matches!(p.space(), Some(SpaceRef::Kernel)))
        .count();
    // Fits: NPROC is statically bounded well below u8::MAX.
    let kernel_refcount = 1 + sharers as u8;
    check_dir(memory, kernel.dir(), DirKind::Kernel, Owner::Kernel, kernel_refcount)?;

    for process in tasks.iter().filter(|p| p.state() != ProcState::Free) {
        if let Some(SpaceRef::Private(space)) = process.space() {
            let pid = process.pid();
            check_dir(memory, space.dir(), DirKind::Process(pid), Owner::Process(pid), 1)?;
        }
    }

    for (page, info) in memory.ledger.iter() {
        if (info.refcount == 0) != (info.owner == Owner::Free) {
            return Err(InvariantViolation::FreeMismatch { page });
        }
        if let Owner::Process(pid) = info.owner {
            let live = pid.as_index() < NPROC && tasks.state(pid) != Some(ProcState::Free);
            if !live {
                return Err(InvariantViolation::Orphan { page, pid });
            }
        }
    }
    Ok(())
}

fn check_dir<R: PhysMem>(
    memory: &Memory<R>,
    dir: PageDir,
    kind: DirKind,
    owner: Owner,
    root_refcount: u8,
) -> Result<(), InvariantViolation> {
    check_page(memory, kind, dir.root(), owner, root_refcount)?;
    let mut result = Ok(());
    dir.for_each_table(&memory.ram, |_, table| {
        if result.is_ok() {
            result = check_page(memory, kind, table, owner, 1);
        }
    });
    result
}

fn check_page<R: PhysMem>(
    memory: &Memory<R>,
    dir: DirKind,
    page: PhysAddr,
    expected_owner: Owner,
    expected_refcount: u8,
) -> Result<(), InvariantViolation> {
    let info = memory
        .ledger
        .info(page)
        .map_err(|_| InvariantViolation::BadPage { dir, page })?;
    if info.owner != expected_owner {
        return Err(InvariantViolation::Owner {
            dir,
            page,
            expected: expected_owner,
            found: info.owner,
        });
    }
    if info.refcount != expected_refcount {
        return Err(InvariantViolation::Refcount {
            dir,
            page,
            expected: expected_refcount,
            found: info.refcount,
        });
    }
    Ok(())
}
