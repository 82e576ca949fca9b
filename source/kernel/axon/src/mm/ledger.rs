// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Physical page ledger (ownership + reference counts)
//! OWNERS: @kernel-mm-team
//! PUBLIC API: PageLedger (new/allocate/find_free/share/release), Owner, PageInfo, AllocError
//! DEPENDS_ON: config::MemoryLayout, config::NPAGES
//! INVARIANTS: refcount == 0 <=> owner == Free; addresses are validated before indexing
//!
//! One entry per physical page, indexed by page number. Every physical address entering the
//! ledger goes through [`PageLedger::page_index`], which rejects misaligned and out-of-range
//! addresses instead of trusting the caller.

use core::fmt;

use crate::config::{MemoryLayout, MEMSIZE_PHYSICAL, NPAGES};
use crate::mm::PAGE_SIZE;
use crate::types::{PhysAddr, Pid};

/// Who a physical page belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Owner {
    Free,
    /// Hardware-reserved memory (page 0, the I/O hole and the console).
    Reserved,
    Kernel,
    Process(Pid),
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Free => f.write_str("free"),
            Self::Reserved => f.write_str("reserved"),
            Self::Kernel => f.write_str("kernel"),
            Self::Process(pid) => write!(f, "pid {pid}"),
        }
    }
}

/// Ledger entry for a single physical page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageInfo {
    pub owner: Owner,
    pub refcount: u8,
}

impl PageInfo {
    const FREE: Self = Self { owner: Owner::Free, refcount: 0 };

    pub const fn is_free(&self) -> bool {
        self.refcount == 0
    }
}

/// Errors reported by ledger operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocError {
    /// Address is not page aligned.
    Unaligned,
    /// Address lies beyond physical memory.
    OutOfRange,
    /// Page already has a non-zero reference count.
    InUse,
    /// Page is free where an owned page was required.
    NotAllocated,
    /// Pages cannot be allocated on behalf of `Owner::Free`.
    InvalidOwner,
    /// Reference count would exceed `u8::MAX`.
    RefcountOverflow,
    /// No free physical page remains.
    OutOfMemory,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::Unaligned => "physical address not page aligned",
            Self::OutOfRange => "physical address beyond physical memory",
            Self::InUse => "physical page already allocated",
            Self::NotAllocated => "physical page not allocated",
            Self::InvalidOwner => "cannot allocate a page to the free owner",
            Self::RefcountOverflow => "physical page reference count overflow",
            Self::OutOfMemory => "out of physical memory",
        };
        f.write_str(msg)
    }
}

/// Per-page ownership table covering all of physical memory.
pub struct PageLedger {
    pages: [PageInfo; NPAGES],
}

impl PageLedger {
    /// Partitions physical memory into reserved, kernel and free pages.
    pub fn new(layout: &MemoryLayout) -> Self {
        let mut pages = [PageInfo::FREE; NPAGES];
        for (pn, info) in pages.iter_mut().enumerate() {
            let pa = PhysAddr::new(pn * PAGE_SIZE);
            let owner = if layout.is_reserved(pa) {
                Owner::Reserved
            } else if layout.is_kernel(pa) {
                Owner::Kernel
            } else {
                Owner::Free
            };
            *info = PageInfo { owner, refcount: u8::from(owner != Owner::Free) };
        }
        Self { pages }
    }

    /// Converts `pa` into a page number, rejecting misaligned or out-of-range addresses.
    pub fn page_index(pa: PhysAddr) -> Result<usize, AllocError> {
        if !pa.is_page_aligned() {
            return Err(AllocError::Unaligned);
        }
        if pa.raw() >= MEMSIZE_PHYSICAL {
            return Err(AllocError::OutOfRange);
        }
        Ok(pa.raw() / PAGE_SIZE)
    }

    /// Returns the ledger entry for `pa`.
    pub fn info(&self, pa: PhysAddr) -> Result<PageInfo, AllocError> {
        Ok(self.pages[Self::page_index(pa)?])
    }

    /// Records `owner` as the sole user of the free page at `pa`.
    pub fn allocate(&mut self, pa: PhysAddr, owner: Owner) -> Result<(), AllocError> {
        let index = Self::page_index(pa)?;
        if owner == Owner::Free {
            return Err(AllocError::InvalidOwner);
        }
        let info = &mut self.pages[index];
        if info.refcount != 0 {
            return Err(AllocError::InUse);
        }
        *info = PageInfo { owner, refcount: 1 };
        Ok(())
    }

    /// Address of the lowest free page, if any.
    pub fn find_free(&self) -> Option<PhysAddr> {
        self.pages
            .iter()
            .position(|info| info.owner == Owner::Free)
            .map(|pn| PhysAddr::new(pn * PAGE_SIZE))
    }

    /// Adds one reference to an already-owned page and returns the new count.
    pub fn share(&mut self, pa: PhysAddr) -> Result<u8, AllocError> {
        let info = &mut self.pages[Self::page_index(pa)?];
        if info.refcount == 0 {
            return Err(AllocError::NotAllocated);
        }
        info.refcount = info.refcount.checked_add(1).ok_or(AllocError::RefcountOverflow)?;
        Ok(info.refcount)
    }

    /// Drops one reference; the page returns to `Owner::Free` when the count reaches zero.
    pub fn release(&mut self, pa: PhysAddr) -> Result<u8, AllocError> {
        let info = &mut self.pages[Self::page_index(pa)?];
        if info.refcount == 0 {
            return Err(AllocError::NotAllocated);
        }
        info.refcount -= 1;
        if info.refcount == 0 {
            info.owner = Owner::Free;
        }
        Ok(info.refcount)
    }

    /// Iterates over `(address, entry)` for every physical page.
    pub fn iter(&self) -> impl Iterator<Item = (PhysAddr, PageInfo)> + '_ {
        self.pages.iter().enumerate().map(|(pn, info)| (PhysAddr::new(pn * PAGE_SIZE), *info))
    }

    /// Number of free pages.
    pub fn free_pages(&self) -> usize {
        self.pages.iter().filter(|info| info.is_free()).count()
    }

    /// Number of pages whose owner is exactly `owner`.
    pub fn pages_owned_by(&self, owner: Owner) -> usize {
        self.pages.iter().filter(|info| info.owner == owner && info.refcount > 0).count()
    }
}
