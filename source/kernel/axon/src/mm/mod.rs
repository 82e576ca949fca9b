// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Virtual memory primitives for two-level x86 paging.

pub mod address_space;
pub mod check;
pub mod ledger;
pub mod page_table;

use bitflags::bitflags;
use core::fmt;

use crate::hal::PhysMem;

pub use address_space::{AddressSpace, AddressSpaceError};
pub use check::{check_invariants, DirKind, InvariantViolation};
pub use ledger::{AllocError, Owner, PageInfo, PageLedger};
pub use page_table::{Mapping, PageDir};

/// Size of a page in bytes.
pub const PAGE_SIZE: usize = 4096;
/// Number of entries per page directory or page table.
pub const PT_ENTRIES: usize = 1024;

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    /// Permission bits stored in x86 page-directory and page-table entries.
    pub struct PageFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
    }
}

impl PageFlags {
    /// Kernel-only read/write mapping.
    pub const KERNEL_RW: Self = Self::PRESENT.union(Self::WRITABLE);
    /// User-accessible read-only mapping.
    pub const USER_RO: Self = Self::PRESENT.union(Self::USER);
    /// User-accessible read/write mapping.
    pub const USER_RW: Self = Self::PRESENT.union(Self::WRITABLE).union(Self::USER);

    /// Present, user-accessible and writable.
    pub const fn is_user_writable(self) -> bool {
        self.contains(Self::USER_RW)
    }

    /// Present and user-accessible but not writable.
    pub const fn is_user_read_only(self) -> bool {
        self.contains(Self::USER_RO) && !self.contains(Self::WRITABLE)
    }
}

/// Error returned by page-table operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// Virtual or physical address is not page aligned.
    Unaligned,
    /// Mapping would leave the 32-bit address space or physical memory.
    OutOfRange,
    /// No page table is installed for the directory slot covering the address.
    MissingTable { dir_index: usize },
    /// The virtual page already maps a different physical page.
    Occupied { va: usize },
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unaligned => f.write_str("address not page aligned"),
            Self::OutOfRange => f.write_str("mapping out of range"),
            Self::MissingTable { dir_index } => {
                write!(f, "no page table behind directory slot {dir_index}")
            }
            Self::Occupied { va } => write!(f, "{va:#x} already maps another page"),
        }
    }
}

/// Physical memory as the kernel sees it: the ownership ledger plus the backing RAM.
pub struct Memory<R: PhysMem> {
    pub ledger: PageLedger,
    pub ram: R,
}

impl<R: PhysMem> Memory<R> {
    pub fn new(ledger: PageLedger, ram: R) -> Self {
        Self { ledger, ram }
    }

    /// Claims the first free page for `owner` and zeroes it.
    pub fn alloc_zeroed(&mut self, owner: Owner) -> Result<crate::PhysAddr, AllocError> {
        let pa = self.ledger.find_free().ok_or(AllocError::OutOfMemory)?;
        self.ledger.allocate(pa, owner)?;
        self.ram.fill(pa, PAGE_SIZE, 0);
        Ok(pa)
    }
}
