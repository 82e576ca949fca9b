// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-process address spaces built on the physical page ledger
//! OWNERS: @kernel-mm-team
//! PUBLIC API: AddressSpace (kernel/new_from_kernel_template/map/map_fresh_page/
//!             duplicate_for_fork/release/read_user_cstr), AddressSpaceError
//! DEPENDS_ON: mm::ledger, mm::page_table, hal::PhysMem
//! INVARIANTS: Root and table pages are owned by the space's owner with refcount 1;
//!             kernel-range entries are copied, never refcounted; user pages are refcounted
//!             once per space mapping them

use core::fmt;

use super::page_table::{encode, Mapping, PageDir};
use super::{AllocError, MapError, Memory, Owner, PageFlags, PAGE_SIZE, PT_ENTRIES};
use crate::config::{MemoryLayout, MEMSIZE_PHYSICAL, MEMSIZE_VIRTUAL, PROC_START_ADDR};
use crate::hal::PhysMem;
use crate::types::{PhysAddr, Pid, VirtAddr};

/// Leaf entries of the first page table that belong to the shared kernel range.
const KERNEL_RANGE_ENTRIES: usize = PROC_START_ADDR / PAGE_SIZE;

/// Errors reported while managing address spaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressSpaceError {
    /// The ledger refused an allocation or reference update.
    Alloc(AllocError),
    /// Underlying map operation failed.
    Mapping(MapError),
    /// A user pointer does not reference user-accessible memory.
    BadUserAddress(VirtAddr),
}

impl From<AllocError> for AddressSpaceError {
    fn from(value: AllocError) -> Self {
        Self::Alloc(value)
    }
}

impl From<MapError> for AddressSpaceError {
    fn from(value: MapError) -> Self {
        Self::Mapping(value)
    }
}

impl fmt::Display for AddressSpaceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Alloc(err) => write!(f, "page allocation failed: {err}"),
            Self::Mapping(err) => write!(f, "mapping failed: {err}"),
            Self::BadUserAddress(va) => write!(f, "bad user address {va}"),
        }
    }
}

/// A page directory together with the owner charged for its structural pages.
#[derive(Debug, PartialEq, Eq)]
pub struct AddressSpace {
    dir: PageDir,
    owner: Owner,
}

impl AddressSpace {
    /// Builds the kernel's own directory: an identity map of physical memory.
    ///
    /// Page 0 stays unmapped so null dereferences fault. Everything else is kernel-only
    /// except the console, which user code may write.
    pub fn kernel<R: PhysMem>(
        memory: &mut Memory<R>,
        layout: &MemoryLayout,
    ) -> Result<Self, AddressSpaceError> {
        let root = memory.alloc_zeroed(Owner::Kernel)?;
        let mut space = Self { dir: PageDir::at(root), owner: Owner::Kernel };
        for pa in (PAGE_SIZE..MEMSIZE_PHYSICAL).step_by(PAGE_SIZE) {
            let pa = PhysAddr::new(pa);
            let va = VirtAddr::new(pa.raw());
            space.map(memory, va, pa, PAGE_SIZE, layout.kernel_mapping_flags(pa))?;
        }
        Ok(space)
    }

    /// Creates a fresh space for `pid` that shares the kernel range of `kernel`.
    ///
    /// Allocates the root and the first page table (both owned by `pid`), copies the
    /// kernel's leaf entries below `PROC_START_ADDR` and leaves the rest of the table empty.
    pub fn new_from_kernel_template<R: PhysMem>(
        memory: &mut Memory<R>,
        kernel: &AddressSpace,
        pid: Pid,
    ) -> Result<Self, AddressSpaceError> {
        let owner = Owner::Process(pid);
        let root = memory.alloc_zeroed(owner)?;
        let table = match memory.alloc_zeroed(owner) {
            Ok(table) => table,
            Err(err) => {
                memory.ledger.release(root)?;
                return Err(err.into());
            }
        };

        let dir = PageDir::at(root);
        dir.set_dir_entry(&mut memory.ram, 0, encode(table, PageFlags::USER_RW));
        for index in 0..KERNEL_RANGE_ENTRIES {
            let va = VirtAddr::new(index * PAGE_SIZE);
            let entry = kernel.dir.entry(&memory.ram, va).unwrap_or(0);
            dir.set_entry(&mut memory.ram, va, entry)?;
        }
        Ok(Self { dir, owner })
    }

    /// Physical address of the directory page.
    pub fn root(&self) -> PhysAddr {
        self.dir.root()
    }

    pub fn dir(&self) -> PageDir {
        self.dir
    }

    pub fn owner(&self) -> Owner {
        self.owner
    }

    /// Present mapping for the page containing `va`.
    pub fn lookup<R: PhysMem + ?Sized>(&self, ram: &R, va: VirtAddr) -> Option<Mapping> {
        self.dir.lookup(ram, va)
    }

    /// Maps `[va, va + len)` to `[pa, pa + len)`, allocating missing page tables.
    ///
    /// A page already mapped may only be remapped to the same physical page (a permission
    /// change); anything else fails with [`MapError::Occupied`] before any change. Page
    /// tables created here are charged to the space's owner and stay installed even if the
    /// final mapping step fails; [`AddressSpace::release`] reclaims them.
    pub fn map<R: PhysMem>(
        &mut self,
        memory: &mut Memory<R>,
        va: VirtAddr,
        pa: PhysAddr,
        len: usize,
        flags: PageFlags,
    ) -> Result<(), AddressSpaceError> {
        if !va.is_page_aligned() || len % PAGE_SIZE != 0 {
            return Err(MapError::Unaligned.into());
        }
        let end = va.checked_add(len).ok_or(MapError::OutOfRange)?;
        for offset in (0..len).step_by(PAGE_SIZE) {
            let page = VirtAddr::new(va.raw() + offset);
            if let Some(existing) = self.lookup(&memory.ram, page) {
                if pa.checked_add(offset) != Some(existing.pa) {
                    return Err(MapError::Occupied { va: page.raw() }.into());
                }
            }
        }
        let mut cursor = va.raw();
        while cursor < end.raw() {
            let slot = super::page_table::dir_index(VirtAddr::new(cursor));
            if self.dir.table(&memory.ram, slot).is_none() {
                let table = memory.alloc_zeroed(self.owner)?;
                self.dir.set_dir_entry(&mut memory.ram, slot, encode(table, PageFlags::USER_RW));
            }
            // Next directory slot boundary.
            cursor = (cursor | (PT_ENTRIES * PAGE_SIZE - 1)).saturating_add(1);
        }
        self.dir.map(&mut memory.ram, va, pa, len, flags)?;
        Ok(())
    }

    /// Allocates a zeroed page owned by this space's owner and maps it at `va`.
    pub fn map_fresh_page<R: PhysMem>(
        &mut self,
        memory: &mut Memory<R>,
        va: VirtAddr,
        flags: PageFlags,
    ) -> Result<PhysAddr, AddressSpaceError> {
        let pa = memory.alloc_zeroed(self.owner)?;
        if let Err(err) = self.map(memory, va, pa, PAGE_SIZE, flags) {
            memory.ledger.release(pa)?;
            return Err(err);
        }
        Ok(pa)
    }

    /// Builds `child`'s copy of this space.
    ///
    /// Over the process range, user-writable pages are copied into fresh pages owned by
    /// `child`; user read-only pages are mapped read-only to the same physical page, whose
    /// refcount goes up by one. Other mappings are not duplicated. On failure every page
    /// taken for the child is handed back and the ledger is as it was.
    pub fn duplicate_for_fork<R: PhysMem>(
        &self,
        memory: &mut Memory<R>,
        kernel: &AddressSpace,
        child: Pid,
    ) -> Result<Self, AddressSpaceError> {
        let mut space = Self::new_from_kernel_template(memory, kernel, child)?;
        if let Err(err) = self.copy_user_range(memory, &mut space) {
            space.release(memory)?;
            return Err(err);
        }
        Ok(space)
    }

    fn copy_user_range<R: PhysMem>(
        &self,
        memory: &mut Memory<R>,
        child: &mut AddressSpace,
    ) -> Result<(), AddressSpaceError> {
        for va in (PROC_START_ADDR..MEMSIZE_VIRTUAL).step_by(PAGE_SIZE) {
            let va = VirtAddr::new(va);
            let Some(Mapping { pa, flags }) = self.lookup(&memory.ram, va) else {
                continue;
            };
            if flags.is_user_writable() {
                let copy = memory.ledger.find_free().ok_or(AllocError::OutOfMemory)?;
                memory.ledger.allocate(copy, child.owner)?;
                memory.ram.copy_page(pa, copy);
                if let Err(err) = child.map(memory, va, copy, PAGE_SIZE, PageFlags::USER_RW) {
                    memory.ledger.release(copy)?;
                    return Err(err);
                }
            } else if flags.is_user_read_only() {
                memory.ledger.share(pa)?;
                if let Err(err) = child.map(memory, va, pa, PAGE_SIZE, PageFlags::USER_RO) {
                    memory.ledger.release(pa)?;
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Drops this space's reference to every page it holds.
    ///
    /// Releases user pages in the process range, then page tables, then the root. The
    /// kernel range is skipped since its entries are copies. Only used to unwind a
    /// partially built process; processes never exit.
    pub fn release<R: PhysMem>(self, memory: &mut Memory<R>) -> Result<(), AddressSpaceError> {
        for va in (PROC_START_ADDR..MEMSIZE_VIRTUAL).step_by(PAGE_SIZE) {
            if let Some(mapping) = self.lookup(&memory.ram, VirtAddr::new(va)) {
                memory.ledger.release(mapping.pa)?;
            }
        }
        let mut tables = [PhysAddr::new(0); PT_ENTRIES];
        let mut count = 0;
        self.dir.for_each_table(&memory.ram, |_, table| {
            tables[count] = table;
            count += 1;
        });
        for &table in &tables[..count] {
            memory.ledger.release(table)?;
        }
        memory.ledger.release(self.dir.root())?;
        Ok(())
    }

    /// Copies a NUL-terminated user string starting at `va` into `buf`.
    ///
    /// Returns the number of bytes copied, excluding the terminator. Stops early when `buf`
    /// is full. Every byte read must lie in a present, user-accessible page.
    pub fn read_user_cstr<R: PhysMem + ?Sized>(
        &self,
        ram: &R,
        va: VirtAddr,
        buf: &mut [u8],
    ) -> Result<usize, AddressSpaceError> {
        let mut len = 0;
        while len < buf.len() {
            let at = va.checked_add(len).ok_or(AddressSpaceError::BadUserAddress(va))?;
            let mapping = self
                .lookup(ram, at)
                .filter(|m| m.flags.contains(PageFlags::USER))
                .ok_or(AddressSpaceError::BadUserAddress(at))?;
            let mut byte = [0u8];
            ram.read(PhysAddr::new(mapping.pa.raw() + at.page_offset()), &mut byte);
            if byte[0] == 0 {
                break;
            }
            buf[len] = byte[0];
            len += 1;
        }
        Ok(len)
    }
}
