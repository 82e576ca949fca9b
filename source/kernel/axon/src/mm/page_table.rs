// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Two-level x86 page-table codec operating on physical memory.
//!
//! A directory is a physical page of 1024 little-endian 32-bit entries; each present entry
//! points at a page table of 1024 leaf entries. This module only encodes and decodes
//! entries. Which pages back a mapping, and who owns them, is decided by
//! [`super::address_space`].

use super::{MapError, PageFlags, PAGE_SIZE, PT_ENTRIES};
use crate::hal::PhysMem;
use crate::types::{PhysAddr, VirtAddr};

const ENTRY_BYTES: usize = core::mem::size_of::<u32>();
const ADDR_MASK: u32 = !(PAGE_SIZE as u32 - 1);
/// Exclusive upper bound of the 32-bit address space.
const ADDRESS_LIMIT: u64 = 1 << 32;

/// Directory slot covering `va`.
#[inline]
pub const fn dir_index(va: VirtAddr) -> usize {
    (va.raw() >> 22) & (PT_ENTRIES - 1)
}

/// Page-table slot covering `va`.
#[inline]
pub const fn table_index(va: VirtAddr) -> usize {
    (va.raw() >> 12) & (PT_ENTRIES - 1)
}

/// Builds an entry referencing `pa`; non-present flags encode as an empty entry.
#[inline]
pub fn encode(pa: PhysAddr, flags: PageFlags) -> u32 {
    if flags.contains(PageFlags::PRESENT) {
        (pa.raw() as u32 & ADDR_MASK) | flags.bits()
    } else {
        0
    }
}

/// Decodes a present entry.
#[inline]
pub fn decode(entry: u32) -> Option<Mapping> {
    let flags = PageFlags::from_bits_truncate(entry);
    flags.contains(PageFlags::PRESENT).then(|| Mapping {
        pa: PhysAddr::new((entry & ADDR_MASK) as usize),
        flags,
    })
}

/// A present leaf mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mapping {
    pub pa: PhysAddr,
    pub flags: PageFlags,
}

/// Handle to a page directory stored in physical memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageDir {
    root: PhysAddr,
}

impl PageDir {
    /// Wraps the directory page at `root`.
    pub const fn at(root: PhysAddr) -> Self {
        Self { root }
    }

    /// Physical address of the directory page (the value loaded into `%cr3`).
    pub const fn root(self) -> PhysAddr {
        self.root
    }

    fn slot(page: PhysAddr, index: usize) -> PhysAddr {
        PhysAddr::new(page.raw() + index * ENTRY_BYTES)
    }

    /// Raw directory entry `index`.
    pub fn dir_entry<R: PhysMem + ?Sized>(self, ram: &R, index: usize) -> u32 {
        ram.read_u32(Self::slot(self.root, index))
    }

    /// Overwrites directory entry `index`.
    pub fn set_dir_entry<R: PhysMem + ?Sized>(self, ram: &mut R, index: usize, entry: u32) {
        ram.write_u32(Self::slot(self.root, index), entry);
    }

    /// Page table installed at directory slot `index`, if present.
    pub fn table<R: PhysMem + ?Sized>(self, ram: &R, index: usize) -> Option<PhysAddr> {
        decode(self.dir_entry(ram, index)).map(|m| m.pa)
    }

    /// Calls `f(slot, table)` for every present directory entry.
    pub fn for_each_table<R: PhysMem + ?Sized>(self, ram: &R, mut f: impl FnMut(usize, PhysAddr)) {
        for index in 0..PT_ENTRIES {
            if let Some(table) = self.table(ram, index) {
                f(index, table);
            }
        }
    }

    /// Raw leaf entry for `va`; `None` when no page table covers it.
    pub fn entry<R: PhysMem + ?Sized>(self, ram: &R, va: VirtAddr) -> Option<u32> {
        let table = self.table(ram, dir_index(va))?;
        Some(ram.read_u32(Self::slot(table, table_index(va))))
    }

    /// Overwrites the leaf entry for `va`.
    pub fn set_entry<R: PhysMem + ?Sized>(
        self,
        ram: &mut R,
        va: VirtAddr,
        entry: u32,
    ) -> Result<(), MapError> {
        let dir_index = dir_index(va);
        let table = self.table(ram, dir_index).ok_or(MapError::MissingTable { dir_index })?;
        ram.write_u32(Self::slot(table, table_index(va)), entry);
        Ok(())
    }

    /// Present mapping for the page containing `va`.
    pub fn lookup<R: PhysMem + ?Sized>(self, ram: &R, va: VirtAddr) -> Option<Mapping> {
        self.entry(ram, va).and_then(decode)
    }

    /// Maps `[va, va + len)` onto `[pa, pa + len)` with `flags`.
    ///
    /// Every page table the range touches must already be installed; nothing is written
    /// unless the whole range can be mapped. Flags without `PRESENT` unmap the range.
    pub fn map<R: PhysMem + ?Sized>(
        self,
        ram: &mut R,
        va: VirtAddr,
        pa: PhysAddr,
        len: usize,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        if !va.is_page_aligned() || !pa.is_page_aligned() || len % PAGE_SIZE != 0 {
            return Err(MapError::Unaligned);
        }
        let va_end = va.checked_add(len).ok_or(MapError::OutOfRange)?;
        let pa_end = pa.checked_add(len).ok_or(MapError::OutOfRange)?;
        if va_end.raw() as u64 > ADDRESS_LIMIT || pa_end.raw() as u64 > ADDRESS_LIMIT {
            return Err(MapError::OutOfRange);
        }

        let mut offset = 0;
        while offset < len {
            let dir_index = dir_index(VirtAddr::new(va.raw() + offset));
            if self.table(ram, dir_index).is_none() {
                return Err(MapError::MissingTable { dir_index });
            }
            offset += PAGE_SIZE;
        }

        let mut offset = 0;
        while offset < len {
            let page_va = VirtAddr::new(va.raw() + offset);
            let page_pa = PhysAddr::new(pa.raw() + offset);
            self.set_entry(ram, page_va, encode(page_pa, flags))?;
            offset += PAGE_SIZE;
        }
        Ok(())
    }
}
