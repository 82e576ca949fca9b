// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Program images and loading them into process address spaces
//! OWNERS: @kernel-team
//! PUBLIC API: Segment, ProgramImage, ProgramLoader, ImageTable, load, LoadError
//! DEPENDS_ON: mm::AddressSpace, mm::Memory
//! INVARIANTS: Segments lie inside the process range; read-only segments map USER_RO,
//!             writable ones USER_RW; every page backing a segment is owned by the process
//!
//! Image decoding (ELF headers and the like) happens before the kernel sees a program; this
//! module only places already-split segments into memory.

use core::fmt;

use crate::config::{PROC_STACK_ADDR, PROC_START_ADDR};
use crate::hal::PhysMem;
use crate::mm::{AddressSpace, AddressSpaceError, Memory, PageFlags, PAGE_SIZE};
use crate::types::{PhysAddr, VirtAddr};

/// One loadable segment. Bytes past `data.len()` up to `mem_size` are zero.
#[derive(Clone, Copy, Debug)]
pub struct Segment {
    pub va: usize,
    pub data: &'static [u8],
    pub mem_size: usize,
    pub writable: bool,
}

/// A program as the boot loader hands it over.
#[derive(Clone, Copy, Debug)]
pub struct ProgramImage {
    pub name: &'static str,
    pub entry: usize,
    pub segments: &'static [Segment],
}

/// Source of program images, numbered from 0.
pub trait ProgramLoader {
    fn image(&self, program: usize) -> Option<&ProgramImage>;
}

/// Programs linked into the kernel image.
#[derive(Clone, Copy, Debug)]
pub struct ImageTable {
    images: &'static [ProgramImage],
}

impl ImageTable {
    pub const fn new(images: &'static [ProgramImage]) -> Self {
        Self { images }
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

impl ProgramLoader for ImageTable {
    fn image(&self, program: usize) -> Option<&ProgramImage> {
        self.images.get(program)
    }
}

/// Errors reported while loading a program.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadError {
    /// No image with this number exists.
    UnknownProgram(usize),
    /// Segment is malformed, falls outside the process range or reaches the stack page.
    BadSegment { va: usize },
    /// Entry point is not inside a loaded segment.
    BadEntry { entry: usize },
    /// Backing pages could not be allocated or mapped.
    Space(AddressSpaceError),
}

impl From<AddressSpaceError> for LoadError {
    fn from(value: AddressSpaceError) -> Self {
        Self::Space(value)
    }
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownProgram(n) => write!(f, "unknown program {n}"),
            Self::BadSegment { va } => write!(f, "bad segment at {va:#x}"),
            Self::BadEntry { entry } => write!(f, "entry point {entry:#x} outside program"),
            Self::Space(err) => write!(f, "{err}"),
        }
    }
}

fn validate(image: &ProgramImage) -> Result<(), LoadError> {
    for seg in image.segments {
        let end = seg.va.checked_add(seg.mem_size);
        let in_range =
            matches!(end, Some(end) if seg.va >= PROC_START_ADDR && end <= PROC_STACK_ADDR);
        if !in_range || seg.data.len() > seg.mem_size {
            return Err(LoadError::BadSegment { va: seg.va });
        }
    }
    let entry_loaded = image
        .segments
        .iter()
        .any(|seg| image.entry >= seg.va && image.entry < seg.va + seg.mem_size);
    if !entry_loaded {
        return Err(LoadError::BadEntry { entry: image.entry });
    }
    Ok(())
}

/// Maps and fills every segment of `image` in `space`; returns the entry point.
///
/// Pages shared by two segments are allocated once and become writable if either segment
/// is. Pages allocated before a failure stay mapped in `space`; the caller releases the
/// whole space.
pub fn load<R: PhysMem>(
    memory: &mut Memory<R>,
    space: &mut AddressSpace,
    image: &ProgramImage,
) -> Result<VirtAddr, LoadError> {
    validate(image)?;
    for seg in image.segments {
        let flags = if seg.writable { PageFlags::USER_RW } else { PageFlags::USER_RO };
        let first = VirtAddr::new(seg.va).page_base().raw();
        for page in (first..seg.va + seg.mem_size).step_by(PAGE_SIZE) {
            let va = VirtAddr::new(page);
            let pa = match space.lookup(&memory.ram, va) {
                Some(existing) => {
                    if seg.writable && !existing.flags.contains(PageFlags::WRITABLE) {
                        space.map(memory, va, existing.pa, PAGE_SIZE, PageFlags::USER_RW)?;
                    }
                    existing.pa
                }
                None => space.map_fresh_page(memory, va, flags)?,
            };
            copy_into_page(&mut memory.ram, pa, page, seg);
        }
    }
    log_debug!(target: "loader", "loaded {} entry={:#x}", image.name, image.entry);
    Ok(VirtAddr::new(image.entry))
}

/// Writes the part of `seg.data` that overlaps the page at `page_va`.
fn copy_into_page<R: PhysMem>(ram: &mut R, pa: PhysAddr, page_va: usize, seg: &Segment) {
    let data_end = seg.va + seg.data.len();
    let start = seg.va.max(page_va);
    let end = data_end.min(page_va + PAGE_SIZE);
    if start < end {
        let bytes = &seg.data[start - seg.va..end - seg.va];
        ram.write(PhysAddr::new(pa.raw() + (start - page_va)), bytes);
    }
}
