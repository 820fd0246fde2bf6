// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Parses the tagged data the bootloader hands the kernel at
//! entry, describing the usable physical memory map.

use crate::PhysAddr;
use core::slice;

/// The type tag of a loader data entry.
///
/// The concrete numeric values are fixed by the boot protocol
/// and must not be reordered.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u64)]
pub enum LoaderDataType {
    /// `value` carries the total number of entries in the
    /// loader data array, including this one.
    ///
    EntryCount = 0,

    /// `value` is the physical address of a [`MemoryMapHeader`].
    ///
    MemoryMap = 1,

    /// Any other tag, not currently interpreted by this core.
    ///
    Unknown = u64::MAX,
}

impl From<u64> for LoaderDataType {
    fn from(tag: u64) -> Self {
        match tag {
            0 => LoaderDataType::EntryCount,
            1 => LoaderDataType::MemoryMap,
            _ => LoaderDataType::Unknown,
        }
    }
}

/// One `(type, value)` pair in the loader data array.
///
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct LoaderDataEntry {
    /// The raw tag identifying the kind of this entry.
    ///
    pub kind: u64,

    /// The tag-specific payload.
    ///
    pub value: u64,
}

/// The header of the physical memory map descriptor pointed to
/// by a [`LoaderDataType::MemoryMap`] entry.
///
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct MemoryMapHeader {
    /// Physical address of the `count`-long array of
    /// [`MemoryMapEntry`] records.
    ///
    pub entries: u64,

    /// The number of records in the array at `entries`.
    ///
    pub count: u64,

    /// The first physical address in the initial available
    /// region not already consumed by the loader.
    ///
    pub allocated_boundary: u64,
}

/// Describes the type of a single physical memory region.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum MemoryRegionKind {
    /// Free for the kernel to use once the loader's own
    /// allocations are accounted for.
    ///
    Usable = 0,

    /// In permanent use and never available to the allocator.
    ///
    Reserved = 1,

    /// Contains data from the loader that can be reclaimed
    /// once it has been consumed (for example, ACPI tables).
    ///
    Reclaimable = 2,
}

impl From<u32> for MemoryRegionKind {
    fn from(kind: u32) -> Self {
        match kind {
            0 => MemoryRegionKind::Usable,
            2 => MemoryRegionKind::Reclaimable,
            _ => MemoryRegionKind::Reserved,
        }
    }
}

/// One entry in the physical memory map.
///
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct MemoryMapEntry {
    /// The physical address at which the region begins.
    ///
    pub begin: u64,

    /// The size of the region in bytes.
    ///
    pub size: u64,

    /// The raw tag identifying the kind of this region.
    ///
    pub kind: u32,

    /// Region-specific flags.
    ///
    pub flags: u32,
}

impl MemoryMapEntry {
    /// Returns the start of the region this entry describes.
    ///
    pub fn start(&self) -> PhysAddr {
        PhysAddr::new(self.begin as usize)
    }

    /// Returns the address one past the end of the region this
    /// entry describes.
    ///
    pub fn end(&self) -> PhysAddr {
        PhysAddr::new((self.begin + self.size) as usize)
    }

    /// Returns the type of region this entry describes.
    ///
    pub fn kind(&self) -> MemoryRegionKind {
        self.kind.into()
    }

    /// Returns whether this region is both [`MemoryRegionKind::Usable`]
    /// and carries the low flag bit that marks it as actually
    /// available RAM, rather than merely free of a reservation.
    ///
    pub fn is_usable(&self) -> bool {
        self.kind() == MemoryRegionKind::Usable && self.flags & 0xf == 1
    }
}

/// A parsed physical memory map, as handed to the bootstrap
/// allocator.
///
#[derive(Clone, Copy, Debug)]
pub struct MemoryMap {
    entries: *const MemoryMapEntry,
    count: usize,

    /// The first physical address not already consumed by the
    /// loader within the initial available region.
    ///
    pub allocated_boundary: PhysAddr,
}

impl MemoryMap {
    /// Parses a [`MemoryMap`] from the header pointed to by a
    /// [`LoaderDataType::MemoryMap`] entry.
    ///
    /// # Safety
    ///
    /// `header` must point to a valid, fully initialised
    /// [`MemoryMapHeader`], whose `entries` field in turn points
    /// to `count` valid [`MemoryMapEntry`] records.
    ///
    pub unsafe fn from_header(header: *const MemoryMapHeader) -> Self {
        let header = &*header;
        MemoryMap {
            entries: header.entries as *const MemoryMapEntry,
            count: header.count as usize,
            allocated_boundary: PhysAddr::new(header.allocated_boundary as usize),
        }
    }

    /// Returns the memory map's entries as a slice.
    ///
    /// # Safety
    ///
    /// The memory described by the entries array must still be
    /// mapped and unchanged since [`MemoryMap::from_header`]
    /// was called.
    ///
    pub unsafe fn entries(&self) -> &[MemoryMapEntry] {
        slice::from_raw_parts(self.entries, self.count)
    }
}

/// Scans the loader data array for the [`MemoryMapHeader`]
/// pointer, returning `None` if no [`LoaderDataType::MemoryMap`]
/// entry is present.
///
/// # Safety
///
/// `entries` must point to a valid array of at least `count`
/// [`LoaderDataEntry`] records.
///
pub unsafe fn find_memory_map(
    entries: *const LoaderDataEntry,
    count: usize,
) -> Option<MemoryMap> {
    let entries = slice::from_raw_parts(entries, count);
    for entry in entries {
        if LoaderDataType::from(entry.kind) == LoaderDataType::MemoryMap {
            let header = entry.value as *const MemoryMapHeader;
            return Some(MemoryMap::from_header(header));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loader_data_type() {
        assert_eq!(LoaderDataType::from(0), LoaderDataType::EntryCount);
        assert_eq!(LoaderDataType::from(1), LoaderDataType::MemoryMap);
        assert_eq!(LoaderDataType::from(99), LoaderDataType::Unknown);
    }

    #[test]
    fn test_memory_region_kind() {
        assert_eq!(MemoryRegionKind::from(0), MemoryRegionKind::Usable);
        assert_eq!(MemoryRegionKind::from(2), MemoryRegionKind::Reclaimable);
        assert_eq!(MemoryRegionKind::from(1), MemoryRegionKind::Reserved);
        assert_eq!(MemoryRegionKind::from(77), MemoryRegionKind::Reserved);
    }

    #[test]
    fn test_memory_map_entry() {
        let entry = MemoryMapEntry {
            begin: 0x1000,
            size: 0x2000,
            kind: 0,
            flags: 0,
        };

        assert_eq!(entry.start(), PhysAddr::new(0x1000));
        assert_eq!(entry.end(), PhysAddr::new(0x3000));
        assert_eq!(entry.kind(), MemoryRegionKind::Usable);
        assert!(!entry.is_usable());

        let usable = MemoryMapEntry {
            begin: 0x1000,
            size: 0x2000,
            kind: 0,
            flags: 1,
        };
        assert!(usable.is_usable());
    }

    #[test]
    fn test_find_memory_map() {
        let record = MemoryMapEntry {
            begin: 0x10_0000,
            size: 0x10_0000,
            kind: 0,
            flags: 0,
        };
        let header = MemoryMapHeader {
            entries: &record as *const MemoryMapEntry as u64,
            count: 1,
            allocated_boundary: 0x20_0000,
        };
        let loader_entries = [
            LoaderDataEntry { kind: 0, value: 2 },
            LoaderDataEntry {
                kind: 1,
                value: &header as *const MemoryMapHeader as u64,
            },
        ];

        let map = unsafe { find_memory_map(loader_entries.as_ptr(), loader_entries.len()) };
        let map = map.expect("expected to find a memory map entry");
        assert_eq!(map.allocated_boundary, PhysAddr::new(0x20_0000));

        let entries = unsafe { map.entries() };
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].start(), PhysAddr::new(0x10_0000));
    }
}
