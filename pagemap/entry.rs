// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

use bitflags::bitflags;
use memory::{PhysAddr, PhysPage};

// The physical address bits of a page table entry, after
// masking out the flag bits and the reserved bit 51. The low
// 12 bits are always zero too, due to page alignment.
//
const ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

/// A single entry in a page table at any of the four levels.
///
#[derive(Clone)]
#[repr(transparent)]
pub struct PageTableEntry {
    entry: u64,
}

impl PageTableEntry {
    /// Returns a new, empty page table entry.
    ///
    #[inline]
    pub const fn new() -> Self {
        PageTableEntry { entry: 0 }
    }

    /// Clears this entry.
    ///
    #[inline]
    pub fn zero(&mut self) {
        self.entry = 0;
    }

    /// Returns the entry's flags.
    ///
    #[inline]
    pub const fn flags(&self) -> PageTableFlags {
        PageTableFlags::from_bits_truncate(self.entry)
    }

    /// Returns whether the `PRESENT` flag is set.
    ///
    #[inline]
    pub const fn is_present(&self) -> bool {
        self.flags().contains(PageTableFlags::PRESENT)
    }

    /// Returns the physical page this entry points at.
    ///
    #[inline]
    pub fn page(&self) -> PhysPage {
        let addr = PhysAddr::new((self.entry & ADDR_MASK) as usize);
        // SAFETY: ADDR_MASK keeps only the 4 KiB-aligned bits.
        unsafe { PhysPage::from_start_address_unchecked(addr) }
    }

    /// Points this entry at `page`, with the given flags.
    ///
    #[inline]
    pub fn set(&mut self, page: PhysPage, flags: PageTableFlags) {
        self.entry = flags.bits() | page.start_address().as_usize() as u64;
    }
}

impl Default for PageTableEntry {
    fn default() -> Self {
        Self::new()
    }
}

bitflags! {
    /// The flags in a page table entry.
    ///
    pub struct PageTableFlags: u64 {
        /// The referenced page table or physical page is
        /// mapped and usable.
        const PRESENT = 1 << 0;

        /// The referenced page table or physical page is
        /// writable.
        const WRITABLE = 1 << 1;

        /// Accesses from ring 3 are allowed.
        const USER_ACCESSIBLE = 1 << 2;

        /// The referenced memory cannot be fetched as
        /// instructions.
        const NO_EXECUTE = 1 << 63;
    }
}

impl PageTableFlags {
    /// The flags used for every entry this core installs: kernel-only,
    /// read-write mappings, since nothing in this core maps
    /// user-accessible or executable pages.
    ///
    pub const KERNEL_DATA: Self = Self::from_bits_truncate(Self::PRESENT.bits | Self::WRITABLE.bits);
}

#[cfg(test)]
mod tests {
    use super::*;
    use memory::PAGE_SIZE;

    #[test]
    fn test_entry_roundtrip() {
        let mut entry = PageTableEntry::new();
        assert!(!entry.is_present());

        let page =
            unsafe { PhysPage::from_start_address_unchecked(PhysAddr::new(0x1234_000)) };
        entry.set(page, PageTableFlags::KERNEL_DATA);
        assert!(entry.is_present());
        assert_eq!(entry.flags(), PageTableFlags::KERNEL_DATA);
        assert_eq!(entry.page().start_address().as_usize(), 0x1234_000);

        entry.zero();
        assert!(!entry.is_present());
        assert_eq!(entry.page().start_address().as_usize(), 0);
        let _ = PAGE_SIZE;
    }
}
