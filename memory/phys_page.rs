// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

use crate::{InvalidPhysAddr, PhysAddr};
use core::fmt;
use core::ops::{Add, AddAssign, Sub, SubAssign};

/// The size in bytes of a single physical page.
///
/// This core manages physical memory exclusively in units
/// of 4 KiB pages; larger contiguous spans are expressed as
/// a run of pages at a given buddy level, not as a distinct
/// page size.
///
pub const PAGE_SIZE: usize = 0x1000;

/// The sentinel physical page number used throughout the
/// bootstrap and buddy allocators to signal the absence of a
/// page, in place of an `Option<PhysPage>` on the hottest
/// allocation paths.
///
pub const INVALID_PAGE: usize = usize::MAX;

/// A single 4 KiB-aligned frame of physical memory.
///
#[derive(Clone, Copy, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct PhysPage(PhysAddr);

impl PhysPage {
    /// Returns the sentinel page used to signal allocation
    /// failure on the single-page allocation paths.
    ///
    #[inline]
    pub const fn invalid() -> Self {
        // SAFETY: never dereferenced; used only as a sentinel.
        PhysPage(unsafe { PhysAddr::new_unchecked(INVALID_PAGE) })
    }

    /// Returns whether this is the [`PhysPage::invalid`]
    /// sentinel.
    ///
    #[inline]
    pub const fn is_invalid(&self) -> bool {
        self.0.as_usize() == INVALID_PAGE
    }

    /// Returns the page that starts at the given physical
    /// address.
    ///
    /// Returns an error if the address is not page-aligned.
    ///
    #[inline]
    pub const fn from_start_address(addr: PhysAddr) -> Result<Self, InvalidPhysAddr> {
        if addr.is_aligned(PAGE_SIZE) {
            Ok(PhysPage(addr))
        } else {
            Err(InvalidPhysAddr(addr.as_usize()))
        }
    }

    /// Returns the page that starts at the given physical
    /// address, without checking alignment.
    ///
    /// # Safety
    ///
    /// The address must be page-aligned.
    ///
    #[inline]
    pub const unsafe fn from_start_address_unchecked(addr: PhysAddr) -> Self {
        PhysPage(addr)
    }

    /// Returns the page containing the given address.
    ///
    #[inline]
    pub const fn containing_address(addr: PhysAddr) -> Self {
        PhysPage(addr.align_down(PAGE_SIZE))
    }

    /// Returns the first address in the page.
    ///
    #[inline]
    pub const fn start_address(&self) -> PhysAddr {
        self.0
    }

    /// Returns the page `n` pages after this one.
    ///
    #[inline]
    #[track_caller]
    pub fn offset(&self, n: usize) -> Self {
        PhysPage(self.0 + n * PAGE_SIZE)
    }
}

impl fmt::Debug for PhysPage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("PhysPage")
            .field(&format_args!("{:p}", self.0))
            .finish()
    }
}

impl Add<usize> for PhysPage {
    type Output = Self;

    #[inline]
    #[track_caller]
    fn add(self, rhs: usize) -> Self::Output {
        self.offset(rhs)
    }
}

impl AddAssign<usize> for PhysPage {
    #[inline]
    #[track_caller]
    fn add_assign(&mut self, rhs: usize) {
        *self = *self + rhs;
    }
}

impl Sub<usize> for PhysPage {
    type Output = Self;

    #[inline]
    #[track_caller]
    fn sub(self, rhs: usize) -> Self::Output {
        PhysPage(self.0 - rhs * PAGE_SIZE)
    }
}

impl SubAssign<usize> for PhysPage {
    #[inline]
    #[track_caller]
    fn sub_assign(&mut self, rhs: usize) {
        *self = *self - rhs;
    }
}

impl Sub<PhysPage> for PhysPage {
    type Output = usize;

    #[inline]
    #[track_caller]
    fn sub(self, rhs: PhysPage) -> Self::Output {
        (self.0 - rhs.0) / PAGE_SIZE
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_phys_page() {
        let addr = PhysAddr::new(0x1234_5678_9000);
        let page = PhysPage::from_start_address(addr).unwrap();
        assert_eq!(page.start_address(), addr);
        assert_eq!(page.offset(1).start_address(), addr + PAGE_SIZE);
        assert_eq!(page + 1 - page, 1);

        assert!(PhysPage::from_start_address(PhysAddr::new(0x1001)).is_err());
    }

    #[test]
    fn test_invalid_page() {
        assert!(PhysPage::invalid().is_invalid());
        let addr = PhysAddr::new(0x2000);
        let page = PhysPage::from_start_address(addr).unwrap();
        assert!(!page.is_invalid());
    }
}
