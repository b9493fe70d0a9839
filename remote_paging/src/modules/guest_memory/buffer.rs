/*
 *  Copyright (C) 2025  Markus Elias Gerber
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  You should have received a copy of the GNU General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use log::trace;

use super::{check_page_len, GuestMemoryModule};
use crate::{
    error::{RPError, RPResult},
    util::bit_array::BitArray,
};

/// Guest memory kept in a plain heap buffer.
///
/// Residency is tracked explicitly, so installing into a present frame or
/// evicting an absent one is detected the same way the kernel would report it.
pub struct BufferGuestMemoryModule {
    data: Vec<u8>,
    resident: BitArray,
    materialized: BitArray,
    page_size: usize,
}

impl BufferGuestMemoryModule {
    /// Creates guest memory of `nr_pages` frames where no frame is resident
    /// and none was ever materialized.
    pub fn new(nr_pages: usize, page_size: usize) -> Self {
        Self {
            data: vec![0; nr_pages * page_size],
            resident: BitArray::new(nr_pages),
            materialized: BitArray::new(nr_pages),
            page_size,
        }
    }

    /// Like [`Self::new`] but every frame is resident and materialized
    pub fn new_resident(nr_pages: usize, page_size: usize) -> Self {
        let mut res = Self::new(nr_pages, page_size);
        for pfn in 0..nr_pages {
            res.resident.set(true, pfn);
            res.materialized.set(true, pfn);
        }
        res
    }

    fn frame(&self, addr: u64) -> RPResult<usize> {
        let pfn = (addr / self.page_size as u64) as usize;
        if pfn < self.resident.len() {
            Ok(pfn)
        } else {
            Err(RPError::PageNotMapped(addr))
        }
    }

    fn range(&self, pfn: usize) -> core::ops::Range<usize> {
        pfn * self.page_size..(pfn + 1) * self.page_size
    }

    pub fn is_resident(&self, pfn: usize) -> bool {
        self.resident.is_set(pfn)
    }

    pub fn resident_pages(&self) -> usize {
        self.resident.count_ones()
    }

    /// Contents of a resident frame
    pub fn read_page(&self, addr: u64) -> Option<&[u8]> {
        let pfn = self.frame(addr).ok()?;
        if !self.resident.is_set(pfn) {
            return None;
        }
        Some(&self.data[self.range(pfn)])
    }

    /// Simulates a write of the guest to a resident frame
    pub fn write_page(&mut self, addr: u64, src: &[u8]) -> RPResult<()> {
        let pfn = self.frame(addr)?;
        if !self.resident.is_set(pfn) {
            return Err(RPError::PageNotMapped(addr));
        }

        let range = self.range(pfn);
        self.data[range].copy_from_slice(src);
        self.materialized.set(true, pfn);
        Ok(())
    }
}

impl GuestMemoryModule for BufferGuestMemoryModule {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn nr_pages(&self) -> usize {
        self.resident.len()
    }

    fn install_page(&mut self, addr: u64, src: &[u8]) -> RPResult<()> {
        check_page_len(addr, src.len(), self.page_size)?;

        let pfn = self.frame(addr)?;
        if self.resident.is_set(pfn) {
            return Err(RPError::Fatal(format!("install: page {:#x} already present", addr)));
        }

        trace!("install page {:#x}", addr);

        let range = self.range(pfn);
        self.data[range].copy_from_slice(src);
        self.resident.set(true, pfn);
        Ok(())
    }

    fn install_zero_page(&mut self, addr: u64) -> RPResult<()> {
        let pfn = self.frame(addr)?;
        if self.resident.is_set(pfn) {
            return Err(RPError::Fatal(format!("zero copy: page {:#x} already present", addr)));
        }

        let range = self.range(pfn);
        self.data[range].fill(0);
        self.resident.set(true, pfn);
        Ok(())
    }

    fn evict_page(&mut self, addr: u64, dest: &mut [u8]) -> RPResult<()> {
        check_page_len(addr, dest.len(), self.page_size)?;
        let pfn = self.frame(addr)?;
        if !self.resident.is_set(pfn) {
            return Err(RPError::PageNotMapped(addr));
        }

        let range = self.range(pfn);
        dest.copy_from_slice(&self.data[range.clone()]);

        // the old contents must not leak into a later install
        self.data[range].fill(0);
        self.resident.set(false, pfn);
        Ok(())
    }

    fn is_materialized(&self, pfn: usize) -> bool {
        self.materialized.is_set(pfn)
    }

    fn mark_materialized(&mut self, pfn: usize) {
        if pfn < self.materialized.len() {
            self.materialized.set(true, pfn);
        }
    }

    fn any_materialized(&self, first_pfn: usize, count: usize) -> bool {
        self.materialized.any_in_range(first_pfn, first_pfn + count)
    }
}
