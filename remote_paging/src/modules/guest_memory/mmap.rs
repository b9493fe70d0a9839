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

use core::ptr::{self, null_mut, NonNull};

use libc::{
    c_void, madvise, mmap, munmap, MADV_DONTNEED, MAP_ANONYMOUS, MAP_FAILED, MAP_NORESERVE,
    MAP_PRIVATE, PROT_READ, PROT_WRITE,
};
use log::{error, trace};

use super::{check_page_len, GuestMemoryModule};
use crate::{
    error::{RPError, RPResult},
    util::{bit_array::BitArray, get_page_size},
};

/// Guest memory backed by an anonymous mapping.
///
/// Evicted frames are handed back to the kernel with `MADV_DONTNEED`.
pub struct MmapGuestMemoryModule {
    base: NonNull<u8>,
    size: usize,
    page_size: usize,
    resident: BitArray,
    materialized: BitArray,
}

// the mapping is owned exclusively by this module
unsafe impl Send for MmapGuestMemoryModule {}

impl MmapGuestMemoryModule {
    /// Maps `nr_pages` frames of `page_size` bytes.
    ///
    /// `page_size` has to be a multiple of the page size of the machine.
    pub fn new(nr_pages: usize, page_size: usize) -> RPResult<Self> {
        let os_page_size = get_page_size();
        if page_size % os_page_size != 0 {
            return Err(RPError::Config(format!(
                "page size {} is not a multiple of the system page size {}",
                page_size, os_page_size
            )));
        }

        let size = nr_pages * page_size;
        let base_ptr = unsafe {
            mmap(
                null_mut(),
                size,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS | MAP_NORESERVE,
                -1,
                0,
            )
        };

        if base_ptr == MAP_FAILED {
            return Err(RPError::Fatal(format!(
                "mmap of {} bytes failed: {}",
                size,
                std::io::Error::last_os_error()
            )));
        }

        let base = NonNull::new(base_ptr as *mut u8)
            .ok_or_else(|| RPError::Fatal("mmap returned null".into()))?;

        Ok(Self {
            base,
            size,
            page_size,
            resident: BitArray::new(nr_pages),
            materialized: BitArray::new(nr_pages),
        })
    }

    fn frame(&self, addr: u64) -> RPResult<(usize, *mut u8)> {
        let pfn = (addr / self.page_size as u64) as usize;
        if pfn >= self.resident.len() {
            return Err(RPError::PageNotMapped(addr));
        }

        let ptr = unsafe { self.base.as_ptr().add(pfn * self.page_size) };
        Ok((pfn, ptr))
    }

    pub fn is_resident(&self, pfn: usize) -> bool {
        self.resident.is_set(pfn)
    }

    /// Contents of a resident frame
    pub fn read_page(&self, addr: u64) -> Option<&[u8]> {
        let (pfn, ptr) = self.frame(addr).ok()?;
        if !self.resident.is_set(pfn) {
            return None;
        }

        Some(unsafe { core::slice::from_raw_parts(ptr, self.page_size) })
    }
}

impl GuestMemoryModule for MmapGuestMemoryModule {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn nr_pages(&self) -> usize {
        self.resident.len()
    }

    fn install_page(&mut self, addr: u64, src: &[u8]) -> RPResult<()> {
        check_page_len(addr, src.len(), self.page_size)?;

        let (pfn, ptr) = self.frame(addr)?;
        if self.resident.is_set(pfn) {
            return Err(RPError::Fatal(format!("install: page {:#x} already present", addr)));
        }

        trace!("install page {:#x}", addr);

        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), ptr, self.page_size) };
        self.resident.set(true, pfn);
        Ok(())
    }

    fn install_zero_page(&mut self, addr: u64) -> RPResult<()> {
        let (pfn, ptr) = self.frame(addr)?;
        if self.resident.is_set(pfn) {
            return Err(RPError::Fatal(format!("zero copy: page {:#x} already present", addr)));
        }

        unsafe { ptr::write_bytes(ptr, 0, self.page_size) };
        self.resident.set(true, pfn);
        Ok(())
    }

    fn evict_page(&mut self, addr: u64, dest: &mut [u8]) -> RPResult<()> {
        check_page_len(addr, dest.len(), self.page_size)?;
        let (pfn, ptr) = self.frame(addr)?;
        if !self.resident.is_set(pfn) {
            return Err(RPError::PageNotMapped(addr));
        }

        unsafe { ptr::copy_nonoverlapping(ptr, dest.as_mut_ptr(), self.page_size) };

        let code = unsafe { madvise(ptr as *mut c_void, self.page_size, MADV_DONTNEED) };
        if code != 0 {
            return Err(RPError::Fatal(format!(
                "madvise of page {:#x} failed: {}",
                addr,
                std::io::Error::last_os_error()
            )));
        }

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
}

impl Drop for MmapGuestMemoryModule {
    fn drop(&mut self) {
        let code = unsafe { munmap(self.base.as_ptr() as *mut c_void, self.size) };

        if code != 0 {
            error!("Could not unmap guest memory");
        }
    }
}

#[cfg(test)]
mod test {
    use super::MmapGuestMemoryModule;
    use crate::{error::RPError, modules::guest_memory::GuestMemoryModule, util::get_page_size};

    #[test]
    fn test_mmap_install_evict() {
        let page_size = get_page_size();
        let mut memory = MmapGuestMemoryModule::new(4, page_size).unwrap();

        let src: Vec<u8> = (0..page_size).map(|i| (i % 251) as u8).collect();
        let addr = 2 * page_size as u64;

        memory.install_page(addr, &src).unwrap();
        assert!(memory.is_resident(2));
        assert_eq!(memory.read_page(addr).unwrap(), &src[..]);

        let mut dest = vec![0u8; page_size];
        memory.evict_page(addr, &mut dest).unwrap();
        assert_eq!(dest, src);
        assert!(!memory.is_resident(2));
        assert!(memory.read_page(addr).is_none());

        // a zero page after eviction really is zero
        memory.install_zero_page(addr).unwrap();
        assert!(memory.read_page(addr).unwrap().iter().all(|b| *b == 0));
    }

    #[test]
    fn test_mmap_rejects_small_pages() {
        let page_size = get_page_size();
        assert!(MmapGuestMemoryModule::new(4, page_size / 2).is_err());
    }

    #[test]
    fn test_mmap_buffer_length_checked() {
        let page_size = get_page_size();
        let mut memory = MmapGuestMemoryModule::new(2, page_size).unwrap();

        let short = vec![1u8; page_size / 2];
        assert!(matches!(memory.install_page(0, &short), Err(RPError::Config(_))));
        assert!(!memory.is_resident(0));

        memory.install_zero_page(0).unwrap();
        let mut short_dest = vec![0u8; page_size - 1];
        assert!(matches!(memory.evict_page(0, &mut short_dest), Err(RPError::Config(_))));
        let mut long_dest = vec![0u8; page_size + 1];
        assert!(matches!(memory.evict_page(0, &mut long_dest), Err(RPError::Config(_))));

        // the page is still there
        assert!(memory.is_resident(0));
    }
}
