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

mod buffer;
#[cfg(feature = "use_libc")]
mod mmap;

pub use buffer::BufferGuestMemoryModule;
#[cfg(feature = "use_libc")]
pub use mmap::MmapGuestMemoryModule;

use crate::error::{RPError, RPResult};

/// Access to the memory of the guest, as provided by the virtualization layer.
///
/// Addresses are guest physical addresses and always page aligned.
/// Implementations return [`RPError::PageNotMapped`](crate::error::RPError::PageNotMapped)
/// if a frame cannot be resolved and [`RPError::Fatal`](crate::error::RPError::Fatal)
/// if the underlying primitive failed and guest memory might be corrupted.
pub trait GuestMemoryModule {
    fn page_size(&self) -> usize;

    /// Number of page frames of the guest
    fn nr_pages(&self) -> usize;

    /// Installs exactly the bytes of `src` into the frame at `addr`.
    ///
    /// The frame must currently be absent.
    fn install_page(&mut self, addr: u64, src: &[u8]) -> RPResult<()>;

    /// Installs a zeroed page into the frame at `addr`
    fn install_zero_page(&mut self, addr: u64) -> RPResult<()>;

    /// Removes the frame at `addr` from the guest and copies its last contents to `dest`
    fn evict_page(&mut self, addr: u64, dest: &mut [u8]) -> RPResult<()>;

    /// Whether the frame was ever touched by the guest.
    ///
    /// Modules that do not track this report every frame as materialized.
    fn is_materialized(&self, _pfn: usize) -> bool {
        true
    }

    fn mark_materialized(&mut self, _pfn: usize) {}

    /// Whether any frame in `[first_pfn, first_pfn + count)` was ever touched
    fn any_materialized(&self, first_pfn: usize, count: usize) -> bool {
        (first_pfn..first_pfn + count).any(|pfn| self.is_materialized(pfn))
    }
}

/// Fails unless a transfer buffer for the page at `addr` holds exactly one page
pub(crate) fn check_page_len(addr: u64, len: usize, page_size: usize) -> RPResult<()> {
    if len != page_size {
        return Err(RPError::Config(format!(
            "page {:#x}: buffer has {} bytes, expected {}",
            addr, len, page_size
        )));
    }
    Ok(())
}
