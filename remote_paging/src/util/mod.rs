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

pub(crate) mod bit_array;

/// Page size of the machine we are running on
#[cfg(feature = "use_libc")]
pub fn get_page_size() -> usize {
    use libc::{sysconf, _SC_PAGE_SIZE};

    unsafe { sysconf(_SC_PAGE_SIZE) as usize }
}

#[cfg(not(feature = "use_libc"))]
pub fn get_page_size() -> usize {
    crate::rp_config::DEFAULT_PAGE_SIZE
}

/// efficient way to calculate: ceil(x / y)
pub(crate) fn ceil_div(x: usize, y: usize) -> usize {
    (x + y - 1) / y
}
