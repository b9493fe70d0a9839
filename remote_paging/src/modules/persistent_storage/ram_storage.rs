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

use super::PersistentStorageModule;

/// Keeps all pages in main memory of the memory server
pub struct RamStorageModule {
    data: Vec<u8>,
}

impl RamStorageModule {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
        }
    }
}

impl PersistentStorageModule for RamStorageModule {
    fn read(&mut self, offset: usize, dest: &mut [u8]) -> Result<(), ()> {
        let src = self.data.get(offset..offset + dest.len()).ok_or(())?;
        dest.copy_from_slice(src);
        Ok(())
    }

    fn get_max_size(&self) -> usize {
        self.data.len()
    }

    fn write(&mut self, offset: usize, src: &[u8]) -> Result<(), ()> {
        let dest = self.data.get_mut(offset..offset + src.len()).ok_or(())?;
        dest.copy_from_slice(src);
        Ok(())
    }

    fn forget_region(&mut self, offset: usize, size: usize) {
        if let Some(region) = self.data.get_mut(offset..offset + size) {
            region.fill(0);
        }
    }
}
