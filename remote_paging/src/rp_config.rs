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

use static_assertions::const_assert;

use crate::{
    error::{RPError, RPResult},
    host_routing_table::MAX_HOST,
};

pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// 2^9 pages = 2 MiB with the default page size
pub const DEFAULT_CHUNK_PAGES: usize = 512;

pub const DEFAULT_SERVER_PORT: u16 = 9737;

const_assert!(DEFAULT_PAGE_SIZE.is_power_of_two());
const_assert!(DEFAULT_CHUNK_PAGES.is_power_of_two());

/// Scan order for chunks whose derived history equals the placement threshold.
///
/// Both orders produce a valid partition, they only differ in which of the
/// tied chunks stay on the main host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum PlacementOrder {
    /// lower addresses are kept on the main host first
    #[default]
    Ascending,
    /// higher addresses are kept on the main host first
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RPConfig {
    /// Size of a single page frame in bytes
    pub page_size: usize,

    /// Pages per chunk, the unit of migration and eviction
    pub chunk_pages: usize,

    /// Upper bound of sub-hosts that may be registered
    pub max_sub_hosts: usize,

    /// Pages the main host may hold, used as the initial free-page budget
    /// and as the target of the initial placement
    pub main_pages: usize,

    pub placement_order: PlacementOrder,

    /// Do not transfer frames that were never materialized
    pub skip_unmaterialized: bool,

    /// Port every memory server listens on
    pub server_port: u16,
}

impl Default for RPConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            chunk_pages: DEFAULT_CHUNK_PAGES,
            max_sub_hosts: MAX_HOST - 1,
            main_pages: DEFAULT_CHUNK_PAGES,
            placement_order: PlacementOrder::Ascending,
            skip_unmaterialized: false,
            server_port: DEFAULT_SERVER_PORT,
        }
    }
}

impl RPConfig {
    /// Size of one chunk in bytes
    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.chunk_pages * self.page_size
    }

    /// Returns the address of the first page of the chunk containing `addr`
    #[inline]
    pub fn chunk_start(&self, addr: u64) -> u64 {
        addr & !(self.chunk_size() as u64 - 1)
    }

    #[inline]
    pub fn page_start(&self, addr: u64) -> u64 {
        addr & !(self.page_size as u64 - 1)
    }

    pub fn validate(&self) -> RPResult<()> {
        if !self.page_size.is_power_of_two() {
            return Err(RPError::Config(format!(
                "page_size has to be a power of two, got {}",
                self.page_size
            )));
        }

        if !self.chunk_pages.is_power_of_two() {
            return Err(RPError::Config(format!(
                "chunk_pages has to be a power of two, got {}",
                self.chunk_pages
            )));
        }

        if self.max_sub_hosts == 0 || self.max_sub_hosts >= MAX_HOST {
            return Err(RPError::Config(format!(
                "max_sub_hosts has to be in [1, {}], got {}",
                MAX_HOST - 1,
                self.max_sub_hosts
            )));
        }

        if self.main_pages < self.chunk_pages {
            return Err(RPError::Config(format!(
                "main_pages ({}) has to hold at least one chunk ({} pages)",
                self.main_pages, self.chunk_pages
            )));
        }

        Ok(())
    }

    /// Reads a configuration from a json file. Missing fields keep their defaults.
    #[cfg(feature = "serde")]
    pub fn from_json_file<P: AsRef<std::path::Path>>(path: P) -> RPResult<Self> {
        let file = std::fs::File::open(path)?;
        let config: RPConfig = serde_json::from_reader(std::io::BufReader::new(file))
            .map_err(|err| RPError::Config(err.to_string()))?;

        config.validate()?;
        Ok(config)
    }
}
