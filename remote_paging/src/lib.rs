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

mod error;
mod rp_config;
mod util;

pub mod access_history;
pub mod host_routing_table;
pub mod memory_server;
pub mod page_fault_engine;
pub mod placement;
pub mod protocol;
pub mod sub_hosts;

#[cfg(test)]
mod test;

pub use error::{RPError, RPResult};
pub use rp_config::{PlacementOrder, RPConfig, DEFAULT_CHUNK_PAGES, DEFAULT_PAGE_SIZE, DEFAULT_SERVER_PORT};
pub use util::get_page_size;

pub use access_history::AccessHistory;
pub use host_routing_table::{HostId, HostRoutingTable};
pub use memory_server::MemoryServer;
pub use page_fault_engine::{FaultOutcome, PageFaultEngine};
pub use placement::ChunkPlacementPlanner;
pub mod modules;
