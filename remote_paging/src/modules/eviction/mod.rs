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

mod lru8;
pub use lru8::Lru8EvictionModule;

use crate::{access_history::AccessHistory, host_routing_table::HostRoutingTable};

/// Decides which chunk leaves the main host when the free-page budget runs out
pub trait EvictionModule {
    fn new() -> Self;

    /// Returns the first frame number of the chunk that should be paged out.
    ///
    /// The chunk starting at `exclude_pfn` was just brought in and must never
    /// be selected. Only chunks owned by the main host are eligible.
    /// Returns `None` if there is no eligible chunk.
    fn select_chunk<C>(
        &mut self,
        history: &AccessHistory,
        table: &HostRoutingTable<C>,
        chunk_pages: usize,
        exclude_pfn: usize,
    ) -> Option<usize>;
}
