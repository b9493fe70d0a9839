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

use super::EvictionModule;
use crate::{access_history::AccessHistory, host_routing_table::HostRoutingTable};

/// Picks the chunk with the smallest derived history (least recently used).
///
/// Ties go to the chunk with the lowest address. The scan stops at the first
/// chunk with a derived history of zero as nothing can be colder.
// completely stateless
pub struct Lru8EvictionModule;

impl EvictionModule for Lru8EvictionModule {
    fn new() -> Self {
        Self
    }

    fn select_chunk<C>(
        &mut self,
        history: &AccessHistory,
        table: &HostRoutingTable<C>,
        chunk_pages: usize,
        exclude_pfn: usize,
    ) -> Option<usize> {
        let nr_pages = table.nr_pfns().min(history.nr_pages());
        let mut selected: Option<(usize, u8)> = None;

        for pfn in (0..nr_pages).step_by(chunk_pages) {
            let chunk_history = history.chunk_history(pfn, chunk_pages);

            if let Some((_, min)) = selected {
                if chunk_history >= min {
                    continue;
                }
            }

            if pfn == exclude_pfn || !table.is_main(table.search_pfn(pfn)) {
                continue;
            }

            selected = Some((pfn, chunk_history));

            if chunk_history == 0 {
                break;
            }
        }

        if let Some((pfn, min)) = selected {
            trace!("Selected chunk at pfn {} with history {:#04x}", pfn, min);
        }

        selected.map(|(pfn, _)| pfn)
    }
}
