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

use std::net::IpAddr;

use log::{debug, info};

use crate::{
    access_history::AccessHistory,
    error::RPResult,
    host_routing_table::{HostId, HostRoutingTable, HOST_ID_MAIN},
    rp_config::PlacementOrder,
};

/// Result of an initial placement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PlacementSummary {
    /// Derived history value at which the chunks were split.
    /// `None` if every chunk fits on the main host.
    pub threshold: Option<u8>,

    /// Pages of threshold chunks that were allowed to stay on the main host
    pub leftover: usize,

    pub main_pages: usize,
    pub sub_pages: usize,
    pub sub_host: HostId,
}

/// Splits guest memory between the main host and one sub-host so that the
/// most recently used chunks stay on the main host.
///
/// This is a one-time bulk partition written into the destination table.
pub struct ChunkPlacementPlanner {
    chunk_pages: usize,
    order: PlacementOrder,
}

impl ChunkPlacementPlanner {
    pub fn new(chunk_pages: usize, order: PlacementOrder) -> Self {
        Self { chunk_pages, order }
    }

    /// Pages of the chunk with index `chunk`, the last chunk may be partial
    #[inline]
    fn chunk_len(&self, chunk: usize, nr_pages: usize) -> usize {
        let first = chunk * self.chunk_pages;
        (first + self.chunk_pages).min(nr_pages).saturating_sub(first)
    }

    /// Number of pages per derived history value (0 = coldest, 255 = hottest)
    pub fn histogram(&self, chunk_histories: &[u8], nr_pages: usize) -> [usize; 256] {
        let mut histogram = [0usize; 256];
        for (chunk, value) in chunk_histories.iter().enumerate() {
            histogram[*value as usize] += self.chunk_len(chunk, nr_pages);
        }
        histogram
    }

    /// Finds the history value at which the hottest chunks exceed `main_pages`.
    ///
    /// Returns the threshold and how many pages of threshold chunks may still go
    /// to the main host, or `None` if all chunks fit.
    pub fn find_threshold(&self, histogram: &[usize; 256], main_pages: usize) -> Option<(u8, usize)> {
        let mut sum = 0;

        for index in (0..=255u8).rev() {
            let bucket_pages = histogram[index as usize];
            if sum + bucket_pages > main_pages {
                return Some((index, main_pages - sum));
            }
            sum += bucket_pages;
        }

        None
    }

    /// Partitions all chunks and records every page in `dst`.
    ///
    /// Chunks hotter than the threshold go to the main host, colder ones to
    /// `sub_host`. Chunks at the threshold stay on the main host while the
    /// leftover budget lasts, visited in the configured order.
    pub fn split<C>(
        &self,
        history: &AccessHistory,
        main_pages: usize,
        sub_host: IpAddr,
        dst: &HostRoutingTable<C>,
    ) -> RPResult<PlacementSummary> {
        let chunk_histories = history.chunk_histories(self.chunk_pages);
        let histogram = self.histogram(&chunk_histories, history.nr_pages());
        let threshold = self.find_threshold(&histogram, main_pages);

        debug!("Placement threshold: {:?}", threshold);

        let sub_host_id = dst.get_or_create_host_id(sub_host)?;

        let mut summary = PlacementSummary {
            threshold: threshold.map(|(index, _)| index),
            leftover: threshold.map(|(_, left)| left).unwrap_or(0),
            main_pages: 0,
            sub_pages: 0,
            sub_host: sub_host_id,
        };

        let mut left = summary.leftover;

        let chunks: Box<dyn Iterator<Item = usize>> = match self.order {
            PlacementOrder::Ascending => Box::new(0..chunk_histories.len()),
            PlacementOrder::Descending => Box::new((0..chunk_histories.len()).rev()),
        };

        for chunk in chunks {
            let target = match threshold {
                None => HOST_ID_MAIN,
                Some((index, _)) => {
                    let value = chunk_histories[chunk];
                    if value > index {
                        HOST_ID_MAIN
                    } else if value < index {
                        sub_host_id
                    } else if left > 0 {
                        left = left.saturating_sub(self.chunk_len(chunk, history.nr_pages()));
                        HOST_ID_MAIN
                    } else {
                        sub_host_id
                    }
                }
            };

            let pages = self.insert_chunk(chunk, history.nr_pages(), target, dst)?;
            if target == HOST_ID_MAIN {
                summary.main_pages += pages;
            } else {
                summary.sub_pages += pages;
            }
        }

        info!(
            "Placement: {} page(s) to main, {} page(s) to sub-host {}",
            summary.main_pages, summary.sub_pages, sub_host
        );

        Ok(summary)
    }

    fn insert_chunk<C>(
        &self,
        chunk: usize,
        nr_pages: usize,
        host_id: HostId,
        dst: &HostRoutingTable<C>,
    ) -> RPResult<usize> {
        let page_size = dst.page_size() as u64;
        let first = chunk * self.chunk_pages;
        let len = self.chunk_len(chunk, nr_pages);

        for pfn in first..first + len {
            dst.insert(pfn as u64 * page_size, host_id)?;
        }

        Ok(len)
    }
}

#[cfg(test)]
mod test {
    use std::net::{IpAddr, Ipv4Addr};

    use rand_xoshiro::rand_core::{RngCore, SeedableRng};
    use rand_xoshiro::Xoshiro256PlusPlus;

    use super::ChunkPlacementPlanner;
    use crate::{
        access_history::AccessHistory,
        host_routing_table::{HostRoutingTable, HOST_ID_MAIN},
        rp_config::PlacementOrder,
    };

    const PAGE_SIZE: usize = 4096;
    const SUB_HOST: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 0, 2));

    fn history_of(chunks: &[u8], chunk_pages: usize) -> AccessHistory {
        let mut history = AccessHistory::new(chunks.len() * chunk_pages);
        for (chunk, value) in chunks.iter().enumerate() {
            history.set(chunk * chunk_pages + chunk_pages / 2, *value);
        }
        history
    }

    fn chunk_owner(table: &HostRoutingTable<()>, chunk: usize, chunk_pages: usize) -> u8 {
        let owner = table.search_pfn(chunk * chunk_pages);
        for pfn in chunk * chunk_pages..(chunk + 1) * chunk_pages {
            assert_eq!(table.search_pfn(pfn), owner, "chunk {} is split", chunk);
        }
        owner
    }

    #[test]
    fn test_exact_fit_scenario() {
        const CHUNK_PAGES: usize = 512;
        let history = history_of(&[10, 10, 5, 0], CHUNK_PAGES);
        let table = HostRoutingTable::new(4 * CHUNK_PAGES * PAGE_SIZE, PAGE_SIZE);

        let planner = ChunkPlacementPlanner::new(CHUNK_PAGES, PlacementOrder::Ascending);
        let summary = planner.split(&history, 1024, SUB_HOST, &table).unwrap();

        assert_eq!(summary.threshold, Some(5));
        assert_eq!(summary.leftover, 0);
        assert_eq!(summary.main_pages, 1024);
        assert_eq!(summary.sub_pages, 1024);

        let sub = summary.sub_host;
        assert_ne!(sub, HOST_ID_MAIN);
        assert_eq!(chunk_owner(&table, 0, CHUNK_PAGES), HOST_ID_MAIN);
        assert_eq!(chunk_owner(&table, 1, CHUNK_PAGES), HOST_ID_MAIN);
        assert_eq!(chunk_owner(&table, 2, CHUNK_PAGES), sub);
        assert_eq!(chunk_owner(&table, 3, CHUNK_PAGES), sub);
    }

    #[test]
    fn test_tie_break_order() {
        const CHUNK_PAGES: usize = 4;
        let history = history_of(&[3, 3, 3, 3], CHUNK_PAGES);

        let ascending = HostRoutingTable::new(4 * CHUNK_PAGES * PAGE_SIZE, PAGE_SIZE);
        let summary = ChunkPlacementPlanner::new(CHUNK_PAGES, PlacementOrder::Ascending)
            .split(&history, 8, SUB_HOST, &ascending)
            .unwrap();
        assert_eq!(summary.threshold, Some(3));
        assert_eq!(summary.leftover, 8);
        assert_eq!(summary.main_pages, 8);

        let descending = HostRoutingTable::new(4 * CHUNK_PAGES * PAGE_SIZE, PAGE_SIZE);
        ChunkPlacementPlanner::new(CHUNK_PAGES, PlacementOrder::Descending)
            .split(&history, 8, SUB_HOST, &descending)
            .unwrap();

        let owners = |table: &HostRoutingTable<()>| -> Vec<bool> {
            (0..4)
                .map(|chunk| chunk_owner(table, chunk, CHUNK_PAGES) == HOST_ID_MAIN)
                .collect()
        };

        assert_eq!(owners(&ascending), vec![true, true, false, false]);
        assert_eq!(owners(&descending), vec![false, false, true, true]);
    }

    #[test]
    fn test_everything_fits() {
        const CHUNK_PAGES: usize = 4;
        let history = history_of(&[1, 2, 0], CHUNK_PAGES);
        let table: HostRoutingTable<()> = HostRoutingTable::new(3 * CHUNK_PAGES * PAGE_SIZE, PAGE_SIZE);

        let summary = ChunkPlacementPlanner::new(CHUNK_PAGES, PlacementOrder::Ascending)
            .split(&history, 12, SUB_HOST, &table)
            .unwrap();

        assert_eq!(summary.threshold, None);
        assert_eq!(summary.main_pages, 12);
        assert_eq!(table.count_owned_by(HOST_ID_MAIN), 12);
    }

    #[test]
    fn test_histogram() {
        let planner = ChunkPlacementPlanner::new(4, PlacementOrder::Ascending);

        // the last chunk only has two pages
        let histogram = planner.histogram(&[0, 255, 7, 7], 14);
        assert_eq!(histogram[0], 4);
        assert_eq!(histogram[7], 6);
        assert_eq!(histogram[255], 4);
        assert_eq!(histogram.iter().sum::<usize>(), 14);
    }

    #[test]
    fn test_partial_last_chunk() {
        const CHUNK_PAGES: usize = 8;
        const NR_PAGES: usize = 2 * CHUNK_PAGES + 2;

        let mut history = AccessHistory::new(NR_PAGES);
        history.set(0, 1);
        history.set(CHUNK_PAGES, 1);
        history.set(2 * CHUNK_PAGES, 9);

        let table = HostRoutingTable::new(NR_PAGES * PAGE_SIZE, PAGE_SIZE);
        let summary = ChunkPlacementPlanner::new(CHUNK_PAGES, PlacementOrder::Ascending)
            .split(&history, 9, SUB_HOST, &table)
            .unwrap();

        // the hottest chunk only takes two pages of the budget
        assert_eq!(summary.threshold, Some(1));
        assert_eq!(summary.leftover, 7);
        assert_eq!(summary.main_pages, CHUNK_PAGES + 2);
        assert_eq!(summary.sub_pages, CHUNK_PAGES);

        assert_eq!(chunk_owner(&table, 0, CHUNK_PAGES), HOST_ID_MAIN);
        assert_ne!(chunk_owner(&table, 1, CHUNK_PAGES), HOST_ID_MAIN);
        assert_eq!(table.search_pfn(NR_PAGES - 1), HOST_ID_MAIN);
    }

    #[test]
    fn test_main_pages_within_one_chunk() {
        const CHUNK_PAGES: usize = 8;
        const CHUNKS: usize = 64;
        let mut rand = Xoshiro256PlusPlus::seed_from_u64(5446535461589659585);

        for round in 0..100 {
            // small value ranges produce many ties
            let modulo = if round % 2 == 0 { 4 } else { 256 };
            let chunks: Vec<u8> = (0..CHUNKS).map(|_| (rand.next_u32() % modulo) as u8).collect();
            let main_pages = (rand.next_u32() as usize) % (CHUNKS * CHUNK_PAGES + 1);
            let order = if round % 3 == 0 {
                PlacementOrder::Descending
            } else {
                PlacementOrder::Ascending
            };

            let history = history_of(&chunks, CHUNK_PAGES);
            let table = HostRoutingTable::new(CHUNKS * CHUNK_PAGES * PAGE_SIZE, PAGE_SIZE);
            let summary = ChunkPlacementPlanner::new(CHUNK_PAGES, order)
                .split(&history, main_pages, SUB_HOST, &table)
                .unwrap();

            let on_main = table.count_owned_by(HOST_ID_MAIN);
            assert_eq!(on_main, summary.main_pages);
            assert_eq!(on_main + summary.sub_pages, CHUNKS * CHUNK_PAGES);
            assert!(
                on_main.abs_diff(main_pages) < CHUNK_PAGES,
                "main_pages={} but placed {}",
                main_pages,
                on_main
            );

            // hotter chunks never end up on the sub-host while colder ones stay
            let hottest_remote = (0..CHUNKS)
                .filter(|c| chunk_owner(&table, *c, CHUNK_PAGES) != HOST_ID_MAIN)
                .map(|c| chunks[c])
                .max();
            let coldest_main = (0..CHUNKS)
                .filter(|c| chunk_owner(&table, *c, CHUNK_PAGES) == HOST_ID_MAIN)
                .map(|c| chunks[c])
                .min();
            if let (Some(remote), Some(main)) = (hottest_remote, coldest_main) {
                assert!(remote <= main);
            }
        }
    }
}
