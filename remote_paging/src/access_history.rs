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

/// Bit that is set for a page as soon as it is fetched or observed as accessed
pub const HISTORY_NEWEST_BIT: u8 = 1 << 7;

/// Approximate recency of every guest page, one byte per frame.
///
/// Bit 7 is the most recent observation, bit 0 the oldest. Comparing two
/// bytes numerically therefore orders pages by how recently they were used,
/// which is all the placement and eviction algorithms need.
///
/// Only the fault thread writes to this array while the engine is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessHistory {
    history: Vec<u8>,
}

impl AccessHistory {
    /// Creates a history for `nr_pages` frames where every page is cold
    pub fn new(nr_pages: usize) -> Self {
        Self {
            history: vec![0; nr_pages],
        }
    }

    /// Takes over a history that was collected by someone else
    /// (e.g. the dirty page tracking of the guest)
    pub fn from_bytes(history: Vec<u8>) -> Self {
        Self { history }
    }

    #[inline]
    pub fn nr_pages(&self) -> usize {
        self.history.len()
    }

    #[inline]
    pub fn get(&self, pfn: usize) -> u8 {
        self.history[pfn]
    }

    #[inline]
    pub fn set(&mut self, pfn: usize, value: u8) {
        self.history[pfn] = value;
    }

    /// Marks a page that was just brought to the main host
    #[inline]
    pub fn mark_fetched(&mut self, pfn: usize) {
        if let Some(entry) = self.history.get_mut(pfn) {
            *entry |= HISTORY_NEWEST_BIT;
        }
    }

    /// Shifts every entry one step into the past and records a new
    /// observation for all pages for which `accessed` returns true.
    pub fn age<F: Fn(usize) -> bool>(&mut self, accessed: F) {
        for (pfn, entry) in self.history.iter_mut().enumerate() {
            *entry >>= 1;
            if accessed(pfn) {
                *entry |= HISTORY_NEWEST_BIT;
            }
        }
    }

    /// Bitwise or of all pages of the chunk starting at `first_pfn`
    #[inline]
    pub fn chunk_history(&self, first_pfn: usize, chunk_pages: usize) -> u8 {
        let end = (first_pfn + chunk_pages).min(self.history.len());
        self.history[first_pfn..end]
            .iter()
            .fold(0, |acc, entry| acc | entry)
    }

    /// Derived history of every chunk, in address order
    pub fn chunk_histories(&self, chunk_pages: usize) -> Vec<u8> {
        self.history
            .chunks(chunk_pages)
            .map(|chunk| chunk.iter().fold(0, |acc, entry| acc | entry))
            .collect()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.history
    }
}
