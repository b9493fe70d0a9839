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

use std::{
    io::{Read, Write},
    sync::Arc,
    thread::{self, JoinHandle},
};

use log::{debug, error, info, trace, warn};

use crate::{
    access_history::AccessHistory,
    error::{RPError, RPResult},
    host_routing_table::{HostId, HostRoutingTable, HOST_ID_MAIN},
    modules::{
        eviction::EvictionModule, fault_source::FaultSourceModule,
        guest_memory::GuestMemoryModule,
    },
    protocol::{recv_pagein_response, send_pagein_request, send_pageout_request, PageinResponse},
    rp_config::RPConfig,
};

/// Where the engine currently is while handling a fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultState {
    Idle,
    FaultReceived,
    Resolving,
    RemoteFetch,
    BudgetCheck,
    Evicting,
}

/// How a single fault was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// page already lives on the main host, nothing to do
    AlreadyMain,

    /// page was never materialized and got zero-filled
    ZeroFilled { pages: usize },

    /// the containing chunk was fetched from `host_id`
    Fetched {
        host_id: HostId,
        pages: usize,
        misses: usize,
        evicted_chunks: usize,
    },

    /// the fault was abandoned, the guest will fault again on the next access
    Unresolved,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct EngineStats {
    /// chunks brought to the main host
    pub pageins: u64,
    /// chunks pushed to a sub-host
    pub pageouts: u64,
    pub pages_in: u64,
    pub pages_out: u64,
    /// pagein responses without payload
    pub misses: u64,
    pub zero_fills: u64,
    pub unresolved: u64,
}

/// Resolves guest page faults by moving chunks between the main host and its
/// sub-hosts.
///
/// Faults are handled one after another. A fault on a page held by a sub-host
/// brings in its whole chunk. The main host only has room for
/// `config.main_pages` pages, so every chunk that comes in pushes out the
/// coldest chunk as soon as the free-page budget drops below one chunk.
pub struct PageFaultEngine<G: GuestMemoryModule, C: Read + Write, E: EvictionModule> {
    config: RPConfig,

    /// local ownership of every page
    table: Arc<HostRoutingTable<C>>,

    memory: G,
    history: AccessHistory,
    eviction: E,

    /// pages the main host can still take in, may temporarily drop below one chunk
    free_pages: i64,

    state: FaultState,

    /// transfer buffer for a single page
    page: Vec<u8>,

    stats: EngineStats,
}

impl<G: GuestMemoryModule, C: Read + Write, E: EvictionModule> PageFaultEngine<G, C, E> {
    pub fn new(
        config: RPConfig,
        table: Arc<HostRoutingTable<C>>,
        memory: G,
        history: AccessHistory,
    ) -> RPResult<Self> {
        config.validate()?;

        if table.page_size() != config.page_size || memory.page_size() != config.page_size {
            return Err(RPError::Config(format!(
                "page sizes differ: config={}, table={}, memory={}",
                config.page_size,
                table.page_size(),
                memory.page_size()
            )));
        }

        if history.nr_pages() != table.nr_pfns() || memory.nr_pages() != table.nr_pfns() {
            return Err(RPError::Config(format!(
                "page counts differ: table={}, memory={}, history={}",
                table.nr_pfns(),
                memory.nr_pages(),
                history.nr_pages()
            )));
        }

        let sub_hosts = table.sub_hosts().len();
        if sub_hosts > config.max_sub_hosts {
            return Err(RPError::Config(format!(
                "{} sub-hosts registered, at most {} allowed",
                sub_hosts, config.max_sub_hosts
            )));
        }

        info!(
            "Paging engine ready: {} pages, {} pages per chunk, budget of {} pages",
            table.nr_pfns(),
            config.chunk_pages,
            config.main_pages
        );

        Ok(Self {
            free_pages: config.main_pages as i64,
            page: vec![0; config.page_size],
            config,
            table,
            memory,
            history,
            eviction: E::new(),
            state: FaultState::Idle,
            stats: EngineStats::default(),
        })
    }

    pub fn config(&self) -> &RPConfig {
        &self.config
    }

    pub fn table(&self) -> &Arc<HostRoutingTable<C>> {
        &self.table
    }

    pub fn memory(&self) -> &G {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut G {
        &mut self.memory
    }

    pub fn history(&self) -> &AccessHistory {
        &self.history
    }

    pub fn history_mut(&mut self) -> &mut AccessHistory {
        &mut self.history
    }

    pub fn free_pages(&self) -> i64 {
        self.free_pages
    }

    pub fn state(&self) -> FaultState {
        self.state
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    #[inline]
    fn transition(&mut self, state: FaultState) {
        trace!("{:?} -> {:?}", self.state, state);
        self.state = state;
    }

    #[inline]
    fn chunk_pages(&self) -> i64 {
        self.config.chunk_pages as i64
    }

    /// Handles a single fault at the guest physical address `addr`.
    ///
    /// Every failure except for [`RPError::Fatal`] is logged and reported as
    /// [`FaultOutcome::Unresolved`]. Partially transferred chunks are left as they are.
    pub fn handle_fault(&mut self, addr: u64) -> RPResult<FaultOutcome> {
        self.transition(FaultState::FaultReceived);
        let res = self.resolve_fault(addr);
        self.transition(FaultState::Idle);

        match res {
            Ok(outcome) => Ok(outcome),
            Err(err) if err.is_fatal() => {
                error!("Fault at {:#x}: {}", addr, err);
                Err(err)
            }
            Err(err) => {
                if err.is_disconnect() {
                    warn!("Fault at {:#x} unresolved, sub-host went away: {}", addr, err);
                } else {
                    warn!("Fault at {:#x} unresolved: {}", addr, err);
                }
                self.stats.unresolved += 1;
                Ok(FaultOutcome::Unresolved)
            }
        }
    }

    fn resolve_fault(&mut self, addr: u64) -> RPResult<FaultOutcome> {
        let addr = self.config.page_start(addr);
        let pfn = (addr / self.config.page_size as u64) as usize;

        if pfn >= self.table.nr_pfns() {
            return Err(RPError::AddressOutOfRange(addr));
        }

        if self.config.skip_unmaterialized && !self.memory.is_materialized(pfn) {
            return self.zero_fill(addr);
        }

        self.transition(FaultState::Resolving);
        let host_id = self.table.search(addr);

        if self.table.is_main(host_id) {
            trace!("Page {:#x} is already on the main host", addr);
            return Ok(FaultOutcome::AlreadyMain);
        }

        if !self.table.is_sub(host_id) {
            return Err(RPError::UnknownOwner(addr));
        }

        self.transition(FaultState::RemoteFetch);
        let chunk_start = self.config.chunk_start(addr);
        let (pages, misses) = self.pagein_chunk(host_id, addr)?;

        self.stats.pageins += 1;
        debug!(
            "Paged in chunk {:#x} from host {}: {} page(s), {} miss(es)",
            chunk_start, host_id, pages, misses
        );

        self.transition(FaultState::BudgetCheck);
        self.free_pages -= self.chunk_pages();

        let exclude_pfn = (chunk_start / self.config.page_size as u64) as usize;
        let evicted_chunks = self.balance_budget(host_id, exclude_pfn)?;

        Ok(FaultOutcome::Fetched {
            host_id,
            pages,
            misses,
            evicted_chunks,
        })
    }

    /// Gives the guest fresh zero pages for a frame it never touched.
    /// If the whole chunk is untouched, the whole chunk is filled at once.
    fn zero_fill(&mut self, addr: u64) -> RPResult<FaultOutcome> {
        let page_size = self.config.page_size as u64;
        let chunk_start = self.config.chunk_start(addr);
        let first_pfn = (chunk_start / page_size) as usize;
        let end_pfn = (first_pfn + self.config.chunk_pages).min(self.table.nr_pfns());

        let range = if self.memory.any_materialized(first_pfn, end_pfn - first_pfn) {
            let pfn = (addr / page_size) as usize;
            pfn..pfn + 1
        } else {
            first_pfn..end_pfn
        };

        let pages = range.len();
        for pfn in range {
            let page_addr = pfn as u64 * page_size;
            self.memory.install_zero_page(page_addr)?;
            self.memory.mark_materialized(pfn);
            self.table.insert(page_addr, HOST_ID_MAIN)?;
        }

        trace!("Zero-filled {} page(s) at {:#x}", pages, addr);
        self.stats.zero_fills += pages as u64;
        Ok(FaultOutcome::ZeroFilled { pages })
    }

    /// Whether `pfn` takes part in a chunk transfer
    fn should_transfer(&self, pfn: usize) -> bool {
        !self.config.skip_unmaterialized || self.memory.is_materialized(pfn)
    }

    /// Fetches the chunk containing `fault_addr` from `host_id`.
    ///
    /// The faulting page is requested first, then every other page of the chunk
    /// that is not on the main host already. All requests go out before the
    /// first response is read. Returns the installed pages and the misses.
    ///
    /// Every response is read even if an earlier one was rejected, so the next
    /// fault on this connection starts with its own responses.
    fn pagein_chunk(&mut self, host_id: HostId, fault_addr: u64) -> RPResult<(usize, usize)> {
        let page_size = self.config.page_size as u64;
        let chunk_start = self.config.chunk_start(fault_addr);
        let first_pfn = (chunk_start / page_size) as usize;
        let end_pfn = (first_pfn + self.config.chunk_pages).min(self.table.nr_pfns());

        let mut requests = Vec::with_capacity(self.config.chunk_pages);
        requests.push(fault_addr);
        for pfn in first_pfn..end_pfn {
            let addr = pfn as u64 * page_size;
            if addr == fault_addr || !self.should_transfer(pfn) {
                continue;
            }
            if self.table.is_main(self.table.search_pfn(pfn)) {
                continue;
            }
            requests.push(addr);
        }

        let table = Arc::clone(&self.table);
        let memory = &mut self.memory;
        let history = &mut self.history;
        let page = &mut self.page;

        let res = table.with_host_connection(host_id, |conn| {
            for addr in requests.iter() {
                send_pagein_request(conn, *addr)?;
            }
            conn.flush()?;

            let mut pages = 0;
            let mut misses = 0;
            let mut rejected = None;

            // responses come back in request order
            for expected in requests.iter().copied() {
                let addr = match recv_pagein_response(conn, page)? {
                    PageinResponse::Miss => {
                        misses += 1;
                        continue;
                    }
                    PageinResponse::Page { addr } => addr,
                };

                if addr != expected {
                    warn!("pagein: expected page {:#x}, got {:#x}", expected, addr);
                    rejected.get_or_insert(RPError::UnexpectedAddress { expected, got: addr });
                    continue;
                }

                let pfn = (addr / page_size) as usize;
                match memory
                    .install_page(addr, page)
                    .and_then(|()| table.insert(addr, HOST_ID_MAIN))
                {
                    Ok(()) => {
                        memory.mark_materialized(pfn);
                        history.mark_fetched(pfn);
                        pages += 1;
                    }
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => {
                        rejected.get_or_insert(err);
                    }
                }
            }

            Ok((pages, misses, rejected))
        });

        let (pages, misses, rejected) = res.map_err(|err| self.drop_broken_connection(host_id, err))?;

        self.stats.pages_in += pages as u64;
        self.stats.misses += misses as u64;

        match rejected {
            Some(err) => Err(err),
            None => Ok((pages, misses)),
        }
    }

    /// Closes the connection to `host_id` if `err` left its stream at an unknown position
    fn drop_broken_connection(&self, host_id: HostId, err: RPError) -> RPError {
        if matches!(err, RPError::Transport(_)) || err.is_fatal() {
            if self.table.take_host_connection(host_id).is_some() {
                warn!("Dropped connection to host {}: {}", host_id, err);
            }
        }
        err
    }

    /// Evicts cold chunks to `host_id` until at least one chunk fits again.
    ///
    /// Returns the number of evicted chunks. If no chunk can be evicted, the
    /// budget stays short and the next fault tries again.
    fn balance_budget(&mut self, host_id: HostId, exclude_pfn: usize) -> RPResult<usize> {
        let mut evicted = 0;

        while self.free_pages < self.chunk_pages() {
            self.transition(FaultState::Evicting);

            let selected = self.eviction.select_chunk(
                &self.history,
                self.table.as_ref(),
                self.config.chunk_pages,
                exclude_pfn,
            );

            let first_pfn = match selected {
                Some(pfn) => pfn,
                None => {
                    warn!(
                        "{}, free-page budget stays at {}",
                        RPError::NoEvictableChunk,
                        self.free_pages
                    );
                    break;
                }
            };

            let pages = self.pageout_chunk(host_id, first_pfn)?;
            debug!(
                "Paged out chunk at pfn {} to host {}: {} page(s)",
                first_pfn, host_id, pages
            );

            self.free_pages += self.chunk_pages();
            self.stats.pageouts += 1;
            evicted += 1;

            self.transition(FaultState::BudgetCheck);
        }

        Ok(evicted)
    }

    /// Pushes every main-owned page of the chunk starting at `first_pfn` to `host_id`
    fn pageout_chunk(&mut self, host_id: HostId, first_pfn: usize) -> RPResult<usize> {
        let page_size = self.config.page_size as u64;
        let end_pfn = (first_pfn + self.config.chunk_pages).min(self.table.nr_pfns());

        let pfns: Vec<usize> = (first_pfn..end_pfn)
            .filter(|pfn| self.should_transfer(*pfn))
            .filter(|pfn| self.table.is_main(self.table.search_pfn(*pfn)))
            .collect();

        let table = Arc::clone(&self.table);
        let memory = &mut self.memory;
        let page = &mut self.page;

        let res = table.with_host_connection(host_id, |conn| {
            let mut pages = 0;
            for pfn in pfns.iter() {
                let addr = *pfn as u64 * page_size;

                // remove the page from the guest before it leaves this host
                memory.evict_page(addr, page)?;
                send_pageout_request(conn, addr, page)?;
                table.insert(addr, host_id)?;
                pages += 1;
            }
            conn.flush()?;

            Ok(pages)
        });
        let pages = res.map_err(|err| self.drop_broken_connection(host_id, err))?;

        self.stats.pages_out += pages as u64;
        Ok(pages)
    }

    /// Handles faults from `source` until it runs dry.
    ///
    /// Only fatal errors end the loop early.
    pub fn run<F: FaultSourceModule>(&mut self, source: &mut F) -> RPResult<()> {
        while let Some(addr) = source.wait_fault()? {
            self.handle_fault(addr)?;
        }

        info!("Fault source closed, stats: {:?}", self.stats);
        Ok(())
    }
}

impl<G, C, E> PageFaultEngine<G, C, E>
where
    G: GuestMemoryModule + Send + 'static,
    C: Read + Write + Send + 'static,
    E: EvictionModule + Send + 'static,
{
    /// Moves the engine to a dedicated fault thread.
    ///
    /// The thread hands the engine back once `source` is closed. A fatal error
    /// terminates the whole process, as guest memory can no longer be trusted.
    pub fn spawn<F: FaultSourceModule + Send + 'static>(
        mut self,
        mut source: F,
    ) -> std::io::Result<JoinHandle<RPResult<Self>>> {
        thread::Builder::new()
            .name("fault-handler".into())
            .spawn(move || match self.run(&mut source) {
                Ok(()) => Ok(self),
                Err(err) if err.is_fatal() => {
                    error!("Stopping: {}", err);
                    std::process::exit(1);
                }
                Err(err) => {
                    error!("Fault source failed: {}", err);
                    Err(err)
                }
            })
    }
}
