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

//! End-to-end tests of the paging engine against a memory server
//! running in its own thread.

use std::{
    io::Write,
    net::{IpAddr, Ipv4Addr},
    os::unix::net::UnixStream,
    sync::Arc,
    thread::{self, JoinHandle},
};

use log::debug;

use crate::{
    access_history::AccessHistory,
    host_routing_table::{HostId, HostRoutingTable, HOST_ID_MAIN},
    memory_server::MemoryServer,
    modules::{
        eviction::Lru8EvictionModule,
        guest_memory::{BufferGuestMemoryModule, GuestMemoryModule},
        persistent_storage::RamStorageModule,
    },
    page_fault_engine::PageFaultEngine,
    protocol::{recv_request, send_pagein_response, Request},
    rp_config::RPConfig,
};


pub(crate) const PAGE_SIZE: usize = 64;
pub(crate) const CHUNK_PAGES: usize = 8;
pub(crate) const SUB_HOST: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 0, 2));

pub(crate) type TestEngine = PageFaultEngine<BufferGuestMemoryModule, UnixStream, Lru8EvictionModule>;

/// Initial state of a single guest frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Frame {
    /// resident on the main host
    Main,
    /// stored at the sub-host
    Remote,
    /// routed to the sub-host, but the sub-host does not hold it
    Missing,
    /// never touched by the guest
    Untouched,
}

pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub(crate) fn get_test_config(main_pages: usize) -> RPConfig {
    RPConfig {
        page_size: PAGE_SIZE,
        chunk_pages: CHUNK_PAGES,
        main_pages,
        ..RPConfig::default()
    }
}

/// Page contents that differ for every frame
pub(crate) fn page_content(pfn: usize) -> Vec<u8> {
    (0..PAGE_SIZE).map(|i| (pfn * 31 + i) as u8).collect()
}

#[inline]
pub(crate) fn addr_of(pfn: usize) -> u64 {
    (pfn * PAGE_SIZE) as u64
}

/// Layout of frames in chunks, e.g. `chunks(&[Frame::Main, Frame::Remote])`
pub(crate) fn chunks(layout: &[Frame]) -> Vec<Frame> {
    layout
        .iter()
        .flat_map(|frame| std::iter::repeat(*frame).take(CHUNK_PAGES))
        .collect()
}

/// History where every page of a chunk has the given value
pub(crate) fn chunk_history(values: &[u8]) -> AccessHistory {
    AccessHistory::from_bytes(
        values
            .iter()
            .flat_map(|value| std::iter::repeat(*value).take(CHUNK_PAGES))
            .collect(),
    )
}

pub(crate) struct TestCluster {
    pub(crate) engine: TestEngine,
    pub(crate) sub_host: HostId,
    pub(crate) server: Option<JoinHandle<MemoryServer<RamStorageModule>>>,
}

impl TestCluster {
    /// Sets up the main host and one sub-host according to `frames`.
    /// Without `connected` the sub-host is registered but unreachable.
    pub(crate) fn new(config: RPConfig, frames: &[Frame], history: AccessHistory, connected: bool) -> Self {
        init_logging();

        let nr_pages = frames.len();
        let table: HostRoutingTable<UnixStream> = HostRoutingTable::new(nr_pages * PAGE_SIZE, PAGE_SIZE);
        let sub_host = table.get_or_create_host_id(SUB_HOST).unwrap();

        let mut memory = BufferGuestMemoryModule::new(nr_pages, PAGE_SIZE);
        let mut server = MemoryServer::new(RamStorageModule::new(nr_pages * PAGE_SIZE), PAGE_SIZE);

        for (pfn, frame) in frames.iter().enumerate() {
            let addr = addr_of(pfn);
            match frame {
                Frame::Main => {
                    memory.install_page(addr, &page_content(pfn)).unwrap();
                    memory.mark_materialized(pfn);
                    table.insert(addr, HOST_ID_MAIN).unwrap();
                }
                Frame::Remote => {
                    server.store_page(addr, &page_content(pfn)).unwrap();
                    memory.mark_materialized(pfn);
                    table.insert(addr, sub_host).unwrap();
                }
                Frame::Missing => {
                    memory.mark_materialized(pfn);
                    table.insert(addr, sub_host).unwrap();
                }
                Frame::Untouched => {
                    table.insert(addr, HOST_ID_MAIN).unwrap();
                }
            }
        }

        let server = if connected {
            let (client, mut server_end) = UnixStream::pair().unwrap();
            table.set_host_connection(sub_host, client).unwrap();

            Some(thread::spawn(move || {
                match server.serve(&mut server_end) {
                    Ok(()) => {}
                    // the engine may drop the connection while responses are in flight
                    Err(err) if err.is_disconnect() => debug!("Sub-host disconnected: {}", err),
                    Err(err) => panic!("memory server failed: {}", err),
                }
                server
            }))
        } else {
            None
        };

        let engine = PageFaultEngine::new(config, Arc::new(table), memory, history).unwrap();

        Self {
            engine,
            sub_host,
            server,
        }
    }

    /// Closes the connection and waits until the sub-host processed every request
    pub(crate) fn finish(self) -> (TestEngine, Option<MemoryServer<RamStorageModule>>) {
        self.engine.table().close_all();
        let server = self.server.map(|handle| handle.join().unwrap());
        (self.engine, server)
    }
}

/// Sub-host that answers pageins from `conn` with [`page_content`] of the
/// requested frame, but lets `reply` pick the address of the n-th response.
///
/// If `reply` returns `None`, only the address of the response is written and
/// the connection is closed. Returns the number of answered requests.
pub(crate) fn spawn_scripted_sub_host<F>(mut conn: UnixStream, reply: F) -> JoinHandle<usize>
where
    F: Fn(usize, u64) -> Option<u64> + Send + 'static,
{
    thread::spawn(move || {
        let mut page = vec![0u8; PAGE_SIZE];
        let mut answered = 0;

        while let Ok(Some(request)) = recv_request(&mut conn, &mut page) {
            let addr = match request {
                Request::Pagein { addr } => addr,
                Request::Pageout { .. } => continue,
            };

            let content = page_content(addr as usize / PAGE_SIZE);
            match reply(answered, addr) {
                Some(reply_addr) => {
                    if send_pagein_response(&mut conn, reply_addr, &content).is_err() {
                        break;
                    }
                }
                None => {
                    let _ = conn.write_all(&addr.to_ne_bytes());
                    break;
                }
            }
            answered += 1;
        }

        answered
    })
}
