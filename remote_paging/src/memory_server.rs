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
    net::TcpListener,
};

use log::{debug, info, trace, warn};

use crate::{
    error::{RPError, RPResult},
    modules::persistent_storage::PersistentStorageModule,
    protocol::{recv_request, send_pagein_miss, send_pagein_response, Request},
    util::bit_array::BitArray,
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct MemoryServerStats {
    pub pageins: u64,
    pub pageouts: u64,
    pub misses: u64,
}

/// Sub-host side of the paging protocol.
///
/// Stores pages pushed out by the main host at `storage[addr]` and hands them
/// back on request. A page that was handed back is dropped, as only one host
/// may hold a page at a time.
pub struct MemoryServer<S: PersistentStorageModule> {
    storage: S,
    present: BitArray,
    page: Vec<u8>,
    page_size: usize,
    stats: MemoryServerStats,
}

impl<S: PersistentStorageModule> MemoryServer<S> {
    /// Creates a server that can hold as many pages as fit into `storage`
    pub fn new(storage: S, page_size: usize) -> Self {
        let nr_pages = storage.get_max_size() / page_size;

        Self {
            storage,
            present: BitArray::new(nr_pages),
            page: vec![0; page_size],
            page_size,
            stats: MemoryServerStats::default(),
        }
    }

    pub fn stats(&self) -> MemoryServerStats {
        self.stats
    }

    /// Number of pages currently held
    pub fn stored_pages(&self) -> usize {
        self.present.count_ones()
    }

    pub fn is_stored(&self, addr: u64) -> bool {
        self.present.is_set(self.pfn_of(addr))
    }

    #[inline]
    fn pfn_of(&self, addr: u64) -> usize {
        (addr / self.page_size as u64) as usize
    }

    /// Stores a page without a main host asking for it, e.g. while the guest
    /// memory is initially distributed
    pub fn store_page(&mut self, addr: u64, src: &[u8]) -> RPResult<()> {
        let pfn = self.pfn_of(addr);
        if addr % self.page_size as u64 != 0 || pfn >= self.present.len() {
            warn!("store: invalid address: {:#x}", addr);
            return Err(RPError::AddressOutOfRange(addr));
        }

        self.storage
            .write(pfn * self.page_size, src)
            .map_err(|_| RPError::Storage(addr))?;
        self.present.set(true, pfn);
        Ok(())
    }

    /// Copies a stored page into `dest` without giving it away
    pub fn load_page(&mut self, addr: u64, dest: &mut [u8]) -> RPResult<bool> {
        let pfn = self.pfn_of(addr);
        if !self.present.is_set(pfn) {
            return Ok(false);
        }

        self.storage
            .read(pfn * self.page_size, dest)
            .map_err(|_| RPError::Storage(addr))?;
        Ok(true)
    }

    fn handle_pagein<C: Write>(&mut self, conn: &mut C, addr: u64) -> RPResult<()> {
        let pfn = self.pfn_of(addr);

        if addr % self.page_size as u64 != 0 || !self.present.is_set(pfn) {
            trace!("pagein: no page {:#x}", addr);
            self.stats.misses += 1;
            return send_pagein_miss(conn);
        }

        let offset = pfn * self.page_size;
        self.storage
            .read(offset, &mut self.page)
            .map_err(|_| RPError::Storage(addr))?;

        send_pagein_response(conn, addr, &self.page)?;

        // the main host owns the page from now on
        self.present.set(false, pfn);
        self.storage.forget_region(offset, self.page_size);
        self.stats.pageins += 1;
        Ok(())
    }

    fn handle_pageout(&mut self, addr: u64) -> RPResult<()> {
        let pfn = self.pfn_of(addr);
        if addr % self.page_size as u64 != 0 || pfn >= self.present.len() {
            warn!("pageout: invalid address: {:#x}", addr);
            return Err(RPError::AddressOutOfRange(addr));
        }

        self.storage
            .write(pfn * self.page_size, &self.page)
            .map_err(|_| RPError::Storage(addr))?;
        self.present.set(true, pfn);
        self.stats.pageouts += 1;
        Ok(())
    }

    /// Serves requests on `conn` until the main host closes the connection
    pub fn serve<C: Read + Write>(&mut self, conn: &mut C) -> RPResult<()> {
        loop {
            let request = match recv_request(conn, &mut self.page)? {
                Some(request) => request,
                None => {
                    debug!("Main host closed the connection");
                    return Ok(());
                }
            };

            match request {
                Request::Pagein { addr } => self.handle_pagein(conn, addr)?,
                Request::Pageout { addr } => self.handle_pageout(addr)?,
            }
        }
    }

    /// Accepts main hosts one after another and serves them.
    ///
    /// Errors of a single connection are logged and end only that connection.
    pub fn run(&mut self, listener: TcpListener) -> RPResult<()> {
        info!("Memory server listening on {}", listener.local_addr()?);

        for conn in listener.incoming() {
            let mut conn = match conn {
                Ok(conn) => conn,
                Err(err) => {
                    warn!("accept failed: {}", err);
                    continue;
                }
            };

            let peer = match conn.peer_addr() {
                Ok(peer) => peer.to_string(),
                Err(_) => "unknown peer".to_string(),
            };
            info!("Connection from {}", peer);

            if let Err(err) = self.serve(&mut conn) {
                warn!("Connection to {} failed: {}", peer, err);
            }

            debug!("Stats after {}: {:?}", peer, self.stats);
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::io::{self, Cursor, Read, Write};

    use super::MemoryServer;
    use crate::{
        error::RPError,
        modules::persistent_storage::RamStorageModule,
        protocol::{
            recv_pagein_response, send_pagein_request, send_pageout_request, PageinResponse,
        },
    };

    const PAGE_SIZE: usize = 64;

    fn get_server(pages: usize) -> MemoryServer<RamStorageModule> {
        MemoryServer::new(RamStorageModule::new(pages * PAGE_SIZE), PAGE_SIZE)
    }

    /// Feeds `requests` to the server and returns everything it answered
    fn exchange(server: &mut MemoryServer<RamStorageModule>, requests: Vec<u8>) -> Vec<u8> {
        let len = requests.len() as u64;
        let mut duplex = Duplex {
            input: Cursor::new(requests),
            output: Vec::new(),
        };

        server.serve(&mut duplex).unwrap();
        assert_eq!(duplex.input.position(), len);
        duplex.output
    }

    struct Duplex {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Read for Duplex {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Duplex {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_pageout_then_pagein() {
        let mut server = get_server(4);

        let mut requests = Vec::new();
        send_pageout_request(&mut requests, 2 * PAGE_SIZE as u64, &[3u8; PAGE_SIZE]).unwrap();
        assert!(exchange(&mut server, requests).is_empty());
        assert!(server.is_stored(2 * PAGE_SIZE as u64));
        assert_eq!(server.stored_pages(), 1);

        let mut requests = Vec::new();
        send_pagein_request(&mut requests, 2 * PAGE_SIZE as u64).unwrap();
        // the second request for the same page misses as it was handed out
        send_pagein_request(&mut requests, 2 * PAGE_SIZE as u64).unwrap();
        let responses = exchange(&mut server, requests);

        let mut conn = Cursor::new(responses);
        let mut page = [0u8; PAGE_SIZE];
        assert_eq!(
            recv_pagein_response(&mut conn, &mut page).unwrap(),
            PageinResponse::Page { addr: 2 * PAGE_SIZE as u64 }
        );
        assert_eq!(page, [3u8; PAGE_SIZE]);
        assert_eq!(recv_pagein_response(&mut conn, &mut page).unwrap(), PageinResponse::Miss);

        assert_eq!(server.stored_pages(), 0);
        let stats = server.stats();
        assert_eq!((stats.pageins, stats.pageouts, stats.misses), (1, 1, 1));
    }

    #[test]
    fn test_pagein_out_of_range_misses() {
        let mut server = get_server(2);

        let mut requests = Vec::new();
        send_pagein_request(&mut requests, 100 * PAGE_SIZE as u64).unwrap();
        send_pagein_request(&mut requests, 3).unwrap();
        let responses = exchange(&mut server, requests);

        let mut conn = Cursor::new(responses);
        let mut page = [0u8; PAGE_SIZE];
        assert_eq!(recv_pagein_response(&mut conn, &mut page).unwrap(), PageinResponse::Miss);
        assert_eq!(recv_pagein_response(&mut conn, &mut page).unwrap(), PageinResponse::Miss);
    }

    #[test]
    fn test_pageout_out_of_range_fails() {
        let mut server = get_server(2);

        let mut requests = Vec::new();
        send_pageout_request(&mut requests, 2 * PAGE_SIZE as u64, &[0u8; PAGE_SIZE]).unwrap();

        let mut duplex = Duplex {
            input: Cursor::new(requests),
            output: Vec::new(),
        };
        assert!(matches!(
            server.serve(&mut duplex),
            Err(RPError::AddressOutOfRange(_))
        ));
    }

    #[test]
    fn test_store_and_load() {
        let mut server = get_server(2);
        server.store_page(PAGE_SIZE as u64, &[8u8; PAGE_SIZE]).unwrap();

        let mut page = [0u8; PAGE_SIZE];
        assert!(server.load_page(PAGE_SIZE as u64, &mut page).unwrap());
        assert_eq!(page, [8u8; PAGE_SIZE]);
        assert!(!server.load_page(0, &mut page).unwrap());

        // loading does not give the page away
        assert!(server.is_stored(PAGE_SIZE as u64));
    }
}
