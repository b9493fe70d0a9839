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

//! Runs a main host and a memory server in one process and replays a skewed
//! random workload against the paging engine.
//!
//! usage: paging_demo [config.json]

use std::{
    env,
    net::{IpAddr, Ipv4Addr, TcpListener, TcpStream},
    sync::Arc,
    thread,
};

use env_logger::{Builder, Env};
use log::info;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use remote_paging::{
    host_routing_table::HOST_ID_MAIN,
    modules::{
        eviction::Lru8EvictionModule,
        fault_source::ChannelFaultSource,
        guest_memory::{BufferGuestMemoryModule, GuestMemoryModule},
        persistent_storage::RamStorageModule,
    },
    sub_hosts::{connect_sub_hosts, register_sub_hosts},
    AccessHistory, ChunkPlacementPlanner, HostRoutingTable, MemoryServer, PageFaultEngine,
    RPConfig,
};

const SEED: u64 = 5446535461589659585;
const NR_CHUNKS: usize = 64;
const NR_FAULTS: usize = 10_000;

/// Loopback address that differs from the main host's
const SUB_HOST: IpAddr = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2));

fn page_pattern(pfn: usize, page_size: usize) -> Vec<u8> {
    (0..page_size).map(|i| (pfn ^ i) as u8).collect()
}

/// Picks a page, three out of four times from the first eighth of guest memory
fn next_page(rand: &mut SmallRng, nr_pages: usize) -> usize {
    if rand.gen_range(0..4) == 0 {
        rand.gen_range(0..nr_pages)
    } else {
        rand.gen_range(0..nr_pages / 8)
    }
}

fn main() {
    Builder::from_env(Env::default())
        .filter_level(log::LevelFilter::Info)
        .format_module_path(false)
        .init();

    let config = match env::args().nth(1) {
        Some(path) => RPConfig::from_json_file(path).unwrap(),
        None => RPConfig {
            chunk_pages: 64,
            main_pages: 16 * 64,
            server_port: 0,
            ..RPConfig::default()
        },
    };

    let page_size = config.page_size;
    let nr_pages = NR_CHUNKS * config.chunk_pages;
    let mut rand = SmallRng::seed_from_u64(SEED);

    // history as it would be collected while the guest was running
    let mut history = AccessHistory::new(nr_pages);
    for _ in 0..8 {
        let accessed: Vec<bool> = {
            let mut accessed = vec![false; nr_pages];
            for _ in 0..nr_pages / 4 {
                accessed[next_page(&mut rand, nr_pages)] = true;
            }
            accessed
        };
        history.age(|pfn| accessed[pfn]);
    }

    let table: HostRoutingTable<TcpStream> =
        HostRoutingTable::with_max_sub_hosts(nr_pages * page_size, page_size, config.max_sub_hosts);
    let planner = ChunkPlacementPlanner::new(config.chunk_pages, config.placement_order);
    let summary = planner
        .split(&history, config.main_pages, SUB_HOST, &table)
        .unwrap();
    info!("{}", serde_json::to_string(&summary).unwrap());

    // distribute the guest memory as decided by the placement
    let mut memory = BufferGuestMemoryModule::new(nr_pages, page_size);
    let mut server = MemoryServer::new(RamStorageModule::new(nr_pages * page_size), page_size);
    for pfn in 0..nr_pages {
        let addr = (pfn * page_size) as u64;
        if table.search_pfn(pfn) == HOST_ID_MAIN {
            memory.install_page(addr, &page_pattern(pfn, page_size)).unwrap();
        } else {
            server.store_page(addr, &page_pattern(pfn, page_size)).unwrap();
        }
    }

    let listener = TcpListener::bind((SUB_HOST, config.server_port)).unwrap();
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || server.run(listener));

    register_sub_hosts(&table, &[SUB_HOST]).unwrap();
    assert_eq!(connect_sub_hosts(&table, port), 1);

    // the placement already filled the main host, one chunk of slack is left
    let engine_config = RPConfig {
        main_pages: config.chunk_pages,
        ..config
    };
    let engine: PageFaultEngine<_, _, Lru8EvictionModule> =
        PageFaultEngine::new(engine_config, Arc::new(table), memory, history).unwrap();

    let (sender, source) = ChannelFaultSource::channel();
    let handle = engine.spawn(source).unwrap();

    for _ in 0..NR_FAULTS {
        let pfn = next_page(&mut rand, nr_pages);
        sender.send((pfn * page_size) as u64).unwrap();
    }
    drop(sender);

    let engine = handle.join().unwrap().unwrap();
    let resident = (0..nr_pages)
        .filter(|pfn| engine.memory().is_resident(*pfn))
        .count();

    info!("{}", serde_json::to_string(&engine.stats()).unwrap());
    info!(
        "{} of {} pages resident, free-page budget: {}",
        resident,
        nr_pages,
        engine.free_pages()
    );
}
