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
    env,
    net::{Ipv4Addr, TcpListener},
};

use env_logger::{Builder, Env};
use log::{error, info};
use remote_paging::{
    modules::persistent_storage::{
        FilePersistentStorageModule, PersistentStorageModule, RamStorageModule,
    },
    MemoryServer, RPConfig, RPResult,
};

/// Bytes of guest memory a server can hold if `RP_MEMORY_SIZE` is not set
const DEFAULT_MEMORY_SIZE: usize = 256 * 1024 * 1024;

fn serve<S: PersistentStorageModule>(storage: S, config: &RPConfig) -> RPResult<()> {
    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.server_port))?;
    let mut server = MemoryServer::new(storage, config.page_size);
    server.run(listener)
}

fn main() {
    Builder::from_env(Env::default())
        .filter_level(log::LevelFilter::Info)
        .format_module_path(false)
        .init();

    // usage: memory_server [config.json]
    let config = match env::args().nth(1) {
        Some(path) => match RPConfig::from_json_file(&path) {
            Ok(config) => config,
            Err(err) => {
                error!("Cannot load config {}: {}", path, err);
                std::process::exit(1);
            }
        },
        None => RPConfig::default(),
    };

    let memory_size = env::var("RP_MEMORY_SIZE")
        .ok()
        .and_then(|size| size.parse().ok())
        .unwrap_or(DEFAULT_MEMORY_SIZE);

    let res = match env::var("RP_STORAGE_FILE") {
        Ok(path) => {
            info!("Storing up to {} bytes in {}", memory_size, path);
            match FilePersistentStorageModule::new(path, memory_size) {
                Ok(storage) => serve(storage, &config),
                Err(err) => Err(err.into()),
            }
        }
        Err(_) => {
            info!("Storing up to {} bytes in memory", memory_size);
            serve(RamStorageModule::new(memory_size), &config)
        }
    };

    if let Err(err) = res {
        error!("Memory server stopped: {}", err);
        std::process::exit(1);
    }
}
