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

use std::net::{IpAddr, TcpStream};

use log::{debug, info, warn};

use crate::{
    error::RPResult,
    host_routing_table::{HostId, HostRoutingTable, HOST_ID_MAIN},
};

/// Registers every address in `addrs` as a sub-host and returns their ids
pub fn register_sub_hosts<C>(table: &HostRoutingTable<C>, addrs: &[IpAddr]) -> RPResult<Vec<HostId>> {
    addrs
        .iter()
        .map(|addr| table.get_or_create_host_id(*addr))
        .collect()
}

/// Connects to the memory server of every registered sub-host.
///
/// Sub-hosts are visited in id order. A sub-host that cannot be reached is
/// logged and left without connection, so faults on its pages stay
/// unresolved. Returns the number of established connections.
pub fn connect_sub_hosts(table: &HostRoutingTable<TcpStream>, port: u16) -> usize {
    let mut connected = 0;
    let mut host_id = table.get_next_host(HOST_ID_MAIN);

    while table.is_sub(host_id) {
        if let Some(addr) = table.get_host_addr(host_id) {
            match connect(addr, port) {
                Ok(conn) => {
                    debug!("Connected to sub-host {} ({}:{})", host_id, addr, port);
                    if table.set_host_connection(host_id, conn).is_ok() {
                        connected += 1;
                    }
                }
                Err(err) => warn!("Cannot connect to sub-host {} ({}:{}): {}", host_id, addr, port, err),
            }
        }

        host_id = table.get_next_host(host_id);
    }

    info!("Connected to {} sub-host(s)", connected);
    connected
}

fn connect(addr: IpAddr, port: u16) -> std::io::Result<TcpStream> {
    let conn = TcpStream::connect((addr, port))?;
    // requests are small and latency bound
    conn.set_nodelay(true)?;
    Ok(conn)
}
