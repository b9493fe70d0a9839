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
    net::{IpAddr, Ipv4Addr},
    sync::{
        atomic::{AtomicU8, Ordering},
        Mutex, MutexGuard,
    },
};

use log::{debug, error, warn};
use static_assertions::const_assert_eq;

use crate::error::{RPError, RPResult};

/// Small integer identifying a host inside of a [`HostRoutingTable`]
pub type HostId = u8;

/// Number of host ids that can be handed out (including the main host)
pub const MAX_HOST: usize = 255;

/// Fixed alias of the host that currently runs the guest
pub const HOST_ID_MAIN: HostId = 0;

/// Sentinel for "no host", never assigned to a real host
pub const HOST_ID_UNDEF: HostId = 255;

/// Address registered for the main host alias
pub const HOST_ADDR_MAIN: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

const_assert_eq!(HOST_ID_UNDEF as usize, MAX_HOST);

/// Maps guest page frames to the host holding them and host addresses to
/// host ids and their connections.
///
/// The per-frame ownership array is not lock protected. Every entry is a
/// single byte written atomically, so readers never see torn values, but
/// updates of different frames are not ordered with respect to each other.
/// Host id allocation is serialized by `hosts`, and every connection has its
/// own lock so I/O with one sub-host never blocks id allocation.
pub struct HostRoutingTable<C> {
    /// host id for each memory page
    mem_loc: Box<[AtomicU8]>,

    /// host id -> host address
    hosts: Mutex<[Option<IpAddr>; MAX_HOST]>,

    /// host id -> connection to the memory server of that host
    conns: Box<[Mutex<Option<C>>]>,

    /// upper bound for registered sub-hosts
    max_sub_hosts: usize,

    page_size: usize,
}

impl<C> HostRoutingTable<C> {
    /// Creates a table covering `mem_size` bytes of guest memory.
    /// All frames start out as owned by [`HOST_ID_UNDEF`].
    pub fn new(mem_size: usize, page_size: usize) -> Self {
        Self::with_max_sub_hosts(mem_size, page_size, MAX_HOST - 1)
    }

    /// Like [`Self::new`], but at most `max_sub_hosts` sub-hosts can be registered.
    /// Values above `MAX_HOST - 1` are capped.
    pub fn with_max_sub_hosts(mem_size: usize, page_size: usize, max_sub_hosts: usize) -> Self {
        debug_assert!(page_size.is_power_of_two());

        let nr_pfns = mem_size / page_size;
        let mem_loc = (0..nr_pfns)
            .map(|_| AtomicU8::new(HOST_ID_UNDEF))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let mut hosts = [None; MAX_HOST];
        hosts[HOST_ID_MAIN as usize] = Some(HOST_ADDR_MAIN);

        let conns = (0..MAX_HOST)
            .map(|_| Mutex::new(None))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            mem_loc,
            hosts: Mutex::new(hosts),
            conns,
            max_sub_hosts: max_sub_hosts.min(MAX_HOST - 1),
            page_size,
        }
    }

    pub fn max_sub_hosts(&self) -> usize {
        self.max_sub_hosts
    }

    #[inline]
    pub fn nr_pfns(&self) -> usize {
        self.mem_loc.len()
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Size of the guest memory this table was created for
    pub fn mem_size(&self) -> usize {
        self.nr_pfns() * self.page_size
    }

    #[inline]
    fn pfn_of(&self, addr: u64) -> Option<usize> {
        let pfn = (addr / self.page_size as u64) as usize;
        if pfn < self.nr_pfns() {
            Some(pfn)
        } else {
            None
        }
    }

    /// Records that the page containing `addr` is held by `host_id`
    pub fn insert(&self, addr: u64, host_id: HostId) -> RPResult<()> {
        let pfn = match self.pfn_of(addr) {
            Some(pfn) => pfn,
            None => {
                warn!("insert: too large address: {:#x}", addr);
                return Err(RPError::AddressOutOfRange(addr));
            }
        };

        if host_id as usize >= MAX_HOST {
            warn!("insert: invalid host id: {}", host_id);
            return Err(RPError::InvalidHostId(host_id));
        }

        self.mem_loc[pfn].store(host_id, Ordering::Relaxed);
        Ok(())
    }

    /// Returns the host holding the page containing `addr`
    /// or [`HOST_ID_UNDEF`] if `addr` is out of range.
    pub fn search(&self, addr: u64) -> HostId {
        match self.pfn_of(addr) {
            Some(pfn) => self.mem_loc[pfn].load(Ordering::Relaxed),
            None => {
                warn!("search: too large address: {:#x}", addr);
                HOST_ID_UNDEF
            }
        }
    }

    /// Owner lookup by frame number
    #[inline]
    pub fn search_pfn(&self, pfn: usize) -> HostId {
        self.mem_loc
            .get(pfn)
            .map(|loc| loc.load(Ordering::Relaxed))
            .unwrap_or(HOST_ID_UNDEF)
    }

    /// Number of frames currently held by `host_id`
    pub fn count_owned_by(&self, host_id: HostId) -> usize {
        self.mem_loc
            .iter()
            .filter(|loc| loc.load(Ordering::Relaxed) == host_id)
            .count()
    }

    fn lock_hosts(&self) -> MutexGuard<'_, [Option<IpAddr>; MAX_HOST]> {
        // a panic while holding this lock cannot leave the array half written
        self.hosts.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns the id of `host`, allocating a new one if the host is unknown
    pub fn get_or_create_host_id(&self, host: IpAddr) -> RPResult<HostId> {
        let mut hosts = self.lock_hosts();

        if let Some(id) = hosts.iter().position(|h| *h == Some(host)) {
            return Ok(id as HostId);
        }

        let registered = hosts.iter().skip(1).filter(|h| h.is_some()).count();
        if registered >= self.max_sub_hosts {
            error!("get_or_create_host_id: limit of {} sub-hosts reached", self.max_sub_hosts);
            return Err(RPError::HostTableFull);
        }

        // id 0 is always taken by the main host
        if let Some(id) = hosts.iter().skip(1).position(|h| h.is_none()) {
            let id = id + 1;
            hosts[id] = Some(host);
            drop(hosts);

            debug!("Registered host {} with id {}", host, id);
            return Ok(id as HostId);
        }

        error!("get_or_create_host_id: too many hosts");
        Err(RPError::HostTableFull)
    }

    pub fn get_host_addr(&self, host_id: HostId) -> Option<IpAddr> {
        if host_id as usize >= MAX_HOST {
            return None;
        }

        self.lock_hosts()[host_id as usize]
    }

    /// Finds the next sub-host with an id greater than `host_id`
    pub fn get_next_host(&self, host_id: HostId) -> HostId {
        let hosts = self.lock_hosts();

        ((host_id as usize + 1)..MAX_HOST)
            .find(|id| *id != HOST_ID_MAIN as usize && hosts[*id].is_some())
            .map(|id| id as HostId)
            .unwrap_or(HOST_ID_UNDEF)
    }

    /// Iterates over all currently registered sub-hosts in id order
    pub fn sub_hosts(&self) -> Vec<(HostId, IpAddr)> {
        let hosts = self.lock_hosts();

        hosts
            .iter()
            .enumerate()
            .skip(1)
            .filter_map(|(id, addr)| addr.map(|addr| (id as HostId, addr)))
            .collect()
    }

    #[inline]
    pub fn is_main(&self, host_id: HostId) -> bool {
        host_id == HOST_ID_MAIN
    }

    pub fn is_sub(&self, host_id: HostId) -> bool {
        if host_id as usize >= MAX_HOST {
            return false;
        }

        host_id != HOST_ID_MAIN && self.lock_hosts()[host_id as usize].is_some()
    }

    pub fn is_undefined(&self, host_id: HostId) -> bool {
        if host_id as usize >= MAX_HOST {
            return true;
        }

        self.lock_hosts()[host_id as usize].is_none()
    }

    /// Registers the connection for the memory server of `host_id`.
    /// A previously registered connection is returned.
    pub fn set_host_connection(&self, host_id: HostId, conn: C) -> RPResult<Option<C>> {
        let slot = self.conn_slot(host_id)?;
        Ok(lock_slot(slot).replace(conn))
    }

    /// Removes the connection of `host_id` from the table
    pub fn take_host_connection(&self, host_id: HostId) -> Option<C> {
        self.conn_slot(host_id).ok().and_then(|slot| lock_slot(slot).take())
    }

    pub fn has_host_connection(&self, host_id: HostId) -> bool {
        self.conn_slot(host_id)
            .map(|slot| lock_slot(slot).is_some())
            .unwrap_or(false)
    }

    /// Runs `f` with exclusive access to the connection of `host_id`
    pub fn with_host_connection<R, F>(&self, host_id: HostId, f: F) -> RPResult<R>
    where
        F: FnOnce(&mut C) -> RPResult<R>,
    {
        let slot = self.conn_slot(host_id)?;
        let mut guard = lock_slot(slot);

        match guard.as_mut() {
            Some(conn) => f(conn),
            None => Err(RPError::NoConnection(host_id)),
        }
    }

    fn conn_slot(&self, host_id: HostId) -> RPResult<&Mutex<Option<C>>> {
        self.conns.get(host_id as usize).ok_or_else(|| {
            warn!("invalid host id for connection: {}", host_id);
            RPError::InvalidHostId(host_id)
        })
    }

    /// Drops all connections to sub-hosts, without draining them
    pub fn close_all(&self) {
        let mut closed = 0;
        for slot in self.conns.iter() {
            if lock_slot(slot).take().is_some() {
                closed += 1;
            }
        }

        if closed > 0 {
            debug!("Closed {} sub-host connection(s)", closed);
        }
    }
}

fn lock_slot<C>(slot: &Mutex<Option<C>>) -> MutexGuard<'_, Option<C>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<C> Drop for HostRoutingTable<C> {
    fn drop(&mut self) {
        self.close_all();
    }
}
