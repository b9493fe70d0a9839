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

use std::io;

use thiserror::Error;

use crate::host_routing_table::HostId;

pub type RPResult<T> = Result<T, RPError>;

/// Everything that can go wrong while routing, transferring or installing pages.
///
/// Only [`RPError::Fatal`] is unrecoverable. Every other kind aborts the current
/// operation and leaves it to the caller whether to continue.
#[derive(Debug, Error)]
pub enum RPError {
    /// The page frame of this address lies outside of the guest memory.
    #[error("address {0:#x} is outside of the guest memory")]
    AddressOutOfRange(u64),

    /// Host id is the undefined sentinel or larger.
    #[error("invalid host id: {0}")]
    InvalidHostId(HostId),

    /// All sub-host slots are in use.
    #[error("host table is full")]
    HostTableFull,

    /// No connection was registered for this host.
    #[error("no connection to host {0}")]
    NoConnection(HostId),

    /// The owner of a faulting page is neither main nor a known sub-host.
    #[error("page {0:#x} is not owned by any known host")]
    UnknownOwner(u64),

    /// The guest memory module could not resolve the frame.
    #[error("no host page mapped for {0:#x}")]
    PageNotMapped(u64),

    /// Sending or receiving on a sub-host connection failed.
    #[error("transport failure: {0}")]
    Transport(#[from] io::Error),

    /// Peer sent a command that is neither pagein nor pageout.
    #[error("unknown command: {0}")]
    UnknownCommand(u32),

    /// The peer answered with a page we did not ask for.
    #[error("unexpected page in response: expected one of chunk {expected:#x}, got {got:#x}")]
    UnexpectedAddress { expected: u64, got: u64 },

    /// Eviction could not find a chunk that lives on the main host.
    #[error("no evictable chunk on the main host")]
    NoEvictableChunk,

    /// Storage module of the memory server failed.
    #[error("storage failure at offset {0:#x}")]
    Storage(u64),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// A low-level memory primitive failed. Guest memory may be inconsistent.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl RPError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, RPError::Fatal(_))
    }

    /// The remote side went away, as opposed to a malformed exchange.
    pub fn is_disconnect(&self) -> bool {
        match self {
            RPError::Transport(err) => matches!(
                err.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}
