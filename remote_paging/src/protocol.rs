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

//! Wire format of the exchange between the main host and a memory server.
//!
//! All integers are sent in native byte order:
//!
//! | Message          | Layout                                              |
//! |------------------|-----------------------------------------------------|
//! | pagein request   | `u32` command (2), `u64` address                    |
//! | pagein response  | `u64` address, page bytes (omitted if address is all ones) |
//! | pageout request  | `u32` command (1), `u64` address, page bytes        |
//!
//! Partial reads and writes are retried until the whole message went through.
//! End of stream in the middle of a message fails the exchange.

use std::io::{Read, Write};

use log::trace;
use static_assertions::const_assert_eq;

use crate::error::{RPError, RPResult};

pub const COMMAND_PAGEOUT: u32 = 1;
pub const COMMAND_PAGEIN: u32 = 2;

/// Address sent back if the requested page is not stored at the sub-host
pub const PAGEIN_MISS: u64 = u64::MAX;

const COMMAND_LEN: usize = core::mem::size_of::<u32>();
const ADDR_LEN: usize = core::mem::size_of::<u64>();

/// Length of the fixed part of every request
pub const REQUEST_HEADER_LEN: usize = COMMAND_LEN + ADDR_LEN;

const_assert_eq!(REQUEST_HEADER_LEN, 12);

/// A request as seen by the memory server
#[derive(Debug, PartialEq, Eq)]
pub enum Request {
    Pagein { addr: u64 },
    /// the page bytes were read into the buffer passed to [`recv_request`]
    Pageout { addr: u64 },
}

/// Response to a pagein request as seen by the main host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageinResponse {
    /// page bytes for `addr` were read into the buffer passed to [`recv_pagein_response`]
    Page { addr: u64 },
    /// the sub-host does not hold the page (anymore)
    Miss,
}

fn encode_header(command: u32, addr: u64) -> [u8; REQUEST_HEADER_LEN] {
    let mut header = [0u8; REQUEST_HEADER_LEN];
    header[..COMMAND_LEN].copy_from_slice(&command.to_ne_bytes());
    header[COMMAND_LEN..].copy_from_slice(&addr.to_ne_bytes());
    header
}

fn read_u64<C: Read>(conn: &mut C) -> RPResult<u64> {
    let mut buf = [0u8; ADDR_LEN];
    conn.read_exact(&mut buf)?;
    Ok(u64::from_ne_bytes(buf))
}

pub fn send_pagein_request<C: Write>(conn: &mut C, addr: u64) -> RPResult<()> {
    trace!("pagein request: {:#x}", addr);

    conn.write_all(&encode_header(COMMAND_PAGEIN, addr))?;
    Ok(())
}

/// Receives one pagein response. `page` is only written if the response is not a miss.
pub fn recv_pagein_response<C: Read>(conn: &mut C, page: &mut [u8]) -> RPResult<PageinResponse> {
    let addr = read_u64(conn)?;

    if addr == PAGEIN_MISS {
        trace!("pagein: no page in sub-host");
        return Ok(PageinResponse::Miss);
    }

    conn.read_exact(page)?;
    Ok(PageinResponse::Page { addr })
}

pub fn send_pageout_request<C: Write>(conn: &mut C, addr: u64, page: &[u8]) -> RPResult<()> {
    trace!("pageout request: {:#x}", addr);

    conn.write_all(&encode_header(COMMAND_PAGEOUT, addr))?;
    conn.write_all(page)?;
    Ok(())
}

/// Receives the next request on the memory server side.
///
/// Returns `Ok(None)` if the peer closed the connection between two requests.
pub fn recv_request<C: Read>(conn: &mut C, page: &mut [u8]) -> RPResult<Option<Request>> {
    let mut command = [0u8; COMMAND_LEN];

    // a clean shutdown can only happen before the first byte of a request
    let mut read = 0;
    while read < COMMAND_LEN {
        match conn.read(&mut command[read..]) {
            Ok(0) if read == 0 => return Ok(None),
            Ok(0) => return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into()),
            Ok(n) => read += n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err.into()),
        }
    }

    match u32::from_ne_bytes(command) {
        COMMAND_PAGEIN => {
            let addr = read_u64(conn)?;
            Ok(Some(Request::Pagein { addr }))
        }
        COMMAND_PAGEOUT => {
            let addr = read_u64(conn)?;
            conn.read_exact(page)?;
            Ok(Some(Request::Pageout { addr }))
        }
        other => Err(RPError::UnknownCommand(other)),
    }
}

pub fn send_pagein_response<C: Write>(conn: &mut C, addr: u64, page: &[u8]) -> RPResult<()> {
    conn.write_all(&addr.to_ne_bytes())?;
    conn.write_all(page)?;
    Ok(())
}

pub fn send_pagein_miss<C: Write>(conn: &mut C) -> RPResult<()> {
    conn.write_all(&PAGEIN_MISS.to_ne_bytes())?;
    Ok(())
}

#[cfg(test)]
mod test {
    use std::io::{self, Cursor, Read};

    use super::*;
    use crate::error::RPError;

    const PAGE_SIZE: usize = 64;

    /// Hands out at most `step` bytes per read call
    struct Trickle<R> {
        inner: R,
        step: usize,
    }

    impl<R: Read> Read for Trickle<R> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let len = buf.len().min(self.step);
            self.inner.read(&mut buf[..len])
        }
    }

    #[test]
    fn test_pagein_request_layout() {
        let mut wire = Vec::new();
        send_pagein_request(&mut wire, 0x1234_5000).unwrap();

        assert_eq!(wire.len(), REQUEST_HEADER_LEN);
        assert_eq!(&wire[..4], &COMMAND_PAGEIN.to_ne_bytes());
        assert_eq!(&wire[4..], &0x1234_5000u64.to_ne_bytes());
    }

    #[test]
    fn test_pageout_request_layout() {
        let page = [0xabu8; PAGE_SIZE];
        let mut wire = Vec::new();
        send_pageout_request(&mut wire, 0x2000, &page).unwrap();

        assert_eq!(wire.len(), REQUEST_HEADER_LEN + PAGE_SIZE);
        assert_eq!(&wire[..4], &COMMAND_PAGEOUT.to_ne_bytes());
        assert_eq!(&wire[4..12], &0x2000u64.to_ne_bytes());
        assert!(wire[12..].iter().all(|b| *b == 0xab));
    }

    #[test]
    fn test_pagein_response_with_partial_reads() {
        let mut wire = Vec::new();
        let page: Vec<u8> = (0..PAGE_SIZE as u8).collect();
        send_pagein_response(&mut wire, 0x3000, &page).unwrap();

        let mut conn = Trickle {
            inner: Cursor::new(wire),
            step: 3,
        };
        let mut buf = [0u8; PAGE_SIZE];
        let res = recv_pagein_response(&mut conn, &mut buf).unwrap();

        assert_eq!(res, PageinResponse::Page { addr: 0x3000 });
        assert_eq!(&buf[..], &page[..]);
    }

    #[test]
    fn test_pagein_miss_reads_no_payload() {
        let mut wire = Vec::new();
        send_pagein_miss(&mut wire).unwrap();
        // whatever comes next belongs to the next response
        send_pagein_response(&mut wire, 0x4000, &[7u8; PAGE_SIZE]).unwrap();

        let mut conn = Cursor::new(wire);
        let mut buf = [0u8; PAGE_SIZE];

        assert_eq!(recv_pagein_response(&mut conn, &mut buf).unwrap(), PageinResponse::Miss);
        assert!(buf.iter().all(|b| *b == 0), "miss must not touch the page buffer");

        assert_eq!(
            recv_pagein_response(&mut conn, &mut buf).unwrap(),
            PageinResponse::Page { addr: 0x4000 }
        );
        assert!(buf.iter().all(|b| *b == 7));
    }

    #[test]
    fn test_truncated_response_fails() {
        let mut wire = Vec::new();
        send_pagein_response(&mut wire, 0x5000, &[1u8; PAGE_SIZE]).unwrap();
        wire.truncate(ADDR_LEN + PAGE_SIZE / 2);

        let mut buf = [0u8; PAGE_SIZE];
        let res = recv_pagein_response(&mut Cursor::new(wire), &mut buf);
        assert!(matches!(res, Err(RPError::Transport(_))));
    }

    #[test]
    fn test_recv_request() {
        let mut wire = Vec::new();
        send_pagein_request(&mut wire, 0x1000).unwrap();
        send_pageout_request(&mut wire, 0x2000, &[9u8; PAGE_SIZE]).unwrap();

        let mut conn = Trickle {
            inner: Cursor::new(wire),
            step: 5,
        };
        let mut page = [0u8; PAGE_SIZE];

        assert_eq!(
            recv_request(&mut conn, &mut page).unwrap(),
            Some(Request::Pagein { addr: 0x1000 })
        );
        assert_eq!(
            recv_request(&mut conn, &mut page).unwrap(),
            Some(Request::Pageout { addr: 0x2000 })
        );
        assert!(page.iter().all(|b| *b == 9));

        // clean end of stream
        assert_eq!(recv_request(&mut conn, &mut page).unwrap(), None);
    }

    #[test]
    fn test_recv_unknown_command() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&7u32.to_ne_bytes());
        wire.extend_from_slice(&0u64.to_ne_bytes());

        let mut page = [0u8; PAGE_SIZE];
        assert!(matches!(
            recv_request(&mut Cursor::new(wire), &mut page),
            Err(RPError::UnknownCommand(7))
        ));
    }

    #[test]
    fn test_recv_request_eof_inside_header() {
        let wire = COMMAND_PAGEIN.to_ne_bytes()[..2].to_vec();

        let mut page = [0u8; PAGE_SIZE];
        let res = recv_request(&mut Cursor::new(wire), &mut page);
        assert!(res.unwrap_err().is_disconnect());
    }
}
