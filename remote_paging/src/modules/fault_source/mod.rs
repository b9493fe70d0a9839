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

use std::sync::mpsc::{self, Receiver, Sender};

use crate::error::RPResult;

/// Delivers faulting guest addresses, one at a time
pub trait FaultSourceModule {
    /// Blocks until the next fault arrives.
    ///
    /// Returns `Ok(None)` once no more faults will be delivered.
    fn wait_fault(&mut self) -> RPResult<Option<u64>>;
}

/// Fault source fed through a channel, e.g. by a workload generator or by a
/// thread translating kernel fault events into guest addresses.
pub struct ChannelFaultSource {
    receiver: Receiver<u64>,
}

impl ChannelFaultSource {
    /// Creates a source together with the sender used to report faults.
    /// Dropping every sender ends the source.
    pub fn channel() -> (Sender<u64>, Self) {
        let (sender, receiver) = mpsc::channel();
        (sender, Self { receiver })
    }
}

impl FaultSourceModule for ChannelFaultSource {
    fn wait_fault(&mut self) -> RPResult<Option<u64>> {
        Ok(self.receiver.recv().ok())
    }
}
