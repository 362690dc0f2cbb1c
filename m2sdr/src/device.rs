// SPDX-FileCopyrightText: 2025 Contributors to the LiteX M2SDR project.
// SPDX-License-Identifier: Apache-2.0

//! Device transport abstraction.
//!
//! [`DeviceHandle`] is the only way the streaming core talks to hardware: DMA
//! geometry queries, channel claims, counter exchange, ring mapping,
//! readiness waits and CSR access. Two transports implement it:
//!
//! - [`LitePcieDevice`]: the LitePCIe character device of a real board
//! - [`SimulatedDevice`]: an in-process model of the DMA rings
//!
//! Every consumer receives the transport explicitly as an
//! `Arc<dyn DeviceHandle>`; there is no process-wide device state.

pub mod litepcie;
pub mod sim;

use std::{fmt, ptr::NonNull, time::Duration};

use crate::Result;

pub use litepcie::LitePcieDevice;
pub use sim::SimulatedDevice;

/// Stream direction, seen from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Board to host. Served by the LitePCIe DMA *writer*.
    Rx,
    /// Host to board. Served by the LitePCIe DMA *reader*.
    Tx,
}

impl Direction {
    /// Both directions, RX first.
    pub const ALL: [Direction; 2] = [Direction::Rx, Direction::Tx];

    pub(crate) fn index(self) -> usize {
        match self {
            Direction::Rx => 0,
            Direction::Tx => 1,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Rx => f.write_str("RX"),
            Direction::Tx => f.write_str("TX"),
        }
    }
}

/// Layout of one direction's DMA ring inside the device's mmap space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaGeometry {
    /// mmap offset of the first slot.
    pub offset: u64,
    /// Size of one slot in bytes.
    pub slot_size: usize,
    /// Number of slots in the ring.
    pub slot_count: usize,
}

impl DmaGeometry {
    /// Total number of bytes covered by the ring.
    pub fn len(&self) -> usize {
        self.slot_size * self.slot_count
    }

    /// Returns `true` if the ring holds no bytes at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// DMA ring geometry for both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaInfo {
    pub rx: DmaGeometry,
    pub tx: DmaGeometry,
}

impl DmaInfo {
    pub fn geometry(&self, direction: Direction) -> DmaGeometry {
        match direction {
            Direction::Rx => self.rx,
            Direction::Tx => self.tx,
        }
    }
}

/// Buffer counters of one DMA channel.
///
/// Both counters only ever grow. For RX, `hw_count` is the number of slots the
/// board has filled and `sw_count` the number the host has released. For TX,
/// `hw_count` is the number of slots the board has consumed and `sw_count` the
/// number the host has submitted.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DmaCounters {
    pub hw_count: u64,
    pub sw_count: u64,
}

/// Transport to an M2SDR board.
///
/// Implementations must be shareable between the control plane and every
/// stream of the device.
pub trait DeviceHandle: Send + Sync {
    /// Queries the DMA ring geometry.
    fn dma_info(&self) -> Result<DmaInfo>;

    /// Claims exclusive use of the DMA channel of `direction`.
    ///
    /// Fails with [`crate::Error::ResourceBusy`] if it is already claimed.
    fn claim_dma(&self, direction: Direction) -> Result<()>;

    /// Releases a claim taken with [`Self::claim_dma`]. Releasing an unclaimed
    /// channel is not an error.
    fn release_dma(&self, direction: Direction) -> Result<()>;

    /// Routes TX ring content back into the RX ring inside the board.
    fn set_loopback(&self, enabled: bool) -> Result<()>;

    /// Enables or disables the DMA channel and returns its counters.
    fn set_dma_enabled(&self, direction: Direction, enabled: bool) -> Result<DmaCounters>;

    /// Reads the current counters of the DMA channel.
    fn dma_counters(&self, direction: Direction) -> Result<DmaCounters>;

    /// Publishes the software counter: slots released (RX) or submitted (TX).
    fn publish_sw_count(&self, direction: Direction, sw_count: u64) -> Result<()>;

    /// Maps the ring of `direction` into the process.
    ///
    /// The returned pointer covers `geometry.len()` bytes and stays valid until
    /// [`Self::unmap_ring`] is called with it.
    fn map_ring(&self, direction: Direction, geometry: &DmaGeometry) -> Result<NonNull<u8>>;

    /// Unmaps a ring returned by [`Self::map_ring`].
    ///
    /// # Safety
    ///
    /// `base` and `len` must come from a successful `map_ring` call on this
    /// device and no reference into the ring may outlive this call.
    unsafe fn unmap_ring(&self, direction: Direction, base: NonNull<u8>, len: usize)
    -> Result<()>;

    /// Blocks until the channel signals progress or `timeout` elapses.
    ///
    /// Returns `Ok(false)` on timeout. Spurious wake-ups are allowed.
    fn wait_ready(&self, direction: Direction, timeout: Duration) -> Result<bool>;

    /// Wakes threads blocked in [`Self::wait_ready`], if the transport can.
    fn wake(&self, _direction: Direction) {}

    /// Reads a 32-bit CSR.
    fn read_csr(&self, addr: u32) -> Result<u32>;

    /// Writes a 32-bit CSR.
    fn write_csr(&self, addr: u32, value: u32) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_length() {
        let geometry = DmaGeometry {
            offset: 0,
            slot_size: 8192,
            slot_count: 256,
        };
        assert_eq!(geometry.len(), 2 * 1024 * 1024);
        assert!(!geometry.is_empty());
    }

    #[test]
    fn direction_indices_are_distinct() {
        assert_eq!(Direction::Rx.index(), 0);
        assert_eq!(Direction::Tx.index(), 1);
        assert_eq!(Direction::Rx.to_string(), "RX");
    }
}
