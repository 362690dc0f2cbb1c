// SPDX-FileCopyrightText: 2025 Contributors to the LiteX M2SDR project.
// SPDX-License-Identifier: Apache-2.0

//! Simulated board for development and testing.
//!
//! [`SimulatedDevice`] implements [`DeviceHandle`] entirely in memory. The
//! host side behaves exactly like the LitePCIe driver (claims, counters,
//! mapping, readiness waits), and the *board* side is driven explicitly by
//! the caller:
//!
//! - [`SimulatedDevice::inject_rx`] plays the DMA writer filling the next RX slot
//! - [`SimulatedDevice::drain_tx`] plays the DMA reader consuming the next TX slot
//!
//! With loopback enabled, every drained TX slot is also injected into the RX
//! ring, like the gateware's loopback path.

use std::{
    collections::HashMap,
    ptr::NonNull,
    sync::{Condvar, Mutex, MutexGuard},
    time::Duration,
};

use tracing::trace;

use crate::{
    DeviceHandle, Direction, DmaCounters, DmaGeometry, DmaInfo, Error, Result,
};

/// Backing memory of one simulated ring.
struct SimRing {
    base: NonNull<u8>,
    len: usize,
    mapped: bool,
}

impl SimRing {
    fn allocate(len: usize) -> Option<Self> {
        if len == 0 {
            return None;
        }
        let memory = vec![0u8; len].into_boxed_slice();
        let base = NonNull::new(Box::into_raw(memory) as *mut u8)?;
        Some(Self {
            base,
            len,
            mapped: false,
        })
    }

    fn write_slot(&mut self, geometry: &DmaGeometry, slot: usize, payload: &[u8]) {
        let len = payload.len().min(geometry.slot_size);
        unsafe {
            let dst = self.base.as_ptr().add(slot * geometry.slot_size);
            std::ptr::copy_nonoverlapping(payload.as_ptr(), dst, len);
            std::ptr::write_bytes(dst.add(len), 0, geometry.slot_size - len);
        }
    }

    fn read_slot(&self, geometry: &DmaGeometry, slot: usize) -> Vec<u8> {
        unsafe {
            let src = self.base.as_ptr().add(slot * geometry.slot_size);
            std::slice::from_raw_parts(src, geometry.slot_size).to_vec()
        }
    }
}

impl Drop for SimRing {
    fn drop(&mut self) {
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.base.as_ptr(),
                self.len,
            )));
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct SimChannel {
    claimed: bool,
    enabled: bool,
    hw_count: u64,
    sw_count: u64,
}

struct SimState {
    rings: [Option<SimRing>; 2],
    channels: [SimChannel; 2],
    loopback: bool,
    csr: HashMap<u32, u32>,
}

/// In-memory model of an M2SDR board.
pub struct SimulatedDevice {
    info: DmaInfo,
    state: Mutex<SimState>,
    progress: Condvar,
}

// Safety: the ring memory is only reached through `state`, which is guarded by
// a mutex, or through the pointers handed to `RingBufferMap`, whose slot
// ownership is arbitrated by the DMA counters exactly as with real hardware.
unsafe impl Send for SimulatedDevice {}
unsafe impl Sync for SimulatedDevice {}

impl Default for SimulatedDevice {
    /// A board with the LitePCIe default ring: 64 slots of 8 KiB per direction.
    fn default() -> Self {
        let geometry = DmaGeometry {
            offset: 0,
            slot_size: 8192,
            slot_count: 64,
        };
        Self::new(geometry, geometry)
    }
}

impl SimulatedDevice {
    /// Creates a simulated board with the given ring geometries.
    ///
    /// A zero-sized geometry is accepted here and rejected when the ring is
    /// mapped, like a misconfigured driver would be.
    pub fn new(rx: DmaGeometry, tx: DmaGeometry) -> Self {
        let tx = DmaGeometry {
            offset: rx.len() as u64,
            ..tx
        };
        Self {
            info: DmaInfo { rx, tx },
            state: Mutex::new(SimState {
                rings: [SimRing::allocate(rx.len()), SimRing::allocate(tx.len())],
                channels: [SimChannel::default(); 2],
                loopback: false,
                csr: HashMap::new(),
            }),
            progress: Condvar::new(),
        }
    }

    /// Creates a board with `slot_count` slots of `slot_size` bytes in both
    /// directions.
    pub fn with_slots(slot_size: usize, slot_count: usize) -> Self {
        let geometry = DmaGeometry {
            offset: 0,
            slot_size,
            slot_count,
        };
        Self::new(geometry, geometry)
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fills the next RX slot with `payload` (zero padded) as the board would.
    ///
    /// Like the gateware, this does not check whether the host has released the
    /// slot: writing more than `slot_count` slots ahead overruns the ring.
    pub fn inject_rx(&self, payload: &[u8]) -> Result<()> {
        let mut state = self.lock();
        Self::inject_rx_locked(&mut state, &self.info.rx, payload)?;
        drop(state);
        self.progress.notify_all();
        Ok(())
    }

    fn inject_rx_locked(state: &mut SimState, geometry: &DmaGeometry, payload: &[u8]) -> Result<()> {
        let channel = state.channels[Direction::Rx.index()];
        if !channel.enabled {
            return Err(Error::invalid_state("RX DMA is not enabled"));
        }
        let slot = (channel.hw_count % geometry.slot_count as u64) as usize;
        let ring = state.rings[Direction::Rx.index()]
            .as_mut()
            .ok_or_else(|| Error::invalid_state("RX ring has no memory"))?;
        ring.write_slot(geometry, slot, payload);
        state.channels[Direction::Rx.index()].hw_count += 1;
        trace!(slot, "Simulated RX slot filled");
        Ok(())
    }

    /// Consumes the next submitted TX slot as the board would.
    ///
    /// Returns `None` when the host has not submitted anything new.
    pub fn drain_tx(&self) -> Result<Option<Vec<u8>>> {
        let mut state = self.lock();
        let channel = state.channels[Direction::Tx.index()];
        if !channel.enabled || channel.hw_count >= channel.sw_count {
            return Ok(None);
        }
        let geometry = self.info.tx;
        let slot = (channel.hw_count % geometry.slot_count as u64) as usize;
        let payload = state.rings[Direction::Tx.index()]
            .as_ref()
            .map(|ring| ring.read_slot(&geometry, slot))
            .ok_or_else(|| Error::invalid_state("TX ring has no memory"))?;
        state.channels[Direction::Tx.index()].hw_count += 1;
        trace!(slot, "Simulated TX slot consumed");
        if state.loopback && state.channels[Direction::Rx.index()].enabled {
            Self::inject_rx_locked(&mut state, &self.info.rx, &payload)?;
        }
        drop(state);
        self.progress.notify_all();
        Ok(Some(payload))
    }

    /// Advances the TX hardware counter without any submitted data, as the
    /// board does when the host falls behind.
    pub fn starve_tx(&self, slots: u64) {
        self.lock().channels[Direction::Tx.index()].hw_count += slots;
        self.progress.notify_all();
    }

    /// Moves the hardware counter backwards. Only useful to exercise the
    /// cursor integrity checks.
    pub fn rewind_hw_count(&self, direction: Direction, slots: u64) {
        let mut state = self.lock();
        let channel = &mut state.channels[direction.index()];
        channel.hw_count = channel.hw_count.saturating_sub(slots);
    }

    /// Returns the counters as the board sees them.
    pub fn counters(&self, direction: Direction) -> DmaCounters {
        let channel = self.lock().channels[direction.index()];
        DmaCounters {
            hw_count: channel.hw_count,
            sw_count: channel.sw_count,
        }
    }

    /// Returns whether the DMA channel of `direction` is claimed.
    pub fn is_claimed(&self, direction: Direction) -> bool {
        self.lock().channels[direction.index()].claimed
    }

    /// Returns whether the DMA channel of `direction` is enabled.
    pub fn is_enabled(&self, direction: Direction) -> bool {
        self.lock().channels[direction.index()].enabled
    }

    /// Returns whether the loopback path is enabled.
    pub fn loopback(&self) -> bool {
        self.lock().loopback
    }

    /// Returns whether the ring of `direction` is currently mapped.
    pub fn is_mapped(&self, direction: Direction) -> bool {
        self.lock().rings[direction.index()]
            .as_ref()
            .is_some_and(|ring| ring.mapped)
    }

    fn is_ready(&self, state: &SimState, direction: Direction) -> bool {
        let channel = state.channels[direction.index()];
        match direction {
            Direction::Rx => channel.hw_count > channel.sw_count,
            Direction::Tx => {
                channel.sw_count.saturating_sub(channel.hw_count)
                    < self.info.tx.slot_count as u64
            }
        }
    }
}

impl DeviceHandle for SimulatedDevice {
    fn dma_info(&self) -> Result<DmaInfo> {
        Ok(self.info)
    }

    fn claim_dma(&self, direction: Direction) -> Result<()> {
        let mut state = self.lock();
        let channel = &mut state.channels[direction.index()];
        if channel.claimed {
            return Err(Error::ResourceBusy(direction));
        }
        channel.claimed = true;
        Ok(())
    }

    fn release_dma(&self, direction: Direction) -> Result<()> {
        self.lock().channels[direction.index()].claimed = false;
        Ok(())
    }

    fn set_loopback(&self, enabled: bool) -> Result<()> {
        self.lock().loopback = enabled;
        Ok(())
    }

    fn set_dma_enabled(&self, direction: Direction, enabled: bool) -> Result<DmaCounters> {
        let mut state = self.lock();
        let channel = &mut state.channels[direction.index()];
        if enabled && !channel.enabled {
            channel.hw_count = 0;
            channel.sw_count = 0;
        }
        channel.enabled = enabled;
        let counters = DmaCounters {
            hw_count: channel.hw_count,
            sw_count: channel.sw_count,
        };
        drop(state);
        self.progress.notify_all();
        Ok(counters)
    }

    fn dma_counters(&self, direction: Direction) -> Result<DmaCounters> {
        Ok(self.counters(direction))
    }

    fn publish_sw_count(&self, direction: Direction, sw_count: u64) -> Result<()> {
        self.lock().channels[direction.index()].sw_count = sw_count;
        self.progress.notify_all();
        Ok(())
    }

    fn map_ring(&self, direction: Direction, geometry: &DmaGeometry) -> Result<NonNull<u8>> {
        if *geometry != self.info.geometry(direction) {
            return Err(Error::Mapping {
                direction,
                reason: format!("requested layout {geometry:?} does not match the device"),
            });
        }
        let mut state = self.lock();
        let ring = state.rings[direction.index()]
            .as_mut()
            .ok_or_else(|| Error::Mapping {
                direction,
                reason: "device reports an empty ring".to_string(),
            })?;
        ring.mapped = true;
        Ok(ring.base)
    }

    unsafe fn unmap_ring(
        &self,
        direction: Direction,
        base: NonNull<u8>,
        len: usize,
    ) -> Result<()> {
        let mut state = self.lock();
        match state.rings[direction.index()].as_mut() {
            Some(ring) if ring.base == base && ring.len == len => {
                ring.mapped = false;
                Ok(())
            }
            _ => Err(Error::Other(format!("{direction} ring was not mapped here"))),
        }
    }

    fn wait_ready(&self, direction: Direction, timeout: Duration) -> Result<bool> {
        let state = self.lock();
        if self.is_ready(&state, direction) {
            return Ok(true);
        }
        let (state, _) = self
            .progress
            .wait_timeout(state, timeout)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(self.is_ready(&state, direction))
    }

    fn wake(&self, _direction: Direction) {
        self.progress.notify_all();
    }

    fn read_csr(&self, addr: u32) -> Result<u32> {
        Ok(self.lock().csr.get(&addr).copied().unwrap_or(0))
    }

    fn write_csr(&self, addr: u32, value: u32) -> Result<()> {
        self.lock().csr.insert(addr, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rx_injection_requires_an_enabled_channel() {
        let device = SimulatedDevice::with_slots(16, 4);
        assert!(device.inject_rx(&[1; 16]).is_err());
        device.set_dma_enabled(Direction::Rx, true).unwrap();
        device.inject_rx(&[1; 16]).unwrap();
        assert_eq!(device.counters(Direction::Rx).hw_count, 1);
    }

    #[test]
    fn tx_drain_only_returns_submitted_slots() {
        let device = SimulatedDevice::with_slots(16, 4);
        device.set_dma_enabled(Direction::Tx, true).unwrap();
        assert!(device.drain_tx().unwrap().is_none());
        device.publish_sw_count(Direction::Tx, 1).unwrap();
        assert_eq!(device.drain_tx().unwrap().unwrap().len(), 16);
        assert!(device.drain_tx().unwrap().is_none());
    }

    #[test]
    fn claims_are_exclusive() {
        let device = SimulatedDevice::default();
        device.claim_dma(Direction::Rx).unwrap();
        assert!(matches!(
            device.claim_dma(Direction::Rx),
            Err(Error::ResourceBusy(Direction::Rx))
        ));
        device.claim_dma(Direction::Tx).unwrap();
        device.release_dma(Direction::Rx).unwrap();
        device.claim_dma(Direction::Rx).unwrap();
    }

    #[test]
    fn mapping_rejects_a_foreign_layout() {
        let device = SimulatedDevice::with_slots(16, 4);
        let wrong = DmaGeometry {
            offset: 0,
            slot_size: 32,
            slot_count: 4,
        };
        assert!(matches!(
            device.map_ring(Direction::Rx, &wrong),
            Err(Error::Mapping { .. })
        ));
    }

    #[test]
    fn wait_times_out_without_progress() {
        let device = SimulatedDevice::with_slots(16, 4);
        device.set_dma_enabled(Direction::Rx, true).unwrap();
        let ready = device
            .wait_ready(Direction::Rx, Duration::from_millis(5))
            .unwrap();
        assert!(!ready);
    }
}
