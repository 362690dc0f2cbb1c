// SPDX-FileCopyrightText: 2025 Contributors to the LiteX M2SDR project.
// SPDX-License-Identifier: Apache-2.0

//! Memory mapping of the DMA rings.
//!
//! A [`RingBufferMap`] owns the mapping of one direction's ring: `slot_count`
//! slots of `slot_size` bytes shared with the board. It is created once per
//! device open and shared (behind an `Arc`) by every stream of that
//! direction. The mapping is released when the last reference is dropped.

use std::{fmt, ptr::NonNull, sync::Arc};

use tracing::{debug, error};

use crate::{DeviceHandle, Direction, DmaGeometry, Error, Result};

/// Mapping of one direction's DMA ring.
pub struct RingBufferMap {
    device: Arc<dyn DeviceHandle>,
    direction: Direction,
    geometry: DmaGeometry,
    base: NonNull<u8>,
}

// Safety: the mapping itself is plain shared memory. Access to individual
// slots is arbitrated by the DMA engine's cursor protocol, which hands each
// slot to at most one owner at a time.
unsafe impl Send for RingBufferMap {}
unsafe impl Sync for RingBufferMap {}

impl RingBufferMap {
    /// Maps the ring of `direction` using the geometry reported by the device.
    ///
    /// # Errors
    ///
    /// [`Error::Mapping`] if the reported slot size or slot count is zero, or
    /// if the device fails to map the region.
    pub fn map(device: Arc<dyn DeviceHandle>, direction: Direction) -> Result<Self> {
        let geometry = device.dma_info()?.geometry(direction);
        if geometry.slot_size == 0 || geometry.slot_count == 0 {
            return Err(Error::Mapping {
                direction,
                reason: format!(
                    "device reports {} slots of {} bytes",
                    geometry.slot_count, geometry.slot_size
                ),
            });
        }
        let base = device.map_ring(direction, &geometry)?;
        debug!(
            %direction,
            slot_size = geometry.slot_size,
            slot_count = geometry.slot_count,
            "Mapped DMA ring"
        );
        Ok(Self {
            device,
            direction,
            geometry,
            base,
        })
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Size of one slot in bytes.
    pub fn slot_size(&self) -> usize {
        self.geometry.slot_size
    }

    /// Number of slots in the ring.
    pub fn slot_count(&self) -> usize {
        self.geometry.slot_count
    }

    pub fn geometry(&self) -> &DmaGeometry {
        &self.geometry
    }

    fn slot_ptr(&self, index: usize) -> Result<*mut u8> {
        if index >= self.geometry.slot_count {
            return Err(Error::integrity(
                self.direction,
                format!(
                    "slot {index} outside a ring of {} slots",
                    self.geometry.slot_count
                ),
            ));
        }
        Ok(unsafe { self.base.as_ptr().add(index * self.geometry.slot_size) })
    }

    /// Returns the bytes of slot `index`.
    ///
    /// # Safety
    ///
    /// The caller must own the slot through the DMA engine (it was returned by
    /// a poll and not yet advanced), so the board does not write it meanwhile.
    pub(crate) unsafe fn slot(&self, index: usize) -> Result<&[u8]> {
        let ptr = self.slot_ptr(index)?;
        Ok(unsafe { std::slice::from_raw_parts(ptr, self.geometry.slot_size) })
    }

    /// Returns the bytes of slot `index` for writing.
    ///
    /// # Safety
    ///
    /// Same ownership requirement as [`Self::slot`]; additionally no other
    /// reference to the same slot may be alive.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn slot_mut(&self, index: usize) -> Result<&mut [u8]> {
        let ptr = self.slot_ptr(index)?;
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr, self.geometry.slot_size) })
    }
}

impl fmt::Debug for RingBufferMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBufferMap")
            .field("direction", &self.direction)
            .field("geometry", &self.geometry)
            .finish()
    }
}

impl Drop for RingBufferMap {
    /// Unmaps the ring.
    fn drop(&mut self) {
        let result = unsafe {
            self.device
                .unmap_ring(self.direction, self.base, self.geometry.len())
        };
        match result {
            Ok(()) => debug!(direction = %self.direction, "Unmapped DMA ring"),
            Err(err) => error!(
                direction = %self.direction,
                "Failed to unmap DMA ring: {:?}", err
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SimulatedDevice;

    #[test]
    fn maps_the_reported_geometry() {
        let sim = Arc::new(SimulatedDevice::with_slots(64, 8));
        let ring = RingBufferMap::map(sim.clone(), Direction::Rx).unwrap();
        assert_eq!(ring.slot_size(), 64);
        assert_eq!(ring.slot_count(), 8);
        assert!(sim.is_mapped(Direction::Rx));
        drop(ring);
        assert!(!sim.is_mapped(Direction::Rx));
    }

    #[test]
    fn zero_geometry_is_a_mapping_error() {
        let sim = Arc::new(SimulatedDevice::with_slots(64, 0));
        let err = RingBufferMap::map(sim, Direction::Tx).unwrap_err();
        assert!(matches!(
            err,
            Error::Mapping {
                direction: Direction::Tx,
                ..
            }
        ));
    }

    #[test]
    fn out_of_range_slots_are_rejected() {
        let sim = Arc::new(SimulatedDevice::with_slots(64, 4));
        let ring = RingBufferMap::map(sim, Direction::Rx).unwrap();
        assert!(unsafe { ring.slot(3) }.is_ok());
        assert!(matches!(
            unsafe { ring.slot(4) },
            Err(Error::DataIntegrityViolation { .. })
        ));
    }
}
