// SPDX-FileCopyrightText: 2025 Contributors to the LiteX M2SDR project.
// SPDX-License-Identifier: Apache-2.0

//! Per-direction DMA engine: channel claim and cursor handshake.
//!
//! The engine keeps a monotonic software cursor and compares it with the
//! hardware counter reported by the device:
//!
//! ```text
//!            RX (board fills, host drains)        TX (host fills, board drains)
//! ready  :   hw - sw > 0                          sw - hw < slot_count
//! slot   :   sw mod slot_count                    sw mod slot_count
//! advance:   sw += 1, publish (slot released)     sw += 1, publish (slot submitted)
//! ```
//!
//! Slots are handed out strictly in ring order. Any observation that would
//! break that order (hardware counter moving backwards, RX ring lapped by the
//! board, advancing a slot that was never polled) is a
//! [`Error::DataIntegrityViolation`].

use std::{sync::Arc, time::Duration};

use tracing::{debug, error, warn};

use crate::{DeviceHandle, Direction, Error, Result};

/// Outcome of [`DmaEngine::poll_ready`] beyond the slot itself.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollEvents {
    /// RX backlog is above half the ring; the host is falling behind.
    pub overflow: bool,
    /// TX hardware counter overtook the software counter: the board ran out
    /// of submitted slots.
    pub underflow: bool,
}

/// Claimed DMA channel of one direction.
pub struct DmaEngine {
    device: Arc<dyn DeviceHandle>,
    direction: Direction,
    slot_count: u64,
    loopback: bool,
    sw_cursor: u64,
    hw_cursor: u64,
    /// Slot handed out by the last successful poll and not yet advanced.
    polled: Option<usize>,
    events: PollEvents,
    claimed: bool,
}

impl DmaEngine {
    /// Claims the DMA channel of `direction` and starts it.
    ///
    /// Loopback is programmed before the channel is enabled. The cursors are
    /// reset to the counters the device reports once enabled.
    ///
    /// # Errors
    ///
    /// [`Error::ResourceBusy`] if the channel is already claimed. Any other
    /// failure releases the claim again before returning.
    pub fn acquire(
        device: Arc<dyn DeviceHandle>,
        direction: Direction,
        slot_count: usize,
        loopback: bool,
    ) -> Result<Self> {
        device.claim_dma(direction)?;
        let mut engine = Self {
            device,
            direction,
            slot_count: slot_count as u64,
            loopback,
            sw_cursor: 0,
            hw_cursor: 0,
            polled: None,
            events: PollEvents::default(),
            claimed: true,
        };
        if let Err(err) = engine.start() {
            engine.release();
            return Err(err);
        }
        debug!(%direction, loopback, cursor = engine.sw_cursor, "DMA engine acquired");
        Ok(engine)
    }

    fn start(&mut self) -> Result<()> {
        if self.slot_count == 0 {
            return Err(Error::integrity(self.direction, "ring has no slots"));
        }
        if self.loopback {
            self.device.set_loopback(true)?;
        }
        // Cycle the channel so stale counters from a previous owner are reset.
        self.device.set_dma_enabled(self.direction, false)?;
        let counters = self.device.set_dma_enabled(self.direction, true)?;
        self.sw_cursor = counters.sw_count;
        self.hw_cursor = counters.hw_count;
        Ok(())
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn loopback(&self) -> bool {
        self.loopback
    }

    /// Software cursor: slots consumed (RX) or submitted (TX) so far.
    pub fn sw_cursor(&self) -> u64 {
        self.sw_cursor
    }

    /// Last hardware counter observed.
    pub fn hw_cursor(&self) -> u64 {
        self.hw_cursor
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count as usize
    }

    /// Slots the host may currently take without waiting.
    pub fn available(&self) -> u64 {
        match self.direction {
            Direction::Rx => self.hw_cursor.saturating_sub(self.sw_cursor),
            Direction::Tx => self
                .slot_count
                .saturating_sub(self.sw_cursor.saturating_sub(self.hw_cursor)),
        }
    }

    /// Returns and clears the overflow/underflow events seen since last call.
    pub fn take_events(&mut self) -> PollEvents {
        std::mem::take(&mut self.events)
    }

    /// Returns the next slot the host owns, without blocking.
    ///
    /// Polling again before [`Self::advance`] returns the same slot.
    pub fn poll_ready(&mut self) -> Result<Option<usize>> {
        if !self.claimed {
            return Err(Error::invalid_state(format!(
                "{} DMA engine was released",
                self.direction
            )));
        }
        if let Some(slot) = self.polled {
            return Ok(Some(slot));
        }
        let counters = self.device.dma_counters(self.direction)?;
        if counters.hw_count < self.hw_cursor {
            return Err(Error::integrity(
                self.direction,
                format!(
                    "hardware counter went back from {} to {}",
                    self.hw_cursor, counters.hw_count
                ),
            ));
        }
        self.hw_cursor = counters.hw_count;

        let ready = match self.direction {
            Direction::Rx => {
                let pending = self.hw_cursor.saturating_sub(self.sw_cursor);
                if pending > self.slot_count {
                    return Err(Error::integrity(
                        self.direction,
                        format!(
                            "ring overrun: {pending} slots pending in a ring of {}",
                            self.slot_count
                        ),
                    ));
                }
                if pending > self.slot_count / 2 && !self.events.overflow {
                    warn!(direction = %self.direction, pending, "RX backlog above half the ring");
                    self.events.overflow = true;
                }
                pending > 0
            }
            Direction::Tx => {
                if self.hw_cursor > self.sw_cursor {
                    if !self.events.underflow {
                        warn!(
                            direction = %self.direction,
                            missing = self.hw_cursor - self.sw_cursor,
                            "TX underflow"
                        );
                    }
                    self.events.underflow = true;
                }
                self.sw_cursor.saturating_sub(self.hw_cursor) < self.slot_count
            }
        };

        if ready {
            let slot = (self.sw_cursor % self.slot_count) as usize;
            self.polled = Some(slot);
            Ok(Some(slot))
        } else {
            Ok(None)
        }
    }

    /// Consumes (RX) or submits (TX) the slot returned by the last poll.
    ///
    /// # Errors
    ///
    /// [`Error::DataIntegrityViolation`] if no slot is currently polled.
    pub fn advance(&mut self) -> Result<()> {
        if self.polled.take().is_none() {
            return Err(Error::integrity(
                self.direction,
                format!("advance at cursor {} without a ready slot", self.sw_cursor),
            ));
        }
        self.sw_cursor += 1;
        self.device
            .publish_sw_count(self.direction, self.sw_cursor)
    }

    /// Blocks until the device signals progress or `timeout` elapses.
    ///
    /// Does not poll the counters; callers follow up with [`Self::poll_ready`].
    pub fn wait(&self, timeout: Duration) -> Result<bool> {
        self.device.wait_ready(self.direction, timeout)
    }

    /// Returns `true` while the channel is claimed.
    pub fn is_claimed(&self) -> bool {
        self.claimed
    }

    /// Stops the channel and releases the claim. Safe to call repeatedly.
    pub fn release(&mut self) {
        if !self.claimed {
            return;
        }
        self.claimed = false;
        self.polled = None;
        if let Err(err) = self.device.set_dma_enabled(self.direction, false) {
            error!(direction = %self.direction, "Failed to disable DMA: {:?}", err);
        }
        if self.loopback
            && let Err(err) = self.device.set_loopback(false)
        {
            error!(direction = %self.direction, "Failed to clear loopback: {:?}", err);
        }
        if let Err(err) = self.device.release_dma(self.direction) {
            error!(direction = %self.direction, "Failed to release DMA: {:?}", err);
        }
        debug!(direction = %self.direction, cursor = self.sw_cursor, "DMA engine released");
    }
}

impl Drop for DmaEngine {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SimulatedDevice;

    fn rx_engine(slots: usize) -> (Arc<SimulatedDevice>, DmaEngine) {
        let sim = Arc::new(SimulatedDevice::with_slots(16, slots));
        let engine = DmaEngine::acquire(sim.clone(), Direction::Rx, slots, false).unwrap();
        (sim, engine)
    }

    #[test]
    fn second_acquire_is_busy() {
        let (sim, _engine) = rx_engine(4);
        let err = DmaEngine::acquire(sim.clone(), Direction::Rx, 4, false)
            .err()
            .unwrap();
        assert!(matches!(err, Error::ResourceBusy(Direction::Rx)));
        // The other direction is independent.
        DmaEngine::acquire(sim, Direction::Tx, 4, false).unwrap();
    }

    #[test]
    fn rx_cursor_follows_filled_slots() {
        let (sim, mut engine) = rx_engine(4);
        assert_eq!(engine.poll_ready().unwrap(), None);
        for _ in 0..6 {
            sim.inject_rx(&[0; 16]).unwrap();
            let slot = engine.poll_ready().unwrap().unwrap();
            assert_eq!(slot as u64, engine.sw_cursor() % 4);
            engine.advance().unwrap();
        }
        assert_eq!(engine.sw_cursor(), 6);
        assert_eq!(sim.counters(Direction::Rx).sw_count, 6);
        assert_eq!(engine.poll_ready().unwrap(), None);
    }

    #[test]
    fn polling_twice_returns_the_same_slot() {
        let (sim, mut engine) = rx_engine(4);
        sim.inject_rx(&[0; 16]).unwrap();
        sim.inject_rx(&[0; 16]).unwrap();
        assert_eq!(engine.poll_ready().unwrap(), Some(0));
        assert_eq!(engine.poll_ready().unwrap(), Some(0));
        engine.advance().unwrap();
        assert_eq!(engine.poll_ready().unwrap(), Some(1));
    }

    #[test]
    fn advancing_without_a_slot_is_an_integrity_violation() {
        let (_sim, mut engine) = rx_engine(4);
        assert!(matches!(
            engine.advance(),
            Err(Error::DataIntegrityViolation { .. })
        ));
        assert_eq!(engine.sw_cursor(), 0);
    }

    #[test]
    fn rx_overrun_aborts() {
        let (sim, mut engine) = rx_engine(4);
        for _ in 0..5 {
            sim.inject_rx(&[0; 16]).unwrap();
        }
        assert!(matches!(
            engine.poll_ready(),
            Err(Error::DataIntegrityViolation { .. })
        ));
    }

    #[test]
    fn rx_backlog_raises_overflow_event() {
        let (sim, mut engine) = rx_engine(4);
        for _ in 0..3 {
            sim.inject_rx(&[0; 16]).unwrap();
        }
        engine.poll_ready().unwrap();
        assert!(engine.take_events().overflow);
        assert!(!engine.take_events().overflow);
    }

    #[test]
    fn hardware_regression_aborts() {
        let (sim, mut engine) = rx_engine(4);
        sim.inject_rx(&[0; 16]).unwrap();
        sim.inject_rx(&[0; 16]).unwrap();
        engine.poll_ready().unwrap();
        engine.advance().unwrap();
        sim.rewind_hw_count(Direction::Rx, 2);
        assert!(matches!(
            engine.poll_ready(),
            Err(Error::DataIntegrityViolation { .. })
        ));
    }

    #[test]
    fn tx_blocks_when_ring_is_full() {
        let sim = Arc::new(SimulatedDevice::with_slots(16, 2));
        let mut engine = DmaEngine::acquire(sim.clone(), Direction::Tx, 2, false).unwrap();
        for expected in [0, 1] {
            assert_eq!(engine.poll_ready().unwrap(), Some(expected));
            engine.advance().unwrap();
        }
        assert_eq!(engine.poll_ready().unwrap(), None);
        sim.drain_tx().unwrap().unwrap();
        assert_eq!(engine.poll_ready().unwrap(), Some(0));
    }

    #[test]
    fn tx_underflow_keeps_the_cursor() {
        let sim = Arc::new(SimulatedDevice::with_slots(16, 4));
        let mut engine = DmaEngine::acquire(sim.clone(), Direction::Tx, 4, false).unwrap();
        sim.starve_tx(3);
        assert_eq!(engine.poll_ready().unwrap(), Some(0));
        assert!(engine.take_events().underflow);
        assert_eq!(engine.sw_cursor(), 0);
    }

    #[test]
    #[tracing_test::traced_test]
    fn tx_underflow_is_logged_once() {
        let sim = Arc::new(SimulatedDevice::with_slots(16, 4));
        let mut engine = DmaEngine::acquire(sim.clone(), Direction::Tx, 4, false).unwrap();
        sim.starve_tx(3);
        // Each poll after an advance re-reads the counters, which stay ahead.
        for slot in 0..2 {
            assert_eq!(engine.poll_ready().unwrap(), Some(slot));
            engine.advance().unwrap();
        }
        assert_eq!(engine.poll_ready().unwrap(), Some(2));
        assert!(engine.take_events().underflow);
        assert!(logs_contain("TX underflow"));
        logs_assert(|lines: &[&str]| {
            match lines.iter().filter(|line| line.contains("TX underflow")).count() {
                1 => Ok(()),
                n => Err(format!("expected one underflow record, got {n}")),
            }
        });
    }

    #[test]
    fn release_is_idempotent_and_frees_the_channel() {
        let (sim, mut engine) = rx_engine(4);
        engine.release();
        engine.release();
        assert!(!sim.is_claimed(Direction::Rx));
        assert!(!sim.is_enabled(Direction::Rx));
        assert!(matches!(
            engine.poll_ready(),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn loopback_is_set_and_cleared() {
        let sim = Arc::new(SimulatedDevice::with_slots(16, 4));
        let engine = DmaEngine::acquire(sim.clone(), Direction::Tx, 4, true).unwrap();
        assert!(sim.loopback());
        drop(engine);
        assert!(!sim.loopback());
    }
}
