// SPDX-FileCopyrightText: 2025 Contributors to the LiteX M2SDR project.
// SPDX-License-Identifier: Apache-2.0

//! RAII guards for zero-copy access to ring slots.

use tracing::{debug, error};

use crate::{
    Error, Result,
    stream::{StreamFlags, StreamStats, session::Active},
};

/// A filled RX slot lent by [`crate::StreamSession::acquire_read_buffer`].
///
/// The bytes are raw wire samples in the stream's sample mode. The slot goes
/// back to the board when the guard is released or dropped.
pub struct RxSlot<'a> {
    active: &'a mut Active,
    stats: &'a mut StreamStats,
    bytes: &'a [u8],
    index: usize,
    flags: StreamFlags,
    time_ns: i64,
    released: bool,
}

impl<'a> RxSlot<'a> {
    pub(super) fn new(
        active: &'a mut Active,
        stats: &'a mut StreamStats,
        bytes: &'a [u8],
        index: usize,
        flags: StreamFlags,
        time_ns: i64,
    ) -> Self {
        Self {
            active,
            stats,
            bytes,
            index,
            flags,
            time_ns,
            released: false,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        self.bytes
    }

    /// Ring index of the slot.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Samples per channel in the slot.
    pub fn samples(&self) -> usize {
        self.active.mtu
    }

    pub fn flags(&self) -> StreamFlags {
        self.flags
    }

    /// Time of the first sample, valid with [`StreamFlags::HAS_TIME`].
    pub fn time_ns(&self) -> i64 {
        self.time_ns
    }

    /// Decodes the slot into per-channel sample vectors.
    pub fn decode(&self) -> Vec<Vec<num_complex::Complex32>> {
        self.active.codec.decode(self.bytes)
    }

    /// Hands the slot back to the board.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        self.active.engine.advance()?;
        self.active.sample_count += self.active.mtu as u64;
        self.stats.slots += 1;
        self.stats.samples += self.active.mtu as u64;
        Ok(())
    }
}

impl Drop for RxSlot<'_> {
    fn drop(&mut self) {
        if !self.released
            && let Err(err) = self.finish()
        {
            error!("Failed to release RX slot {} on drop: {:?}", self.index, err);
        }
    }
}

/// A free TX slot lent by [`crate::StreamSession::acquire_write_buffer`].
///
/// Fill [`Self::bytes_mut`] with raw wire samples and [`Self::commit`]. A
/// guard dropped without commit sends nothing; the same slot is lent again
/// by the next acquisition.
pub struct TxSlot<'a> {
    active: &'a mut Active,
    stats: &'a mut StreamStats,
    bytes: &'a mut [u8],
    index: usize,
    committed: bool,
}

impl<'a> TxSlot<'a> {
    pub(super) fn new(
        active: &'a mut Active,
        stats: &'a mut StreamStats,
        bytes: &'a mut [u8],
        index: usize,
    ) -> Self {
        Self {
            active,
            stats,
            bytes,
            index,
            committed: false,
        }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut *self.bytes
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Samples per channel the slot can carry.
    pub fn samples(&self) -> usize {
        self.active.mtu
    }

    /// Encodes per-channel samples at the start of the slot. Returns the
    /// number of samples written per channel.
    pub fn encode(&mut self, inputs: &[&[num_complex::Complex32]]) -> Result<usize> {
        self.active.codec.encode_into(inputs, 0, &mut *self.bytes)
    }

    /// Submits the first `samples` samples of the slot; the rest is zeroed.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArg`] if `samples` exceeds [`Self::samples`].
    pub fn commit(mut self, samples: usize) -> Result<()> {
        if samples > self.active.mtu {
            return Err(Error::InvalidArg(format!(
                "{samples} samples in a slot of {}",
                self.active.mtu
            )));
        }
        let start = samples * self.active.codec.frame_size();
        self.bytes[start..].fill(0);
        self.committed = true;
        self.active.engine.advance()?;
        self.active.sample_count += samples as u64;
        self.stats.slots += 1;
        self.stats.samples += samples as u64;
        Ok(())
    }
}

impl Drop for TxSlot<'_> {
    fn drop(&mut self) {
        if !self.committed {
            debug!(slot = self.index, "Discarding uncommitted TX slot");
        }
    }
}
