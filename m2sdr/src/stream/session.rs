// SPDX-FileCopyrightText: 2025 Contributors to the LiteX M2SDR project.
// SPDX-License-Identifier: Apache-2.0

//! Stream session: the setup/activate/read/write/deactivate/close contract.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use num_complex::Complex32;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::{
    Direction, Error, Result, SampleCodec,
    config::StreamArgs,
    dma::DmaEngine,
    instance::DeviceContext,
    ring::RingBufferMap,
    stream::{
        FORMAT_CF32, ReadResult, RxSlot, StreamCanceller, StreamFlags, StreamState, StreamStats,
        TxSlot, WriteResult,
    },
};

/// Parameters of an activation, compared when activating twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Activation {
    flags: StreamFlags,
    time_ns: i64,
    num_elems: usize,
}

/// Resources held while the stream is active.
pub(super) struct Active {
    pub(super) engine: DmaEngine,
    pub(super) codec: SampleCodec,
    params: Activation,
    /// Samples per channel in one slot.
    pub(super) mtu: usize,
    /// Samples already consumed from (RX) or written into (TX) the polled slot.
    pub(super) slot_offset: usize,
    sample_rate: f64,
    time_base_ns: i64,
    /// Samples per channel moved since activation.
    pub(super) sample_count: u64,
}

impl Active {
    /// Timestamp of the next sample, if the sample rate is known.
    pub(super) fn time_ns(&self) -> Option<i64> {
        (self.sample_rate > 0.0).then(|| {
            self.time_base_ns + (self.sample_count as f64 * 1e9 / self.sample_rate).round() as i64
        })
    }

    /// Turns pending engine events into result flags and statistics.
    pub(super) fn collect_events(&mut self, stats: &mut StreamStats) -> StreamFlags {
        let events = self.engine.take_events();
        let mut flags = StreamFlags::NONE;
        if events.overflow {
            stats.overflows += 1;
            flags |= StreamFlags::OVERFLOW;
        }
        if events.underflow {
            stats.underflows += 1;
            flags |= StreamFlags::UNDERFLOW;
        }
        flags
    }
}

/// Waits for the engine's next slot until `deadline`.
///
/// The wait is sliced by `poll_interval` so that a cancellation request is
/// noticed even when the transport cannot be woken.
fn next_slot(
    engine: &mut DmaEngine,
    cancel: &AtomicBool,
    deadline: Instant,
    poll_interval: Duration,
) -> Result<usize> {
    loop {
        if cancel.load(Ordering::Acquire) {
            return Err(Error::Cancelled);
        }
        if let Some(slot) = engine.poll_ready()? {
            return Ok(slot);
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(Error::Timeout);
        }
        engine.wait((deadline - now).min(poll_interval))?;
    }
}

/// Checks that every channel buffer has the same length and returns it.
fn common_len(lens: impl Iterator<Item = usize>) -> Result<usize> {
    let mut common = None;
    for len in lens {
        match common {
            None => common = Some(len),
            Some(expected) if expected != len => {
                return Err(Error::InvalidArg(format!(
                    "channel buffers differ in length ({expected} and {len})"
                )));
            }
            Some(_) => {}
        }
    }
    Ok(common.unwrap_or(0))
}

/// Puts per-channel buffers, given in the order of `channels`, into wire
/// order: channel 0 first.
fn wire_order<T>(channels: &[usize], buffers: impl Iterator<Item = T>) -> Vec<T> {
    let mut tagged: Vec<(usize, T)> = channels.iter().copied().zip(buffers).collect();
    tagged.sort_by_key(|(channel, _)| *channel);
    tagged.into_iter().map(|(_, buffer)| buffer).collect()
}

/// A stream of one direction, created by [`crate::M2sdrDevice::setup_stream`].
///
/// Only one session per direction can be active at a time; the exclusivity is
/// the DMA channel claim taken in [`Self::activate`]. A session is used from
/// one thread; [`Self::canceller`] hands out the only thread-safe part.
///
/// # Examples
///
/// ```
/// use std::{sync::Arc, time::Duration};
/// use m2sdr::{Direction, M2sdrDevice, SimulatedDevice, StreamFlags};
/// use num_complex::Complex32;
///
/// # fn main() -> Result<(), m2sdr::Error> {
/// let sim = Arc::new(SimulatedDevice::with_slots(1024, 8));
/// let device = M2sdrDevice::simulated(sim.clone())?;
///
/// let mut rx = device.setup_stream(Direction::Rx, "CF32", &[0], &Default::default())?;
/// rx.activate(StreamFlags::NONE, 0, 0)?;
/// sim.inject_rx(&[0u8; 1024])?;
///
/// let mut samples = vec![Complex32::default(); 256];
/// let result = rx.read(&mut [samples.as_mut_slice()], Duration::from_millis(100))?;
/// assert_eq!(result.elements, 256);
/// rx.close()?;
/// # Ok(())
/// # }
/// ```
pub struct StreamSession {
    id: Uuid,
    context: Arc<DeviceContext>,
    ring: Option<Arc<RingBufferMap>>,
    direction: Direction,
    channels: Vec<usize>,
    args: StreamArgs,
    state: StreamState,
    active: Option<Active>,
    cancel: Arc<AtomicBool>,
    stats: StreamStats,
}

impl StreamSession {
    /// Validates the request and creates the session. No hardware access.
    pub(crate) fn new(
        context: Arc<DeviceContext>,
        direction: Direction,
        format: &str,
        channels: &[usize],
        args: StreamArgs,
    ) -> Result<Self> {
        if format != FORMAT_CF32 {
            return Err(Error::UnsupportedFormat(format.to_string()));
        }
        args.validate()?;
        let channels = if channels.is_empty() {
            vec![0, 1]
        } else {
            channels.to_vec()
        };
        for (n, &channel) in channels.iter().enumerate() {
            if channel > 1 || channels[..n].contains(&channel) {
                return Err(Error::InvalidChannel(channel));
            }
        }

        let id = Uuid::new_v4();
        let ring = context.ring(direction);
        debug!(stream = %id, %direction, ?channels, "Stream set up");
        Ok(Self {
            id,
            context,
            ring: Some(ring),
            direction,
            channels,
            args,
            state: StreamState::Created,
            active: None,
            cancel: Arc::new(AtomicBool::new(false)),
            stats: StreamStats::default(),
        })
    }

    /// Identifier used in log records.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Channels of the stream, in buffer order.
    ///
    /// Buffers passed to [`Self::read`] and [`Self::write`] follow this order
    /// whatever the order on the wire. A single-channel stream occupies the
    /// one wire position of the 1R1T frame, whichever channel it names.
    pub fn channels(&self) -> &[usize] {
        &self.channels
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn stats(&self) -> StreamStats {
        self.stats
    }

    /// Samples per channel carried by one ring slot in the current sample
    /// mode.
    pub fn mtu(&self) -> Result<usize> {
        if let Some(active) = &self.active {
            return Ok(active.mtu);
        }
        let ring = self.ring()?;
        let mode = self.context.lock_control()?.sample_mode;
        Ok(SampleCodec::new(mode, self.channels.len())?.samples_per_slot(ring.slot_size()))
    }

    /// Returns a handle that can interrupt blocking calls from another thread.
    pub fn canceller(&self) -> StreamCanceller {
        StreamCanceller::new(
            self.cancel.clone(),
            self.context.device.clone(),
            self.direction,
        )
    }

    fn ring(&self) -> Result<&Arc<RingBufferMap>> {
        self.ring
            .as_ref()
            .ok_or_else(|| Error::invalid_state("stream is closed"))
    }

    /// Starts the stream: claims and enables the DMA channel.
    ///
    /// With [`StreamFlags::HAS_TIME`], `time_ns` is the timestamp of the first
    /// sample; otherwise timestamps start at zero. Activating an active stream
    /// again with the same parameters does nothing.
    ///
    /// # Errors
    ///
    /// - [`Error::ResourceBusy`] if another stream holds this direction
    /// - [`Error::InvalidState`] if the stream is closed, or already active
    ///   with different parameters
    pub fn activate(&mut self, flags: StreamFlags, time_ns: i64, num_elems: usize) -> Result<()> {
        let params = Activation {
            flags,
            time_ns,
            num_elems,
        };
        match self.state {
            StreamState::Closed => return Err(Error::invalid_state("stream is closed")),
            StreamState::Activated => {
                return match &self.active {
                    Some(active) if active.params == params => Ok(()),
                    _ => Err(Error::invalid_state(
                        "stream is already active with different parameters",
                    )),
                };
            }
            StreamState::Created | StreamState::Deactivated => {}
        }

        let ring = self.ring()?.clone();
        let mut control = self.context.lock_control()?;
        let codec = SampleCodec::new(control.sample_mode, self.channels.len())?;
        let mtu = codec.samples_per_slot(ring.slot_size());
        if mtu == 0 {
            return Err(Error::Mapping {
                direction: self.direction,
                reason: format!(
                    "slot of {} bytes holds no {}-byte frame",
                    ring.slot_size(),
                    codec.frame_size()
                ),
            });
        }
        let sample_rate = control.rfic.sample_rate(self.direction)?;
        // Loopback feeds TX into RX, so the TX engine owns the setting.
        let loopback = self.direction == Direction::Tx && control.loopback;
        let engine = DmaEngine::acquire(
            self.context.device.clone(),
            self.direction,
            ring.slot_count(),
            loopback,
        )?;
        control.active_streams += 1;
        drop(control);

        self.cancel.store(false, Ordering::Release);
        self.active = Some(Active {
            engine,
            codec,
            params,
            mtu,
            slot_offset: 0,
            sample_rate,
            time_base_ns: if flags.contains(StreamFlags::HAS_TIME) {
                time_ns
            } else {
                0
            },
            sample_count: 0,
        });
        self.state = StreamState::Activated;
        debug!(stream = %self.id, direction = %self.direction, mtu, sample_rate, "Stream activated");
        Ok(())
    }

    /// Stops the stream and releases the DMA channel. Safe to call repeatedly.
    ///
    /// A partially read RX slot is handed back to the board; a partially
    /// written TX slot is discarded.
    pub fn deactivate(&mut self) -> Result<()> {
        if self.state == StreamState::Closed {
            return Err(Error::invalid_state("stream is closed"));
        }
        self.stop();
        Ok(())
    }

    /// Deactivates the stream and drops its ring reference. Every later call
    /// fails with [`Error::InvalidState`].
    pub fn close(&mut self) -> Result<()> {
        if self.state == StreamState::Closed {
            return Err(Error::invalid_state("stream is already closed"));
        }
        self.stop();
        self.ring = None;
        self.state = StreamState::Closed;
        debug!(stream = %self.id, direction = %self.direction, "Stream closed");
        Ok(())
    }

    fn stop(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        if active.slot_offset > 0 {
            match self.direction {
                Direction::Rx => {
                    if let Err(err) = active.engine.advance() {
                        warn!(stream = %self.id, "Failed to release partial RX slot: {:?}", err);
                    }
                }
                Direction::Tx => debug!(
                    stream = %self.id,
                    samples = active.slot_offset,
                    "Discarding partially written TX slot"
                ),
            }
        }
        active.engine.release();
        match self.context.lock_control() {
            Ok(mut control) => control.active_streams = control.active_streams.saturating_sub(1),
            Err(err) => error!(stream = %self.id, "Failed to update control state: {:?}", err),
        }
        if self.state == StreamState::Activated {
            self.state = StreamState::Deactivated;
        }
        debug!(stream = %self.id, direction = %self.direction, "Stream deactivated");
    }

    /// Applies the stream policy to a failed transfer.
    ///
    /// Timeouts leave the stream running. Cancellation and every other error
    /// end the activation so no slot stays claimed.
    fn fail(&mut self, err: Error) -> Error {
        match &err {
            Error::Timeout => self.stats.timeouts += 1,
            Error::Cancelled => {
                debug!(stream = %self.id, "Stream cancelled");
                self.stop();
            }
            _ => {
                error!(stream = %self.id, direction = %self.direction, "Aborting stream: {}", err);
                self.stop();
            }
        }
        err
    }

    /// Common preconditions of read/write: active, right direction, one buffer
    /// per channel. A pending cancellation is honoured here.
    fn check_transfer(&mut self, direction: Direction, buffers: usize) -> Result<()> {
        match self.state {
            StreamState::Activated => {}
            StreamState::Closed => return Err(Error::invalid_state("stream is closed")),
            StreamState::Created | StreamState::Deactivated => {
                return Err(Error::invalid_state("stream is not active"));
            }
        }
        if self.direction != direction {
            return Err(Error::invalid_state(format!(
                "{} transfer on a {} stream",
                direction, self.direction
            )));
        }
        if buffers != self.channels.len() {
            return Err(Error::InvalidArg(format!(
                "{buffers} buffers for {} channels",
                self.channels.len()
            )));
        }
        if self.cancel.load(Ordering::Acquire) {
            return Err(self.fail(Error::Cancelled));
        }
        Ok(())
    }

    fn burst(&self, mtu: usize) -> usize {
        self.args.burst_size.map_or(mtu, |burst| burst.min(mtu))
    }

    /// Reads up to the buffers' length of samples, one buffer per channel.
    ///
    /// Samples are served in ring order, finishing a partially consumed slot
    /// first. Returns a short count when the timeout or a cancellation
    /// interrupts a transfer that already moved samples.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] before activation or after close
    /// - [`Error::Timeout`] when no sample arrived within `timeout`
    /// - [`Error::Cancelled`] when cancelled before any sample moved
    /// - [`Error::DataIntegrityViolation`] if the ring order broke; the stream
    ///   is deactivated
    pub fn read(
        &mut self,
        buffers: &mut [&mut [Complex32]],
        timeout: Duration,
    ) -> Result<ReadResult> {
        self.check_transfer(Direction::Rx, buffers.len())?;
        let want = common_len(buffers.iter().map(|buffer| buffer.len()))?;
        let mut buffers = wire_order(
            &self.channels,
            buffers.iter_mut().map(|buffer| &mut **buffer),
        );
        let deadline = Instant::now() + timeout;
        let poll_interval = self.context.poll_interval;
        let burst = self.burst(self.active.as_ref().map_or(0, |active| active.mtu));

        let (Some(active), Some(ring)) = (self.active.as_mut(), self.ring.as_deref()) else {
            return Err(Error::invalid_state("stream is not active"));
        };
        let time_ns = active.time_ns();
        let mut done = 0;
        let mut interrupted = None;
        while done < want {
            let chunk = read_chunk(
                active,
                ring,
                &self.cancel,
                deadline,
                poll_interval,
                burst,
                &mut buffers,
                done,
            );
            match chunk {
                Ok((0, _)) => break,
                Ok((moved, completed)) => {
                    done += moved;
                    if completed {
                        self.stats.slots += 1;
                    }
                }
                Err(err) => {
                    interrupted = Some(err);
                    break;
                }
            }
        }
        active.sample_count += done as u64;
        self.stats.samples += done as u64;
        let mut flags = active.collect_events(&mut self.stats);
        if time_ns.is_some() {
            flags |= StreamFlags::HAS_TIME;
        }
        trace!(stream = %self.id, done, want, "Read");

        let result = ReadResult {
            elements: done,
            flags,
            time_ns: time_ns.unwrap_or(0),
        };
        match interrupted {
            None => Ok(result),
            Some(err) => {
                let recoverable = err.is_recoverable();
                let err = self.fail(err);
                if done > 0 && recoverable {
                    Ok(result)
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Writes the buffers' samples, one buffer per channel.
    ///
    /// A slot is submitted once full. With [`StreamFlags::END_BURST`] a
    /// partially filled slot is zero-padded and submitted at the end of the
    /// call. With [`StreamFlags::ONE_PACKET`] at most one burst is written.
    /// TX timestamps are not supported: `time_ns` is ignored.
    ///
    /// # Errors
    ///
    /// Same as [`Self::read`]; [`Error::Timeout`] means no ring slot became
    /// free within `timeout`.
    pub fn write(
        &mut self,
        buffers: &[&[Complex32]],
        flags: StreamFlags,
        time_ns: i64,
        timeout: Duration,
    ) -> Result<WriteResult> {
        self.check_transfer(Direction::Tx, buffers.len())?;
        let want = common_len(buffers.iter().map(|buffer| buffer.len()))?;
        let buffers = wire_order(&self.channels, buffers.iter().copied());
        if flags.contains(StreamFlags::HAS_TIME) {
            trace!(stream = %self.id, time_ns, "Ignoring TX timestamp");
        }
        let deadline = Instant::now() + timeout;
        let poll_interval = self.context.poll_interval;
        let burst = self.burst(self.active.as_ref().map_or(0, |active| active.mtu));

        let (Some(active), Some(ring)) = (self.active.as_mut(), self.ring.as_deref()) else {
            return Err(Error::invalid_state("stream is not active"));
        };
        let mut done = 0;
        let mut interrupted = None;
        let mut result_flags = StreamFlags::NONE;
        while done < want {
            let chunk = write_chunk(
                active,
                ring,
                &self.cancel,
                deadline,
                poll_interval,
                burst,
                &buffers,
                done,
            );
            match chunk {
                Ok((0, _)) => break,
                Ok((moved, completed)) => {
                    done += moved;
                    if completed {
                        self.stats.slots += 1;
                    }
                }
                Err(err) => {
                    interrupted = Some(err);
                    break;
                }
            }
            if flags.contains(StreamFlags::ONE_PACKET) {
                break;
            }
        }
        if interrupted.is_none() && done == want && flags.contains(StreamFlags::END_BURST) {
            if active.slot_offset > 0 {
                match flush_partial(active, ring) {
                    Ok(()) => self.stats.slots += 1,
                    Err(err) => interrupted = Some(err),
                }
            }
            if interrupted.is_none() {
                result_flags |= StreamFlags::END_BURST;
            }
        }
        active.sample_count += done as u64;
        self.stats.samples += done as u64;
        result_flags |= active.collect_events(&mut self.stats);
        trace!(stream = %self.id, done, want, "Write");

        let result = WriteResult {
            elements: done,
            flags: result_flags,
        };
        match interrupted {
            None => Ok(result),
            Some(err) => {
                let recoverable = err.is_recoverable();
                let err = self.fail(err);
                if done > 0 && recoverable {
                    Ok(result)
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Number of ring slots available for direct access.
    pub fn num_direct_access_buffers(&self) -> usize {
        self.ring.as_ref().map_or(0, |ring| ring.slot_count())
    }

    /// Waits for the next filled RX slot and lends its raw wire bytes.
    ///
    /// The slot returns to the board when the guard is released or dropped.
    ///
    /// # Errors
    ///
    /// As [`Self::read`], plus [`Error::InvalidState`] while a slot is
    /// partially consumed by [`Self::read`].
    pub fn acquire_read_buffer(&mut self, timeout: Duration) -> Result<RxSlot<'_>> {
        self.check_transfer(Direction::Rx, self.channels.len())?;
        let slot = self.wait_whole_slot(timeout);
        let slot = match slot {
            Ok(slot) => slot,
            Err(err) => return Err(self.fail(err)),
        };

        let (Some(active), Some(ring)) = (self.active.as_mut(), self.ring.as_deref()) else {
            return Err(Error::invalid_state("stream is not active"));
        };
        let mut flags = active.collect_events(&mut self.stats);
        let time_ns = active.time_ns();
        if time_ns.is_some() {
            flags |= StreamFlags::HAS_TIME;
        }
        // Safety: the slot was returned by the engine's poll and is owned by
        // the guard until it advances the engine.
        let bytes = unsafe { ring.slot(slot)? };
        Ok(RxSlot::new(
            active,
            &mut self.stats,
            bytes,
            slot,
            flags,
            time_ns.unwrap_or(0),
        ))
    }

    /// Waits for the next free TX slot and lends it for writing raw wire
    /// bytes. Nothing is sent unless the guard is committed.
    ///
    /// # Errors
    ///
    /// As [`Self::write`], plus [`Error::InvalidState`] while a slot is
    /// partially written by [`Self::write`].
    pub fn acquire_write_buffer(&mut self, timeout: Duration) -> Result<TxSlot<'_>> {
        self.check_transfer(Direction::Tx, self.channels.len())?;
        let slot = self.wait_whole_slot(timeout);
        let slot = match slot {
            Ok(slot) => slot,
            Err(err) => return Err(self.fail(err)),
        };

        let (Some(active), Some(ring)) = (self.active.as_mut(), self.ring.as_deref()) else {
            return Err(Error::invalid_state("stream is not active"));
        };
        // Safety: as in `acquire_read_buffer`; the guard is the only writer.
        let bytes = unsafe { ring.slot_mut(slot)? };
        Ok(TxSlot::new(active, &mut self.stats, bytes, slot))
    }

    fn wait_whole_slot(&mut self, timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        let poll_interval = self.context.poll_interval;
        let Some(active) = self.active.as_mut() else {
            return Err(Error::invalid_state("stream is not active"));
        };
        if active.slot_offset > 0 {
            return Err(Error::invalid_state(
                "a partially transferred slot is pending",
            ));
        }
        next_slot(&mut active.engine, &self.cancel, deadline, poll_interval)
    }
}

/// Decodes the next piece of the current RX slot into `buffers[..][done..]`.
///
/// Returns the samples moved and whether the slot was completed.
#[allow(clippy::too_many_arguments)]
fn read_chunk(
    active: &mut Active,
    ring: &RingBufferMap,
    cancel: &AtomicBool,
    deadline: Instant,
    poll_interval: Duration,
    burst: usize,
    buffers: &mut [&mut [Complex32]],
    done: usize,
) -> Result<(usize, bool)> {
    let slot = next_slot(&mut active.engine, cancel, deadline, poll_interval)?;
    let want = buffers.first().map_or(0, |buffer| buffer.len());
    let frame = active.codec.frame_size();
    let start = active.slot_offset * frame;
    let chunk = (active.mtu - active.slot_offset)
        .min(want - done)
        .min(burst);
    // Safety: the slot was returned by the engine's poll and is not advanced
    // until it has been consumed.
    let raw = unsafe { ring.slot(slot)? };
    let moved = active
        .codec
        .decode_into(&raw[start..start + chunk * frame], buffers, done)?;
    active.slot_offset += moved;
    if active.slot_offset == active.mtu {
        active.engine.advance()?;
        active.slot_offset = 0;
        return Ok((moved, true));
    }
    Ok((moved, false))
}

/// Encodes `buffers[..][done..]` into the next piece of the current TX slot.
#[allow(clippy::too_many_arguments)]
fn write_chunk(
    active: &mut Active,
    ring: &RingBufferMap,
    cancel: &AtomicBool,
    deadline: Instant,
    poll_interval: Duration,
    burst: usize,
    buffers: &[&[Complex32]],
    done: usize,
) -> Result<(usize, bool)> {
    let slot = next_slot(&mut active.engine, cancel, deadline, poll_interval)?;
    let want = buffers.first().map_or(0, |buffer| buffer.len());
    let frame = active.codec.frame_size();
    let start = active.slot_offset * frame;
    let chunk = (active.mtu - active.slot_offset)
        .min(want - done)
        .min(burst);
    // Safety: the slot was returned by the engine's poll; the board does not
    // read it before it is submitted.
    let raw = unsafe { ring.slot_mut(slot)? };
    let moved = active
        .codec
        .encode_into(buffers, done, &mut raw[start..start + chunk * frame])?;
    active.slot_offset += moved;
    if active.slot_offset == active.mtu {
        active.engine.advance()?;
        active.slot_offset = 0;
        return Ok((moved, true));
    }
    Ok((moved, false))
}

/// Zero-pads the partially written TX slot and submits it.
fn flush_partial(active: &mut Active, ring: &RingBufferMap) -> Result<()> {
    let Some(slot) = active.engine.poll_ready()? else {
        return Err(Error::integrity(
            Direction::Tx,
            "partially written slot is no longer owned",
        ));
    };
    let start = active.slot_offset * active.codec.frame_size();
    // Safety: the slot is the one being filled and has not been submitted.
    let raw = unsafe { ring.slot_mut(slot)? };
    raw[start..].fill(0);
    active.engine.advance()?;
    active.slot_offset = 0;
    Ok(())
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{M2sdrDevice, SimulatedDevice};

    fn device(slot_size: usize, slots: usize) -> (Arc<SimulatedDevice>, M2sdrDevice) {
        let sim = Arc::new(SimulatedDevice::with_slots(slot_size, slots));
        let device = M2sdrDevice::simulated(sim.clone()).unwrap();
        (sim, device)
    }

    fn rx_slot_16bit(values: impl Iterator<Item = i16>) -> Vec<u8> {
        values.flat_map(i16::to_le_bytes).collect()
    }

    #[test]
    fn setup_validates_format_and_channels() {
        let (sim, device) = device(64, 4);
        let args = StreamArgs::default();
        assert!(matches!(
            device.setup_stream(Direction::Rx, "CS16", &[0], &args),
            Err(Error::UnsupportedFormat(_))
        ));
        assert!(matches!(
            device.setup_stream(Direction::Rx, "CF32", &[2], &args),
            Err(Error::InvalidChannel(2))
        ));
        assert!(matches!(
            device.setup_stream(Direction::Tx, "CF32", &[1, 1], &args),
            Err(Error::InvalidChannel(1))
        ));
        let stream = device.setup_stream(Direction::Rx, "CF32", &[], &args).unwrap();
        assert_eq!(stream.channels(), &[0, 1]);
        assert_eq!(stream.state(), StreamState::Created);
        assert!(!sim.is_claimed(Direction::Rx));
    }

    #[test]
    fn zero_burst_size_is_rejected_at_setup() {
        let (_sim, device) = device(64, 4);
        let args = StreamArgs {
            burst_size: Some(0),
        };
        assert!(matches!(
            device.setup_stream(Direction::Rx, "CF32", &[0], &args),
            Err(Error::InvalidArg(_))
        ));
        assert!(matches!(
            device.setup_stream(Direction::Tx, "CF32", &[0], &args),
            Err(Error::InvalidArg(_))
        ));
    }

    #[test]
    fn buffers_follow_the_channel_list_order() {
        // 16-bit, two channels: 2 samples per 16-byte slot.
        let (sim, device) = device(16, 4);
        let mut rx = device
            .setup_stream(Direction::Rx, "CF32", &[1, 0], &StreamArgs::default())
            .unwrap();
        let mut tx = device
            .setup_stream(Direction::Tx, "CF32", &[1, 0], &StreamArgs::default())
            .unwrap();
        rx.activate(StreamFlags::NONE, 0, 0).unwrap();
        tx.activate(StreamFlags::NONE, 0, 0).unwrap();
        let timeout = Duration::from_millis(50);

        // Wire channel 0 at +full scale, channel 1 at -full scale.
        sim.inject_rx(&rx_slot_16bit([2047, 2047, -2047, -2047].into_iter().cycle().take(8)))
            .unwrap();
        let mut for_ch1 = vec![Complex32::default(); 2];
        let mut for_ch0 = vec![Complex32::default(); 2];
        rx.read(&mut [for_ch1.as_mut_slice(), for_ch0.as_mut_slice()], timeout)
            .unwrap();
        assert!(for_ch0.iter().all(|s| *s == Complex32::new(1.0, 1.0)));
        assert!(for_ch1.iter().all(|s| *s == Complex32::new(-1.0, -1.0)));

        let to_ch1 = [Complex32::new(-1.0, -1.0); 2];
        let to_ch0 = [Complex32::new(1.0, 1.0); 2];
        tx.write(&[&to_ch1[..], &to_ch0[..]], StreamFlags::END_BURST, 0, timeout)
            .unwrap();
        let sent = sim.drain_tx().unwrap().unwrap();
        let words: Vec<i16> = sent
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        assert_eq!(words, [2047, 2047, -2047, -2047, 2047, 2047, -2047, -2047]);
    }

    #[test]
    fn zero_elements_is_a_no_op() {
        let (sim, device) = device(16, 4);
        let mut rx = device
            .setup_stream(Direction::Rx, "CF32", &[0], &StreamArgs::default())
            .unwrap();
        let mut tx = device
            .setup_stream(Direction::Tx, "CF32", &[0], &StreamArgs::default())
            .unwrap();
        rx.activate(StreamFlags::NONE, 0, 0).unwrap();
        tx.activate(StreamFlags::NONE, 0, 0).unwrap();

        let mut empty: [Complex32; 0] = [];
        let read = rx.read(&mut [&mut empty[..]], Duration::ZERO).unwrap();
        assert_eq!(read.elements, 0);
        let written = tx
            .write(&[&empty[..]], StreamFlags::END_BURST, 0, Duration::ZERO)
            .unwrap();
        assert_eq!(written.elements, 0);

        assert_eq!(sim.drain_tx().unwrap(), None);
        assert_eq!(sim.counters(Direction::Rx).sw_count, 0);
        assert_eq!(rx.stats().timeouts, 0);
        assert_eq!(rx.state(), StreamState::Activated);
    }

    #[test]
    fn activation_is_idempotent_only_with_same_parameters() {
        let (_sim, device) = device(64, 4);
        let mut stream = device
            .setup_stream(Direction::Rx, "CF32", &[0], &StreamArgs::default())
            .unwrap();
        stream.activate(StreamFlags::NONE, 0, 0).unwrap();
        stream.activate(StreamFlags::NONE, 0, 0).unwrap();
        assert!(matches!(
            stream.activate(StreamFlags::HAS_TIME, 5, 0),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn partial_reads_continue_in_slot_order() {
        // 16-bit, one channel: 4 samples per 16-byte slot.
        let (sim, device) = device(16, 4);
        let mut stream = device
            .setup_stream(Direction::Rx, "CF32", &[0], &StreamArgs::default())
            .unwrap();
        stream.activate(StreamFlags::NONE, 0, 0).unwrap();
        sim.inject_rx(&rx_slot_16bit((0..8).map(|n| n * 100))).unwrap();
        sim.inject_rx(&rx_slot_16bit((8..16).map(|n| n * 100))).unwrap();

        let mut first = vec![Complex32::default(); 3];
        let mut second = vec![Complex32::default(); 5];
        let timeout = Duration::from_millis(50);
        assert_eq!(stream.read(&mut [first.as_mut_slice()], timeout).unwrap().elements, 3);
        assert_eq!(stream.read(&mut [second.as_mut_slice()], timeout).unwrap().elements, 5);

        let re: Vec<f32> = first.iter().chain(&second).map(|s| s.re * 2047.0).collect();
        let expected: Vec<f32> = (0..8).map(|n| (2 * n * 100) as f32).collect();
        for (got, want) in re.iter().zip(&expected) {
            assert!((got - want).abs() < 0.01, "{got} vs {want}");
        }
        assert_eq!(stream.stats().slots, 2);
        assert_eq!(sim.counters(Direction::Rx).sw_count, 2);
    }

    #[test]
    fn timestamps_follow_the_sample_count() {
        let (sim, device) = device(16, 4);
        device.set_sample_rate(Direction::Rx, 1e6).unwrap();
        let mut stream = device
            .setup_stream(Direction::Rx, "CF32", &[0], &StreamArgs::default())
            .unwrap();
        stream.activate(StreamFlags::HAS_TIME, 1_000, 0).unwrap();
        sim.inject_rx(&[0; 16]).unwrap();
        let mut buffer = vec![Complex32::default(); 2];
        let timeout = Duration::from_millis(50);
        let first = stream.read(&mut [buffer.as_mut_slice()], timeout).unwrap();
        let second = stream.read(&mut [buffer.as_mut_slice()], timeout).unwrap();
        assert!(first.flags.contains(StreamFlags::HAS_TIME));
        assert_eq!(first.time_ns, 1_000);
        assert_eq!(second.time_ns, 3_000);
    }

    #[test]
    fn end_burst_flushes_a_partial_slot() {
        let (sim, device) = device(16, 4);
        let mut stream = device
            .setup_stream(Direction::Tx, "CF32", &[0], &StreamArgs::default())
            .unwrap();
        stream.activate(StreamFlags::NONE, 0, 0).unwrap();
        let samples = [Complex32::new(1.0, -1.0); 2];
        let timeout = Duration::from_millis(50);

        let held = stream
            .write(&[&samples[..]], StreamFlags::NONE, 0, timeout)
            .unwrap();
        assert_eq!(held.elements, 2);
        assert_eq!(sim.drain_tx().unwrap(), None);

        let flushed = stream
            .write(&[&samples[..]], StreamFlags::END_BURST, 0, timeout)
            .unwrap();
        assert!(flushed.flags.contains(StreamFlags::END_BURST));
        // 4 samples fill the slot exactly, so nothing is left to pad.
        assert!(sim.drain_tx().unwrap().is_some());

        stream
            .write(&[&samples[..1]], StreamFlags::END_BURST, 0, timeout)
            .unwrap();
        let slot = sim.drain_tx().unwrap().unwrap();
        assert_eq!(&slot[0..2], &2047i16.to_le_bytes());
        assert!(slot[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn one_packet_limits_a_write_to_one_burst() {
        let (_sim, device) = device(64, 4);
        let args = StreamArgs {
            burst_size: Some(3),
        };
        let mut stream = device
            .setup_stream(Direction::Tx, "CF32", &[0], &args)
            .unwrap();
        stream.activate(StreamFlags::NONE, 0, 0).unwrap();
        let samples = [Complex32::default(); 10];
        let result = stream
            .write(&[&samples[..]], StreamFlags::ONE_PACKET, 0, Duration::ZERO)
            .unwrap();
        assert_eq!(result.elements, 3);
    }

    #[test]
    fn direction_and_buffer_count_are_checked() {
        let (_sim, device) = device(64, 4);
        let mut stream = device
            .setup_stream(Direction::Tx, "CF32", &[0, 1], &StreamArgs::default())
            .unwrap();
        stream.activate(StreamFlags::NONE, 0, 0).unwrap();
        let mut buffer = vec![Complex32::default(); 4];
        assert!(matches!(
            stream.read(&mut [buffer.as_mut_slice()], Duration::ZERO),
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(
            stream.write(&[&buffer[..]], StreamFlags::NONE, 0, Duration::ZERO),
            Err(Error::InvalidArg(_))
        ));
        assert!(matches!(
            stream.write(&[&buffer[..], &buffer[..2]], StreamFlags::NONE, 0, Duration::ZERO),
            Err(Error::InvalidArg(_))
        ));
    }

    #[test]
    fn integrity_violation_deactivates_the_stream() {
        let (sim, device) = device(16, 4);
        let mut stream = device
            .setup_stream(Direction::Rx, "CF32", &[0], &StreamArgs::default())
            .unwrap();
        stream.activate(StreamFlags::NONE, 0, 0).unwrap();
        for _ in 0..5 {
            sim.inject_rx(&[0; 16]).unwrap();
        }
        let mut buffer = vec![Complex32::default(); 4];
        assert!(matches!(
            stream.read(&mut [buffer.as_mut_slice()], Duration::ZERO),
            Err(Error::DataIntegrityViolation { .. })
        ));
        assert_eq!(stream.state(), StreamState::Deactivated);
        assert!(!sim.is_claimed(Direction::Rx));
    }

    #[test]
    fn direct_access_slots() {
        let (sim, device) = device(16, 4);
        let mut rx = device
            .setup_stream(Direction::Rx, "CF32", &[0], &StreamArgs::default())
            .unwrap();
        let mut tx = device
            .setup_stream(Direction::Tx, "CF32", &[0], &StreamArgs::default())
            .unwrap();
        assert_eq!(rx.num_direct_access_buffers(), 4);
        rx.activate(StreamFlags::NONE, 0, 0).unwrap();
        tx.activate(StreamFlags::NONE, 0, 0).unwrap();

        let mut slot = tx.acquire_write_buffer(Duration::ZERO).unwrap();
        slot.bytes_mut().fill(0x11);
        slot.commit(2).unwrap();
        let sent = sim.drain_tx().unwrap().unwrap();
        assert!(sent[..8].iter().all(|&b| b == 0x11));
        assert!(sent[8..].iter().all(|&b| b == 0));

        // Dropping an uncommitted slot sends nothing.
        drop(tx.acquire_write_buffer(Duration::ZERO).unwrap());
        assert_eq!(sim.drain_tx().unwrap(), None);

        sim.inject_rx(&[7; 16]).unwrap();
        {
            let slot = rx.acquire_read_buffer(Duration::ZERO).unwrap();
            assert_eq!(slot.index(), 0);
            assert!(slot.bytes().iter().all(|&b| b == 7));
        }
        assert_eq!(sim.counters(Direction::Rx).sw_count, 1);
        assert!(matches!(
            rx.acquire_read_buffer(Duration::ZERO),
            Err(Error::Timeout)
        ));
        assert_eq!(rx.stats().timeouts, 1);
    }
}
