// SPDX-FileCopyrightText: 2025 Contributors to the LiteX M2SDR project.
// SPDX-License-Identifier: Apache-2.0

//! Sample streaming between the host and the board.
//!
//! # Key Types
//!
//! - [`StreamSession`]: setup/activate/read/write/deactivate/close contract
//!   of one direction
//! - [`StreamCanceller`]: thread-safe handle that interrupts a blocked call
//! - [`RxSlot`] / [`TxSlot`]: zero-copy access to one ring slot
//! - [`StreamFlags`], [`ReadResult`], [`WriteResult`], [`StreamStats`]

pub mod session;
pub mod slot;

use std::{
    fmt, ops,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use serde::Serialize;

use crate::{DeviceHandle, Direction};

pub use session::StreamSession;
pub use slot::{RxSlot, TxSlot};

/// The only host sample format: interleaved complex 32-bit floats.
pub const FORMAT_CF32: &str = "CF32";

/// Flags exchanged with read/write calls.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct StreamFlags(u32);

impl StreamFlags {
    pub const NONE: Self = Self(0);
    /// Last samples of a burst; a partially filled TX slot is sent at once.
    pub const END_BURST: Self = Self(1 << 1);
    /// The accompanying `time_ns` is valid.
    pub const HAS_TIME: Self = Self(1 << 2);
    /// Move at most one burst in this call.
    pub const ONE_PACKET: Self = Self(1 << 4);
    /// The RX backlog went above half the ring since the last read.
    pub const OVERFLOW: Self = Self(1 << 8);
    /// The board ran out of TX slots since the last write.
    pub const UNDERFLOW: Self = Self(1 << 9);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl ops::BitOr for StreamFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl ops::BitOrAssign for StreamFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.insert(rhs);
    }
}

impl fmt::Debug for StreamFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(StreamFlags, &str); 5] = [
            (StreamFlags::END_BURST, "END_BURST"),
            (StreamFlags::HAS_TIME, "HAS_TIME"),
            (StreamFlags::ONE_PACKET, "ONE_PACKET"),
            (StreamFlags::OVERFLOW, "OVERFLOW"),
            (StreamFlags::UNDERFLOW, "UNDERFLOW"),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "StreamFlags({})", names.join(" | "))
    }
}

/// Lifecycle of a [`StreamSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Created,
    Activated,
    Deactivated,
    Closed,
}

/// Outcome of a successful read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadResult {
    /// Samples written to each channel buffer. May be short.
    pub elements: usize,
    pub flags: StreamFlags,
    /// Time of the first sample returned, valid with [`StreamFlags::HAS_TIME`].
    pub time_ns: i64,
}

/// Outcome of a successful write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResult {
    /// Samples consumed from each channel buffer. May be short.
    pub elements: usize,
    pub flags: StreamFlags,
}

/// Counters of one stream session, accumulated across activations.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    /// Ring slots consumed (RX) or submitted (TX).
    pub slots: u64,
    /// Samples per channel moved to or from caller buffers.
    pub samples: u64,
    pub overflows: u64,
    pub underflows: u64,
    pub timeouts: u64,
}

/// Interrupts blocking calls of a [`StreamSession`] from another thread.
///
/// After [`Self::cancel`], an outstanding read or write returns promptly (a
/// short count, or [`crate::Error::Cancelled`] if nothing moved) and the
/// session ends up deactivated. If no call is outstanding, the next one
/// observes the request.
#[derive(Clone)]
pub struct StreamCanceller {
    requested: Arc<AtomicBool>,
    device: Arc<dyn DeviceHandle>,
    direction: Direction,
}

impl StreamCanceller {
    pub(crate) fn new(
        requested: Arc<AtomicBool>,
        device: Arc<dyn DeviceHandle>,
        direction: Direction,
    ) -> Self {
        Self {
            requested,
            device,
            direction,
        }
    }

    pub fn cancel(&self) {
        self.requested.store(true, Ordering::Release);
        self.device.wake(self.direction);
    }

    pub fn is_cancelled(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }
}

impl fmt::Debug for StreamCanceller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamCanceller")
            .field("direction", &self.direction)
            .field("requested", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_combine() {
        let mut flags = StreamFlags::END_BURST | StreamFlags::HAS_TIME;
        assert!(flags.contains(StreamFlags::END_BURST));
        assert!(!flags.contains(StreamFlags::OVERFLOW));
        flags |= StreamFlags::OVERFLOW;
        assert_eq!(
            format!("{flags:?}"),
            "StreamFlags(END_BURST | HAS_TIME | OVERFLOW)"
        );
        assert!(StreamFlags::NONE.is_empty());
        assert_eq!(StreamFlags::from_bits(flags.bits()), flags);
    }
}
