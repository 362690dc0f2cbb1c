// SPDX-FileCopyrightText: 2025 Contributors to the LiteX M2SDR project.
// SPDX-License-Identifier: Apache-2.0

//! Error types for M2SDR operations.
//!
//! Transport failures coming from the LitePCIe driver are carried unchanged
//! ([`Error::Io`], [`Error::Sys`]); ring, engine and codec failures are
//! expressed with the streaming taxonomy below.

use crate::Direction;

/// Convenience result type using [`Error`] as the error variant.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors that can occur when using the M2SDR API.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The device node could not be opened.
    #[error("Failed to open device {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The DMA ring geometry is unusable or the mapping syscall failed.
    ///
    /// Fatal for the device: it has to be reopened.
    #[error("Mapping error ({direction}): {reason}")]
    Mapping { direction: Direction, reason: String },

    /// The DMA channel of this direction is already claimed by another stream.
    #[error("{0} DMA channel is busy")]
    ResourceBusy(Direction),

    /// No ring slot became available within the caller's timeout.
    #[error("Timeout")]
    Timeout,

    /// Only complex 32-bit float (`CF32`) streams are supported.
    #[error("Unsupported stream format: {0}")]
    UnsupportedFormat(String),

    /// The channel list is not a subset of {0, 1}.
    #[error("Invalid channel: {0}")]
    InvalidChannel(usize),

    /// An argument does not match what the stream or codec expects.
    #[error("Invalid argument: {0}")]
    InvalidArg(String),

    /// The operation is not valid in the current stream/device state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A blocking transfer was interrupted by a deactivation request.
    #[error("Cancelled")]
    Cancelled,

    /// A DMA cursor invariant was broken; samples would be lost or misordered.
    ///
    /// The stream is aborted when this is raised.
    #[error("Data integrity violation ({direction}): {reason}")]
    DataIntegrityViolation { direction: Direction, reason: String },

    /// A control-plane value is outside the supported range.
    #[error("{what} {value} out of range [{min}, {max}]")]
    OutOfRange {
        what: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    /// The requested sensor does not exist on this board.
    #[error("Unknown sensor: {0}")]
    UnknownSensor(String),

    /// Generic failure that is not covered by the variants above.
    #[error("Other error: {0}")]
    Other(String),

    /// I/O error from the device transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Errno returned by a LitePCIe ioctl or by mmap/poll.
    #[error("System error: {0}")]
    Sys(#[from] nix::errno::Errno),

    /// The device configuration could not be parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] serde_json::Error),
}

impl Error {
    /// Returns `true` for outcomes the caller may simply retry.
    ///
    /// Timeouts and cancellations leave the stream in a consistent state;
    /// everything else either needs caller action or is fatal for the stream.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Timeout | Error::Cancelled)
    }

    pub(crate) fn integrity(direction: Direction, reason: impl Into<String>) -> Self {
        Error::DataIntegrityViolation {
            direction,
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_state(reason: impl Into<String>) -> Self {
        Error::InvalidState(reason.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_timeouts_and_cancellations_are_recoverable() {
        assert!(Error::Timeout.is_recoverable());
        assert!(Error::Cancelled.is_recoverable());
        assert!(!Error::ResourceBusy(Direction::Rx).is_recoverable());
        assert!(!Error::integrity(Direction::Tx, "skip").is_recoverable());
    }

    #[test]
    fn messages_name_the_direction() {
        let err = Error::ResourceBusy(Direction::Tx);
        assert_eq!(err.to_string(), "TX DMA channel is busy");
    }
}
