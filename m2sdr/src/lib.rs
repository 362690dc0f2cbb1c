// SPDX-FileCopyrightText: 2025 Contributors to the LiteX M2SDR project.
// SPDX-License-Identifier: Apache-2.0

//! # M2SDR - LiteX M2SDR streaming HAL
//!
//! Safe Rust access to the LiteX M2SDR board (LitePCIe DMA + AD9361 RFIC)
//! through a generic SDR streaming API.
//!
//! ## Overview
//!
//! The board moves samples through two DMA rings shared with the host: the
//! board fills RX slots and drains TX slots, and both sides exchange slot
//! counters to hand slots over. This crate maps the rings, runs the counter
//! protocol, converts between wire samples and `Complex32`, and exposes the
//! setup/activate/read/write/deactivate/close stream contract. The raw kernel
//! driver ABI lives in [`m2sdr_sys`].
//!
//! ### Key Concepts
//!
//! - **Slot**: one fixed-size buffer of a DMA ring ([`RingBufferMap`])
//! - **Cursor**: monotonic count of slots handed over ([`DmaEngine`])
//! - **Sample mode**: 8-bit or 16-bit signed I/Q on the wire ([`SampleMode`], [`SampleCodec`])
//! - **Stream**: one direction's transfer session ([`StreamSession`])
//! - **Transport**: the [`DeviceHandle`] a device runs on, real ([`LitePcieDevice`])
//!   or simulated ([`SimulatedDevice`])
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐
//! │ M2sdrDevice  │  (control plane, RFIC via RficControl)
//! └──────┬───────┘
//!        │ setup_stream
//!        ▼
//! ┌──────────────┐   decode/encode   ┌─────────────┐
//! │ StreamSession├──────────────────►│ SampleCodec │
//! └──────┬───────┘                   └─────────────┘
//!        │ poll/advance
//!        ▼
//! ┌──────────────┐   slots   ┌───────────────┐
//! │  DmaEngine   ├──────────►│ RingBufferMap │
//! └──────┬───────┘           └───────┬───────┘
//!        └─────────► DeviceHandle ◄──┘
//! ```
//!
//! ## Examples
//!
//! ### Receiving samples
//!
//! ```no_run
//! use std::time::Duration;
//! use m2sdr::{Direction, M2sdrDevice, SimulatedRfic, StreamFlags, config::DeviceConfig};
//! use num_complex::Complex32;
//!
//! # fn main() -> Result<(), m2sdr::Error> {
//! let device = M2sdrDevice::open(&DeviceConfig::default(), Box::new(SimulatedRfic::new()))?;
//! device.set_sample_rate(Direction::Rx, 10e6)?;
//!
//! let mut rx = device.setup_stream(Direction::Rx, "CF32", &[0, 1], &Default::default())?;
//! rx.activate(StreamFlags::NONE, 0, 0)?;
//!
//! let mut ch0 = vec![Complex32::default(); 4096];
//! let mut ch1 = vec![Complex32::default(); 4096];
//! let result = rx.read(
//!     &mut [ch0.as_mut_slice(), ch1.as_mut_slice()],
//!     Duration::from_millis(100),
//! )?;
//! println!("{} samples at {} ns", result.elements, result.time_ns);
//! rx.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Interrupting a blocked read
//!
//! ```no_run
//! # use std::time::Duration;
//! # use m2sdr::{Direction, M2sdrDevice, StreamFlags};
//! # use num_complex::Complex32;
//! # fn example(device: M2sdrDevice) -> Result<(), m2sdr::Error> {
//! let mut rx = device.setup_stream(Direction::Rx, "CF32", &[0], &Default::default())?;
//! rx.activate(StreamFlags::NONE, 0, 0)?;
//!
//! let canceller = rx.canceller();
//! std::thread::spawn(move || {
//!     std::thread::sleep(Duration::from_secs(1));
//!     canceller.cancel();
//! });
//!
//! let mut samples = vec![Complex32::default(); 1 << 20];
//! match rx.read(&mut [samples.as_mut_slice()], Duration::from_secs(60)) {
//!     Ok(result) => println!("short read of {}", result.elements),
//!     Err(m2sdr::Error::Cancelled) => println!("cancelled"),
//!     Err(err) => return Err(err),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Thread Safety
//!
//! - [`M2sdrDevice`] is `Send + Sync` and cheaply cloneable
//! - [`StreamSession`] is `Send` and used by one thread at a time
//! - [`StreamCanceller`] is `Send + Sync`
//! - Only one stream per direction can be active; the DMA channel claim
//!   enforces it across processes too

mod codec;
mod device;
mod dma;
mod error;
mod instance;
mod ring;
mod stream;

pub mod config;
pub mod control;

pub use codec::{SampleCodec, SampleMode};
pub use control::{RficControl, SimulatedRfic, SpiBus};
pub use device::{
    DeviceHandle, Direction, DmaCounters, DmaGeometry, DmaInfo, LitePcieDevice, SimulatedDevice,
};
pub use dma::{DmaEngine, PollEvents};
pub use error::{Error, Result};
pub use instance::M2sdrDevice;
pub use ring::RingBufferMap;
pub use stream::{
    FORMAT_CF32, ReadResult, RxSlot, StreamCanceller, StreamFlags, StreamSession, StreamState,
    StreamStats, TxSlot, WriteResult,
};
