// SPDX-FileCopyrightText: 2025 Contributors to the LiteX M2SDR project.
// SPDX-License-Identifier: Apache-2.0

//! Control plane: RFIC capabilities, ranges and sensors.
//!
//! The streaming core never talks to the RFIC. Tuning goes through an
//! injected [`RficControl`] implementation, which in turn reaches the part
//! through an injected [`SpiBus`]. Both are owned by the device and used
//! under its control mutex, so control-plane register writes never interleave
//! with the data plane's format register writes.

pub mod sim;

use std::{fmt, str::FromStr};

use serde::Serialize;

use crate::{Direction, Error, Result, SampleMode};

pub use sim::{RegisterFileSpi, SimulatedRfic};

/// SPI access to the RFIC registers.
pub trait SpiBus: Send {
    /// Writes `write` to `address`, or reads `address` when `write` is `None`.
    ///
    /// Returns the byte read, `None` for writes.
    fn spi_transfer(&mut self, address: u16, write: Option<u8>) -> Result<Option<u8>>;
}

/// Adapts the vendor-library transfer convention to a [`SpiBus`].
///
/// `tx` carries a big-endian 16-bit command word (read flag and address),
/// followed by the data byte for writes. Only single-register transfers are
/// supported: 2 bytes out and 1 in, or 3 bytes out and none in.
pub fn spi_write_then_read(bus: &mut dyn SpiBus, tx: &[u8], rx: &mut [u8]) -> Result<()> {
    match (tx, rx) {
        ([hi, lo], [value]) => {
            let address = u16::from_be_bytes([*hi, *lo]) & 0x3ff;
            *value = bus.spi_transfer(address, None)?.unwrap_or(0);
            Ok(())
        }
        ([hi, lo, data], []) => {
            let address = u16::from_be_bytes([*hi, *lo]) & 0x3ff;
            bus.spi_transfer(address, Some(*data))?;
            Ok(())
        }
        (tx, rx) => Err(Error::InvalidArg(format!(
            "unsupported SPI transfer: {} bytes out, {} bytes in",
            tx.len(),
            rx.len()
        ))),
    }
}

/// RFIC tuning capability.
///
/// LO, sample rate and bandwidth are per direction; gain is per channel.
/// Values are in Hz and dB. TX gain is expressed as negative attenuation.
pub trait RficControl: Send {
    fn set_frequency(&mut self, direction: Direction, hz: f64) -> Result<()>;
    fn frequency(&self, direction: Direction) -> Result<f64>;

    fn set_gain(&mut self, direction: Direction, channel: usize, db: f64) -> Result<()>;
    fn gain(&self, direction: Direction, channel: usize) -> Result<f64>;

    /// Enables automatic gain control on an RX channel.
    fn set_gain_mode(&mut self, channel: usize, automatic: bool) -> Result<()>;
    fn gain_mode(&self, channel: usize) -> Result<bool>;

    fn set_sample_rate(&mut self, direction: Direction, rate: f64) -> Result<()>;
    fn sample_rate(&self, direction: Direction) -> Result<f64>;

    fn set_bandwidth(&mut self, direction: Direction, hz: f64) -> Result<()>;
    fn bandwidth(&self, direction: Direction) -> Result<f64>;

    /// Die temperature in degrees Celsius.
    fn temperature(&mut self) -> Result<f64>;
}

/// Closed interval of supported values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Range {
    pub min: f64,
    pub max: f64,
}

impl Range {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        (self.min..=self.max).contains(&value)
    }

    pub(crate) fn check(&self, what: &'static str, value: f64) -> Result<()> {
        if self.contains(value) {
            Ok(())
        } else {
            Err(Error::OutOfRange {
                what,
                value,
                min: self.min,
                max: self.max,
            })
        }
    }
}

/// Lowest rate the AD9361 reaches: its 25 MHz reference divided by 96.
pub const MIN_SAMPLE_RATE: f64 = 25e6 / 96.0;
pub const SAMPLE_RATE_RANGE: Range = Range::new(MIN_SAMPLE_RATE, 61.44e6);
pub const BANDWIDTH_RANGE: Range = Range::new(0.2e6, 56.0e6);

/// Rates offered to applications that want a list instead of a range.
pub const SAMPLE_RATES: [f64; 8] = [
    MIN_SAMPLE_RATE,
    1.0e6,
    2.5e6,
    5.0e6,
    10.0e6,
    20.0e6,
    30.72e6,
    61.44e6,
];

pub fn frequency_range(direction: Direction) -> Range {
    match direction {
        Direction::Rx => Range::new(70e6, 6e9),
        Direction::Tx => Range::new(47e6, 6e9),
    }
}

pub fn gain_range(direction: Direction) -> Range {
    match direction {
        Direction::Rx => Range::new(0.0, 73.0),
        Direction::Tx => Range::new(-89.0, 0.0),
    }
}

pub fn antennas(direction: Direction) -> &'static [&'static str] {
    match direction {
        Direction::Rx => &["A_BALANCED"],
        Direction::Tx => &["A"],
    }
}

/// Gain elements; the RFIC exposes a single programmable stage.
pub const GAINS: [&str; 1] = ["PGA"];

/// Board sensors readable through [`crate::M2sdrDevice::read_sensor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sensor {
    FpgaTemp,
    FpgaVccInt,
    FpgaVccAux,
    FpgaVccBram,
    Ad9361Temp,
}

/// Description of a sensor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorInfo {
    pub key: &'static str,
    pub units: &'static str,
    pub description: &'static str,
}

impl Sensor {
    pub const FPGA: [Sensor; 4] = [
        Sensor::FpgaTemp,
        Sensor::FpgaVccInt,
        Sensor::FpgaVccAux,
        Sensor::FpgaVccBram,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Sensor::FpgaTemp => "fpga_temp",
            Sensor::FpgaVccInt => "fpga_vccint",
            Sensor::FpgaVccAux => "fpga_vccaux",
            Sensor::FpgaVccBram => "fpga_vccbram",
            Sensor::Ad9361Temp => "ad9361_temp",
        }
    }

    pub fn info(self) -> SensorInfo {
        let (units, description) = match self {
            Sensor::FpgaTemp => ("°C", "FPGA temperature"),
            Sensor::FpgaVccInt => ("V", "FPGA internal supply voltage"),
            Sensor::FpgaVccAux => ("V", "FPGA auxiliary supply voltage"),
            Sensor::FpgaVccBram => ("V", "FPGA block RAM supply voltage"),
            Sensor::Ad9361Temp => ("°C", "AD9361 temperature"),
        };
        SensorInfo {
            key: self.key(),
            units,
            description,
        }
    }
}

impl fmt::Display for Sensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for Sensor {
    type Err = Error;

    fn from_str(key: &str) -> Result<Self> {
        match key {
            "fpga_temp" => Ok(Sensor::FpgaTemp),
            "fpga_vccint" => Ok(Sensor::FpgaVccInt),
            "fpga_vccaux" => Ok(Sensor::FpgaVccAux),
            "fpga_vccbram" => Ok(Sensor::FpgaVccBram),
            "ad9361_temp" => Ok(Sensor::Ad9361Temp),
            other => Err(Error::UnknownSensor(other.to_string())),
        }
    }
}

/// Converts a 12-bit XADC temperature code to degrees Celsius.
pub fn xadc_temperature(raw: u32) -> f64 {
    f64::from(raw) * 503.975 / 4096.0 - 273.15
}

/// Converts a 12-bit XADC supply code to volts.
pub fn xadc_voltage(raw: u32) -> f64 {
    f64::from(raw) / 4096.0 * 3.0
}

/// State shared by the control plane and stream activation.
pub(crate) struct ControlState {
    pub rfic: Box<dyn RficControl>,
    pub sample_mode: SampleMode,
    pub loopback: bool,
    /// Selected antenna per direction and channel.
    pub antennas: [[String; 2]; 2],
    /// Streams currently holding a DMA engine.
    pub active_streams: usize,
}

impl ControlState {
    pub fn new(rfic: Box<dyn RficControl>, sample_mode: SampleMode, loopback: bool) -> Self {
        let default_antenna = |direction| antennas(direction)[0].to_string();
        Self {
            rfic,
            sample_mode,
            loopback,
            antennas: Direction::ALL.map(|d| [default_antenna(d), default_antenna(d)]),
            active_streams: 0,
        }
    }
}
