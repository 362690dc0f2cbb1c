// SPDX-FileCopyrightText: 2025 Contributors to the LiteX M2SDR project.
// SPDX-License-Identifier: Apache-2.0

//! Device and stream configuration.
//!
//! [`DeviceConfig`] can be built in code, deserialised from JSON, or parsed
//! from SoapySDR-style `key=value` arguments:
//!
//! ```
//! use m2sdr::config::{DeviceConfig, parse_kwargs};
//! use m2sdr::SampleMode;
//!
//! # fn main() -> Result<(), m2sdr::Error> {
//! let args = parse_kwargs("path=/dev/m2sdr1, sample_mode=8, bypass_init=1");
//! let config = DeviceConfig::from_kwargs(&args)?;
//! assert_eq!(config.sample_mode, SampleMode::Bits8);
//! assert!(config.bypass_init);
//!
//! let config = DeviceConfig::from_json(r#"{ "path": "/dev/m2sdr0", "loopback": true }"#)?;
//! assert!(config.loopback);
//! # Ok(())
//! # }
//! ```

use std::{collections::BTreeMap, path::PathBuf, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{Error, Result, SampleMode};

/// SoapySDR-style keyword arguments.
pub type Kwargs = BTreeMap<String, String>;

/// Parses `key=value` pairs separated by commas. Keys without a value map to
/// an empty string; surrounding whitespace is ignored.
pub fn parse_kwargs(args: &str) -> Kwargs {
    args.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => (key.trim().to_string(), value.trim().to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(Error::InvalidArg(format!("{key}: expected a boolean, got {other:?}"))),
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::InvalidArg(format!("{key}: expected a number, got {value:?}")))
}

/// CSR addresses used by the HAL.
///
/// Defaults follow the reference gateware's CSR map (one 0x800 page per core:
/// `xadc` at 4, `pcie_dma0` at 12, `ad9361` at 24).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CsrMap {
    /// AD9361 sample format (1: 8-bit, 0: 16-bit).
    pub ad9361_format: u32,
    /// PCIe DMA synchronizer bypass.
    pub dma_synchronizer_bypass: u32,
    /// XADC measurements, `None` when the gateware has no XADC.
    pub xadc: Option<XadcCsr>,
}

/// XADC measurement registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct XadcCsr {
    pub temperature: u32,
    pub vccint: u32,
    pub vccaux: u32,
    pub vccbram: u32,
}

impl Default for CsrMap {
    fn default() -> Self {
        Self {
            ad9361_format: 0xC00C,
            dma_synchronizer_bypass: 0x6068,
            xadc: Some(XadcCsr {
                temperature: 0x2000,
                vccint: 0x2004,
                vccaux: 0x2008,
                vccbram: 0x200C,
            }),
        }
    }
}

/// Device-wide configuration, fixed when the device is opened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceConfig {
    /// LitePCIe device node.
    pub path: PathBuf,
    /// Wire sample width.
    pub sample_mode: SampleMode,
    /// Skip clock and RFIC initialisation (the board is already configured).
    pub bypass_init: bool,
    /// Route TX back into RX inside the gateware on the next activation.
    pub loopback: bool,
    /// Longest single wait while polling for a slot, in microseconds.
    ///
    /// Bounds how long a cancellation can go unnoticed.
    pub poll_interval_us: u64,
    pub csr: CsrMap,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/dev/m2sdr0"),
            sample_mode: SampleMode::default(),
            bypass_init: false,
            loopback: false,
            poll_interval_us: 10_000,
            csr: CsrMap::default(),
        }
    }
}

impl DeviceConfig {
    /// Parses a JSON configuration; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads a JSON configuration file.
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&json)
    }

    /// Builds a configuration from device arguments.
    ///
    /// Recognised keys: `path`, `sample_mode`, `bypass_init`, `loopback`,
    /// `poll_interval_us`. Other keys (`driver`, `serial`, ...) belong to the
    /// enumeration layer and are ignored.
    pub fn from_kwargs(args: &Kwargs) -> Result<Self> {
        let mut config = Self::default();
        for (key, value) in args {
            match key.as_str() {
                "path" => config.path = PathBuf::from(value),
                "sample_mode" => config.sample_mode = value.parse()?,
                "bypass_init" => config.bypass_init = parse_bool(key, value)?,
                "loopback" => config.loopback = parse_bool(key, value)?,
                "poll_interval_us" => config.poll_interval_us = parse_number(key, value)?,
                _ => tracing::trace!(key = %key, "Ignoring device argument"),
            }
        }
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us.max(1))
    }
}

/// Per-stream arguments given to `setup_stream`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StreamArgs {
    /// Largest number of samples moved per slot iteration. Capped at the
    /// slot's sample capacity; `None` means the full slot.
    pub burst_size: Option<usize>,
}

impl StreamArgs {
    /// Parses stream arguments (`burst` or `burst_size`).
    pub fn from_kwargs(args: &Kwargs) -> Result<Self> {
        let mut stream_args = Self::default();
        for (key, value) in args {
            match key.as_str() {
                "burst" | "burst_size" => {
                    stream_args.burst_size = Some(parse_number(key, value)?);
                }
                _ => tracing::trace!(key = %key, "Ignoring stream argument"),
            }
        }
        stream_args.validate()?;
        Ok(stream_args)
    }

    /// Rejects a zero burst size, which could never move a sample.
    pub fn validate(&self) -> Result<()> {
        if self.burst_size == Some(0) {
            return Err(Error::InvalidArg("burst_size must be positive".into()));
        }
        Ok(())
    }
}
