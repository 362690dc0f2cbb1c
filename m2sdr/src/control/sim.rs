// SPDX-FileCopyrightText: 2025 Contributors to the LiteX M2SDR project.
// SPDX-License-Identifier: Apache-2.0

//! In-process RFIC model.

use std::collections::HashMap;

use tracing::trace;

use crate::{
    Direction, Error, Result,
    control::{RficControl, SpiBus, spi_write_then_read},
};

/// AD9361 temperature register.
const REG_TEMPERATURE: u16 = 0x00E;

/// Register file behind a [`SpiBus`]. Unwritten registers read as zero.
#[derive(Debug, Default, Clone)]
pub struct RegisterFileSpi {
    registers: HashMap<u16, u8>,
}

impl RegisterFileSpi {
    pub fn register(&self, address: u16) -> u8 {
        self.registers.get(&address).copied().unwrap_or(0)
    }
}

impl SpiBus for RegisterFileSpi {
    fn spi_transfer(&mut self, address: u16, write: Option<u8>) -> Result<Option<u8>> {
        trace!(address, ?write, "SPI transfer");
        match write {
            Some(value) => {
                self.registers.insert(address, value);
                Ok(None)
            }
            None => Ok(Some(self.register(address))),
        }
    }
}

/// RFIC stand-in that records every setting.
///
/// Values read back exactly as written. The temperature is read over SPI from
/// the temperature register (in units of 1/1.14 °C).
pub struct SimulatedRfic {
    spi: Box<dyn SpiBus>,
    frequency: [f64; 2],
    gain: [[f64; 2]; 2],
    agc: [bool; 2],
    sample_rate: [f64; 2],
    bandwidth: [f64; 2],
}

impl Default for SimulatedRfic {
    fn default() -> Self {
        let mut spi = RegisterFileSpi::default();
        // ~25 °C
        spi.registers.insert(REG_TEMPERATURE, 29);
        Self::with_spi(Box::new(spi))
    }
}

impl SimulatedRfic {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_spi(spi: Box<dyn SpiBus>) -> Self {
        Self {
            spi,
            frequency: [0.0; 2],
            gain: [[0.0; 2]; 2],
            agc: [false; 2],
            sample_rate: [0.0; 2],
            bandwidth: [0.0; 2],
        }
    }
}

fn check_channel(channel: usize) -> Result<usize> {
    if channel < 2 {
        Ok(channel)
    } else {
        Err(Error::InvalidChannel(channel))
    }
}

impl RficControl for SimulatedRfic {
    fn set_frequency(&mut self, direction: Direction, hz: f64) -> Result<()> {
        self.frequency[direction.index()] = hz;
        Ok(())
    }

    fn frequency(&self, direction: Direction) -> Result<f64> {
        Ok(self.frequency[direction.index()])
    }

    fn set_gain(&mut self, direction: Direction, channel: usize, db: f64) -> Result<()> {
        self.gain[direction.index()][check_channel(channel)?] = db;
        Ok(())
    }

    fn gain(&self, direction: Direction, channel: usize) -> Result<f64> {
        Ok(self.gain[direction.index()][check_channel(channel)?])
    }

    fn set_gain_mode(&mut self, channel: usize, automatic: bool) -> Result<()> {
        self.agc[check_channel(channel)?] = automatic;
        Ok(())
    }

    fn gain_mode(&self, channel: usize) -> Result<bool> {
        Ok(self.agc[check_channel(channel)?])
    }

    fn set_sample_rate(&mut self, direction: Direction, rate: f64) -> Result<()> {
        self.sample_rate[direction.index()] = rate;
        Ok(())
    }

    fn sample_rate(&self, direction: Direction) -> Result<f64> {
        Ok(self.sample_rate[direction.index()])
    }

    fn set_bandwidth(&mut self, direction: Direction, hz: f64) -> Result<()> {
        self.bandwidth[direction.index()] = hz;
        Ok(())
    }

    fn bandwidth(&self, direction: Direction) -> Result<f64> {
        Ok(self.bandwidth[direction.index()])
    }

    fn temperature(&mut self) -> Result<f64> {
        // Same framing as the vendor driver: 16-bit command word, one byte in.
        let mut raw = [0u8];
        spi_write_then_read(self.spi.as_mut(), &REG_TEMPERATURE.to_be_bytes(), &mut raw)?;
        Ok(f64::from(raw[0]) / 1.14)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_read_back() {
        let mut rfic = SimulatedRfic::new();
        rfic.set_frequency(Direction::Tx, 2.4e9).unwrap();
        rfic.set_gain(Direction::Rx, 1, 20.0).unwrap();
        assert_eq!(rfic.frequency(Direction::Tx).unwrap(), 2.4e9);
        assert_eq!(rfic.frequency(Direction::Rx).unwrap(), 0.0);
        assert_eq!(rfic.gain(Direction::Rx, 1).unwrap(), 20.0);
        assert!(matches!(
            rfic.set_gain(Direction::Rx, 2, 1.0),
            Err(Error::InvalidChannel(2))
        ));
    }

    #[test]
    fn temperature_comes_from_spi() {
        let mut spi = RegisterFileSpi::default();
        spi.spi_transfer(REG_TEMPERATURE, Some(57)).unwrap();
        let mut rfic = SimulatedRfic::with_spi(Box::new(spi));
        assert!((rfic.temperature().unwrap() - 50.0).abs() < 0.01);
    }
}
