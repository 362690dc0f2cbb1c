// SPDX-FileCopyrightText: 2025 Contributors to the LiteX M2SDR project.
// SPDX-License-Identifier: Apache-2.0

//! Device façade: opening, stream setup and the control plane.
//!
//! This module provides [`M2sdrDevice`], the main entry point. It owns the
//! transport, maps both DMA rings once, and shares them with every
//! [`StreamSession`] it creates.

use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use tracing::{debug, info};

use crate::{
    DeviceHandle, Direction, Error, LitePcieDevice, Result, SampleMode, SimulatedDevice,
    StreamSession,
    config::{CsrMap, DeviceConfig, StreamArgs},
    control::{
        self, BANDWIDTH_RANGE, ControlState, GAINS, Range, RficControl, SAMPLE_RATE_RANGE,
        SAMPLE_RATES, Sensor, SensorInfo, SimulatedRfic,
    },
    ring::RingBufferMap,
    stream::FORMAT_CF32,
};

/// Defaults applied to the RFIC at open, unless initialisation is bypassed.
const DEFAULT_SAMPLE_RATE: f64 = 30.72e6;
const DEFAULT_BANDWIDTH: f64 = 30.72e6;
const DEFAULT_FREQUENCY: f64 = 1e6;

/// Internal shared context of an open device.
///
/// Kept apart from [`M2sdrDevice`] so that stream sessions can outlive the
/// façade. The rings are unmapped when the last reference is dropped.
pub(crate) struct DeviceContext {
    pub(crate) device: Arc<dyn DeviceHandle>,
    rings: [Arc<RingBufferMap>; 2],
    control: Mutex<ControlState>,
    csr: CsrMap,
    pub(crate) poll_interval: Duration,
}

impl DeviceContext {
    pub(crate) fn ring(&self, direction: Direction) -> Arc<RingBufferMap> {
        self.rings[direction.index()].clone()
    }

    pub(crate) fn lock_control(&self) -> Result<MutexGuard<'_, ControlState>> {
        self.control
            .lock()
            .map_err(|_| Error::Other("Control state lock poisoned.".to_string()))
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        info!("Closing M2SDR device");
    }
}

fn check_channel(channel: usize) -> Result<()> {
    if channel < 2 {
        Ok(())
    } else {
        Err(Error::InvalidChannel(channel))
    }
}

/// An open M2SDR board.
///
/// The device is cheaply cloneable and thread-safe (`Send + Sync`). Control
/// calls are serialised by an internal mutex; stream sessions created from it
/// are used from one thread each.
///
/// # Examples
///
/// ```no_run
/// use m2sdr::{Direction, M2sdrDevice, SimulatedRfic, config::DeviceConfig};
///
/// # fn main() -> Result<(), m2sdr::Error> {
/// let config = DeviceConfig::from_file("m2sdr.json")?;
/// let device = M2sdrDevice::open(&config, Box::new(SimulatedRfic::new()))?;
/// device.set_frequency(Direction::Rx, 0, 2.4e9)?;
/// let rx = device.setup_stream(Direction::Rx, "CF32", &[0, 1], &Default::default())?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct M2sdrDevice {
    context: Arc<DeviceContext>,
}

impl M2sdrDevice {
    /// Opens the LitePCIe device node named in `config`.
    ///
    /// # Errors
    ///
    /// [`Error::Open`] if the node cannot be opened, [`Error::Mapping`] if a
    /// DMA ring cannot be mapped, and any error of [`Self::with_device`].
    pub fn open(config: &DeviceConfig, rfic: Box<dyn RficControl>) -> Result<Self> {
        let device = LitePcieDevice::open(&config.path)?;
        info!(path = %config.path.display(), "Opened LitePCIe device");
        Self::with_device(Arc::new(device), rfic, config)
    }

    /// Opens an in-process simulated board with default settings.
    pub fn simulated(device: Arc<SimulatedDevice>) -> Result<Self> {
        Self::with_device(
            device,
            Box::new(SimulatedRfic::new()),
            &DeviceConfig::default(),
        )
    }

    /// Brings up a board behind an arbitrary transport.
    ///
    /// Bypasses the DMA synchronizer, programs the sample format, maps both
    /// DMA rings, and applies the RFIC defaults (30.72 MS/s, 1 MHz LO,
    /// 30.72 MHz bandwidth, manual gain) unless `config.bypass_init` is set.
    pub fn with_device(
        device: Arc<dyn DeviceHandle>,
        mut rfic: Box<dyn RficControl>,
        config: &DeviceConfig,
    ) -> Result<Self> {
        let csr = config.csr;
        device.write_csr(csr.dma_synchronizer_bypass, 1)?;
        device.write_csr(csr.ad9361_format, config.sample_mode.format_register())?;

        let rings = [
            Arc::new(RingBufferMap::map(device.clone(), Direction::Rx)?),
            Arc::new(RingBufferMap::map(device.clone(), Direction::Tx)?),
        ];

        if config.bypass_init {
            debug!("Skipping RFIC initialisation");
        } else {
            for direction in Direction::ALL {
                rfic.set_sample_rate(direction, DEFAULT_SAMPLE_RATE)?;
                rfic.set_frequency(direction, DEFAULT_FREQUENCY)?;
                rfic.set_bandwidth(direction, DEFAULT_BANDWIDTH)?;
            }
            for channel in 0..2 {
                rfic.set_gain_mode(channel, false)?;
            }
        }

        let context = DeviceContext {
            device,
            rings,
            control: Mutex::new(ControlState::new(rfic, config.sample_mode, config.loopback)),
            csr,
            poll_interval: config.poll_interval(),
        };
        info!(
            sample_mode = ?config.sample_mode,
            loopback = config.loopback,
            "M2SDR initialization complete"
        );
        Ok(Self {
            context: Arc::new(context),
        })
    }

    pub fn driver_key(&self) -> &'static str {
        "LiteX-M2SDR"
    }

    pub fn hardware_key(&self) -> &'static str {
        "R01"
    }

    pub fn num_channels(&self, _direction: Direction) -> usize {
        2
    }

    pub fn full_duplex(&self, _direction: Direction, _channel: usize) -> bool {
        true
    }

    /// Host sample formats of a channel.
    pub fn stream_formats(&self, _direction: Direction, _channel: usize) -> Vec<&'static str> {
        vec![FORMAT_CF32]
    }

    /// Creates a stream session. Does not touch the hardware.
    ///
    /// `channels` is a subset of `{0, 1}` in buffer order; an empty list
    /// selects both channels.
    ///
    /// # Errors
    ///
    /// [`Error::UnsupportedFormat`] unless `format` is `"CF32"`,
    /// [`Error::InvalidChannel`] for unknown or repeated channels.
    pub fn setup_stream(
        &self,
        direction: Direction,
        format: &str,
        channels: &[usize],
        args: &StreamArgs,
    ) -> Result<StreamSession> {
        StreamSession::new(self.context.clone(), direction, format, channels, *args)
    }

    pub fn sample_mode(&self) -> Result<SampleMode> {
        Ok(self.context.lock_control()?.sample_mode)
    }

    /// Switches between 8-bit and 16-bit wire samples.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] while any stream of the device is active.
    pub fn set_sample_mode(&self, mode: SampleMode) -> Result<()> {
        let mut control = self.context.lock_control()?;
        if control.active_streams > 0 {
            return Err(Error::invalid_state(format!(
                "cannot change the sample mode with {} active stream(s)",
                control.active_streams
            )));
        }
        self.context
            .device
            .write_csr(self.context.csr.ad9361_format, mode.format_register())?;
        control.sample_mode = mode;
        debug!(?mode, "Sample mode set");
        Ok(())
    }

    pub fn loopback(&self) -> Result<bool> {
        Ok(self.context.lock_control()?.loopback)
    }

    /// Records the loopback setting; it takes effect at the next TX
    /// activation.
    pub fn set_loopback(&self, enabled: bool) -> Result<()> {
        self.context.lock_control()?.loopback = enabled;
        Ok(())
    }

    // Antennas.

    pub fn list_antennas(&self, direction: Direction, _channel: usize) -> Vec<&'static str> {
        control::antennas(direction).to_vec()
    }

    pub fn set_antenna(&self, direction: Direction, channel: usize, name: &str) -> Result<()> {
        check_channel(channel)?;
        if !control::antennas(direction).contains(&name) {
            return Err(Error::InvalidArg(format!(
                "unknown {direction} antenna {name:?}"
            )));
        }
        self.context.lock_control()?.antennas[direction.index()][channel] = name.to_string();
        Ok(())
    }

    pub fn antenna(&self, direction: Direction, channel: usize) -> Result<String> {
        check_channel(channel)?;
        Ok(self.context.lock_control()?.antennas[direction.index()][channel].clone())
    }

    // Frequency.

    pub fn list_frequencies(&self, _direction: Direction, _channel: usize) -> Vec<&'static str> {
        vec!["RF"]
    }

    pub fn frequency_range(&self, direction: Direction, _channel: usize) -> Range {
        control::frequency_range(direction)
    }

    /// Tunes the LO of `direction`. Both channels of a direction share it.
    pub fn set_frequency(&self, direction: Direction, channel: usize, hz: f64) -> Result<()> {
        check_channel(channel)?;
        control::frequency_range(direction).check("frequency", hz)?;
        debug!(%direction, channel, mhz = hz / 1e6, "Set frequency");
        self.context
            .lock_control()?
            .rfic
            .set_frequency(direction, hz)
    }

    pub fn frequency(&self, direction: Direction, channel: usize) -> Result<f64> {
        check_channel(channel)?;
        self.context.lock_control()?.rfic.frequency(direction)
    }

    // Gain.

    pub fn list_gains(&self, _direction: Direction, _channel: usize) -> Vec<&'static str> {
        GAINS.to_vec()
    }

    pub fn gain_range(&self, direction: Direction, _channel: usize) -> Range {
        control::gain_range(direction)
    }

    /// Sets the gain in dB; TX gain is negative attenuation.
    pub fn set_gain(&self, direction: Direction, channel: usize, db: f64) -> Result<()> {
        check_channel(channel)?;
        control::gain_range(direction).check("gain", db)?;
        debug!(%direction, channel, db, "Set gain");
        self.context
            .lock_control()?
            .rfic
            .set_gain(direction, channel, db)
    }

    pub fn gain(&self, direction: Direction, channel: usize) -> Result<f64> {
        check_channel(channel)?;
        self.context.lock_control()?.rfic.gain(direction, channel)
    }

    /// Automatic gain control exists on RX only.
    pub fn has_gain_mode(&self, direction: Direction, _channel: usize) -> bool {
        direction == Direction::Rx
    }

    /// Enables AGC on an RX channel. Ignored for TX.
    pub fn set_gain_mode(&self, direction: Direction, channel: usize, automatic: bool) -> Result<()> {
        check_channel(channel)?;
        if direction == Direction::Tx {
            return Ok(());
        }
        self.context
            .lock_control()?
            .rfic
            .set_gain_mode(channel, automatic)
    }

    pub fn gain_mode(&self, direction: Direction, channel: usize) -> Result<bool> {
        check_channel(channel)?;
        if direction == Direction::Tx {
            return Ok(false);
        }
        self.context.lock_control()?.rfic.gain_mode(channel)
    }

    // Sample rate.

    pub fn list_sample_rates(&self, _direction: Direction, _channel: usize) -> Vec<f64> {
        SAMPLE_RATES.to_vec()
    }

    pub fn sample_rate_range(&self, _direction: Direction, _channel: usize) -> Range {
        SAMPLE_RATE_RANGE
    }

    /// Sets the sample rate of `direction`. Takes effect for timestamps at
    /// the next activation.
    pub fn set_sample_rate(&self, direction: Direction, rate: f64) -> Result<()> {
        SAMPLE_RATE_RANGE.check("sample rate", rate)?;
        debug!(%direction, msps = rate / 1e6, "Set sample rate");
        self.context
            .lock_control()?
            .rfic
            .set_sample_rate(direction, rate)
    }

    pub fn sample_rate(&self, direction: Direction) -> Result<f64> {
        self.context.lock_control()?.rfic.sample_rate(direction)
    }

    // Bandwidth.

    pub fn bandwidth_range(&self, _direction: Direction, _channel: usize) -> Range {
        BANDWIDTH_RANGE
    }

    /// Sets the analog bandwidth of `direction`. Zero leaves it unchanged.
    pub fn set_bandwidth(&self, direction: Direction, hz: f64) -> Result<()> {
        if hz == 0.0 {
            return Ok(());
        }
        BANDWIDTH_RANGE.check("bandwidth", hz)?;
        self.context.lock_control()?.rfic.set_bandwidth(direction, hz)
    }

    pub fn bandwidth(&self, direction: Direction) -> Result<f64> {
        self.context.lock_control()?.rfic.bandwidth(direction)
    }

    // Sensors.

    /// Sensors of this board; FPGA sensors need the XADC in the gateware.
    pub fn list_sensors(&self) -> Vec<Sensor> {
        let mut sensors = Vec::new();
        if self.context.csr.xadc.is_some() {
            sensors.extend(Sensor::FPGA);
        }
        sensors.push(Sensor::Ad9361Temp);
        sensors
    }

    pub fn sensor_info(&self, key: &str) -> Result<SensorInfo> {
        let sensor: Sensor = key.parse()?;
        if !self.list_sensors().contains(&sensor) {
            return Err(Error::UnknownSensor(key.to_string()));
        }
        Ok(sensor.info())
    }

    /// Reads a sensor by key (`fpga_temp`, `ad9361_temp`, ...).
    ///
    /// # Errors
    ///
    /// [`Error::UnknownSensor`] for keys not listed by [`Self::list_sensors`].
    pub fn read_sensor(&self, key: &str) -> Result<f64> {
        let sensor: Sensor = key.parse()?;
        let mut state = self.context.lock_control()?;
        if sensor == Sensor::Ad9361Temp {
            return state.rfic.temperature();
        }
        let Some(xadc) = self.context.csr.xadc else {
            return Err(Error::UnknownSensor(key.to_string()));
        };
        let device = &self.context.device;
        let value = match sensor {
            Sensor::FpgaTemp => control::xadc_temperature(device.read_csr(xadc.temperature)?),
            Sensor::FpgaVccInt => control::xadc_voltage(device.read_csr(xadc.vccint)?),
            Sensor::FpgaVccAux => control::xadc_voltage(device.read_csr(xadc.vccaux)?),
            Sensor::FpgaVccBram => control::xadc_voltage(device.read_csr(xadc.vccbram)?),
            Sensor::Ad9361Temp => state.rfic.temperature()?,
        };
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> (Arc<SimulatedDevice>, M2sdrDevice) {
        let sim = Arc::new(SimulatedDevice::with_slots(64, 4));
        (sim.clone(), M2sdrDevice::simulated(sim).unwrap())
    }

    #[test]
    fn open_programs_the_gateware() {
        let (sim, _device) = device();
        let csr = CsrMap::default();
        assert_eq!(sim.read_csr(csr.dma_synchronizer_bypass).unwrap(), 1);
        assert_eq!(sim.read_csr(csr.ad9361_format).unwrap(), 0);
        assert!(sim.is_mapped(Direction::Rx));
        assert!(sim.is_mapped(Direction::Tx));
    }

    #[test]
    fn rings_are_unmapped_after_the_last_user() {
        let (sim, device) = device();
        let stream = device
            .setup_stream(Direction::Rx, "CF32", &[0], &StreamArgs::default())
            .unwrap();
        drop(device);
        assert!(sim.is_mapped(Direction::Rx));
        drop(stream);
        assert!(!sim.is_mapped(Direction::Rx));
    }

    #[test]
    fn identification() {
        let (_sim, device) = device();
        assert_eq!(device.driver_key(), "LiteX-M2SDR");
        assert_eq!(device.hardware_key(), "R01");
        assert_eq!(device.num_channels(Direction::Rx), 2);
        assert!(device.full_duplex(Direction::Tx, 0));
        assert_eq!(device.stream_formats(Direction::Rx, 1), vec!["CF32"]);
    }

    #[test]
    fn rfic_defaults_are_applied() {
        let (_sim, device) = device();
        assert_eq!(device.sample_rate(Direction::Rx).unwrap(), 30.72e6);
        assert_eq!(device.bandwidth(Direction::Tx).unwrap(), 30.72e6);
        assert_eq!(device.antenna(Direction::Rx, 1).unwrap(), "A_BALANCED");
        assert_eq!(device.antenna(Direction::Tx, 0).unwrap(), "A");
    }

    #[test]
    fn control_values_are_range_checked() {
        let (_sim, device) = device();
        device.set_frequency(Direction::Tx, 0, 2.4e9).unwrap();
        assert_eq!(device.frequency(Direction::Tx, 1).unwrap(), 2.4e9);
        assert!(matches!(
            device.set_frequency(Direction::Rx, 0, 10e6),
            Err(Error::OutOfRange { .. })
        ));
        device.set_gain(Direction::Tx, 1, -20.0).unwrap();
        assert_eq!(device.gain(Direction::Tx, 1).unwrap(), -20.0);
        assert!(device.set_gain(Direction::Tx, 0, 5.0).is_err());
        assert!(matches!(
            device.set_gain(Direction::Rx, 2, 5.0),
            Err(Error::InvalidChannel(2))
        ));
        device.set_bandwidth(Direction::Rx, 0.0).unwrap();
        assert_eq!(device.bandwidth(Direction::Rx).unwrap(), 30.72e6);
        assert!(device.set_sample_rate(Direction::Rx, 100e6).is_err());
        assert!(device.set_antenna(Direction::Tx, 0, "B").is_err());
    }

    #[test]
    fn gain_mode_is_rx_only() {
        let (_sim, device) = device();
        device.set_gain_mode(Direction::Rx, 0, true).unwrap();
        device.set_gain_mode(Direction::Tx, 0, true).unwrap();
        assert!(device.gain_mode(Direction::Rx, 0).unwrap());
        assert!(!device.gain_mode(Direction::Tx, 0).unwrap());
        assert!(!device.has_gain_mode(Direction::Tx, 0));
    }

    #[test]
    fn sensors_read_xadc_and_rfic() {
        let (sim, device) = device();
        let xadc = CsrMap::default().xadc.unwrap();
        sim.write_csr(xadc.temperature, 0x9C4).unwrap();
        sim.write_csr(xadc.vccint, 0x555).unwrap();
        assert_eq!(device.list_sensors().len(), 5);
        assert!((device.read_sensor("fpga_temp").unwrap() - 34.45).abs() < 0.01);
        assert!((device.read_sensor("fpga_vccint").unwrap() - 1.0).abs() < 0.001);
        assert!(device.read_sensor("ad9361_temp").unwrap() > 0.0);
        assert_eq!(device.sensor_info("fpga_vccaux").unwrap().units, "V");
        assert!(matches!(
            device.read_sensor("board_fan"),
            Err(Error::UnknownSensor(_))
        ));
    }

    #[test]
    fn fpga_sensors_need_an_xadc() {
        let sim = Arc::new(SimulatedDevice::with_slots(64, 4));
        let mut config = DeviceConfig::default();
        config.csr.xadc = None;
        config.bypass_init = true;
        let device = M2sdrDevice::with_device(sim, Box::new(SimulatedRfic::new()), &config).unwrap();
        assert_eq!(device.list_sensors(), vec![Sensor::Ad9361Temp]);
        assert!(matches!(
            device.read_sensor("fpga_temp"),
            Err(Error::UnknownSensor(_))
        ));
        // Initialisation was bypassed: the RFIC keeps its power-on values.
        assert_eq!(device.sample_rate(Direction::Rx).unwrap(), 0.0);
    }
}
