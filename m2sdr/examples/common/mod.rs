// SPDX-FileCopyrightText: 2025 Contributors to the LiteX M2SDR project.
// SPDX-License-Identifier: Apache-2.0

//! Common utilities shared across examples.

use std::{path::PathBuf, sync::Arc};

use m2sdr::{M2sdrDevice, SimulatedDevice, SimulatedRfic, config::DeviceConfig};

/// Initializes tracing subscriber for examples.
///
/// Configures logging to stdout with an INFO level filter, respecting the
/// `RUST_LOG` environment variable for custom log levels.
pub fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();
}

/// Opens either a real board, configured from `config` when given, or an
/// in-memory simulated board.
///
/// The RFIC driver lives outside this crate; the examples stand in the
/// simulated one.
pub fn open_device(
    config: Option<PathBuf>,
    simulate: bool,
) -> Result<(M2sdrDevice, Option<Arc<SimulatedDevice>>), m2sdr::Error> {
    if simulate {
        let sim = Arc::new(SimulatedDevice::default());
        let device = M2sdrDevice::simulated(sim.clone())?;
        return Ok((device, Some(sim)));
    }
    let config = match config {
        Some(path) => DeviceConfig::from_file(path)?,
        None => DeviceConfig::default(),
    };
    let device = M2sdrDevice::open(&config, Box::new(SimulatedRfic::new()))?;
    Ok((device, None))
}
