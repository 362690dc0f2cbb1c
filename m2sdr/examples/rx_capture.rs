// SPDX-FileCopyrightText: 2025 Contributors to the LiteX M2SDR project.
// SPDX-License-Identifier: Apache-2.0

//! Captures RX samples to a file of interleaved little-endian CF32.
//!
//! On real hardware:
//!
//! ```text
//! cargo run --example rx_capture -- --config m2sdr.json --frequency 2.4e9 -n 1000000 -o capture.cf32
//! ```
//!
//! Without a board, `--simulate` feeds a test tone from an in-memory device.

mod common;

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use clap::Parser;
use m2sdr::{
    DeviceHandle, Direction, SampleCodec, SampleMode, SimulatedDevice, StreamFlags,
    config::StreamArgs,
};
use num_complex::Complex32;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(version, about = "Capture M2SDR RX samples", long_about = None)]
struct Args {
    /// Device configuration (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Use an in-memory board generating a test tone
    #[arg(long)]
    simulate: bool,

    /// RX channels to capture
    #[arg(long, value_delimiter = ',', default_value = "0")]
    channels: Vec<usize>,

    /// RX sample rate (S/s)
    #[arg(long, default_value_t = 30.72e6)]
    sample_rate: f64,

    /// RX LO frequency (Hz)
    #[arg(long, default_value_t = 100e6)]
    frequency: f64,

    /// Samples per channel to capture
    #[arg(short = 'n', long, default_value_t = 1 << 20)]
    samples: usize,

    /// Output file
    #[arg(short, long, default_value = "capture.cf32")]
    output: PathBuf,
}

/// Plays the board side of a simulated device: keeps the RX ring topped up
/// with a complex tone until `stop` is set.
fn feed_tone(sim: Arc<SimulatedDevice>, channels: usize, stop: Arc<AtomicBool>) {
    let Ok(codec) = SampleCodec::new(SampleMode::Bits16, channels) else {
        return;
    };
    let Ok(info) = sim.dma_info() else {
        return;
    };
    let geometry = info.geometry(Direction::Rx);
    let per_slot = codec.samples_per_slot(geometry.slot_size);
    let mut phase = 0.0f32;
    while !stop.load(Ordering::Relaxed) {
        let counters = sim.counters(Direction::Rx);
        if counters.hw_count.saturating_sub(counters.sw_count) >= geometry.slot_count as u64 / 2 {
            thread::sleep(Duration::from_micros(200));
            continue;
        }
        let tone: Vec<Complex32> = (0..per_slot)
            .map(|n| Complex32::from_polar(0.5, phase + n as f32 * 0.05))
            .collect();
        phase += per_slot as f32 * 0.05;
        let inputs = vec![tone.as_slice(); channels];
        let injected = codec
            .encode(&inputs)
            .and_then(|payload| sim.inject_rx(&payload));
        if let Err(err) = injected {
            warn!("Simulated board stopped: {}", err);
            return;
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    common::setup_logging();
    let args = Args::parse();

    let (device, sim) = common::open_device(args.config, args.simulate)?;
    info!(
        driver = device.driver_key(),
        hardware = device.hardware_key(),
        "Device ready"
    );
    device.set_sample_rate(Direction::Rx, args.sample_rate)?;
    for &channel in &args.channels {
        device.set_frequency(Direction::Rx, channel, args.frequency)?;
    }

    let mut rx = device.setup_stream(
        Direction::Rx,
        "CF32",
        &args.channels,
        &StreamArgs::default(),
    )?;
    rx.activate(StreamFlags::NONE, 0, 0)?;

    let stop = Arc::new(AtomicBool::new(false));
    let board = sim.map(|sim| {
        let stop = stop.clone();
        let channels = args.channels.len();
        thread::spawn(move || feed_tone(sim, channels, stop))
    });

    let chunk = rx.mtu()?;
    let mut buffers = vec![vec![Complex32::default(); chunk]; args.channels.len()];
    let mut output = BufWriter::new(File::create(&args.output)?);
    let mut captured = 0;
    while captured < args.samples {
        let want = chunk.min(args.samples - captured);
        let mut views: Vec<&mut [Complex32]> = buffers
            .iter_mut()
            .map(|buffer| &mut buffer[..want])
            .collect();
        let result = match rx.read(&mut views, Duration::from_secs(1)) {
            Ok(result) => result,
            Err(m2sdr::Error::Timeout) => {
                warn!("No samples within 1 s");
                continue;
            }
            Err(err) => return Err(err.into()),
        };
        if result.flags.contains(StreamFlags::OVERFLOW) {
            warn!(time_ns = result.time_ns, "Overflow");
        }
        for n in 0..result.elements {
            for buffer in &buffers {
                output.write_all(&buffer[n].re.to_le_bytes())?;
                output.write_all(&buffer[n].im.to_le_bytes())?;
            }
        }
        captured += result.elements;
    }
    output.flush()?;

    stop.store(true, Ordering::Relaxed);
    if let Some(board) = board {
        let _ = board.join();
    }
    rx.close()?;
    info!(
        samples = captured,
        output = %args.output.display(),
        stats = %serde_json::to_string(&rx.stats())?,
        "Capture complete"
    );
    Ok(())
}
