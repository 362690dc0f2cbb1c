// SPDX-FileCopyrightText: 2025 Contributors to the LiteX M2SDR project.
// SPDX-License-Identifier: Apache-2.0

//! Sends a counter pattern through the gateware TX to RX loopback and checks
//! what comes back.
//!
//! ```text
//! cargo run --example loopback_test -- --simulate --slots 256
//! ```

mod common;

use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use clap::Parser;
use m2sdr::{Direction, SampleMode, SimulatedDevice, StreamFlags, config::StreamArgs};
use num_complex::Complex32;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(version, about = "M2SDR DMA loopback test", long_about = None)]
struct Args {
    /// Device configuration (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Use an in-memory board
    #[arg(long)]
    simulate: bool,

    /// Use 8-bit wire samples
    #[arg(long)]
    bits8: bool,

    /// Number of slots to send
    #[arg(short, long, default_value_t = 64)]
    slots: usize,
}

/// Plays the board side of a simulated device: consumes submitted TX slots,
/// which the loopback path feeds into RX.
fn drain_tx(sim: Arc<SimulatedDevice>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::Relaxed) {
        match sim.drain_tx() {
            Ok(Some(_)) => {}
            Ok(None) => thread::sleep(Duration::from_micros(100)),
            Err(err) => {
                warn!("Simulated board stopped: {}", err);
                return;
            }
        }
    }
}

/// Ramp on the 8-bit grid, exact in 8-bit mode and within 1e-3 in 16-bit.
fn pattern(slot: usize, len: usize) -> Vec<Complex32> {
    (0..len)
        .map(|n| {
            let value = ((slot * len + n) % 127) as f32 / 127.0;
            Complex32::new(value, -value)
        })
        .collect()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    common::setup_logging();
    let args = Args::parse();

    let (device, sim) = common::open_device(args.config, args.simulate)?;
    if args.bits8 {
        device.set_sample_mode(SampleMode::Bits8)?;
    }
    device.set_loopback(true)?;

    let mut rx = device.setup_stream(Direction::Rx, "CF32", &[0], &StreamArgs::default())?;
    let mut tx = device.setup_stream(Direction::Tx, "CF32", &[0], &StreamArgs::default())?;
    // RX first so nothing looped back is lost.
    rx.activate(StreamFlags::NONE, 0, 0)?;
    tx.activate(StreamFlags::NONE, 0, 0)?;

    let stop = Arc::new(AtomicBool::new(false));
    let board = sim.map(|sim| {
        let stop = stop.clone();
        thread::spawn(move || drain_tx(sim, stop))
    });

    let mtu = tx.mtu()?;
    let mut received = vec![Complex32::default(); mtu];
    let mut errors = 0usize;
    let started = Instant::now();
    for slot in 0..args.slots {
        let sent = pattern(slot, mtu);
        tx.write(
            &[sent.as_slice()],
            StreamFlags::END_BURST,
            0,
            Duration::from_secs(1),
        )?;
        let result = rx.read(&mut [received.as_mut_slice()], Duration::from_secs(1))?;
        errors += sent[..result.elements]
            .iter()
            .zip(&received[..result.elements])
            .filter(|(a, b)| (**a - **b).norm() > 1e-3)
            .count();
        if result.elements < mtu {
            warn!(slot, elements = result.elements, "Short read");
        }
    }
    let elapsed = started.elapsed();

    stop.store(true, Ordering::Relaxed);
    if let Some(board) = board {
        let _ = board.join();
    }
    tx.close()?;
    rx.close()?;

    let samples = args.slots * mtu;
    info!(
        samples,
        errors,
        rate_msps = samples as f64 / elapsed.as_secs_f64() / 1e6,
        tx = %serde_json::to_string(&tx.stats())?,
        rx = %serde_json::to_string(&rx.stats())?,
        "Loopback test finished"
    );
    if errors > 0 {
        error!(errors, "Loopback data mismatch");
        std::process::exit(1);
    }
    Ok(())
}
