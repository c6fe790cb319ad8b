//! # MDR Control Unit
//!
//! Runtime coordination for the MDR torque/rheometer instrument. The
//! serial command channel is bridged over stdin/stdout; the hardware
//! collaborators default to the simulation backends, with the calibration
//! blob persisted to an EEPROM image file.

use clap::Parser;
use mdr_common::ControllerConfig;
use mdr_control_unit::runtime::{spawn, Rig};
use mdr_control_unit::sim::{RecordingBus, SimRtd, SimTorqueAdc};
use mdr_control_unit::store::{FileMemory, PagedMemory};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::Ordering;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// MDR instrument controller — mode state machine, torque pipeline and
/// serial command protocol.
#[derive(Parser, Debug)]
#[command(name = "mdr_control_unit")]
#[command(version)]
#[command(about = "Runtime coordination layer for the MDR test instrument")]
struct Args {
    /// Path to the controller configuration TOML.
    #[arg(long, default_value = "config/controller.toml")]
    config: PathBuf,

    /// Path to the EEPROM image holding the calibration record.
    #[arg(long, default_value = "mdr_eeprom.bin")]
    eeprom: PathBuf,

    /// Enable verbose logging (DEBUG level).
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format.
    #[arg(long)]
    json: bool,
}

fn main() {
    let args = Args::parse();
    setup_tracing(&args);

    info!("MDR control unit v{} starting...", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(&args) {
        error!("FATAL: {e}");
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = ControllerConfig::load(&args.config)?;
    info!(
        "config OK: tick={}ms, cycle={:.0}ms, run={}s",
        config.tick_ms,
        config.cycle_period().as_millis(),
        config.default_run_duration_s
    );

    let rig = Rig {
        adc: Box::new(SimTorqueAdc::new(85_000.0, 1_500.0, config.cycle_frequency_hz)),
        rtd: Box::new(SimRtd::new(25.0, 185.0, 120.0)),
        bus: Box::new(RecordingBus::default()),
        memory: Box::new(PagedMemory::new(FileMemory::new(args.eeprom.clone()))),
    };

    let (line_tx, line_rx) = std::sync::mpsc::channel::<String>();
    let (out_tx, out_rx) = std::sync::mpsc::channel::<String>();

    let controller = spawn(&config, rig, line_rx, out_tx)?;

    // Serial reader: stdin lines into the command processor. EOF on the
    // serial channel shuts the controller down, which releases the writer
    // drain loop below.
    let shutdown = controller.shutdown_handle();
    std::thread::Builder::new()
        .name("serial-rx".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                match line {
                    Ok(line) => {
                        if line_tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            info!("serial channel closed, shutting down");
            shutdown.store(true, Ordering::Relaxed);
        })?;

    // Single serial writer: whole lines only, never interleaved.
    let stdout = std::io::stdout();
    for line in out_rx {
        let mut lock = stdout.lock();
        writeln!(lock, "{line}")?;
        lock.flush()?;
    }

    controller.stop();
    Ok(())
}

fn setup_tracing(args: &Args) {
    let default = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if args.json {
        builder.json().init();
    } else {
        builder.init();
    }
}
