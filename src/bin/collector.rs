//! Telemetry collector
//!
//! Connects to the node and writes every received sample to a series file
//! (CSV, or HDF5 for `.h5` paths when built with the `hdf5` feature).
//!
//! Usage:
//!   collector --output run.csv --duration 60
//!   collector --udp 192.168.1.20:9000 --scale 6g --output run.csv

use accel_telemetry::cli::LinkArgs;
#[cfg(feature = "hdf5")]
use accel_telemetry::hdf5_format::{is_hdf5_path, Hdf5SeriesWriter};
use accel_telemetry::{
    PresentationPort, ScaleSetting, SeriesUpdate, SeriesWriter, TelemetrySample, TelemetrySession, TimeKeeper,
};
use clap::Parser;
use crossbeam_channel::{Receiver, Sender};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const BATCH_SIZE: usize = 100;
const FLUSH_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "collector")]
#[command(about = "Record accelerometer telemetry to a series file", long_about = None)]
struct Args {
    #[command(flatten)]
    link: LinkArgs,

    /// Output series file path
    #[arg(short, long, default_value = "telemetry.csv")]
    output: PathBuf,

    /// Scale to request once connected (2g or 6g)
    #[arg(short, long)]
    scale: Option<ScaleSetting>,

    /// Duration in seconds (optional, runs until Ctrl+C if omitted)
    #[arg(short, long)]
    duration: Option<u64>,
}

/// Series file being written
enum Output {
    Csv(SeriesWriter),
    #[cfg(feature = "hdf5")]
    Hdf5(Hdf5SeriesWriter),
}

impl Output {
    fn create(path: &Path, scale: ScaleSetting) -> accel_telemetry::Result<Self> {
        #[cfg(feature = "hdf5")]
        {
            if is_hdf5_path(path) {
                return Ok(Output::Hdf5(Hdf5SeriesWriter::create(path, scale)?));
            }
        }
        Ok(Output::Csv(SeriesWriter::create(path, scale)?))
    }

    fn append_batch(&mut self, samples: &[TelemetrySample]) -> accel_telemetry::Result<()> {
        match self {
            Output::Csv(writer) => writer.append_batch(samples),
            #[cfg(feature = "hdf5")]
            Output::Hdf5(writer) => writer.append_batch(samples),
        }
    }

    fn flush(&mut self) -> accel_telemetry::Result<()> {
        match self {
            Output::Csv(writer) => writer.flush(),
            #[cfg(feature = "hdf5")]
            Output::Hdf5(writer) => writer.flush(),
        }
    }

    fn sample_count(&self) -> usize {
        match self {
            Output::Csv(writer) => writer.sample_count(),
            #[cfg(feature = "hdf5")]
            Output::Hdf5(writer) => writer.sample_count(),
        }
    }
}

/// Forwards raw samples to the writer loop
struct SampleForwarder {
    tx: Sender<TelemetrySample>,
}

impl PresentationPort for SampleForwarder {
    fn on_sample_batch(&self, update: &SeriesUpdate) {
        let _ = self.tx.send(update.sample);
    }

    fn on_connection_status(&self, connected: bool, message: &str) {
        if connected {
            log::info!("{}", message);
        } else {
            log::warn!("{}", message);
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    println!("Telemetry Collector");
    println!("===================");
    println!("Output file: {}", args.output.display());
    if let Some(duration) = args.duration {
        println!("Duration: {} seconds", duration);
    } else {
        println!("Duration: continuous (Ctrl+C to stop)");
    }
    println!();

    let config = args.link.load_config()?;
    let open = args.link.open(config)?;
    let session = open.session;

    let (tx, rx) = crossbeam_channel::unbounded();
    session.subscribe(Arc::new(SampleForwarder { tx }));

    // Setup Ctrl+C handler
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        println!("\nReceived Ctrl+C, stopping collection...");
        r.store(false, Ordering::SeqCst);
    })?;

    session.connect()?;
    wait_for_connection(&session, &running);
    if let Some(scale) = args.scale {
        session.set_scale(scale)?;
    }

    let mut writer = Output::create(&args.output, args.scale.unwrap_or_else(|| session.scale()))?;
    let timer = TimeKeeper::new();
    let end_time = args.duration.map(|d| Instant::now() + Duration::from_secs(d));

    println!("Starting data collection...");
    println!("Press Ctrl+C to stop\n");

    let result = collect(&mut writer, &rx, &running, end_time);
    session.disconnect()?;

    match result {
        Ok(skipped) => {
            let elapsed = timer.elapsed_secs();
            let samples = writer.sample_count();
            let actual_rate = if elapsed > 0.0 { samples as f64 / elapsed } else { 0.0 };

            println!("\nCollection complete!");
            println!("Total samples: {}", samples);
            if skipped > 0 {
                println!("Skipped samples: {} (timestamps not increasing)", skipped);
            }
            println!("Elapsed time: {:.2} seconds", elapsed);
            println!("Actual sample rate: {:.1} Hz", actual_rate);
            println!("File: {}", args.output.display());
        }
        Err(e) => {
            eprintln!("\nError during collection: {}", e);
            eprintln!("Attempting to flush data...");
            if let Err(flush_err) = writer.flush() {
                eprintln!("Failed to flush: {}", flush_err);
            }
            return Err(e);
        }
    }

    drop(session);
    drop(open.node);
    Ok(())
}

fn wait_for_connection(session: &TelemetrySession, running: &AtomicBool) {
    let timer = TimeKeeper::new();
    let mut warned = false;
    while running.load(Ordering::SeqCst) && !session.link_state().is_connected() {
        if !warned && timer.elapsed_secs() > 10.0 {
            log::warn!("Still waiting for the node ({})", session.link_state());
            warned = true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

/// Drain samples into the writer in batches; returns the number skipped
fn collect(
    writer: &mut Output,
    rx: &Receiver<TelemetrySample>,
    running: &AtomicBool,
    end_time: Option<Instant>,
) -> Result<usize, Box<dyn std::error::Error>> {
    let mut batch: Vec<TelemetrySample> = Vec::with_capacity(BATCH_SIZE);
    let mut last_timestamp: Option<f64> = None;
    let mut skipped = 0;
    let mut last_flush = Instant::now();

    while running.load(Ordering::SeqCst) {
        if end_time.map_or(false, |end| Instant::now() >= end) {
            break;
        }

        let sample = match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(sample) => sample,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        };

        // A rebooted node restarts its clock; the file must stay monotonic
        if last_timestamp.map_or(false, |last| sample.timestamp() <= last) {
            skipped += 1;
            continue;
        }
        last_timestamp = Some(sample.timestamp());
        batch.push(sample);

        // Write batch every BATCH_SIZE samples
        if batch.len() >= BATCH_SIZE {
            writer.append_batch(&batch)?;
            batch.clear();

            if last_flush.elapsed() >= FLUSH_INTERVAL {
                writer.flush()?;
                last_flush = Instant::now();
            }
        }
    }

    // Write remaining samples
    writer.append_batch(&batch)?;
    writer.flush()?;
    Ok(skipped)
}
