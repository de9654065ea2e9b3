//! Telemetry console - live view of the accelerometer node
//!
//! Connects to the node (simulated unless `--udp` is given), redraws smoothed
//! acceleration, velocity and peak magnitude in place, and accepts one-line
//! commands on stdin:
//!
//!   scale 2g|6g, calibrate, ping, stream on|off, filter <kind> <width>,
//!   record [x|y|z], stop, clear, save <path>, reconnect, quit

use accel_telemetry::cli::{parse_smoothing, LinkArgs};
use accel_telemetry::{
    create_bar, level_bar, Axis, Classification, CommandKind, PresentationPort, ScaleSetting, SeriesUpdate,
    SmoothedPoint, TelemetrySession, TimeKeeper,
};
use clap::Parser;
use parking_lot::Mutex;
use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "telemetry-console")]
#[command(about = "Live console view of the accelerometer node", long_about = None)]
struct Args {
    #[command(flatten)]
    link: LinkArgs,

    /// Initial smoothing: none, boxcar, triangular
    #[arg(long, value_parser = parse_smoothing)]
    filter: Option<accel_telemetry::SmoothingKind>,

    /// Smoothing width (normalized to an odd value of at least 3)
    #[arg(long, default_value = "5")]
    width: i64,

    /// Stop after this many seconds (runs until Ctrl+C or `quit` if omitted)
    #[arg(short, long)]
    duration: Option<u64>,
}

/// What the screen shows, updated from worker threads
#[derive(Default)]
struct DisplayState {
    latest: Option<SmoothedPoint>,
    velocity: [f64; 3],
    max_magnitude: f64,
    samples: u64,
    status: String,
    last_event: String,
}

#[derive(Default)]
struct ConsolePort {
    state: Mutex<DisplayState>,
}

impl PresentationPort for ConsolePort {
    fn on_sample_batch(&self, update: &SeriesUpdate) {
        let mut state = self.state.lock();
        if let Some(point) = update.points.last() {
            state.latest = Some(*point);
        }
        state.velocity = update.integrated.velocity;
        state.samples += 1;
    }

    fn on_connection_status(&self, _connected: bool, message: &str) {
        self.state.lock().status = message.to_string();
    }

    fn on_max_magnitude_update(&self, value: f64) {
        self.state.lock().max_magnitude = value;
    }

    fn on_gesture_classified(&self, result: &Classification) {
        self.state.lock().last_event = match result {
            Classification::Recognized { name, score } => format!("Gesture: {} ({:.0}%)", name, score * 100.0),
            Classification::Unrecognized { best_score } => {
                format!("Gesture not recognized (best {:.0}%)", best_score * 100.0)
            }
        };
    }

    fn on_command_failed(&self, kind: CommandKind, reason: &str) {
        self.state.lock().last_event = format!("{} failed: {}", kind, reason);
    }

    fn on_ping_reply(&self, round_trip: Duration) {
        self.state.lock().last_event = format!("Ping: {:.1} ms", round_trip.as_secs_f64() * 1000.0);
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let config = args.link.load_config()?;
    let open = args.link.open(config)?;
    let session = Arc::new(open.session);

    if let Some(kind) = args.filter {
        session.set_filter(kind, args.width)?;
    }

    let port = Arc::new(ConsolePort::default());
    session.subscribe(port.clone());

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    spawn_command_reader(Arc::clone(&session), Arc::clone(&port), running.clone());

    session.connect()?;

    let timer = TimeKeeper::new();

    // Clear screen once at start
    print!("\x1B[2J\x1B[H");
    io::stdout().flush()?;

    while running.load(Ordering::SeqCst) {
        if let Some(limit) = args.duration {
            if timer.elapsed_secs() >= limit as f64 {
                break;
            }
        }
        draw(&session, &port, timer.elapsed_secs())?;
        thread::sleep(Duration::from_millis(100));
    }

    println!("\nStopping...");
    session.disconnect()?;
    if session.has_unsaved_data() {
        println!("Note: {} unsaved samples discarded", session.series_len());
    }
    drop(open.node);
    Ok(())
}

fn draw(session: &TelemetrySession, port: &ConsolePort, elapsed: f64) -> io::Result<()> {
    let snapshot = session.link_snapshot();
    let range = snapshot.scale.range_g();
    let filter = session.filter();
    let state = port.state.lock();

    // Move cursor to top without clearing (reduces flicker)
    print!("\x1B[H");

    println!("Accelerometer Telemetry - Live Data                               ");
    println!("===================================                               ");
    println!(
        "Time: {:.1}s | Samples: {} | Link: {} | Scale: {}{}              ",
        elapsed,
        state.samples,
        snapshot.state,
        snapshot.scale,
        if snapshot.scale_confirmed { "" } else { " (pending)" }
    );
    println!("Status: {:<60}", state.status);
    println!(
        "Filter: {:?} width {} | Malformed: {} | Discarded: {}          ",
        filter.kind, filter.width, snapshot.malformed_frames, snapshot.discarded_telemetry
    );
    println!();

    let accel = state.latest.map(|p| p.accel).unwrap_or_default();
    let magnitude = state.latest.map(|p| p.magnitude).unwrap_or_default();
    println!(
        "ACCELERATION (g)                 -{:.0}g ◄─────────┼─────────► +{:.0}g",
        range, range
    );
    for axis in Axis::ALL {
        println!("  {}: {:7.3}g  [{}]", axis, accel[axis.index()], create_bar(accel[axis.index()], range, 40));
    }
    println!("  |a|: {:5.3}g  [{}]", magnitude, level_bar(magnitude, range, 41));
    println!();

    println!("VELOCITY (m/s)                                                   ");
    for axis in Axis::ALL {
        println!("  {}: {:8.3}                                ", axis, state.velocity[axis.index()]);
    }
    println!("Peak |a|: {:.3}g                                                 ", state.max_magnitude);
    println!();

    let recording = if session.is_recording_gesture() { "recording gesture" } else { "" };
    println!("{:<50}{:<20}", state.last_event, recording);
    println!("> scale 2g|6g, calibrate, ping, stream on|off, filter <kind> <w>, record [axis], stop, clear, save <path>, quit");

    io::stdout().flush()
}

fn spawn_command_reader(session: Arc<TelemetrySession>, port: Arc<ConsolePort>, running: Arc<AtomicBool>) {
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            let words: Vec<&str> = line.split_whitespace().collect();
            if words.first() == Some(&"quit") {
                running.store(false, Ordering::SeqCst);
                break;
            }
            let message = match run_command(&session, &words) {
                Ok(message) => message,
                Err(e) => format!("Error: {}", e),
            };
            port.state.lock().last_event = message;
        }
    });
}

fn run_command(session: &TelemetrySession, words: &[&str]) -> Result<String, Box<dyn std::error::Error>> {
    let message = match words {
        [] => String::new(),
        ["scale", value] => {
            let scale = value.parse::<ScaleSetting>()?;
            session.set_scale(scale)?;
            format!("Setting scale to {}", scale)
        }
        ["calibrate"] => {
            session.calibrate()?;
            "Calibrating".to_string()
        }
        ["ping"] => {
            session.ping()?;
            "Ping sent".to_string()
        }
        ["stream", "on"] => {
            session.set_streaming(true)?;
            "Streaming on".to_string()
        }
        ["stream", "off"] => {
            session.set_streaming(false)?;
            "Streaming off".to_string()
        }
        ["filter", kind, width] => {
            let filter = session.set_filter(parse_smoothing(kind)?, width.parse::<i64>()?)?;
            format!("Filter {:?} width {}", filter.kind, filter.width)
        }
        ["record"] => {
            session.start_gesture_recording(None)?;
            "Recording gesture".to_string()
        }
        ["record", axis] => {
            let axis = axis.parse::<Axis>()?;
            session.start_gesture_recording(Some(axis))?;
            format!("Recording gesture ({} inactive)", axis)
        }
        ["stop"] => {
            let gesture = session.stop_gesture_recording()?;
            format!("Recorded {}; classifying", gesture)
        }
        ["clear"] => {
            session.clear()?;
            "Cleared".to_string()
        }
        ["save", path] => {
            session.save_series(path)?;
            format!("Saved to {}", path)
        }
        ["reconnect"] => {
            session.reconnect()?;
            "Reconnecting".to_string()
        }
        other => format!("Unknown command: {}", other.join(" ")),
    };
    Ok(message)
}
