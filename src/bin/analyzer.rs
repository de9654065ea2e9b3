//! Telemetry analyzer
//!
//! Offline tool for recorded series files: statistics, replay through the
//! stream processor, gesture classification and template management.
//!
//! Usage:
//!   analyzer stats --input run.csv --start 5.0 --end 10.0
//!   analyzer replay --input run.csv --filter triangular --width 9
//!   analyzer classify --input run.csv --inactive z --library gestures.json
//!   analyzer add-template --input run.csv --name wave --library gestures.json

use accel_telemetry::cli::parse_smoothing;
use accel_telemetry::gesture::format_pattern;
use accel_telemetry::{
    load_series_file, replay, Axis, Classification, FilterConfig, Gesture, GestureLibrary, Matcher, ProcessorConfig,
    RecordedSeries, SessionConfig, SmoothingKind, TelemetrySample,
};
use clap::{Args, Parser, Subcommand};
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "analyzer")]
#[command(about = "Analyze recorded accelerometer series", long_about = None)]
struct Cli {
    /// Session configuration file (JSON) for filter, pattern and matcher settings
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: AnalyzerCommand,
}

#[derive(Subcommand, Debug)]
enum AnalyzerCommand {
    /// Per-axis statistics
    Stats {
        #[command(flatten)]
        input: InputArgs,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Replay through the stream processor and report integration results
    Replay {
        #[command(flatten)]
        input: InputArgs,

        /// Smoothing: none, boxcar, triangular
        #[arg(long, value_parser = parse_smoothing)]
        filter: Option<SmoothingKind>,

        /// Smoothing width
        #[arg(long, default_value = "5")]
        width: i64,
    },
    /// Extract the motion pattern and classify it against a template library
    Classify {
        #[command(flatten)]
        input: InputArgs,

        #[command(flatten)]
        library: LibraryArgs,

        /// Axis to ignore when labelling motion
        #[arg(long)]
        inactive: Option<Axis>,
    },
    /// Store the series' gesture as a named template
    AddTemplate {
        #[command(flatten)]
        input: InputArgs,

        #[command(flatten)]
        library: LibraryArgs,

        /// Template name
        #[arg(short, long)]
        name: String,

        /// Axis to ignore when labelling motion
        #[arg(long)]
        inactive: Option<Axis>,

        /// Replace an existing template with the same name
        #[arg(long)]
        overwrite: bool,
    },
    /// Delete a template
    RemoveTemplate {
        #[command(flatten)]
        library: LibraryArgs,

        /// Template name
        #[arg(short, long)]
        name: String,
    },
    /// List templates and their patterns
    ListTemplates {
        #[command(flatten)]
        library: LibraryArgs,
    },
}

#[derive(Args, Debug)]
struct InputArgs {
    /// Input series file
    #[arg(short, long)]
    input: PathBuf,

    /// Start time in seconds (optional, default: file start)
    #[arg(long)]
    start: Option<f64>,

    /// End time in seconds (optional, default: file end)
    #[arg(long)]
    end: Option<f64>,
}

#[derive(Args, Debug)]
struct LibraryArgs {
    /// Template library (JSON); built-in templates are used if it does not exist yet
    #[arg(short, long, default_value = "gestures.json")]
    library: PathBuf,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::default(),
    };

    match cli.command {
        AnalyzerCommand::Stats { input, output } => {
            let series = load_input(&input)?;
            let mut output: Box<dyn Write> = match output {
                Some(path) => Box::new(File::create(path)?),
                None => Box::new(io::stdout()),
            };
            write_header(&mut output, &series, &input)?;
            write_statistics(&mut output, &series.samples)?;
        }
        AnalyzerCommand::Replay { input, filter, width } => {
            let series = load_input(&input)?;
            let mut processor = config.processor.clone();
            if let Some(kind) = filter {
                processor.filter = FilterConfig::new(kind, width);
            }
            run_replay(&series, processor)?;
        }
        AnalyzerCommand::Classify { input, library, inactive } => {
            let series = load_input(&input)?;
            let gesture = Gesture::from_samples(series.samples, inactive, &config.pattern);
            let library = open_library(&library.library)?;
            let matcher = Matcher::new(config.matcher.clone())?;

            println!("Pattern: [{}]", format_pattern(gesture.pattern()));
            match matcher.classify(&gesture, &library) {
                Classification::Recognized { name, score } => {
                    println!("Recognized: {} (similarity {:.2})", name, score)
                }
                Classification::Unrecognized { best_score } => {
                    println!("Unrecognized (best similarity {:.2})", best_score)
                }
            }
        }
        AnalyzerCommand::AddTemplate { input, library, name, inactive, overwrite } => {
            let series = load_input(&input)?;
            let gesture = Gesture::from_samples(series.samples, inactive, &config.pattern);
            let mut templates = open_library(&library.library)?;
            println!("Pattern: [{}]", format_pattern(gesture.pattern()));
            templates.add_template(&name, gesture, overwrite)?;
            templates.save(&library.library)?;
            println!("Saved template '{}' to {}", name, library.library.display());
        }
        AnalyzerCommand::RemoveTemplate { library, name } => {
            let mut templates = open_library(&library.library)?;
            templates.remove_template(&name)?;
            templates.save(&library.library)?;
            println!("Removed template '{}'", name);
        }
        AnalyzerCommand::ListTemplates { library } => {
            let templates = open_library(&library.library)?;
            for template in templates.iter() {
                println!("{:<16} [{}]", template.name, format_pattern(template.gesture.pattern()));
            }
        }
    }

    Ok(())
}

fn open_library(path: &Path) -> accel_telemetry::Result<GestureLibrary> {
    if path.exists() {
        GestureLibrary::load(path)
    } else {
        log::info!("{} not found; starting from built-in templates", path.display());
        Ok(GestureLibrary::with_builtins())
    }
}

/// Load a series and cut it to the requested time range
fn load_input(input: &InputArgs) -> Result<RecordedSeries, Box<dyn std::error::Error>> {
    println!("Loading data from {}...", input.input.display());
    let mut series = load_series_file(&input.input)?;

    let Some((file_start, file_end)) = series.time_range() else {
        return Err("no samples in file".into());
    };
    let start_time = input.start.unwrap_or(file_start);
    let end_time = input.end.unwrap_or(file_end);

    if start_time < file_start || end_time > file_end {
        eprintln!(
            "Warning: Requested time range [{}, {}] extends beyond file range [{}, {}]",
            start_time, end_time, file_start, file_end
        );
    }
    if start_time > end_time {
        return Err("start time must not be after end time".into());
    }

    series.samples.retain(|s| s.timestamp() >= start_time && s.timestamp() <= end_time);
    if series.samples.is_empty() {
        return Err("no samples in specified time range".into());
    }

    println!(
        "Loaded {} samples ({:.2}s to {:.2}s)",
        series.samples.len(),
        start_time.max(file_start),
        end_time.min(file_end)
    );
    Ok(series)
}

fn write_header(output: &mut dyn Write, series: &RecordedSeries, input: &InputArgs) -> io::Result<()> {
    writeln!(output, "{}", "=".repeat(80))?;
    writeln!(output, "ACCELERATION SERIES REPORT")?;
    writeln!(output, "{}", "=".repeat(80))?;
    writeln!(output)?;
    writeln!(output, "File Information:")?;
    writeln!(output, "  Path: {}", input.input.display())?;
    writeln!(output, "  Format version: {}", series.metadata.version)?;
    writeln!(output, "  Recorded at: {}", series.metadata.recorded_at)?;
    writeln!(output, "  Scale: {}", series.metadata.scale)?;
    if let Some((start, end)) = series.time_range() {
        writeln!(output)?;
        writeln!(output, "Analysis Range:")?;
        writeln!(output, "  Start: {:.2}s", start)?;
        writeln!(output, "  End: {:.2}s", end)?;
        writeln!(output, "  Duration: {:.2}s", end - start)?;
        writeln!(output, "  Samples: {}", series.samples.len())?;
        if end > start {
            writeln!(output, "  Mean rate: {:.1} Hz", (series.samples.len() - 1) as f64 / (end - start))?;
        }
    }
    Ok(())
}

#[derive(Debug, PartialEq)]
struct Stats {
    mean: f64,
    rms: f64,
    std_dev: f64,
    min: f64,
    max: f64,
    peak_to_peak: f64,
}

fn compute_stats(data: &[f64]) -> Stats {
    let n = data.len() as f64;

    let mean = data.iter().sum::<f64>() / n;
    let rms = (data.iter().map(|&x| x * x).sum::<f64>() / n).sqrt();
    let variance = data.iter().map(|&x| (x - mean).powi(2)).sum::<f64>() / n;

    let min = data.iter().copied().fold(f64::INFINITY, f64::min);
    let max = data.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    Stats { mean, rms, std_dev: variance.sqrt(), min, max, peak_to_peak: max - min }
}

fn write_statistics(output: &mut dyn Write, samples: &[TelemetrySample]) -> io::Result<()> {
    writeln!(output, "\n{}", "=".repeat(80))?;
    writeln!(output, "STATISTICAL ANALYSIS")?;
    writeln!(output, "{}", "=".repeat(80))?;
    writeln!(output)?;
    writeln!(output, "Acceleration Statistics (g):")?;
    writeln!(output, "{:-<80}", "")?;
    writeln!(
        output,
        "{:<10} {:>12} {:>12} {:>12} {:>12} {:>12} {:>12}",
        "Axis", "Mean", "RMS", "Std Dev", "Min", "Max", "Peak-Peak"
    )?;
    writeln!(output, "{:-<80}", "")?;

    for axis in Axis::ALL {
        let data: Vec<f64> = samples.iter().map(|s| s.axis(axis)).collect();
        write_stats_row(output, &axis.to_string(), &compute_stats(&data))?;
    }
    let magnitude: Vec<f64> = samples.iter().map(TelemetrySample::magnitude).collect();
    write_stats_row(output, "|a|", &compute_stats(&magnitude))?;
    Ok(())
}

fn write_stats_row(output: &mut dyn Write, axis: &str, stats: &Stats) -> io::Result<()> {
    writeln!(
        output,
        "{:<10} {:>12.4} {:>12.4} {:>12.4} {:>12.4} {:>12.4} {:>12.4}",
        axis, stats.mean, stats.rms, stats.std_dev, stats.min, stats.max, stats.peak_to_peak
    )
}

fn run_replay(series: &RecordedSeries, config: ProcessorConfig) -> Result<(), Box<dyn std::error::Error>> {
    let filter = config.filter;
    let (points, integrated) = replay(config, &series.samples)?;

    println!();
    println!("Replay ({:?}, width {}):", filter.kind, filter.width);
    println!("  Smoothed points: {}", points.len());
    if let Some(peak) = points.iter().map(|p| p.magnitude).reduce(f64::max) {
        println!("  Peak smoothed |a|: {:.4}g", peak);
    }
    println!("  Peak raw |a|: {:.4}g", integrated.max_magnitude);
    println!();
    println!("Integrated state at end of series:");
    for axis in Axis::ALL {
        println!(
            "  {}: velocity {:>10.4} m/s   distance {:>10.4} m",
            axis,
            integrated.velocity[axis.index()],
            integrated.distance[axis.index()]
        );
    }
    Ok(())
}
