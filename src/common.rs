//! Small utilities shared by the simulator and the binaries

use std::time::Instant;

/// Tracks elapsed time since creation
pub struct TimeKeeper {
    start: Instant,
}

impl TimeKeeper {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }

    /// Elapsed time in seconds
    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    /// Elapsed time in whole milliseconds
    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

impl Default for TimeKeeper {
    fn default() -> Self {
        Self::new()
    }
}

/// Centered bar for a signed value on a `±max_value` scale
///
/// The result is `width + 1` characters wide; the extra one is the `|` center marker.
///
/// ```
/// use accel_telemetry::create_bar;
///
/// let bar = create_bar(1.5, 2.0, 40);
/// println!("[{}]", bar);
/// ```
pub fn create_bar(value: f64, max_value: f64, width: usize) -> String {
    let normalized = if max_value > 0.0 { (value / max_value).clamp(-1.0, 1.0) } else { 0.0 };
    let center = width / 2;
    let filled = ((normalized.abs() * center as f64) as usize).min(center);

    let mut bar = String::with_capacity(width + 1);
    if normalized < 0.0 {
        bar.push_str(&" ".repeat(center - filled));
        bar.push_str(&"█".repeat(filled));
        bar.push('|');
        bar.push_str(&" ".repeat(center));
    } else {
        bar.push_str(&" ".repeat(center));
        bar.push('|');
        bar.push_str(&"█".repeat(filled));
        bar.push_str(&" ".repeat(center - filled));
    }
    bar
}

/// Left-aligned bar for a non-negative value such as |a|
pub fn level_bar(value: f64, max_value: f64, width: usize) -> String {
    let fraction = if max_value > 0.0 { (value / max_value).clamp(0.0, 1.0) } else { 0.0 };
    let filled = ((fraction * width as f64) as usize).min(width);
    format!("{}{}", "█".repeat(filled), "·".repeat(width - filled))
}
