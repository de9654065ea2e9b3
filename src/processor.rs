//! Streaming numerical pipeline: smoothing, integration and extrema
//!
//! Smoothing is trailing: a position is emitted once `(width - 1) / 2` later
//! samples have arrived, so the display lags by that many samples. At the very
//! start of the series the window is truncated on the left and the weights are
//! renormalized over the samples that exist.
//!
//! Integration and the running maximum always use raw samples and are not
//! affected by the smoothing configuration.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::error::{Result, TelemetryError};
use crate::sample::{TelemetrySample, STANDARD_GRAVITY};

/// Widest accepted smoothing window
pub const MAX_FILTER_WIDTH: usize = 201;

/// Accepted zoom factors for both axes
pub const ZOOM_FACTORS: [f64; 5] = [0.5, 1.0, 2.0, 4.0, 8.0];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmoothingKind {
    #[default]
    None,
    Boxcar,
    Triangular,
}

/// Smoothing kind and (always odd, ≥ 3) width
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub kind: SmoothingKind,
    pub width: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self { kind: SmoothingKind::None, width: 5 }
    }
}

impl FilterConfig {
    /// Build a config, normalizing the width with [`normalize_width`]
    pub fn new(kind: SmoothingKind, requested_width: i64) -> Self {
        Self { kind, width: normalize_width(requested_width) }
    }

    /// Samples on each side of the center
    pub fn half_width(&self) -> usize {
        (self.width - 1) / 2
    }
}

/// Effective filter width: values below 2 become 2, then even widths are made odd
///
/// So `-4`, `0`, `1` and `2` all give 3, and `6` gives 7.
pub fn normalize_width(requested: i64) -> usize {
    let width = requested.max(2);
    let odd = if width % 2 == 0 { width.saturating_add(1) } else { width };
    usize::try_from(odd).unwrap_or(usize::MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoomAxis {
    Time,
    Amplitude,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZoomSettings {
    pub time: f64,
    pub amplitude: f64,
}

impl Default for ZoomSettings {
    fn default() -> Self {
        Self { time: 1.0, amplitude: 1.0 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    pub history_capacity: usize,
    pub filter: FilterConfig,
    pub zoom: ZoomSettings,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            history_capacity: 10_000,
            filter: FilterConfig::default(),
            zoom: ZoomSettings::default(),
        }
    }
}

impl ProcessorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.history_capacity == 0 {
            return Err(TelemetryError::InvalidConfig("history_capacity must be positive".to_string()));
        }
        check_filter_width(self.filter.width, self.history_capacity)?;
        if self.filter.width < 3 || self.filter.width % 2 == 0 {
            return Err(TelemetryError::InvalidConfig(format!(
                "filter width {} must be odd and at least 3",
                self.filter.width
            )));
        }
        check_zoom(self.zoom.time)?;
        check_zoom(self.zoom.amplitude)?;
        Ok(())
    }
}

fn check_filter_width(width: usize, history_capacity: usize) -> Result<()> {
    if width > MAX_FILTER_WIDTH || width > history_capacity {
        return Err(TelemetryError::InvalidConfig(format!(
            "filter width {} exceeds limit {}",
            width,
            MAX_FILTER_WIDTH.min(history_capacity)
        )));
    }
    Ok(())
}

fn check_zoom(factor: f64) -> Result<()> {
    if ZOOM_FACTORS.contains(&factor) {
        Ok(())
    } else {
        Err(TelemetryError::InvalidConfig(format!(
            "zoom factor {} not in {:?}",
            factor, ZOOM_FACTORS
        )))
    }
}

/// Smoothed values at one series position
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SmoothedPoint {
    /// Timestamp of the center sample (seconds)
    pub timestamp: f64,
    /// Smoothed `[x, y, z]` in g
    pub accel: [f64; 3],
    /// Smoothed |a| in g
    pub magnitude: f64,
}

/// Velocity (m/s), distance (m) and max |a| (g) since the last reset
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct IntegratedState {
    pub velocity: [f64; 3],
    pub distance: [f64; 3],
    pub max_magnitude: f64,
}

/// Everything produced by one [`StreamProcessor::ingest`]
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesUpdate {
    pub sample: TelemetrySample,
    /// Newly emitted smoothed points, oldest first
    pub points: Vec<SmoothedPoint>,
    pub integrated: IntegratedState,
    pub max_changed: bool,
}

pub struct StreamProcessor {
    capacity: usize,
    filter: FilterConfig,
    zoom: ZoomSettings,
    history: VecDeque<TelemetrySample>,
    /// Absolute index of `history[0]`
    base_index: u64,
    /// Absolute index of the next position to emit
    next_pos: u64,
    integrated: IntegratedState,
    last_timestamp: Option<f64>,
}

impl StreamProcessor {
    pub fn new(config: ProcessorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            capacity: config.history_capacity,
            filter: config.filter,
            zoom: config.zoom,
            history: VecDeque::with_capacity(config.history_capacity.min(4096)),
            base_index: 0,
            next_pos: 0,
            integrated: IntegratedState::default(),
            last_timestamp: None,
        })
    }

    pub fn filter(&self) -> FilterConfig {
        self.filter
    }

    pub fn integrated(&self) -> IntegratedState {
        self.integrated
    }

    pub fn zoom(&self, axis: ZoomAxis) -> f64 {
        match axis {
            ZoomAxis::Time => self.zoom.time,
            ZoomAxis::Amplitude => self.zoom.amplitude,
        }
    }

    pub fn zoom_settings(&self) -> ZoomSettings {
        self.zoom
    }

    /// Raw samples currently held for smoothing
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Feed one raw sample
    pub fn ingest(&mut self, sample: TelemetrySample) -> SeriesUpdate {
        self.integrate(&sample);

        let max_changed = sample.magnitude() > self.integrated.max_magnitude;
        if max_changed {
            self.integrated.max_magnitude = sample.magnitude();
        }

        self.history.push_back(sample);
        if self.history.len() > self.capacity {
            self.history.pop_front();
            self.base_index += 1;
        }
        if self.next_pos < self.base_index {
            self.next_pos = self.base_index;
        }

        SeriesUpdate {
            sample,
            points: self.emit_ready(),
            integrated: self.integrated,
            max_changed,
        }
    }

    /// Zero the integrated state and running maximum; smoothing history is kept
    pub fn reset(&mut self) {
        log::debug!("Resetting integrated state");
        self.integrated = IntegratedState::default();
        self.last_timestamp = None;
    }

    /// Change smoothing; applies to positions not yet emitted
    pub fn set_filter(&mut self, kind: SmoothingKind, requested_width: i64) -> Result<FilterConfig> {
        let filter = FilterConfig::new(kind, requested_width);
        check_filter_width(filter.width, self.capacity)?;
        if filter != self.filter {
            log::info!("Filter changed to {:?} width {}", filter.kind, filter.width);
        }
        self.filter = filter;
        Ok(filter)
    }

    pub fn set_zoom(&mut self, axis: ZoomAxis, factor: f64) -> Result<()> {
        check_zoom(factor)?;
        match axis {
            ZoomAxis::Time => self.zoom.time = factor,
            ZoomAxis::Amplitude => self.zoom.amplitude = factor,
        }
        Ok(())
    }

    // Semi-implicit Euler: v += a·g0·dt, then d += v·dt with the updated v
    fn integrate(&mut self, sample: &TelemetrySample) {
        let timestamp = sample.timestamp();
        if let Some(previous) = self.last_timestamp {
            let dt = timestamp - previous;
            if dt > 0.0 && dt.is_finite() {
                let accel = sample.accel();
                for i in 0..3 {
                    self.integrated.velocity[i] += accel[i] * STANDARD_GRAVITY * dt;
                    self.integrated.distance[i] += self.integrated.velocity[i] * dt;
                }
            } else if dt < 0.0 {
                log::warn!(
                    "Timestamp went backwards ({:.3}s -> {:.3}s); skipping integration step",
                    previous,
                    timestamp
                );
            }
        }
        self.last_timestamp = Some(timestamp);
    }

    fn emit_ready(&mut self) -> Vec<SmoothedPoint> {
        let end = self.base_index + self.history.len() as u64;
        let mut points = Vec::new();

        if self.filter.kind == SmoothingKind::None {
            while self.next_pos < end {
                let sample = self.history[(self.next_pos - self.base_index) as usize];
                points.push(SmoothedPoint {
                    timestamp: sample.timestamp(),
                    accel: sample.accel(),
                    magnitude: sample.magnitude(),
                });
                self.next_pos += 1;
            }
            return points;
        }

        let half = self.filter.half_width() as u64;
        while self.next_pos + half < end {
            points.push(self.smooth_at(self.next_pos, half));
            self.next_pos += 1;
        }
        points
    }

    fn smooth_at(&self, position: u64, half: u64) -> SmoothedPoint {
        let first = position.saturating_sub(half).max(self.base_index);
        let last = position + half;

        let mut weight_sum = 0.0;
        let mut accel = [0.0; 3];
        let mut magnitude = 0.0;
        for index in first..=last {
            let sample = &self.history[(index - self.base_index) as usize];
            let weight = match self.filter.kind {
                SmoothingKind::Triangular => (half + 1 - index.abs_diff(position)) as f64,
                _ => 1.0,
            };
            weight_sum += weight;
            for (sum, value) in accel.iter_mut().zip(sample.accel()) {
                *sum += weight * value;
            }
            magnitude += weight * sample.magnitude();
        }

        for value in accel.iter_mut() {
            *value /= weight_sum;
        }
        SmoothedPoint {
            timestamp: self.history[(position - self.base_index) as usize].timestamp(),
            accel,
            magnitude: magnitude / weight_sum,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processor(kind: SmoothingKind, width: usize) -> StreamProcessor {
        StreamProcessor::new(ProcessorConfig {
            filter: FilterConfig { kind, width },
            ..ProcessorConfig::default()
        })
        .unwrap()
    }

    fn x_sample(i: usize, x: f64) -> TelemetrySample {
        TelemetrySample::new(i as f64 * 0.01, x, 0.0, 0.0)
    }

    fn wobble(n: usize) -> Vec<TelemetrySample> {
        (0..n)
            .map(|i| {
                let t = i as f64 * 0.02;
                TelemetrySample::new(t, (t * 7.0).sin(), (t * 3.0).cos() * 0.5, 1.0 + 0.1 * t)
            })
            .collect()
    }

    #[test]
    fn test_normalize_width() {
        assert_eq!(normalize_width(-4), 3);
        assert_eq!(normalize_width(0), 3);
        assert_eq!(normalize_width(1), 3);
        assert_eq!(normalize_width(2), 3);
        assert_eq!(normalize_width(4), 5);
        assert_eq!(normalize_width(7), 7);
    }

    #[test]
    fn test_oversized_filter_rejected() {
        let mut p = processor(SmoothingKind::Boxcar, 5);
        let err = p.set_filter(SmoothingKind::Triangular, 500).unwrap_err();
        assert!(matches!(err, TelemetryError::InvalidConfig(_)));
        assert_eq!(p.filter(), FilterConfig { kind: SmoothingKind::Boxcar, width: 5 });

        let effective = p.set_filter(SmoothingKind::Triangular, 0).unwrap();
        assert_eq!(effective.width, 3);
    }

    #[test]
    fn test_no_smoothing_emits_immediately() {
        let mut p = processor(SmoothingKind::None, 5);
        let update = p.ingest(x_sample(0, 0.7));
        assert_eq!(update.points.len(), 1);
        assert_eq!(update.points[0].accel[0], 0.7);
    }

    #[test]
    fn test_boxcar_lag_and_values() {
        let mut p = processor(SmoothingKind::Boxcar, 3);
        assert!(p.ingest(x_sample(0, 0.0)).points.is_empty());

        // Left edge is truncated
        let first = p.ingest(x_sample(1, 3.0)).points;
        assert_eq!(first.len(), 1);
        assert!((first[0].accel[0] - 1.5).abs() < 1e-12);

        let second = p.ingest(x_sample(2, 6.0)).points;
        assert!((second[0].accel[0] - 3.0).abs() < 1e-12);
        assert_eq!(second[0].timestamp, 0.01);
    }

    #[test]
    fn test_triangular_weights() {
        let mut p = processor(SmoothingKind::Triangular, 5);
        let values = [0.0, 0.0, 9.0, 0.0, 0.0, 0.0];
        let mut points = Vec::new();
        for (i, x) in values.iter().enumerate() {
            points.extend(p.ingest(x_sample(i, *x)).points);
        }
        // Positions 0..=3 are complete after six samples
        assert_eq!(points.len(), 4);
        assert!((points[2].accel[0] - 3.0).abs() < 1e-12);
        assert!((points[3].accel[0] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_width_change_applies_to_pending_positions() {
        let mut p = processor(SmoothingKind::Boxcar, 7);
        let mut emitted = 0;
        for i in 0..5 {
            emitted += p.ingest(x_sample(i, 1.0)).points.len();
        }
        assert_eq!(emitted, 2);

        p.set_filter(SmoothingKind::Boxcar, 3).unwrap();
        assert_eq!(p.ingest(x_sample(5, 1.0)).points.len(), 3);

        p.set_filter(SmoothingKind::Boxcar, 7).unwrap();
        assert!(p.ingest(x_sample(6, 1.0)).points.is_empty());
        assert!(p.ingest(x_sample(7, 1.0)).points.is_empty());
        assert_eq!(p.ingest(x_sample(8, 1.0)).points.len(), 1);
    }

    #[test]
    fn test_integration_semi_implicit_euler() {
        let mut p = processor(SmoothingKind::None, 3);
        p.ingest(TelemetrySample::new(0.0, 1.0, 0.0, 0.0));
        let update = p.ingest(TelemetrySample::new(0.5, 1.0, 0.0, 0.0));

        let v = STANDARD_GRAVITY * 0.5;
        assert!((update.integrated.velocity[0] - v).abs() < 1e-12);
        assert!((update.integrated.distance[0] - v * 0.5).abs() < 1e-12);
        assert_eq!(update.integrated.velocity[1], 0.0);
    }

    #[test]
    fn test_integration_independent_of_smoothing() {
        let samples = wobble(200);
        let mut raw = processor(SmoothingKind::None, 3);
        let mut boxcar = processor(SmoothingKind::Boxcar, 9);
        let mut triangular = processor(SmoothingKind::Triangular, 21);
        for s in &samples {
            raw.ingest(*s);
            boxcar.ingest(*s);
            triangular.ingest(*s);
        }
        assert_eq!(raw.integrated(), boxcar.integrated());
        assert_eq!(raw.integrated(), triangular.integrated());
    }

    #[test]
    fn test_reset_matches_fresh_processor() {
        let samples = wobble(50);
        let mut used = processor(SmoothingKind::Boxcar, 5);
        for s in wobble(30).iter().rev() {
            used.ingest(*s);
        }
        used.reset();
        assert_eq!(used.integrated(), IntegratedState::default());

        let mut fresh = processor(SmoothingKind::Boxcar, 5);
        for s in &samples {
            used.ingest(*s);
            fresh.ingest(*s);
        }
        assert_eq!(used.integrated(), fresh.integrated());
    }

    #[test]
    fn test_negative_dt_contributes_zero() {
        let mut p = processor(SmoothingKind::None, 3);
        p.ingest(TelemetrySample::new(5.0, 1.0, 0.0, 0.0));
        let update = p.ingest(TelemetrySample::new(1.0, 1.0, 0.0, 0.0));
        assert_eq!(update.integrated.velocity, [0.0; 3]);

        let update = p.ingest(TelemetrySample::new(1.1, 1.0, 0.0, 0.0));
        assert!(update.integrated.velocity[0] > 0.0);
    }

    #[test]
    fn test_running_maximum() {
        let mut p = processor(SmoothingKind::None, 3);
        assert!(p.ingest(TelemetrySample::new(0.0, 0.0, 0.0, 1.0)).max_changed);
        assert!(p.ingest(TelemetrySample::new(0.1, 0.0, 3.0, 4.0)).max_changed);
        let update = p.ingest(TelemetrySample::new(0.2, 0.0, 0.0, 1.0));
        assert!(!update.max_changed);
        assert_eq!(update.integrated.max_magnitude, 5.0);

        p.reset();
        assert_eq!(p.integrated().max_magnitude, 0.0);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut p = StreamProcessor::new(ProcessorConfig {
            history_capacity: 10,
            filter: FilterConfig { kind: SmoothingKind::Boxcar, width: 3 },
            ..ProcessorConfig::default()
        })
        .unwrap();
        let mut emitted = 0;
        for i in 0..25 {
            emitted += p.ingest(x_sample(i, 1.0)).points.len();
        }
        assert_eq!(p.history_len(), 10);
        assert_eq!(emitted, 24);
        assert!(p.set_filter(SmoothingKind::Boxcar, 11).is_err());
    }

    #[test]
    fn test_zoom() {
        let mut p = processor(SmoothingKind::None, 3);
        p.set_zoom(ZoomAxis::Time, 0.5).unwrap();
        p.set_zoom(ZoomAxis::Amplitude, 8.0).unwrap();
        assert_eq!(p.zoom(ZoomAxis::Time), 0.5);
        assert_eq!(p.zoom(ZoomAxis::Amplitude), 8.0);

        for bad in [0.0, -2.0, 3.0, f64::NAN] {
            assert!(p.set_zoom(ZoomAxis::Time, bad).is_err());
        }
        assert_eq!(p.zoom(ZoomAxis::Time), 0.5);
    }
}
