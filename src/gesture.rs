//! Gesture recording and motion-pattern extraction

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, TelemetryError};
use crate::sample::{Axis, TelemetrySample};

/// Direction of motion along one axis, written `+X`, `-Z`, ...
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MotionLabel {
    pub axis: Axis,
    pub positive: bool,
}

impl MotionLabel {
    pub fn new(axis: Axis, positive: bool) -> Self {
        Self { axis, positive }
    }
}

impl fmt::Display for MotionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", if self.positive { '+' } else { '-' }, self.axis)
    }
}

impl FromStr for MotionLabel {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let positive = match s.chars().next() {
            Some('+') => true,
            Some('-') => false,
            _ => {
                return Err(TelemetryError::InvalidConfig(format!(
                    "motion label '{}' must start with + or -",
                    s
                )))
            }
        };
        Ok(MotionLabel { axis: s[1..].parse()?, positive })
    }
}

impl TryFrom<String> for MotionLabel {
    type Error = TelemetryError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<MotionLabel> for String {
    fn from(label: MotionLabel) -> Self {
        label.to_string()
    }
}

/// Parse a whitespace-separated pattern such as `"+X -X +Z"`
pub fn parse_pattern(text: &str) -> Result<Vec<MotionLabel>> {
    text.split_whitespace().map(str::parse).collect()
}

/// Render a pattern as `"+X -X +Z"`
pub fn format_pattern(pattern: &[MotionLabel]) -> String {
    pattern.iter().map(|l| l.to_string()).collect::<Vec<_>>().join(" ")
}

/// Pattern extraction thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternConfig {
    /// Minimum deviation from the baseline that counts as motion (g)
    pub threshold_g: f64,
    /// Consecutive samples a label must persist before it is recorded
    pub min_run: usize,
    /// Leading samples averaged into the baseline
    pub baseline_samples: usize,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self { threshold_g: 0.5, min_run: 3, baseline_samples: 5 }
    }
}

impl PatternConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.threshold_g.is_finite() && self.threshold_g > 0.0) {
            return Err(TelemetryError::InvalidConfig(format!(
                "threshold_g must be positive, got {}",
                self.threshold_g
            )));
        }
        if self.min_run == 0 || self.baseline_samples == 0 {
            return Err(TelemetryError::InvalidConfig(
                "min_run and baseline_samples must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Collapsed sequence of dominant motion directions in `samples`
pub fn extract_pattern(
    samples: &[TelemetrySample],
    inactive_axis: Option<Axis>,
    config: &PatternConfig,
) -> Vec<MotionLabel> {
    if samples.is_empty() {
        return Vec::new();
    }

    let n = config.baseline_samples.min(samples.len());
    let mut baseline = [0.0; 3];
    for sample in &samples[..n] {
        for (b, a) in baseline.iter_mut().zip(sample.accel()) {
            *b += a / n as f64;
        }
    }

    let mut pattern: Vec<MotionLabel> = Vec::new();
    let mut candidate: Option<MotionLabel> = None;
    let mut run = 0usize;

    for sample in samples {
        let label = dominant_motion(sample, &baseline, inactive_axis, config.threshold_g);
        if label == candidate {
            run += 1;
        } else {
            candidate = label;
            run = 1;
        }
        if run == config.min_run {
            if let Some(label) = candidate {
                if pattern.last() != Some(&label) {
                    pattern.push(label);
                }
            }
        }
    }
    pattern
}

fn dominant_motion(
    sample: &TelemetrySample,
    baseline: &[f64; 3],
    inactive_axis: Option<Axis>,
    threshold_g: f64,
) -> Option<MotionLabel> {
    Axis::ALL
        .iter()
        .filter(|&&axis| Some(axis) != inactive_axis)
        .map(|&axis| (axis, sample.axis(axis) - baseline[axis.index()]))
        .filter(|(_, deviation)| deviation.abs() >= threshold_g)
        .max_by(|a, b| a.1.abs().total_cmp(&b.1.abs()))
        .map(|(axis, deviation)| MotionLabel::new(axis, deviation > 0.0))
}

/// A recorded motion segment and its extracted pattern
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Gesture {
    dataset: Vec<TelemetrySample>,
    pattern: Vec<MotionLabel>,
    inactive_axis: Option<Axis>,
    end_timestamp: f64,
}

impl Gesture {
    pub fn new(
        dataset: Vec<TelemetrySample>,
        pattern: Vec<MotionLabel>,
        inactive_axis: Option<Axis>,
        end_timestamp: f64,
    ) -> Self {
        Self { dataset, pattern, inactive_axis, end_timestamp }
    }

    /// Build a gesture from samples, extracting its pattern
    pub fn from_samples(
        samples: Vec<TelemetrySample>,
        inactive_axis: Option<Axis>,
        config: &PatternConfig,
    ) -> Self {
        let pattern = extract_pattern(&samples, inactive_axis, config);
        let end_timestamp = samples.last().map(|s| s.timestamp()).unwrap_or(0.0);
        Self { dataset: samples, pattern, inactive_axis, end_timestamp }
    }

    /// A gesture that only carries a pattern (built-in templates)
    pub fn from_pattern(pattern: Vec<MotionLabel>, inactive_axis: Option<Axis>) -> Self {
        Self { dataset: Vec::new(), pattern, inactive_axis, end_timestamp: 0.0 }
    }

    pub fn dataset(&self) -> &[TelemetrySample] {
        &self.dataset
    }

    pub fn pattern(&self) -> &[MotionLabel] {
        &self.pattern
    }

    pub fn inactive_axis(&self) -> Option<Axis> {
        self.inactive_axis
    }

    pub fn end_timestamp(&self) -> f64 {
        self.end_timestamp
    }

    /// Append another segment: its samples, its pattern and its end timestamp
    pub fn combine(&mut self, other: Gesture) {
        self.dataset.extend(other.dataset);
        self.pattern.extend(other.pattern);
        self.end_timestamp = other.end_timestamp;
    }

    /// Replace all samples and re-extract the pattern
    pub fn replace_data(&mut self, samples: Vec<TelemetrySample>, config: &PatternConfig) {
        *self = Gesture::from_samples(samples, self.inactive_axis, config);
    }
}

impl fmt::Display for Gesture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} samples, pattern [{}]",
            self.dataset.len(),
            format_pattern(&self.pattern)
        )
    }
}

struct Recording {
    inactive_axis: Option<Axis>,
    segments: Vec<Vec<TelemetrySample>>,
    paused: bool,
}

/// Accumulates samples into a gesture, surviving link interruptions
///
/// Each interruption closes the current segment; segments are labelled
/// separately and combined on [`stop`](GestureRecorder::stop).
pub struct GestureRecorder {
    config: PatternConfig,
    recording: Option<Recording>,
}

impl GestureRecorder {
    pub fn new(config: PatternConfig) -> Self {
        Self { config, recording: None }
    }

    pub fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.recording.as_ref().map_or(false, |r| r.paused)
    }

    /// Samples collected so far across all segments
    pub fn sample_count(&self) -> usize {
        self.recording
            .as_ref()
            .map_or(0, |r| r.segments.iter().map(Vec::len).sum())
    }

    pub fn start(&mut self, inactive_axis: Option<Axis>) -> Result<()> {
        if self.recording.is_some() {
            return Err(TelemetryError::AlreadyRecording);
        }
        log::info!("Gesture recording started (inactive axis {:?})", inactive_axis);
        self.recording = Some(Recording { inactive_axis, segments: vec![Vec::new()], paused: false });
        Ok(())
    }

    /// Add a sample; returns false when not recording or paused
    pub fn push(&mut self, sample: TelemetrySample) -> bool {
        match self.recording.as_mut() {
            Some(recording) if !recording.paused => {
                if let Some(segment) = recording.segments.last_mut() {
                    segment.push(sample);
                }
                true
            }
            _ => false,
        }
    }

    /// Close the current segment
    pub fn pause(&mut self) {
        if let Some(recording) = self.recording.as_mut() {
            if !recording.paused {
                log::info!("Gesture recording paused");
                recording.paused = true;
            }
        }
    }

    /// Open a new segment after a pause
    pub fn resume(&mut self) {
        if let Some(recording) = self.recording.as_mut() {
            if recording.paused {
                log::info!("Gesture recording resumed");
                recording.paused = false;
                recording.segments.push(Vec::new());
            }
        }
    }

    /// Finish recording and return the combined gesture
    pub fn stop(&mut self) -> Result<Gesture> {
        let recording = self.recording.take().ok_or(TelemetryError::NotRecording)?;
        let inactive_axis = recording.inactive_axis;

        let mut segments = recording
            .segments
            .into_iter()
            .filter(|s| !s.is_empty())
            .map(|s| Gesture::from_samples(s, inactive_axis, &self.config));

        let mut gesture = match segments.next() {
            Some(first) => first,
            None => Gesture::from_pattern(Vec::new(), inactive_axis),
        };
        for segment in segments {
            gesture.combine(segment);
        }
        log::info!("Gesture recorded: {}", gesture);
        Ok(gesture)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn label(s: &str) -> MotionLabel {
        s.parse().unwrap()
    }

    fn samples(xs: &[f64], t0: f64) -> Vec<TelemetrySample> {
        xs.iter()
            .enumerate()
            .map(|(i, &x)| TelemetrySample::new(t0 + i as f64 * 0.01, x, 0.0, 1.0))
            .collect()
    }

    #[test]
    fn test_motion_label_text() {
        assert_eq!(label("+X"), MotionLabel::new(Axis::X, true));
        assert_eq!(label("-z"), MotionLabel::new(Axis::Z, false));
        assert_eq!(MotionLabel::new(Axis::Y, false).to_string(), "-Y");
        assert!("X".parse::<MotionLabel>().is_err());
        assert!("+W".parse::<MotionLabel>().is_err());

        let json = serde_json::to_string(&vec![label("+X"), label("-Y")]).unwrap();
        assert_eq!(json, r#"["+X","-Y"]"#);
        assert_eq!(parse_pattern("+X  -Y").unwrap(), vec![label("+X"), label("-Y")]);
    }

    #[test]
    fn test_combine_appends_and_adopts_end() {
        let s = samples(&[0.1, 0.2, 0.3], 0.0);
        let mut a = Gesture::new(s[..2].to_vec(), vec![label("+X")], None, 1.0);
        let b = Gesture::new(s[2..].to_vec(), vec![label("-Z")], None, 2.0);
        a.combine(b);

        assert_eq!(a.dataset(), &s[..]);
        assert_eq!(a.pattern(), &[label("+X"), label("-Z")]);
        assert_eq!(a.end_timestamp(), 2.0);
    }

    #[test]
    fn test_extract_pattern_collapses_runs() {
        let config = PatternConfig::default();
        let mut xs = vec![0.0; 5];
        xs.extend([1.0; 4]);
        xs.extend([0.0; 4]);
        xs.extend([-1.0; 4]);
        let short = extract_pattern(&samples(&xs, 0.0), None, &config);
        assert_eq!(short, vec![label("+X"), label("-X")]);

        let mut long = vec![0.0; 5];
        long.extend([1.0; 40]);
        long.extend([-1.0; 25]);
        assert_eq!(extract_pattern(&samples(&long, 0.0), None, &config), short);
    }

    #[test]
    fn test_extract_pattern_ignores_short_spikes() {
        let config = PatternConfig::default();
        let mut xs = vec![0.0; 5];
        xs.extend([1.0, 1.0]);
        xs.extend([0.0; 5]);
        assert!(extract_pattern(&samples(&xs, 0.0), None, &config).is_empty());
    }

    #[test]
    fn test_inactive_axis_never_labelled() {
        let config = PatternConfig::default();
        let mut data: Vec<_> = (0..5).map(|i| TelemetrySample::new(i as f64, 0.0, 0.0, 1.0)).collect();
        data.extend((5..15).map(|i| TelemetrySample::new(i as f64, 0.6, 0.0, 3.0)));

        assert_eq!(extract_pattern(&data, None, &config), vec![label("+Z")]);
        assert_eq!(extract_pattern(&data, Some(Axis::Z), &config), vec![label("+X")]);
    }

    #[test]
    fn test_recorder_errors() {
        let mut recorder = GestureRecorder::new(PatternConfig::default());
        assert!(matches!(recorder.stop(), Err(TelemetryError::NotRecording)));
        recorder.start(None).unwrap();
        assert!(matches!(recorder.start(None), Err(TelemetryError::AlreadyRecording)));
    }

    #[test]
    fn test_recorder_combines_segments_across_pause() {
        let config = PatternConfig { min_run: 2, baseline_samples: 2, ..PatternConfig::default() };
        let mut recorder = GestureRecorder::new(config);
        assert!(!recorder.push(TelemetrySample::new(0.0, 0.0, 0.0, 1.0)));

        recorder.start(Some(Axis::Z)).unwrap();
        for s in samples(&[0.0, 0.0, 1.0, 1.0], 0.0) {
            assert!(recorder.push(s));
        }
        recorder.pause();
        assert!(!recorder.push(TelemetrySample::new(0.5, 9.0, 0.0, 1.0)));
        recorder.resume();
        for s in samples(&[0.0, 0.0, -1.0, -1.0], 1.0) {
            recorder.push(s);
        }
        assert_eq!(recorder.sample_count(), 8);

        let gesture = recorder.stop().unwrap();
        assert!(!recorder.is_recording());
        assert_eq!(gesture.dataset().len(), 8);
        assert_eq!(gesture.pattern(), &[label("+X"), label("-X")]);
        assert_eq!(gesture.inactive_axis(), Some(Axis::Z));
        assert!((gesture.end_timestamp() - 1.03).abs() < 1e-9);
    }

    #[test]
    fn test_empty_recording() {
        let mut recorder = GestureRecorder::new(PatternConfig::default());
        recorder.start(None).unwrap();
        let gesture = recorder.stop().unwrap();
        assert!(gesture.dataset().is_empty());
        assert!(gesture.pattern().is_empty());
    }
}
