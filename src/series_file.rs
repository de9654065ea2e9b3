//! Persisted acceleration series
//!
//! Text layout:
//!
//! ```text
//! # format=accel-telemetry-series
//! # version=1.0
//! # recorded_at=2026-10-19T10:04:05+02:00
//! # scale=2G
//! timestamp,ax,ay,az
//! 0.000,0.01,-0.02,0.99
//! ...
//! ```
//!
//! Timestamps are strictly increasing; both the writer and the reader enforce
//! it. Loading is all-or-nothing.

use csv::{ReaderBuilder, WriterBuilder};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Instant;

use crate::error::{Result, TelemetryError};
use crate::sample::{ScaleSetting, SeriesRecord, TelemetrySample};

pub const FORMAT_NAME: &str = "accel-telemetry-series";
pub const FORMAT_VERSION: &str = "1.0";
const CSV_HEADER: [&str; 4] = ["timestamp", "ax", "ay", "az"];

/// Header of a persisted series
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesMetadata {
    /// RFC 3339 time the recording started
    pub recorded_at: String,
    pub scale: ScaleSetting,
    pub version: String,
}

impl SeriesMetadata {
    /// Metadata stamped with the current local time
    pub fn now(scale: ScaleSetting) -> Self {
        Self {
            recorded_at: chrono::Local::now().to_rfc3339(),
            scale,
            version: FORMAT_VERSION.to_string(),
        }
    }

    fn write_header<W: Write>(&self, out: &mut W) -> Result<()> {
        writeln!(out, "# format={}", FORMAT_NAME)?;
        writeln!(out, "# version={}", self.version)?;
        writeln!(out, "# recorded_at={}", self.recorded_at)?;
        writeln!(out, "# scale={}", self.scale)?;
        Ok(())
    }

    fn parse_header(text: &str) -> Result<Self> {
        let mut format = None;
        let mut metadata = SeriesMetadata {
            recorded_at: String::new(),
            scale: ScaleSetting::default(),
            version: FORMAT_VERSION.to_string(),
        };

        for line in text.lines().take_while(|l| l.starts_with('#')) {
            let Some((key, value)) = line.trim_start_matches('#').trim().split_once('=') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "format" => format = Some(value.to_string()),
                "version" => metadata.version = value.to_string(),
                "recorded_at" => metadata.recorded_at = value.to_string(),
                "scale" => {
                    metadata.scale = value.parse().map_err(|_| corrupt(0, format!("bad scale '{}'", value)))?
                }
                _ => {}
            }
        }

        match format.as_deref() {
            Some(FORMAT_NAME) => Ok(metadata),
            Some(other) => Err(corrupt(0, format!("unknown format '{}'", other))),
            None => Err(corrupt(0, "missing format header".to_string())),
        }
    }
}

/// A fully loaded series
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedSeries {
    pub metadata: SeriesMetadata,
    pub samples: Vec<TelemetrySample>,
}

impl RecordedSeries {
    /// First and last timestamp, if any samples
    pub fn time_range(&self) -> Option<(f64, f64)> {
        Some((self.samples.first()?.timestamp(), self.samples.last()?.timestamp()))
    }
}

fn corrupt(record: usize, reason: String) -> TelemetryError {
    TelemetryError::CorruptPersistedFile { record, reason }
}

/// Check one record against its predecessor; `record` is 1-based
fn check_record(record: usize, sample: &TelemetrySample, previous: Option<f64>) -> Result<()> {
    let values = [sample.timestamp(), sample.ax(), sample.ay(), sample.az()];
    if values.iter().any(|v| !v.is_finite()) {
        return Err(corrupt(record, "non-finite value".to_string()));
    }
    if let Some(previous) = previous {
        if sample.timestamp() <= previous {
            return Err(corrupt(
                record,
                format!("timestamp {} not after {}", sample.timestamp(), previous),
            ));
        }
    }
    Ok(())
}

/// Streaming writer for a series file
pub struct SeriesWriter {
    writer: csv::Writer<BufWriter<File>>,
    metadata: SeriesMetadata,
    last_timestamp: Option<f64>,
    sample_count: usize,
    start_time: Instant,
}

impl SeriesWriter {
    pub fn create<P: AsRef<Path>>(path: P, scale: ScaleSetting) -> Result<Self> {
        let file = File::create(path)?;
        let mut out = BufWriter::new(file);
        let metadata = SeriesMetadata::now(scale);
        metadata.write_header(&mut out)?;

        let mut writer = WriterBuilder::new().has_headers(false).from_writer(out);
        writer
            .write_record(CSV_HEADER)
            .map_err(|e| TelemetryError::Serialization(format!("Failed to write header: {}", e)))?;

        Ok(Self {
            writer,
            metadata,
            last_timestamp: None,
            sample_count: 0,
            start_time: Instant::now(),
        })
    }

    pub fn metadata(&self) -> &SeriesMetadata {
        &self.metadata
    }

    /// Append one sample; rejects non-finite values and non-increasing timestamps
    pub fn append_sample(&mut self, sample: &TelemetrySample) -> Result<()> {
        check_record(self.sample_count + 1, sample, self.last_timestamp)?;
        self.writer
            .serialize(SeriesRecord::from(*sample))
            .map_err(|e| TelemetryError::Serialization(format!("Failed to write record: {}", e)))?;
        self.last_timestamp = Some(sample.timestamp());
        self.sample_count += 1;
        Ok(())
    }

    pub fn append_batch(&mut self, samples: &[TelemetrySample]) -> Result<()> {
        for sample in samples {
            self.append_sample(sample)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    /// Time since the file was created
    pub fn elapsed_secs(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }
}

/// Write a complete series in one go
pub fn write_series<P: AsRef<Path>>(
    path: P,
    scale: ScaleSetting,
    samples: &[TelemetrySample],
) -> Result<SeriesMetadata> {
    let mut writer = SeriesWriter::create(path, scale)?;
    writer.append_batch(samples)?;
    writer.flush()?;
    Ok(writer.metadata().clone())
}

/// Load a series file; any bad record fails the whole load
pub fn read_series<P: AsRef<Path>>(path: P) -> Result<RecordedSeries> {
    let text = std::fs::read_to_string(path)?;
    let metadata = SeriesMetadata::parse_header(&text)?;

    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let mut samples = Vec::new();
    let mut previous = None;
    for (index, result) in reader.deserialize::<SeriesRecord>().enumerate() {
        let record = index + 1;
        let parsed = result.map_err(|e| corrupt(record, e.to_string()))?;
        let sample = TelemetrySample::from(parsed);
        check_record(record, &sample, previous)?;
        previous = Some(sample.timestamp());
        samples.push(sample);
    }

    log::info!("Loaded {} samples", samples.len());
    Ok(RecordedSeries { metadata, samples })
}

/// Save using the format implied by the extension (`.h5` needs the `hdf5` feature)
pub fn save_series_file<P: AsRef<Path>>(
    path: P,
    scale: ScaleSetting,
    samples: &[TelemetrySample],
) -> Result<SeriesMetadata> {
    #[cfg(feature = "hdf5")]
    {
        if crate::hdf5_format::is_hdf5_path(path.as_ref()) {
            return crate::hdf5_format::write_series_hdf5(path, scale, samples);
        }
    }
    write_series(path, scale, samples)
}

/// Load using the format implied by the extension (`.h5` needs the `hdf5` feature)
pub fn load_series_file<P: AsRef<Path>>(path: P) -> Result<RecordedSeries> {
    #[cfg(feature = "hdf5")]
    {
        if crate::hdf5_format::is_hdf5_path(path.as_ref()) {
            return crate::hdf5_format::read_series_hdf5(path);
        }
    }
    read_series(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(timestamps: &[f64]) -> Vec<TelemetrySample> {
        timestamps.iter().map(|&t| TelemetrySample::new(t, 0.1, -0.2, 1.0)).collect()
    }

    fn write_raw(contents: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("series.csv");
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.csv");
        let samples = series(&[0.0, 0.01, 0.02]);

        let metadata = write_series(&path, ScaleSetting::SixG, &samples).unwrap();
        let loaded = read_series(&path).unwrap();

        assert_eq!(loaded.samples, samples);
        assert_eq!(loaded.metadata, metadata);
        assert_eq!(loaded.metadata.scale, ScaleSetting::SixG);
        assert_eq!(loaded.time_range(), Some((0.0, 0.02)));
        assert!(chrono::DateTime::parse_from_rfc3339(&loaded.metadata.recorded_at).is_ok());
    }

    #[test]
    fn test_out_of_order_load_fails() {
        let (_dir, path) = write_raw(
            "# format=accel-telemetry-series\n# scale=2G\ntimestamp,ax,ay,az\n0.0,0,0,1\n0.5,0,0,1\n0.3,0,0,1\n",
        );
        match read_series(&path) {
            Err(TelemetryError::CorruptPersistedFile { record, .. }) => assert_eq!(record, 3),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unparsable_record_fails() {
        let (_dir, path) =
            write_raw("# format=accel-telemetry-series\ntimestamp,ax,ay,az\n0.0,0,0,1\n0.1,abc,0,1\n");
        assert!(matches!(
            read_series(&path),
            Err(TelemetryError::CorruptPersistedFile { record: 2, .. })
        ));

        let (_dir, path) = write_raw("# format=accel-telemetry-series\ntimestamp,ax,ay,az\n0.0,NaN,0,1\n");
        assert!(matches!(read_series(&path), Err(TelemetryError::CorruptPersistedFile { .. })));
    }

    #[test]
    fn test_missing_format_header_fails() {
        let (_dir, path) = write_raw("timestamp,ax,ay,az\n0.0,0,0,1\n");
        assert!(matches!(
            read_series(&path),
            Err(TelemetryError::CorruptPersistedFile { record: 0, .. })
        ));
    }

    #[test]
    fn test_writer_rejects_non_increasing() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SeriesWriter::create(dir.path().join("w.csv"), ScaleSetting::TwoG).unwrap();
        writer.append_sample(&TelemetrySample::new(1.0, 0.0, 0.0, 1.0)).unwrap();
        assert!(writer.append_sample(&TelemetrySample::new(1.0, 0.0, 0.0, 1.0)).is_err());
        assert!(writer.append_sample(&TelemetrySample::new(2.0, f64::INFINITY, 0.0, 1.0)).is_err());
        assert_eq!(writer.sample_count(), 1);
    }

    #[test]
    fn test_empty_series_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.csv");
        write_series(&path, ScaleSetting::TwoG, &[]).unwrap();
        let loaded = read_series(&path).unwrap();
        assert!(loaded.samples.is_empty());
        assert_eq!(loaded.time_range(), None);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        assert!(matches!(read_series("/nonexistent/series.csv"), Err(TelemetryError::Io(_))));
    }
}
