//! HDF5 layout for persisted series (`hdf5` feature)
//!
//! `metadata` group attributes: `format`, `version`, `recorded_at`, `scale`.
//! `series` group datasets: `timestamps`, `accel_x`, `accel_y`, `accel_z` (f64, g).
//! The same strictly-increasing timestamp rule as the CSV layout applies.

use hdf5::types::VarLenUnicode;
use hdf5::{Dataset, File, Group};
use std::path::Path;

use crate::error::{Result, TelemetryError};
use crate::sample::{ScaleSetting, TelemetrySample};
use crate::series_file::{RecordedSeries, SeriesMetadata, FORMAT_NAME};

const CHUNK_SIZE: usize = 1024;

/// Whether `path` has an HDF5 extension
pub fn is_hdf5_path(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()).as_deref(),
        Some("h5") | Some("hdf5")
    )
}

fn h5_err(context: &str) -> impl Fn(hdf5::Error) -> TelemetryError + '_ {
    move |e| TelemetryError::Serialization(format!("{}: {}", context, e))
}

fn write_str_attr(group: &Group, name: &str, value: &str) -> Result<()> {
    let value: VarLenUnicode = value
        .parse()
        .map_err(|e| TelemetryError::Serialization(format!("Invalid {} attribute: {:?}", name, e)))?;
    group
        .new_attr::<VarLenUnicode>()
        .create(name)
        .and_then(|attr| attr.write_scalar(&value))
        .map_err(|e| TelemetryError::Serialization(format!("Failed to write {}: {}", name, e)))
}

fn read_str_attr(group: &Group, name: &str) -> Result<String> {
    group
        .attr(name)
        .and_then(|attr| attr.read_scalar::<VarLenUnicode>())
        .map(|s| s.to_string())
        .map_err(|e| TelemetryError::Serialization(format!("Failed to read {}: {}", name, e)))
}

struct DatasetHandles {
    timestamps: Dataset,
    accel_x: Dataset,
    accel_y: Dataset,
    accel_z: Dataset,
}

/// HDF5 writer for acceleration series
pub struct Hdf5SeriesWriter {
    file: File,
    datasets: DatasetHandles,
    metadata: SeriesMetadata,
    last_timestamp: Option<f64>,
    sample_count: usize,
}

impl Hdf5SeriesWriter {
    pub fn create<P: AsRef<Path>>(path: P, scale: ScaleSetting) -> Result<Self> {
        let file = File::create(path).map_err(h5_err("Failed to create HDF5 file"))?;

        let metadata = SeriesMetadata::now(scale);
        let metadata_group = file
            .create_group("metadata")
            .map_err(h5_err("Failed to create metadata group"))?;
        write_str_attr(&metadata_group, "format", FORMAT_NAME)?;
        write_str_attr(&metadata_group, "version", &metadata.version)?;
        write_str_attr(&metadata_group, "recorded_at", &metadata.recorded_at)?;
        write_str_attr(&metadata_group, "scale", &metadata.scale.to_string())?;

        let series_group = file
            .create_group("series")
            .map_err(h5_err("Failed to create series group"))?;
        let datasets = DatasetHandles {
            timestamps: Self::create_dataset(&series_group, "timestamps")?,
            accel_x: Self::create_dataset(&series_group, "accel_x")?,
            accel_y: Self::create_dataset(&series_group, "accel_y")?,
            accel_z: Self::create_dataset(&series_group, "accel_z")?,
        };

        Ok(Self { file, datasets, metadata, last_timestamp: None, sample_count: 0 })
    }

    /// Resizable, chunked, compressed f64 dataset
    fn create_dataset(group: &Group, name: &str) -> Result<Dataset> {
        group
            .new_dataset::<f64>()
            .shape((0..,))
            .chunk((CHUNK_SIZE,))
            .deflate(4)
            .create(name)
            .map_err(|e| TelemetryError::Serialization(format!("Failed to create dataset {}: {}", name, e)))
    }

    pub fn metadata(&self) -> &SeriesMetadata {
        &self.metadata
    }

    pub fn append_batch(&mut self, samples: &[TelemetrySample]) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }

        let mut previous = self.last_timestamp;
        for (i, sample) in samples.iter().enumerate() {
            let record = self.sample_count + i + 1;
            let values = [sample.timestamp(), sample.ax(), sample.ay(), sample.az()];
            if values.iter().any(|v| !v.is_finite()) {
                return Err(TelemetryError::CorruptPersistedFile { record, reason: "non-finite value".to_string() });
            }
            if previous.map_or(false, |p| sample.timestamp() <= p) {
                return Err(TelemetryError::CorruptPersistedFile {
                    record,
                    reason: "timestamps not strictly increasing".to_string(),
                });
            }
            previous = Some(sample.timestamp());
        }

        let new_size = self.sample_count + samples.len();
        let column = |f: fn(&TelemetrySample) -> f64| samples.iter().map(f).collect::<Vec<f64>>();

        append_to_dataset(&self.datasets.timestamps, new_size, &column(TelemetrySample::timestamp))?;
        append_to_dataset(&self.datasets.accel_x, new_size, &column(TelemetrySample::ax))?;
        append_to_dataset(&self.datasets.accel_y, new_size, &column(TelemetrySample::ay))?;
        append_to_dataset(&self.datasets.accel_z, new_size, &column(TelemetrySample::az))?;

        self.last_timestamp = previous;
        self.sample_count = new_size;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.file.flush().map_err(h5_err("Failed to flush HDF5 file"))
    }

    pub fn sample_count(&self) -> usize {
        self.sample_count
    }
}

fn append_to_dataset(dataset: &Dataset, new_size: usize, data: &[f64]) -> Result<()> {
    dataset
        .resize((new_size,))
        .map_err(h5_err("Failed to resize dataset"))?;
    let start = new_size - data.len();
    dataset
        .write_slice(data, start..)
        .map_err(h5_err("Failed to write to dataset"))
}

/// HDF5 reader for acceleration series
pub struct Hdf5SeriesReader {
    #[allow(dead_code)]
    file: File,
    datasets: DatasetHandles,
    metadata: SeriesMetadata,
}

impl Hdf5SeriesReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path).map_err(h5_err("Failed to open HDF5 file"))?;

        let metadata_group = file.group("metadata").map_err(h5_err("Failed to open metadata group"))?;
        let format = read_str_attr(&metadata_group, "format")?;
        if format != FORMAT_NAME {
            return Err(TelemetryError::CorruptPersistedFile {
                record: 0,
                reason: format!("unknown format '{}'", format),
            });
        }
        let scale_text = read_str_attr(&metadata_group, "scale")?;
        let metadata = SeriesMetadata {
            recorded_at: read_str_attr(&metadata_group, "recorded_at")?,
            scale: scale_text.parse().map_err(|_| TelemetryError::CorruptPersistedFile {
                record: 0,
                reason: format!("bad scale '{}'", scale_text),
            })?,
            version: read_str_attr(&metadata_group, "version")?,
        };

        let series_group = file.group("series").map_err(h5_err("Failed to open series group"))?;
        let open = |name: &str| {
            series_group
                .dataset(name)
                .map_err(|e| TelemetryError::Serialization(format!("Failed to open {} dataset: {}", name, e)))
        };
        let datasets = DatasetHandles {
            timestamps: open("timestamps")?,
            accel_x: open("accel_x")?,
            accel_y: open("accel_y")?,
            accel_z: open("accel_z")?,
        };

        Ok(Self { file, datasets, metadata })
    }

    pub fn metadata(&self) -> &SeriesMetadata {
        &self.metadata
    }

    pub fn total_samples(&self) -> usize {
        self.datasets.timestamps.size()
    }

    /// Read `count` samples from `start`, validating order within the range
    pub fn read_range(&self, start: usize, count: usize) -> Result<Vec<TelemetrySample>> {
        let total = self.total_samples();
        if start >= total {
            return Ok(Vec::new());
        }
        let end = start + count.min(total - start);

        let read = |dataset: &Dataset, name: &str| -> Result<Vec<f64>> {
            dataset
                .read_slice_1d::<f64, _>(start..end)
                .map(|a| a.to_vec())
                .map_err(|e| TelemetryError::Serialization(format!("Failed to read {}: {}", name, e)))
        };
        let timestamps = read(&self.datasets.timestamps, "timestamps")?;
        let accel_x = read(&self.datasets.accel_x, "accel_x")?;
        let accel_y = read(&self.datasets.accel_y, "accel_y")?;
        let accel_z = read(&self.datasets.accel_z, "accel_z")?;

        let mut samples = Vec::with_capacity(timestamps.len());
        let mut previous: Option<f64> = None;
        for (i, (((t, ax), ay), az)) in timestamps
            .into_iter()
            .zip(accel_x)
            .zip(accel_y)
            .zip(accel_z)
            .enumerate()
        {
            let record = start + i + 1;
            if ![t, ax, ay, az].iter().all(|v| v.is_finite()) {
                return Err(TelemetryError::CorruptPersistedFile { record, reason: "non-finite value".to_string() });
            }
            if previous.map_or(false, |p| t <= p) {
                return Err(TelemetryError::CorruptPersistedFile {
                    record,
                    reason: format!("timestamp {} not after previous", t),
                });
            }
            previous = Some(t);
            samples.push(TelemetrySample::new(t, ax, ay, az));
        }
        Ok(samples)
    }
}

pub fn write_series_hdf5<P: AsRef<Path>>(
    path: P,
    scale: ScaleSetting,
    samples: &[TelemetrySample],
) -> Result<SeriesMetadata> {
    let mut writer = Hdf5SeriesWriter::create(path, scale)?;
    writer.append_batch(samples)?;
    writer.flush()?;
    Ok(writer.metadata().clone())
}

pub fn read_series_hdf5<P: AsRef<Path>>(path: P) -> Result<RecordedSeries> {
    let reader = Hdf5SeriesReader::open(path)?;
    let samples = reader.read_range(0, reader.total_samples())?;
    Ok(RecordedSeries { metadata: reader.metadata().clone(), samples })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hdf5_path_detection() {
        assert!(is_hdf5_path(Path::new("run.h5")));
        assert!(is_hdf5_path(Path::new("run.HDF5")));
        assert!(!is_hdf5_path(Path::new("run.csv")));
    }

    #[test]
    fn test_hdf5_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.h5");
        let samples: Vec<_> = (0..10).map(|i| TelemetrySample::new(i as f64 * 0.01, 0.1, 0.2, 1.0)).collect();

        write_series_hdf5(&path, ScaleSetting::SixG, &samples).unwrap();
        let loaded = read_series_hdf5(&path).unwrap();
        assert_eq!(loaded.samples, samples);
        assert_eq!(loaded.metadata.scale, ScaleSetting::SixG);
    }

    #[test]
    fn test_hdf5_writer_rejects_out_of_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = Hdf5SeriesWriter::create(dir.path().join("bad.h5"), ScaleSetting::TwoG).unwrap();
        let samples = [
            TelemetrySample::new(0.0, 0.0, 0.0, 1.0),
            TelemetrySample::new(0.5, 0.0, 0.0, 1.0),
            TelemetrySample::new(0.3, 0.0, 0.0, 1.0),
        ];
        assert!(matches!(
            writer.append_batch(&samples),
            Err(TelemetryError::CorruptPersistedFile { record: 3, .. })
        ));
        assert_eq!(writer.sample_count(), 0);
    }
}
