//! Telemetry session: wires the link worker, stream processor, gesture recorder,
//! matcher and presentation ports together
//!
//! Nothing here is global. The gesture library and the port registry are shared
//! `Arc` handles passed in by the caller, so several sessions (or an analyzer and
//! a live view) can use the same library.

use parking_lot::{Mutex, RwLock};
use std::path::Path;
use std::sync::Arc;

use crate::config::SessionConfig;
use crate::error::{Result, TelemetryError};
use crate::gesture::{Gesture, GestureRecorder};
use crate::link::Link;
use crate::link_worker::LinkHandle;
use crate::matcher::{Classification, GestureLibrary, GestureTemplate, MatchWorker, Matcher};
use crate::port::{PortRegistry, PresentationPort, SubscriptionId};
use crate::processor::{
    FilterConfig, IntegratedState, ProcessorConfig, SmoothedPoint, SmoothingKind, StreamProcessor, ZoomAxis,
};
use crate::sample::{Axis, ScaleSetting, TelemetrySample};
use crate::sensor_link::{LinkEvent, LinkSnapshot, LinkState};
use crate::series_file::{load_series_file, save_series_file, RecordedSeries, SeriesMetadata};

/// Live data guarded by one lock
struct Pipeline {
    processor: StreamProcessor,
    recorder: GestureRecorder,
    series: Vec<TelemetrySample>,
    last_series_timestamp: Option<f64>,
    unsaved: bool,
}

impl Pipeline {
    fn ingest(&mut self, sample: TelemetrySample) -> crate::processor::SeriesUpdate {
        let update = self.processor.ingest(sample);
        self.recorder.push(sample);

        if self.last_series_timestamp.map_or(true, |last| sample.timestamp() > last) {
            self.series.push(sample);
            self.last_series_timestamp = Some(sample.timestamp());
            self.unsaved = true;
        } else {
            log::warn!(
                "Sample at {:.3}s is not after {:.3}s; not added to recorded series",
                sample.timestamp(),
                self.last_series_timestamp.unwrap_or_default()
            );
        }
        update
    }

    fn clear(&mut self) {
        self.processor.reset();
        self.series.clear();
        self.last_series_timestamp = None;
        self.unsaved = false;
    }
}

/// A series loaded from disk and replayed through its own processor
#[derive(Debug, Clone)]
pub struct LoadedSeries {
    pub series: RecordedSeries,
    pub points: Vec<SmoothedPoint>,
    pub integrated: IntegratedState,
}

pub struct TelemetrySession {
    // Declared first so the link worker, which feeds the pipeline, stops first
    link: LinkHandle,
    match_worker: MatchWorker,
    pipeline: Arc<Mutex<Pipeline>>,
    ports: Arc<PortRegistry>,
    library: Arc<RwLock<GestureLibrary>>,
    matcher: Matcher,
    config: SessionConfig,
}

impl TelemetrySession {
    /// Session with its own built-in gesture library and an empty port registry
    pub fn new<L: Link + 'static>(link: L, config: SessionConfig) -> Result<Self> {
        Self::with_shared(
            link,
            config,
            Arc::new(RwLock::new(GestureLibrary::with_builtins())),
            Arc::new(PortRegistry::new()),
        )
    }

    /// Session using a caller-owned library and port registry
    pub fn with_shared<L: Link + 'static>(
        link: L,
        config: SessionConfig,
        library: Arc<RwLock<GestureLibrary>>,
        ports: Arc<PortRegistry>,
    ) -> Result<Self> {
        config.validate()?;

        let pipeline = Arc::new(Mutex::new(Pipeline {
            processor: StreamProcessor::new(config.processor.clone())?,
            recorder: GestureRecorder::new(config.pattern.clone()),
            series: Vec::new(),
            last_series_timestamp: None,
            unsaved: false,
        }));

        let worker_ports = Arc::clone(&ports);
        let match_worker = MatchWorker::spawn(
            Matcher::new(config.matcher.clone())?,
            Arc::clone(&library),
            move |result| {
                log::info!("Gesture classified: {:?}", result);
                worker_ports.notify(|port| port.on_gesture_classified(&result));
            },
        );

        let sink_pipeline = Arc::clone(&pipeline);
        let sink_ports = Arc::clone(&ports);
        let link = LinkHandle::spawn(link, config.link.clone(), move |event| {
            handle_link_event(event, &sink_pipeline, &sink_ports)
        })?;

        Ok(Self {
            link,
            match_worker,
            pipeline,
            ports,
            library,
            matcher: Matcher::new(config.matcher.clone())?,
            config,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn ports(&self) -> Arc<PortRegistry> {
        Arc::clone(&self.ports)
    }

    pub fn subscribe(&self, port: Arc<dyn PresentationPort>) -> SubscriptionId {
        self.ports.subscribe(port)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.ports.unsubscribe(id)
    }

    pub fn library(&self) -> Arc<RwLock<GestureLibrary>> {
        Arc::clone(&self.library)
    }

    // Link commands

    pub fn connect(&self) -> Result<()> {
        self.link.connect()
    }

    pub fn reconnect(&self) -> Result<()> {
        self.link.reconnect()
    }

    pub fn disconnect(&self) -> Result<()> {
        self.link.disconnect()
    }

    pub fn set_scale(&self, scale: ScaleSetting) -> Result<()> {
        self.link.set_scale(scale)
    }

    pub fn calibrate(&self) -> Result<()> {
        self.link.calibrate()
    }

    pub fn ping(&self) -> Result<()> {
        self.link.ping()
    }

    pub fn set_streaming(&self, enabled: bool) -> Result<()> {
        self.link.set_streaming(enabled)
    }

    pub fn link_state(&self) -> LinkState {
        self.link.snapshot().state
    }

    pub fn link_snapshot(&self) -> LinkSnapshot {
        self.link.snapshot()
    }

    pub fn scale(&self) -> ScaleSetting {
        self.link.snapshot().scale
    }

    // Pipeline

    /// Change smoothing; the width is normalized before use
    pub fn set_filter(&self, kind: SmoothingKind, width: i64) -> Result<FilterConfig> {
        self.pipeline.lock().processor.set_filter(kind, width)
    }

    pub fn set_zoom(&self, axis: ZoomAxis, factor: f64) -> Result<()> {
        self.pipeline.lock().processor.set_zoom(axis, factor)
    }

    /// Stop streaming, then drop the recorded series and reset integration
    ///
    /// The stop is applied by the link worker, so every sample it accepted
    /// before has already reached the pipeline when the series is dropped.
    pub fn clear(&self) -> Result<()> {
        match self.link.set_streaming(false) {
            // Without a session nothing streams; the stop still applied locally
            Ok(()) | Err(TelemetryError::InvalidState { .. }) => {}
            Err(e) => return Err(e),
        }
        self.pipeline.lock().clear();
        log::info!("Series cleared");
        Ok(())
    }

    pub fn filter(&self) -> FilterConfig {
        self.pipeline.lock().processor.filter()
    }

    pub fn zoom(&self, axis: ZoomAxis) -> f64 {
        self.pipeline.lock().processor.zoom(axis)
    }

    pub fn integrated(&self) -> IntegratedState {
        self.pipeline.lock().processor.integrated()
    }

    /// Samples recorded since the last clear
    pub fn series_len(&self) -> usize {
        self.pipeline.lock().series.len()
    }

    pub fn has_unsaved_data(&self) -> bool {
        self.pipeline.lock().unsaved
    }

    // Gestures

    pub fn start_gesture_recording(&self, inactive_axis: Option<Axis>) -> Result<()> {
        self.pipeline.lock().recorder.start(inactive_axis)
    }

    pub fn is_recording_gesture(&self) -> bool {
        self.pipeline.lock().recorder.is_recording()
    }

    /// Finish the recording and queue it for classification
    ///
    /// The result reaches subscribed ports through `on_gesture_classified`.
    pub fn stop_gesture_recording(&self) -> Result<Gesture> {
        let gesture = self.pipeline.lock().recorder.stop()?;
        self.match_worker.submit(gesture.clone());
        Ok(gesture)
    }

    pub fn classify(&self, gesture: &Gesture) -> Classification {
        self.matcher.classify(gesture, &self.library.read())
    }

    pub fn add_template(&self, name: &str, gesture: Gesture, overwrite: bool) -> Result<()> {
        self.library.write().add_template(name, gesture, overwrite)
    }

    pub fn remove_template(&self, name: &str) -> Result<GestureTemplate> {
        self.library.write().remove_template(name)
    }

    // Files

    /// Write the recorded series; clears the unsaved flag on success
    pub fn save_series<P: AsRef<Path>>(&self, path: P) -> Result<SeriesMetadata> {
        let samples = self.pipeline.lock().series.clone();
        let metadata = save_series_file(path.as_ref(), self.scale(), &samples)?;
        log::info!("Saved {} samples to {}", samples.len(), path.as_ref().display());

        let mut pipeline = self.pipeline.lock();
        // Anything that arrived while writing is still unsaved
        if pipeline.series.len() == samples.len() {
            pipeline.unsaved = false;
        }
        Ok(metadata)
    }

    /// Load a series and replay it with the current filter; live data is untouched
    pub fn load_series<P: AsRef<Path>>(&self, path: P) -> Result<LoadedSeries> {
        let series = load_series_file(path)?;
        let config = ProcessorConfig { filter: self.filter(), ..self.config.processor.clone() };
        let (points, integrated) = replay(config, &series.samples)?;
        Ok(LoadedSeries { series, points, integrated })
    }
}

/// Run `samples` through a fresh processor
pub fn replay(config: ProcessorConfig, samples: &[TelemetrySample]) -> Result<(Vec<SmoothedPoint>, IntegratedState)> {
    let mut processor = StreamProcessor::new(config)?;
    let mut points = Vec::with_capacity(samples.len());
    for sample in samples {
        points.extend(processor.ingest(*sample).points);
    }
    Ok((points, processor.integrated()))
}

fn handle_link_event(event: LinkEvent, pipeline: &Mutex<Pipeline>, ports: &PortRegistry) {
    match event {
        LinkEvent::Sample(sample) => {
            let update = pipeline.lock().ingest(sample);
            ports.notify(|port| port.on_sample_batch(&update));
            if update.max_changed {
                let max = update.integrated.max_magnitude;
                ports.notify(|port| port.on_max_magnitude_update(max));
            }
        }
        LinkEvent::Status { connected, message } => {
            {
                let mut pipeline = pipeline.lock();
                if connected {
                    pipeline.recorder.resume();
                } else {
                    pipeline.recorder.pause();
                }
            }
            ports.notify(|port| port.on_connection_status(connected, &message));
        }
        LinkEvent::CalibrationComplete => {
            pipeline.lock().processor.reset();
            log::info!("Calibration complete; integration reset");
        }
        LinkEvent::CommandFailed { kind, reason } => {
            ports.notify(|port| port.on_command_failed(kind, &reason));
        }
        LinkEvent::PingReply { round_trip } => {
            ports.notify(|port| port.on_ping_reply(round_trip));
        }
        LinkEvent::CommandAcknowledged(kind) => log::debug!("{} acknowledged", kind),
        LinkEvent::ScaleChanged(scale) => log::info!("Scale now {}", scale),
        LinkEvent::StreamingChanged(enabled) => log::info!("Streaming {}", if enabled { "on" } else { "off" }),
    }
}
