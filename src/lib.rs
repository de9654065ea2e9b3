//! Host-side telemetry for a remote 3-axis accelerometer node
//!
//! The node streams acceleration samples over a lossy link and accepts a handful
//! of commands (scale, calibration, streaming, ping). This library keeps the link
//! alive, smooths and integrates the stream, records and classifies motion
//! gestures, and pushes everything to presentation ports.
//!
//! # Quick Start
//!
//! ## Live Session Against the Simulated Node
//! ```no_run
//! use accel_telemetry::{ChannelLink, ChannelPort, NodeConfig, SessionConfig, SimulatedNode, TelemetrySession};
//!
//! let (host, node) = ChannelLink::pair();
//! let _node = SimulatedNode::spawn(node, NodeConfig::default());
//!
//! let session = TelemetrySession::new(host, SessionConfig::default())?;
//! let (port, events) = ChannelPort::new();
//! session.subscribe(port);
//! session.connect()?;
//!
//! for event in events.iter().take(100) {
//!     println!("{:?}", event);
//! }
//! # Ok::<(), accel_telemetry::TelemetryError>(())
//! ```
//!
//! ## Recording and Classifying a Gesture
//! ```no_run
//! use accel_telemetry::{Axis, ChannelLink, SessionConfig, TelemetrySession};
//! use std::time::Duration;
//!
//! # let (host, _node) = ChannelLink::pair();
//! let session = TelemetrySession::new(host, SessionConfig::default())?;
//! session.connect()?;
//!
//! session.start_gesture_recording(Some(Axis::Z))?;
//! std::thread::sleep(Duration::from_secs(2));
//! let gesture = session.stop_gesture_recording()?;
//!
//! println!("{} -> {:?}", gesture, session.classify(&gesture));
//! # Ok::<(), accel_telemetry::TelemetryError>(())
//! ```
//!
//! ## Offline Replay
//! ```no_run
//! use accel_telemetry::{load_series_file, replay, ProcessorConfig};
//!
//! let series = load_series_file("run.csv")?;
//! let (points, integrated) = replay(ProcessorConfig::default(), &series.samples)?;
//! println!("{} points, peak {:.2}g", points.len(), integrated.max_magnitude);
//! # Ok::<(), accel_telemetry::TelemetryError>(())
//! ```

pub mod cli;
pub mod common;
pub mod config;
pub mod error;
pub mod gesture;
#[cfg(feature = "hdf5")]
pub mod hdf5_format;
pub mod link;
pub mod link_worker;
pub mod matcher;
pub mod port;
pub mod processor;
pub mod protocol;
pub mod sample;
pub mod sensor_link;
pub mod series_file;
pub mod session;
pub mod sim;

// Re-export public API
pub use common::{create_bar, level_bar, TimeKeeper};
pub use config::SessionConfig;
pub use error::{Result, TelemetryError};
pub use gesture::{Gesture, GestureRecorder, MotionLabel, PatternConfig};
pub use link::{ChannelLink, Link, UdpLink};
pub use link_worker::LinkHandle;
pub use matcher::{Classification, GestureLibrary, GestureTemplate, MatchWorker, Matcher, MatcherConfig};
pub use port::{ChannelPort, PortEvent, PortRegistry, PresentationPort, SubscriptionId};
pub use processor::{
    FilterConfig, IntegratedState, ProcessorConfig, SeriesUpdate, SmoothedPoint, SmoothingKind, StreamProcessor,
    ZoomAxis,
};
pub use protocol::{Command, CommandKind, Frame, FrameError};
pub use sample::{Axis, ScaleSetting, TelemetrySample};
pub use sensor_link::{LinkConfig, LinkEvent, LinkSnapshot, LinkState, SensorLink};
pub use series_file::{load_series_file, save_series_file, RecordedSeries, SeriesMetadata, SeriesWriter};
pub use session::{replay, LoadedSeries, TelemetrySession};
pub use sim::{Motion, NodeConfig, SimulatedNode};
