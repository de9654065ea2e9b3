//! Session configuration, loadable from JSON

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;
use crate::gesture::PatternConfig;
use crate::matcher::MatcherConfig;
use crate::processor::ProcessorConfig;
use crate::sensor_link::LinkConfig;

/// Everything a [`TelemetrySession`](crate::session::TelemetrySession) needs
///
/// Missing sections and fields fall back to their defaults, so a file only has to
/// mention what it changes:
///
/// ```json
/// { "link": { "ack_timeout_ms": 800 }, "processor": { "filter": { "kind": "triangular", "width": 9 } } }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub link: LinkConfig,
    pub processor: ProcessorConfig,
    pub pattern: PatternConfig,
    pub matcher: MatcherConfig,
}

impl SessionConfig {
    /// Read and validate a JSON config file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: SessionConfig = serde_json::from_str(&text)?;
        config.validate()?;
        log::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.link.validate()?;
        self.processor.validate()?;
        self.pattern.validate()?;
        self.matcher.validate()?;
        Ok(())
    }
}
