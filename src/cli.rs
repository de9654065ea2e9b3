//! Command-line plumbing shared by the binaries

use clap::Args;
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::config::SessionConfig;
use crate::error::{Result, TelemetryError};
use crate::link::{ChannelLink, UdpLink};
use crate::processor::SmoothingKind;
use crate::sample::Axis;
use crate::session::TelemetrySession;
use crate::sim::{Motion, NodeConfig, SimulatedNode};

/// Where the node lives and how the session is configured
#[derive(Args, Debug, Clone)]
pub struct LinkArgs {
    /// Session configuration file (JSON)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Base-station bridge address; without it an in-process simulated node is used
    #[arg(long)]
    pub udp: Option<SocketAddr>,

    /// Local address for the UDP socket
    #[arg(long, default_value = "0.0.0.0:0")]
    pub bind: String,

    /// Simulated motion: rest, shake-x, shake-y, shake-z
    #[arg(long, default_value = "rest", value_parser = parse_motion)]
    pub motion: Motion,

    /// Simulated sample rate in Hz
    #[arg(long, default_value = "100")]
    pub sim_rate: u32,
}

pub fn parse_motion(text: &str) -> std::result::Result<Motion, String> {
    match text.to_ascii_lowercase().as_str() {
        "rest" => Ok(Motion::Rest),
        other => match other.strip_prefix("shake-") {
            Some(axis) => axis.parse::<Axis>().map(Motion::Shake).map_err(|e| e.to_string()),
            None => Err(format!("unknown motion '{}'", text)),
        },
    }
}

pub fn parse_smoothing(text: &str) -> std::result::Result<SmoothingKind, String> {
    match text.to_ascii_lowercase().as_str() {
        "none" => Ok(SmoothingKind::None),
        "boxcar" => Ok(SmoothingKind::Boxcar),
        "triangular" => Ok(SmoothingKind::Triangular),
        _ => Err(format!("unknown smoothing '{}' (none, boxcar, triangular)", text)),
    }
}

/// A running session plus the simulated node behind it, if any
pub struct OpenSession {
    // Session first: its link worker must stop before the node goes away
    pub session: TelemetrySession,
    pub node: Option<SimulatedNode>,
}

impl LinkArgs {
    pub fn load_config(&self) -> Result<SessionConfig> {
        match &self.config {
            Some(path) => SessionConfig::load(path),
            None => Ok(SessionConfig::default()),
        }
    }

    pub fn open(&self, config: SessionConfig) -> Result<OpenSession> {
        match self.udp {
            Some(peer) => {
                log::info!("Using UDP bridge at {}", peer);
                let link = UdpLink::bind(&self.bind, peer)?;
                Ok(OpenSession { session: TelemetrySession::new(link, config)?, node: None })
            }
            None => {
                if self.sim_rate == 0 {
                    return Err(TelemetryError::InvalidConfig("sim-rate must be positive".to_string()));
                }
                log::info!("Using simulated node ({:?} at {} Hz)", self.motion, self.sim_rate);
                let (host, node_end) = ChannelLink::pair();
                let node = SimulatedNode::spawn(
                    node_end,
                    NodeConfig { sample_rate_hz: self.sim_rate, motion: self.motion, ..NodeConfig::default() },
                );
                Ok(OpenSession { session: TelemetrySession::new(host, config)?, node: Some(node) })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_motion() {
        assert_eq!(parse_motion("rest").unwrap(), Motion::Rest);
        assert_eq!(parse_motion("Shake-Y").unwrap(), Motion::Shake(Axis::Y));
        assert!(parse_motion("shake-w").is_err());
        assert!(parse_motion("spin").is_err());
    }

    #[test]
    fn test_parse_smoothing() {
        assert_eq!(parse_smoothing("Boxcar").unwrap(), SmoothingKind::Boxcar);
        assert!(parse_smoothing("gaussian").is_err());
    }
}
