//! Connection and command state machine for the remote sensor node
//!
//! [`SensorLink`] owns a [`Link`] and is driven by three kinds of input:
//! operations from the application (`connect`, `set_scale`, ...), frames from the
//! node (`on_frame`) and the passage of time (`poll`). Every method that depends on
//! time takes `now` explicitly so deadlines can be exercised without sleeping.
//! Observable outcomes are queued as [`LinkEvent`]s and collected with
//! [`SensorLink::drain_events`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

use crate::error::{Result, TelemetryError};
use crate::link::Link;
use crate::protocol::{Command, CommandKind, Frame, ACK_OK};
use crate::sample::{ScaleSetting, TelemetrySample};

const LINK_CLOSED: &str = "link closed";

/// Timeouts and retry bounds of the link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Wait for a command acknowledgement before resending
    pub ack_timeout_ms: u64,
    /// Resends of an unacknowledged command before it fails
    pub command_retries: u32,
    /// Consecutive failed commands that count as a transport failure
    pub command_failure_threshold: u32,
    /// Wait for a handshake reply
    pub handshake_timeout_ms: u64,
    /// Silence after which a heartbeat ping is sent
    pub heartbeat_interval_ms: u64,
    /// Silence after which the link is considered lost
    pub liveness_timeout_ms: u64,
    pub reconnect_initial_backoff_ms: u64,
    pub reconnect_max_backoff_ms: u64,
    /// Failed reconnect handshakes before giving up
    pub max_reconnect_attempts: u32,
    /// Consecutive malformed frames that count as a transport failure
    pub malformed_frame_threshold: u32,
    /// Receive timeout of one event loop iteration
    pub poll_interval_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 500,
            command_retries: 2,
            command_failure_threshold: 3,
            handshake_timeout_ms: 1000,
            heartbeat_interval_ms: 1000,
            liveness_timeout_ms: 3000,
            reconnect_initial_backoff_ms: 250,
            reconnect_max_backoff_ms: 4000,
            max_reconnect_attempts: 5,
            malformed_frame_threshold: 10,
            poll_interval_ms: 20,
        }
    }
}

impl LinkConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Delay before reconnect attempt `attempt` (0-based): `min(initial * 2^attempt, max)`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let delay = self.reconnect_initial_backoff_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.reconnect_max_backoff_ms))
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("ack_timeout_ms", self.ack_timeout_ms),
            ("handshake_timeout_ms", self.handshake_timeout_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("liveness_timeout_ms", self.liveness_timeout_ms),
            ("poll_interval_ms", self.poll_interval_ms),
            ("command_failure_threshold", self.command_failure_threshold as u64),
            ("max_reconnect_attempts", self.max_reconnect_attempts as u64),
            ("malformed_frame_threshold", self.malformed_frame_threshold as u64),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(TelemetryError::InvalidConfig(format!("{} must be positive", name)));
            }
        }
        if self.reconnect_initial_backoff_ms > self.reconnect_max_backoff_ms {
            return Err(TelemetryError::InvalidConfig(
                "reconnect_initial_backoff_ms exceeds reconnect_max_backoff_ms".to_string(),
            ));
        }
        if self.liveness_timeout_ms <= self.heartbeat_interval_ms {
            return Err(TelemetryError::InvalidConfig(
                "liveness_timeout_ms must exceed heartbeat_interval_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// Connection state of the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    AwaitingAck(CommandKind),
    Reconnecting,
}

impl LinkState {
    /// Whether a handshake has completed and not been lost since
    pub fn is_connected(self) -> bool {
        matches!(self, LinkState::Connected | LinkState::AwaitingAck(_))
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Disconnected => f.write_str("disconnected"),
            LinkState::Connecting => f.write_str("connecting"),
            LinkState::Connected => f.write_str("connected"),
            LinkState::AwaitingAck(kind) => write!(f, "awaiting {} ack", kind),
            LinkState::Reconnecting => f.write_str("reconnecting"),
        }
    }
}

/// Something observable happened on the link
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Connectedness changed (or the link gave up)
    Status { connected: bool, message: String },
    /// Telemetry accepted from the node
    Sample(TelemetrySample),
    CommandAcknowledged(CommandKind),
    /// A command timed out, was rejected by the node or was cancelled
    CommandFailed { kind: CommandKind, reason: String },
    /// The cached scale changed through an ack or a revert
    ScaleChanged(ScaleSetting),
    CalibrationComplete,
    PingReply { round_trip: Duration },
    StreamingChanged(bool),
}

/// Point-in-time view of the link, shared with other threads
#[derive(Debug, Clone, PartialEq)]
pub struct LinkSnapshot {
    pub state: LinkState,
    pub scale: ScaleSetting,
    pub scale_confirmed: bool,
    pub streaming: bool,
    pub malformed_frames: u64,
    pub discarded_telemetry: u64,
}

impl Default for LinkSnapshot {
    fn default() -> Self {
        Self {
            state: LinkState::Disconnected,
            scale: ScaleSetting::default(),
            scale_confirmed: false,
            streaming: false,
            malformed_frames: 0,
            discarded_telemetry: 0,
        }
    }
}

struct PendingCommand {
    command: Command,
    seq: u8,
    first_sent: Instant,
    deadline: Instant,
    resends_left: u32,
    previous_scale: Option<ScaleSetting>,
}

struct Handshake {
    seq: u8,
    deadline: Instant,
}

/// Protocol state machine over a [`Link`]
pub struct SensorLink<L: Link> {
    link: L,
    config: LinkConfig,
    state: LinkState,
    scale: ScaleSetting,
    scale_confirmed: bool,
    streaming: bool,
    seq: u8,
    pending: Option<PendingCommand>,
    handshake: Option<Handshake>,
    failed_attempts: u32,
    next_attempt: Option<Instant>,
    last_rx: Instant,
    heartbeat: Option<u8>,
    last_heartbeat: Option<Instant>,
    consecutive_failures: u32,
    malformed_streak: u32,
    malformed_total: u64,
    discarded_telemetry: u64,
    // Stop-streaming request waiting for the in-flight command to resolve
    stop_deferred: bool,
    events: Vec<LinkEvent>,
}

impl<L: Link> SensorLink<L> {
    pub fn new(link: L, config: LinkConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            link,
            config,
            state: LinkState::Disconnected,
            scale: ScaleSetting::default(),
            scale_confirmed: false,
            streaming: false,
            seq: 0,
            pending: None,
            handshake: None,
            failed_attempts: 0,
            next_attempt: None,
            last_rx: Instant::now(),
            heartbeat: None,
            last_heartbeat: None,
            consecutive_failures: 0,
            malformed_streak: 0,
            malformed_total: 0,
            discarded_telemetry: 0,
            stop_deferred: false,
            events: Vec::new(),
        })
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Cached scale; see [`scale_confirmed`](Self::scale_confirmed)
    pub fn scale(&self) -> ScaleSetting {
        self.scale
    }

    /// False after any link failure until a handshake or ack reconfirms the scale
    pub fn scale_confirmed(&self) -> bool {
        self.scale_confirmed
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn malformed_frames(&self) -> u64 {
        self.malformed_total
    }

    pub fn discarded_telemetry(&self) -> u64 {
        self.discarded_telemetry
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn snapshot(&self) -> LinkSnapshot {
        LinkSnapshot {
            state: self.state,
            scale: self.scale,
            scale_confirmed: self.scale_confirmed,
            streaming: self.streaming,
            malformed_frames: self.malformed_total,
            discarded_telemetry: self.discarded_telemetry,
        }
    }

    /// Take every event queued since the last call
    pub fn drain_events(&mut self) -> Vec<LinkEvent> {
        std::mem::take(&mut self.events)
    }

    /// Start the handshake; no-op unless disconnected
    pub fn connect(&mut self, now: Instant) {
        if self.state != LinkState::Disconnected {
            log::debug!("connect ignored while {}", self.state);
            return;
        }
        log::info!("Connecting to sensor node");
        self.state = LinkState::Connecting;
        self.failed_attempts = 0;
        self.next_attempt = None;
        self.start_handshake(now);
    }

    /// Force a fresh handshake from any state, cancelling in-flight work
    pub fn reconnect(&mut self, now: Instant) {
        log::info!("Reconnect requested while {}", self.state);
        let was_connected = self.state.is_connected();
        self.cancel_pending("cancelled by reconnect");
        self.reset_session();
        if was_connected {
            self.status(false, "Reconnecting".to_string());
        }
        self.state = LinkState::Connecting;
        self.start_handshake(now);
    }

    /// Force `Disconnected`, cancelling in-flight work
    pub fn disconnect(&mut self) {
        if self.state == LinkState::Disconnected {
            return;
        }
        log::info!("Disconnecting from sensor node");
        self.cancel_pending("cancelled by disconnect");
        self.reset_session();
        self.state = LinkState::Disconnected;
        self.status(false, "Disconnected".to_string());
    }

    /// Change the node's full-scale range; the cache is updated optimistically
    pub fn set_scale(&mut self, scale: ScaleSetting, now: Instant) -> Result<()> {
        self.issue(Command::SetScale(scale), now)
    }

    pub fn calibrate(&mut self, now: Instant) -> Result<()> {
        self.issue(Command::Calibrate, now)
    }

    pub fn ping(&mut self, now: Instant) -> Result<()> {
        self.issue(Command::Ping, now)
    }

    /// Enable or disable telemetry; repeating the current value is a no-op
    ///
    /// Disabling always takes local effect first. While another command awaits
    /// its ack, the stop is sent once that command resolves.
    pub fn set_streaming(&mut self, enabled: bool, now: Instant) -> Result<()> {
        if enabled {
            if self.streaming {
                return Ok(());
            }
            return self.issue(Command::SetStreaming(true), now);
        }

        let enabling = matches!(self.pending.as_ref().map(|p| p.command), Some(Command::SetStreaming(true)));
        if !self.streaming && !enabling {
            return Ok(());
        }
        self.set_streaming_local(false);
        if let LinkState::AwaitingAck(pending) = self.state {
            log::debug!("Stop streaming queued behind {} command", pending);
            self.stop_deferred = true;
            return Ok(());
        }
        self.issue(Command::SetStreaming(false), now)
    }

    /// Handle one raw frame from the node; returns accepted telemetry
    pub fn on_frame(&mut self, bytes: &[u8], now: Instant) -> Option<TelemetrySample> {
        let frame = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                self.malformed_streak += 1;
                self.malformed_total += 1;
                log::warn!(
                    "Dropping malformed frame ({} in a row): {}",
                    self.malformed_streak,
                    e
                );
                // Only an established session escalates; handshakes have their own deadline
                if self.state.is_connected() && self.malformed_streak >= self.config.malformed_frame_threshold {
                    let reason = format!("{} consecutive malformed frames", self.malformed_streak);
                    self.malformed_streak = 0;
                    self.transport_failure(&reason, now);
                }
                return None;
            }
        };

        self.malformed_streak = 0;
        self.last_rx = now;

        match frame {
            Frame::HelloAck { seq, scale, streaming } => {
                self.on_hello_ack(seq, scale, streaming);
                None
            }
            Frame::Ack { seq, command, status, arg } => {
                self.on_ack(seq, command, status, arg, now);
                None
            }
            Frame::Telemetry { .. } => {
                if self.state.is_connected() && self.streaming {
                    frame.to_sample()
                } else {
                    self.discarded_telemetry += 1;
                    log::debug!(
                        "Discarding telemetry (state {}, streaming {})",
                        self.state,
                        self.streaming
                    );
                    None
                }
            }
            Frame::Hello { .. } | Frame::Command { .. } => {
                log::debug!("Ignoring host-bound frame type from node");
                None
            }
        }
    }

    /// Run deadlines: handshake and ack timeouts, backoff, liveness and heartbeat
    pub fn poll(&mut self, now: Instant) {
        match self.state {
            LinkState::Disconnected => {}
            LinkState::Connecting | LinkState::Reconnecting => {
                if self.handshake.as_ref().map_or(false, |h| now >= h.deadline) {
                    self.handshake = None;
                    if self.state == LinkState::Connecting {
                        self.transport_failure("handshake timed out", now);
                    } else {
                        self.attempt_failed(now);
                    }
                }
                if self.state == LinkState::Reconnecting && self.handshake.is_none() {
                    if let Some(at) = self.next_attempt {
                        if now >= at {
                            self.next_attempt = None;
                            log::info!("Reconnect attempt {}", self.failed_attempts + 1);
                            self.start_handshake(now);
                        }
                    }
                }
            }
            LinkState::Connected | LinkState::AwaitingAck(_) => {
                self.check_pending(now);
                if !self.state.is_connected() {
                    return;
                }
                let silence = now.saturating_duration_since(self.last_rx);
                if silence >= self.config.liveness_timeout() {
                    let reason = format!("no frame for {} ms", silence.as_millis());
                    self.transport_failure(&reason, now);
                } else {
                    self.maybe_heartbeat(now);
                }
            }
        }
    }

    /// Read at most one frame (waiting up to `wait`) and run deadlines
    pub fn pump(&mut self, wait: Duration) {
        // A closed link fails the session; handshakes fail on send at their backoff deadline
        if !self.link.is_open() {
            if self.state.is_connected() {
                self.transport_failure(LINK_CLOSED, Instant::now());
            } else {
                std::thread::sleep(wait);
            }
            self.poll(Instant::now());
            return;
        }
        match self.link.receive(wait) {
            Ok(Some(bytes)) => {
                if let Some(sample) = self.on_frame(&bytes, Instant::now()) {
                    self.events.push(LinkEvent::Sample(sample));
                }
            }
            Ok(None) => {}
            Err(e) => {
                if self.state == LinkState::Disconnected {
                    // Nothing to recover; avoid spinning on a dead transport
                    std::thread::sleep(wait);
                } else {
                    self.transport_failure(&e.to_string(), Instant::now());
                }
            }
        }
        self.poll(Instant::now());
    }

    fn send(&mut self, frame: &Frame) -> Result<()> {
        if !self.link.is_open() {
            return Err(TelemetryError::LinkTransport(LINK_CLOSED.to_string()));
        }
        self.link.send(&frame.encode())
    }

    fn next_seq(&mut self) -> u8 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    fn status(&mut self, connected: bool, message: String) {
        log::info!("Link status: {}", message);
        self.events.push(LinkEvent::Status { connected, message });
    }

    fn set_streaming_local(&mut self, enabled: bool) {
        if self.streaming != enabled {
            self.streaming = enabled;
            self.events.push(LinkEvent::StreamingChanged(enabled));
        }
    }

    fn reset_session(&mut self) {
        self.handshake = None;
        self.heartbeat = None;
        self.last_heartbeat = None;
        self.next_attempt = None;
        self.failed_attempts = 0;
        self.consecutive_failures = 0;
        self.malformed_streak = 0;
        self.stop_deferred = false;
        self.scale_confirmed = false;
    }

    fn start_handshake(&mut self, now: Instant) {
        let seq = self.next_seq();
        self.handshake = Some(Handshake { seq, deadline: now + self.config.handshake_timeout() });
        log::debug!("Sending hello (seq {})", seq);
        if let Err(e) = self.send(&Frame::Hello { seq }) {
            self.transport_failure(&e.to_string(), now);
        }
    }

    fn on_hello_ack(&mut self, seq: u8, scale: ScaleSetting, streaming: bool) {
        let expected = self.handshake.as_ref().map(|h| h.seq);
        if expected != Some(seq) {
            log::debug!("Ignoring stale handshake reply (seq {})", seq);
            return;
        }
        self.handshake = None;
        self.next_attempt = None;
        self.failed_attempts = 0;
        self.consecutive_failures = 0;
        self.state = LinkState::Connected;
        self.scale = scale;
        self.scale_confirmed = true;
        self.set_streaming_local(streaming);
        self.status(true, format!("Connected ({} scale)", scale));
    }

    fn issue(&mut self, command: Command, now: Instant) -> Result<()> {
        let kind = command.kind();
        match self.state {
            LinkState::Connected => {}
            LinkState::AwaitingAck(pending) => return Err(TelemetryError::CommandInFlight(pending)),
            state => return Err(TelemetryError::InvalidState { command: kind, state }),
        }

        let mut previous_scale = None;
        match command {
            Command::SetScale(scale) => {
                previous_scale = Some(self.scale);
                self.scale = scale;
            }
            Command::SetStreaming(false) => self.set_streaming_local(false),
            _ => {}
        }

        let seq = self.next_seq();
        self.pending = Some(PendingCommand {
            command,
            seq,
            first_sent: now,
            deadline: now + self.config.ack_timeout(),
            resends_left: self.config.command_retries,
            previous_scale,
        });
        self.state = LinkState::AwaitingAck(kind);
        log::debug!("Sending {} command (seq {})", kind, seq);

        if let Err(e) = self.send(&Frame::Command { seq, command }) {
            let reason = e.to_string();
            self.transport_failure(&reason, now);
            return Err(TelemetryError::LinkTransport(reason));
        }
        Ok(())
    }

    fn on_ack(&mut self, seq: u8, kind: CommandKind, status: u8, arg: u8, now: Instant) {
        if kind == CommandKind::Ping && self.heartbeat == Some(seq) {
            self.heartbeat = None;
            log::debug!("Heartbeat acknowledged (seq {})", seq);
            return;
        }

        let matches = self
            .pending
            .as_ref()
            .map_or(false, |p| p.seq == seq && p.command.kind() == kind);
        if !matches {
            log::debug!("Ignoring stale {} ack (seq {})", kind, seq);
            return;
        }
        if status != ACK_OK {
            self.fail_pending(format!("rejected by node (status {})", status), now);
            return;
        }

        let Some(pending) = self.pending.take() else {
            return;
        };
        self.state = LinkState::Connected;
        self.consecutive_failures = 0;

        match pending.command {
            Command::SetScale(requested) => {
                let applied = ScaleSetting::from_wire(arg).unwrap_or(requested);
                self.scale = applied;
                self.scale_confirmed = true;
                self.events.push(LinkEvent::ScaleChanged(applied));
            }
            Command::Calibrate => self.events.push(LinkEvent::CalibrationComplete),
            Command::Ping => {
                let round_trip = now.saturating_duration_since(pending.first_sent);
                self.events.push(LinkEvent::PingReply { round_trip });
            }
            Command::SetStreaming(enabled) => {
                if !(enabled && self.stop_deferred) {
                    self.set_streaming_local(enabled);
                }
            }
        }
        log::debug!("{} acknowledged (seq {})", kind, seq);
        self.events.push(LinkEvent::CommandAcknowledged(kind));
        self.send_deferred_stop(now);
    }

    fn check_pending(&mut self, now: Instant) {
        let (seq, command, resends_left) = match &self.pending {
            Some(p) if now >= p.deadline => (p.seq, p.command, p.resends_left),
            _ => return,
        };

        if resends_left > 0 {
            if let Some(p) = self.pending.as_mut() {
                p.resends_left -= 1;
                p.deadline = now + self.config.ack_timeout();
            }
            log::debug!("Resending {} command (seq {})", command.kind(), seq);
            if let Err(e) = self.send(&Frame::Command { seq, command }) {
                self.transport_failure(&e.to_string(), now);
            }
            return;
        }

        let reason = TelemetryError::ProtocolTimeout(command.kind()).to_string();
        self.fail_pending(reason, now);
    }

    fn revert(&mut self, pending: &PendingCommand) {
        if let Some(previous) = pending.previous_scale {
            if previous != self.scale {
                self.scale = previous;
                self.events.push(LinkEvent::ScaleChanged(previous));
            }
        }
    }

    fn fail_pending(&mut self, reason: String, now: Instant) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        let kind = pending.command.kind();
        self.revert(&pending);
        self.state = LinkState::Connected;
        log::warn!("{} command failed: {}", kind, reason);
        self.events.push(LinkEvent::CommandFailed { kind, reason });

        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.config.command_failure_threshold {
            let reason = format!("{} consecutive command failures", self.consecutive_failures);
            self.transport_failure(&reason, now);
        }
        self.send_deferred_stop(now);
    }

    fn send_deferred_stop(&mut self, now: Instant) {
        if !self.stop_deferred || self.state != LinkState::Connected {
            return;
        }
        self.stop_deferred = false;
        log::debug!("Sending queued stop streaming");
        if let Err(e) = self.issue(Command::SetStreaming(false), now) {
            log::warn!("Queued stop streaming not sent: {}", e);
        }
    }

    fn cancel_pending(&mut self, reason: &str) {
        if let Some(pending) = self.pending.take() {
            let kind = pending.command.kind();
            self.revert(&pending);
            self.events.push(LinkEvent::CommandFailed { kind, reason: reason.to_string() });
        }
    }

    fn maybe_heartbeat(&mut self, now: Instant) {
        let quiet_since = match self.last_heartbeat {
            Some(sent) if sent > self.last_rx => sent,
            _ => self.last_rx,
        };
        if now.saturating_duration_since(quiet_since) < self.config.heartbeat_interval() {
            return;
        }
        let seq = self.next_seq();
        self.heartbeat = Some(seq);
        self.last_heartbeat = Some(now);
        log::debug!("Sending heartbeat (seq {})", seq);
        if let Err(e) = self.send(&Frame::Command { seq, command: Command::Ping }) {
            self.transport_failure(&e.to_string(), now);
        }
    }

    fn transport_failure(&mut self, reason: &str, now: Instant) {
        match self.state {
            LinkState::Disconnected => return,
            LinkState::Reconnecting => {
                log::warn!("Reconnect attempt failed: {}", reason);
                self.handshake = None;
                self.attempt_failed(now);
                return;
            }
            LinkState::Connecting => {
                log::warn!("Connection failed: {}", reason);
                self.status(false, format!("Connection failed: {}; reconnecting", reason));
            }
            LinkState::Connected | LinkState::AwaitingAck(_) => {
                log::warn!("Connection lost: {}", reason);
                self.status(false, format!("Connection lost: {}; reconnecting", reason));
            }
        }

        self.cancel_pending("link lost");
        self.reset_session();
        self.state = LinkState::Reconnecting;
        self.next_attempt = Some(now + self.config.backoff(0));
    }

    fn attempt_failed(&mut self, now: Instant) {
        self.failed_attempts += 1;
        if self.failed_attempts >= self.config.max_reconnect_attempts {
            self.state = LinkState::Disconnected;
            self.next_attempt = None;
            let attempts = self.failed_attempts;
            self.failed_attempts = 0;
            self.status(false, format!("Disconnected: no response after {} attempts", attempts));
        } else {
            let delay = self.config.backoff(self.failed_attempts);
            log::debug!("Next reconnect attempt in {} ms", delay.as_millis());
            self.next_attempt = Some(now + delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::ChannelLink;

    const WAIT: Duration = Duration::from_millis(10);

    fn quiet_config() -> LinkConfig {
        LinkConfig {
            heartbeat_interval_ms: 60_000,
            liveness_timeout_ms: 120_000,
            ..LinkConfig::default()
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    /// Frames the host sent, oldest first
    fn sent(node: &mut ChannelLink) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(bytes) = node.receive(WAIT).unwrap() {
            frames.push(Frame::decode(&bytes).unwrap());
        }
        frames
    }

    fn connected(config: LinkConfig) -> (SensorLink<ChannelLink>, ChannelLink, Instant) {
        let (host, mut node) = ChannelLink::pair();
        let mut link = SensorLink::new(host, config).unwrap();
        let t0 = Instant::now();
        link.connect(t0);

        let hello = sent(&mut node).pop().unwrap();
        let reply = Frame::HelloAck { seq: hello.seq(), scale: ScaleSetting::TwoG, streaming: true };
        link.on_frame(&reply.encode(), t0);
        assert_eq!(link.state(), LinkState::Connected);
        link.drain_events();
        (link, node, t0)
    }

    fn telemetry(seq: u8) -> Vec<u8> {
        Frame::telemetry(seq, 100, ScaleSetting::TwoG, [0.0, 0.0, 1.0]).encode()
    }

    #[test]
    fn test_handshake_connects() {
        let (host, mut node) = ChannelLink::pair();
        let mut link = SensorLink::new(host, quiet_config()).unwrap();
        let t0 = Instant::now();
        link.connect(t0);
        assert_eq!(link.state(), LinkState::Connecting);

        let hello = sent(&mut node).pop().unwrap();
        assert!(matches!(hello, Frame::Hello { .. }));
        let reply = Frame::HelloAck { seq: hello.seq(), scale: ScaleSetting::SixG, streaming: false };
        link.on_frame(&reply.encode(), t0);

        assert_eq!(link.state(), LinkState::Connected);
        assert_eq!(link.scale(), ScaleSetting::SixG);
        assert!(link.scale_confirmed());
        assert!(!link.is_streaming());
        assert_eq!(
            link.drain_events(),
            vec![LinkEvent::Status { connected: true, message: "Connected (6G scale)".to_string() }]
        );
    }

    #[test]
    fn test_connect_is_noop_when_connected() {
        let (mut link, mut node, t0) = connected(quiet_config());
        link.connect(t0);
        assert_eq!(link.state(), LinkState::Connected);
        assert!(sent(&mut node).is_empty());
    }

    #[test]
    fn test_set_scale_rejected_while_disconnected() {
        let (host, _node) = ChannelLink::pair();
        let mut link = SensorLink::new(host, quiet_config()).unwrap();
        let err = link.set_scale(ScaleSetting::SixG, Instant::now()).unwrap_err();
        assert!(matches!(
            err,
            TelemetryError::InvalidState { command: CommandKind::SetScale, state: LinkState::Disconnected }
        ));
        assert_eq!(link.scale(), ScaleSetting::TwoG);
    }

    #[test]
    fn test_set_scale_acknowledged() {
        let (mut link, mut node, t0) = connected(quiet_config());
        link.set_scale(ScaleSetting::SixG, t0).unwrap();
        assert_eq!(link.scale(), ScaleSetting::SixG);
        assert_eq!(link.state(), LinkState::AwaitingAck(CommandKind::SetScale));

        let cmd = sent(&mut node).pop().unwrap();
        let ack = Frame::Ack { seq: cmd.seq(), command: CommandKind::SetScale, status: ACK_OK, arg: 6 };
        link.on_frame(&ack.encode(), t0 + ms(20));

        assert_eq!(link.state(), LinkState::Connected);
        assert_eq!(
            link.drain_events(),
            vec![
                LinkEvent::ScaleChanged(ScaleSetting::SixG),
                LinkEvent::CommandAcknowledged(CommandKind::SetScale),
            ]
        );
    }

    #[test]
    fn test_set_scale_timeout_reverts_without_status_change() {
        let (mut link, mut node, t0) = connected(quiet_config());
        link.set_scale(ScaleSetting::SixG, t0).unwrap();

        // Two resends, then failure
        link.poll(t0 + ms(500));
        link.poll(t0 + ms(1000));
        assert_eq!(link.scale(), ScaleSetting::SixG);
        link.poll(t0 + ms(1500));

        assert_eq!(sent(&mut node).len(), 3);
        assert_eq!(link.scale(), ScaleSetting::TwoG);
        assert_eq!(link.state(), LinkState::Connected);

        let events = link.drain_events();
        assert!(events.iter().all(|e| !matches!(e, LinkEvent::Status { .. })));
        assert!(events.contains(&LinkEvent::CommandFailed {
            kind: CommandKind::SetScale,
            reason: TelemetryError::ProtocolTimeout(CommandKind::SetScale).to_string(),
        }));
    }

    #[test]
    fn test_repeated_command_failures_escalate() {
        let config = LinkConfig { command_retries: 0, command_failure_threshold: 2, ..quiet_config() };
        let (mut link, _node, t0) = connected(config);

        link.ping(t0).unwrap();
        link.poll(t0 + ms(500));
        assert_eq!(link.state(), LinkState::Connected);

        link.ping(t0 + ms(600)).unwrap();
        link.poll(t0 + ms(1100));
        assert_eq!(link.state(), LinkState::Reconnecting);
        assert!(!link.scale_confirmed());
    }

    #[test]
    fn test_command_in_flight_rejected() {
        let (mut link, _node, t0) = connected(quiet_config());
        link.calibrate(t0).unwrap();
        assert!(matches!(
            link.ping(t0),
            Err(TelemetryError::CommandInFlight(CommandKind::Calibrate))
        ));
    }

    #[test]
    fn test_stale_ack_ignored() {
        let (mut link, mut node, t0) = connected(quiet_config());
        link.calibrate(t0).unwrap();
        let cmd = sent(&mut node).pop().unwrap();

        let stale = Frame::Ack {
            seq: cmd.seq().wrapping_sub(1),
            command: CommandKind::Calibrate,
            status: ACK_OK,
            arg: 0,
        };
        link.on_frame(&stale.encode(), t0);
        assert_eq!(link.state(), LinkState::AwaitingAck(CommandKind::Calibrate));

        let ack = Frame::Ack { seq: cmd.seq(), command: CommandKind::Calibrate, status: ACK_OK, arg: 0 };
        link.on_frame(&ack.encode(), t0);
        assert!(link.drain_events().contains(&LinkEvent::CalibrationComplete));
    }

    #[test]
    fn test_nack_reported_as_failure() {
        let (mut link, mut node, t0) = connected(quiet_config());
        link.set_scale(ScaleSetting::SixG, t0).unwrap();
        let cmd = sent(&mut node).pop().unwrap();
        let nack = Frame::Ack { seq: cmd.seq(), command: CommandKind::SetScale, status: 1, arg: 0 };
        link.on_frame(&nack.encode(), t0);

        assert_eq!(link.scale(), ScaleSetting::TwoG);
        assert!(link
            .drain_events()
            .iter()
            .any(|e| matches!(e, LinkEvent::CommandFailed { kind: CommandKind::SetScale, .. })));
    }

    #[test]
    fn test_malformed_frames_threshold() {
        let config = LinkConfig { malformed_frame_threshold: 3, ..quiet_config() };
        let (mut link, _node, t0) = connected(config);

        link.on_frame(&[0x00, 0x01, 0x02], t0);
        link.on_frame(&[0xA5, 0x20, 0x00, 0x00, 0x00], t0);
        assert_eq!(link.state(), LinkState::Connected);

        // A valid frame resets the streak
        link.on_frame(&telemetry(1), t0);
        link.on_frame(&[0xFF], t0);
        link.on_frame(&[0xFF], t0);
        assert_eq!(link.state(), LinkState::Connected);

        link.on_frame(&[0xFF], t0);
        assert_eq!(link.state(), LinkState::Reconnecting);
        assert_eq!(link.malformed_frames(), 5);
    }

    #[test]
    fn test_telemetry_discarded_when_not_streaming() {
        let (mut link, mut node, t0) = connected(quiet_config());
        assert!(link.on_frame(&telemetry(1), t0).is_some());

        link.set_streaming(false, t0).unwrap();
        assert!(!link.is_streaming());
        assert!(link.on_frame(&telemetry(2), t0).is_none());
        assert_eq!(link.discarded_telemetry(), 1);

        let cmd = sent(&mut node).pop().unwrap();
        assert!(matches!(cmd, Frame::Command { command: Command::SetStreaming(false), .. }));
    }

    #[test]
    fn test_set_streaming_same_value_is_noop() {
        let (mut link, mut node, t0) = connected(quiet_config());
        assert!(link.is_streaming());
        link.set_streaming(true, t0).unwrap();
        assert_eq!(link.state(), LinkState::Connected);
        assert!(sent(&mut node).is_empty());
    }

    #[test]
    fn test_liveness_loss_and_give_up() {
        let config = LinkConfig {
            handshake_timeout_ms: 100,
            heartbeat_interval_ms: 100,
            liveness_timeout_ms: 300,
            reconnect_initial_backoff_ms: 50,
            reconnect_max_backoff_ms: 200,
            max_reconnect_attempts: 2,
            ..LinkConfig::default()
        };
        let (mut link, mut node, t0) = connected(config);

        link.poll(t0 + ms(150));
        assert!(matches!(sent(&mut node).pop(), Some(Frame::Command { command: Command::Ping, .. })));

        link.poll(t0 + ms(300));
        assert_eq!(link.state(), LinkState::Reconnecting);

        // attempt 1 at +350, times out at +450; attempt 2 at +550, times out at +650
        link.poll(t0 + ms(350));
        assert!(matches!(sent(&mut node).pop(), Some(Frame::Hello { .. })));
        link.poll(t0 + ms(450));
        assert_eq!(link.state(), LinkState::Reconnecting);
        link.poll(t0 + ms(550));
        link.poll(t0 + ms(650));
        assert_eq!(link.state(), LinkState::Disconnected);

        let statuses: Vec<_> = link
            .drain_events()
            .into_iter()
            .filter_map(|e| match e {
                LinkEvent::Status { message, .. } => Some(message),
                _ => None,
            })
            .collect();
        assert_eq!(statuses.len(), 2);
        assert!(statuses[0].starts_with("Connection lost: no frame"));
        assert_eq!(statuses[1], "Disconnected: no response after 2 attempts");
    }

    #[test]
    fn test_reconnect_cancels_pending_scale() {
        let (mut link, mut node, t0) = connected(quiet_config());
        link.set_scale(ScaleSetting::SixG, t0).unwrap();
        link.reconnect(t0);

        assert_eq!(link.state(), LinkState::Connecting);
        assert_eq!(link.scale(), ScaleSetting::TwoG);
        assert!(!link.scale_confirmed());
        assert!(matches!(sent(&mut node).pop(), Some(Frame::Hello { .. })));
    }

    #[test]
    fn test_malformed_frames_while_reconnecting_keep_attempts() {
        let config = LinkConfig { malformed_frame_threshold: 3, max_reconnect_attempts: 5, ..quiet_config() };
        let (mut link, mut node, t0) = connected(config);
        for _ in 0..3 {
            link.on_frame(&[0xFF], t0);
        }
        assert_eq!(link.state(), LinkState::Reconnecting);

        for _ in 0..7 {
            link.on_frame(&[0xFF], t0);
        }
        assert_eq!(link.state(), LinkState::Reconnecting);
        assert_eq!(link.malformed_frames(), 10);
        assert!(!link.drain_events().iter().any(|e| matches!(
            e,
            LinkEvent::Status { message, .. } if message.contains("no response after")
        )));

        let retry_at = t0 + link.config().backoff(0);
        link.poll(retry_at);
        assert!(matches!(sent(&mut node).pop(), Some(Frame::Hello { .. })));
    }

    #[test]
    fn test_stop_streaming_while_command_in_flight() {
        let (mut link, mut node, t0) = connected(quiet_config());
        link.calibrate(t0).unwrap();
        let calibrate = sent(&mut node).pop().unwrap();

        link.set_streaming(false, t0).unwrap();
        assert!(!link.is_streaming());
        assert!(link.on_frame(&telemetry(1), t0).is_none());
        assert_eq!(link.discarded_telemetry(), 1);
        assert!(sent(&mut node).is_empty());
        assert_eq!(link.state(), LinkState::AwaitingAck(CommandKind::Calibrate));

        let ack = Frame::Ack { seq: calibrate.seq(), command: CommandKind::Calibrate, status: ACK_OK, arg: 0 };
        link.on_frame(&ack.encode(), t0 + ms(10));
        assert!(matches!(
            sent(&mut node).pop(),
            Some(Frame::Command { command: Command::SetStreaming(false), .. })
        ));
        assert_eq!(link.state(), LinkState::AwaitingAck(CommandKind::SetStreaming));
    }

    #[test]
    fn test_stop_streaming_sent_after_failed_command() {
        let config = LinkConfig { command_retries: 0, ..quiet_config() };
        let (mut link, mut node, t0) = connected(config);
        link.ping(t0).unwrap();
        link.set_streaming(false, t0).unwrap();
        assert_eq!(sent(&mut node).len(), 1);

        let deadline = t0 + link.config().ack_timeout();
        link.poll(deadline);
        assert!(matches!(
            sent(&mut node).pop(),
            Some(Frame::Command { command: Command::SetStreaming(false), .. })
        ));
        assert!(!link.is_streaming());
    }

    #[test]
    fn test_stop_overrides_pending_start() {
        let (mut link, mut node, t0) = connected(quiet_config());
        link.set_streaming(false, t0).unwrap();
        let stop = sent(&mut node).pop().unwrap();
        let ack = Frame::Ack { seq: stop.seq(), command: CommandKind::SetStreaming, status: ACK_OK, arg: 0 };
        link.on_frame(&ack.encode(), t0);

        link.set_streaming(true, t0).unwrap();
        let start = sent(&mut node).pop().unwrap();
        link.set_streaming(false, t0).unwrap();

        let ack = Frame::Ack { seq: start.seq(), command: CommandKind::SetStreaming, status: ACK_OK, arg: 1 };
        link.on_frame(&ack.encode(), t0 + ms(10));
        assert!(!link.is_streaming());
        assert!(matches!(
            sent(&mut node).pop(),
            Some(Frame::Command { command: Command::SetStreaming(false), .. })
        ));
    }

    #[test]
    fn test_reconnect_cancels_backoff_wait() {
        let config = LinkConfig {
            malformed_frame_threshold: 1,
            handshake_timeout_ms: 1000,
            reconnect_initial_backoff_ms: 100,
            ..quiet_config()
        };
        let (mut link, mut node, t0) = connected(config);
        link.on_frame(&[0xFF], t0);
        assert_eq!(link.state(), LinkState::Reconnecting);

        link.reconnect(t0 + ms(10));
        assert_eq!(link.state(), LinkState::Connecting);
        // The abandoned retry deadline passes without a second hello
        link.poll(t0 + ms(100));
        link.poll(t0 + ms(150));
        let hellos = sent(&mut node);
        assert_eq!(hellos.len(), 1);
        assert!(matches!(hellos[0], Frame::Hello { .. }));

        let reply = Frame::HelloAck { seq: hellos[0].seq(), scale: ScaleSetting::TwoG, streaming: true };
        link.on_frame(&reply.encode(), t0 + ms(160));
        assert_eq!(link.state(), LinkState::Connected);
    }

    #[test]
    fn test_closed_link_drops_session() {
        let (mut link, node, _t0) = connected(quiet_config());
        node.close();
        link.pump(WAIT);

        assert_eq!(link.state(), LinkState::Reconnecting);
        assert!(link.drain_events().contains(&LinkEvent::Status {
            connected: false,
            message: "Connection lost: link closed; reconnecting".to_string(),
        }));
        assert!(matches!(link.ping(Instant::now()), Err(TelemetryError::InvalidState { .. })));
    }

    #[test]
    fn test_backoff_is_bounded() {
        let config = LinkConfig {
            reconnect_initial_backoff_ms: 100,
            reconnect_max_backoff_ms: 1000,
            ..LinkConfig::default()
        };
        assert_eq!(config.backoff(0), ms(100));
        assert_eq!(config.backoff(3), ms(800));
        assert_eq!(config.backoff(4), ms(1000));
        assert_eq!(config.backoff(80), ms(1000));
    }

    #[test]
    fn test_config_validation() {
        assert!(LinkConfig::default().validate().is_ok());
        let bad = LinkConfig { liveness_timeout_ms: 500, heartbeat_interval_ms: 1000, ..LinkConfig::default() };
        assert!(matches!(bad.validate(), Err(TelemetryError::InvalidConfig(_))));
    }
}
