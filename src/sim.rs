//! In-process emulation of the remote sensor node
//!
//! Answers handshakes and commands and streams synthetic telemetry at a fixed
//! rate. Faults (silence, lost acks) can be switched on at runtime.

use parking_lot::Mutex;
use std::f64::consts::PI;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::common::TimeKeeper;
use crate::link::Link;
use crate::protocol::{Command, Frame, ACK_OK};
use crate::sample::{Axis, ScaleSetting};

const SHAKE_AMPLITUDE_G: f64 = 1.5;
const SHAKE_FREQUENCY_HZ: f64 = 2.0;
const MAX_RECEIVE_WAIT: Duration = Duration::from_millis(5);

/// Synthetic motion produced by the node
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Motion {
    /// 1 g on +Z only
    Rest,
    /// Sinusoidal shake along one axis on top of gravity
    Shake(Axis),
    /// Constant extra acceleration (in g) along one axis
    Hold(Axis, f64),
}

impl Motion {
    fn accel_at(self, t: f64) -> [f64; 3] {
        let mut accel = [0.0, 0.0, 1.0];
        match self {
            Motion::Rest => {}
            Motion::Shake(axis) => {
                accel[axis.index()] += SHAKE_AMPLITUDE_G * (2.0 * PI * SHAKE_FREQUENCY_HZ * t).sin();
            }
            Motion::Hold(axis, g) => accel[axis.index()] += g,
        }
        accel
    }
}

/// Initial node settings
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub scale: ScaleSetting,
    pub streaming: bool,
    pub sample_rate_hz: u32,
    pub motion: Motion,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            scale: ScaleSetting::TwoG,
            streaming: true,
            sample_rate_hz: 100,
            motion: Motion::Rest,
        }
    }
}

struct NodeShared {
    stop: AtomicBool,
    silent: AtomicBool,
    drop_acks: AtomicBool,
    motion: Mutex<Motion>,
    calibrations: AtomicU32,
}

/// Handle to a simulated node thread; stopped and joined on drop
pub struct SimulatedNode {
    shared: Arc<NodeShared>,
    thread: Option<JoinHandle<()>>,
}

impl SimulatedNode {
    /// Start the node on its end of a link
    pub fn spawn<L: Link + 'static>(link: L, config: NodeConfig) -> Self {
        let shared = Arc::new(NodeShared {
            stop: AtomicBool::new(false),
            silent: AtomicBool::new(false),
            drop_acks: AtomicBool::new(false),
            motion: Mutex::new(config.motion),
            calibrations: AtomicU32::new(0),
        });
        let shared_clone = Arc::clone(&shared);
        let thread = thread::spawn(move || run_node(link, config, shared_clone));
        Self { shared, thread: Some(thread) }
    }

    /// Stop answering anything, including handshakes, and stop streaming
    pub fn set_silent(&self, silent: bool) {
        self.shared.silent.store(silent, Ordering::SeqCst);
    }

    /// Apply commands but never acknowledge them
    pub fn set_drop_acks(&self, drop_acks: bool) {
        self.shared.drop_acks.store(drop_acks, Ordering::SeqCst);
    }

    pub fn set_motion(&self, motion: Motion) {
        *self.shared.motion.lock() = motion;
    }

    /// Number of calibrate commands received
    pub fn calibrations(&self) -> u32 {
        self.shared.calibrations.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
    }
}

impl Drop for SimulatedNode {
    fn drop(&mut self) {
        self.stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct NodeState {
    scale: ScaleSetting,
    streaming: bool,
    seq: u8,
}

fn run_node<L: Link>(mut link: L, config: NodeConfig, shared: Arc<NodeShared>) {
    let clock = TimeKeeper::new();
    let interval = Duration::from_micros(1_000_000 / config.sample_rate_hz.max(1) as u64);
    let mut state = NodeState { scale: config.scale, streaming: config.streaming, seq: 0 };
    let mut next_sample_time = Instant::now();

    while !shared.stop.load(Ordering::Relaxed) {
        let wait = next_sample_time
            .saturating_duration_since(Instant::now())
            .min(MAX_RECEIVE_WAIT);
        match link.receive(wait) {
            Ok(Some(bytes)) => {
                if !shared.silent.load(Ordering::Relaxed) {
                    if let Some(reply) = answer(&bytes, &mut state, &shared) {
                        if link.send(&reply.encode()).is_err() {
                            break;
                        }
                    }
                }
            }
            Ok(None) => {}
            Err(_) => break,
        }

        let now = Instant::now();
        if now < next_sample_time {
            continue;
        }
        next_sample_time += interval;
        if next_sample_time < now {
            // Running behind, don't try to catch up
            next_sample_time = now + interval;
        }

        if state.streaming && !shared.silent.load(Ordering::Relaxed) {
            let t = clock.elapsed_secs();
            let accel = shared.motion.lock().accel_at(t);
            state.seq = state.seq.wrapping_add(1);
            let frame = Frame::telemetry(state.seq, (t * 1000.0) as u32, state.scale, accel);
            if link.send(&frame.encode()).is_err() {
                break;
            }
        }
    }
    log::debug!("Simulated node stopped");
}

fn answer(bytes: &[u8], state: &mut NodeState, shared: &NodeShared) -> Option<Frame> {
    let frame = match Frame::decode(bytes) {
        Ok(frame) => frame,
        Err(e) => {
            log::debug!("Simulated node dropping bad frame: {}", e);
            return None;
        }
    };

    match frame {
        Frame::Hello { seq } => Some(Frame::HelloAck { seq, scale: state.scale, streaming: state.streaming }),
        Frame::Command { seq, command } => {
            let arg = match command {
                Command::SetScale(scale) => {
                    state.scale = scale;
                    scale.to_wire()
                }
                Command::SetStreaming(enabled) => {
                    state.streaming = enabled;
                    u8::from(enabled)
                }
                Command::Calibrate => {
                    shared.calibrations.fetch_add(1, Ordering::SeqCst);
                    0
                }
                Command::Ping => 0,
            };
            if shared.drop_acks.load(Ordering::Relaxed) {
                return None;
            }
            Some(Frame::Ack { seq, command: command.kind(), status: ACK_OK, arg })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::ChannelLink;

    const WAIT: Duration = Duration::from_millis(500);

    fn next_non_telemetry(host: &mut ChannelLink) -> Option<Frame> {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if let Some(bytes) = host.receive(WAIT).unwrap() {
                let frame = Frame::decode(&bytes).unwrap();
                if !matches!(frame, Frame::Telemetry { .. }) {
                    return Some(frame);
                }
            }
        }
        None
    }

    #[test]
    fn test_node_answers_handshake() {
        let (mut host, node_end) = ChannelLink::pair();
        let _node = SimulatedNode::spawn(node_end, NodeConfig { scale: ScaleSetting::SixG, ..NodeConfig::default() });

        host.send(&Frame::Hello { seq: 9 }.encode()).unwrap();
        let reply = next_non_telemetry(&mut host).unwrap();
        assert_eq!(reply, Frame::HelloAck { seq: 9, scale: ScaleSetting::SixG, streaming: true });
    }

    #[test]
    fn test_node_streams_telemetry() {
        let (mut host, node_end) = ChannelLink::pair();
        let _node = SimulatedNode::spawn(node_end, NodeConfig::default());

        let bytes = host.receive(WAIT).unwrap().unwrap();
        let sample = Frame::decode(&bytes).unwrap().to_sample().unwrap();
        assert!((sample.az() - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_node_drops_acks_when_asked() {
        let (mut host, node_end) = ChannelLink::pair();
        let node = SimulatedNode::spawn(node_end, NodeConfig { streaming: false, ..NodeConfig::default() });
        node.set_drop_acks(true);

        host.send(&Frame::Command { seq: 1, command: Command::Calibrate }.encode()).unwrap();
        assert!(host.receive(Duration::from_millis(100)).unwrap().is_none());
        assert_eq!(node.calibrations(), 1);
    }

    #[test]
    fn test_shake_motion_oscillates() {
        let quarter_period = 1.0 / (4.0 * SHAKE_FREQUENCY_HZ);
        let peak = Motion::Shake(Axis::X).accel_at(quarter_period);
        let trough = Motion::Shake(Axis::X).accel_at(3.0 * quarter_period);
        assert!((peak[0] - SHAKE_AMPLITUDE_G).abs() < 1e-9);
        assert!((trough[0] + SHAKE_AMPLITUDE_G).abs() < 1e-9);
        assert_eq!(peak[2], 1.0);
    }
}
