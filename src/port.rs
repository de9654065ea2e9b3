//! Presentation port: the one-way interface the core pushes updates through

use crossbeam_channel::{Receiver, Sender};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::matcher::Classification;
use crate::processor::SeriesUpdate;
use crate::protocol::CommandKind;

/// Receiver of processed series and status notifications
///
/// Calls arrive from worker threads and must not block. Every method defaults
/// to a no-op so implementors only override what they display.
pub trait PresentationPort: Send + Sync {
    fn on_sample_batch(&self, _update: &SeriesUpdate) {}

    fn on_connection_status(&self, _connected: bool, _message: &str) {}

    fn on_max_magnitude_update(&self, _value: f64) {}

    fn on_gesture_classified(&self, _result: &Classification) {}

    fn on_command_failed(&self, _kind: CommandKind, _reason: &str) {}

    fn on_ping_reply(&self, _round_trip: Duration) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Set of subscribed ports
#[derive(Default)]
pub struct PortRegistry {
    ports: RwLock<Vec<(SubscriptionId, Arc<dyn PresentationPort>)>>,
    next_id: AtomicU64,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, port: Arc<dyn PresentationPort>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.ports.write().push((id, port));
        id
    }

    /// Returns false if `id` was not subscribed
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut ports = self.ports.write();
        let before = ports.len();
        ports.retain(|(existing, _)| *existing != id);
        ports.len() != before
    }

    pub fn len(&self) -> usize {
        self.ports.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.read().is_empty()
    }

    /// Call `f` on every port; the registry lock is not held during the calls
    pub fn notify<F: Fn(&dyn PresentationPort)>(&self, f: F) {
        let ports: Vec<Arc<dyn PresentationPort>> =
            self.ports.read().iter().map(|(_, port)| Arc::clone(port)).collect();
        for port in &ports {
            f(port.as_ref());
        }
    }
}

/// Owned copy of one port notification
#[derive(Debug, Clone, PartialEq)]
pub enum PortEvent {
    SampleBatch(SeriesUpdate),
    ConnectionStatus { connected: bool, message: String },
    MaxMagnitude(f64),
    GestureClassified(Classification),
    CommandFailed { kind: CommandKind, reason: String },
    PingReply(Duration),
}

/// Port that forwards every notification into a channel
pub struct ChannelPort {
    tx: Sender<PortEvent>,
}

impl ChannelPort {
    pub fn new() -> (Arc<Self>, Receiver<PortEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Arc::new(Self { tx }), rx)
    }

    fn forward(&self, event: PortEvent) {
        // Receiver gone means nobody is listening any more
        let _ = self.tx.send(event);
    }
}

impl PresentationPort for ChannelPort {
    fn on_sample_batch(&self, update: &SeriesUpdate) {
        self.forward(PortEvent::SampleBatch(update.clone()));
    }

    fn on_connection_status(&self, connected: bool, message: &str) {
        self.forward(PortEvent::ConnectionStatus { connected, message: message.to_string() });
    }

    fn on_max_magnitude_update(&self, value: f64) {
        self.forward(PortEvent::MaxMagnitude(value));
    }

    fn on_gesture_classified(&self, result: &Classification) {
        self.forward(PortEvent::GestureClassified(result.clone()));
    }

    fn on_command_failed(&self, kind: CommandKind, reason: &str) {
        self.forward(PortEvent::CommandFailed { kind, reason: reason.to_string() });
    }

    fn on_ping_reply(&self, round_trip: Duration) {
        self.forward(PortEvent::PingReply(round_trip));
    }
}
