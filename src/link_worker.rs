//! Background thread that owns a [`SensorLink`] and serializes access to it

use crossbeam_channel::{Receiver, Sender};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::error::{Result, TelemetryError};
use crate::link::Link;
use crate::sample::ScaleSetting;
use crate::sensor_link::{LinkConfig, LinkEvent, LinkSnapshot, SensorLink};

#[derive(Debug, Clone, Copy)]
enum LinkRequest {
    Connect,
    Reconnect,
    Disconnect,
    SetScale(ScaleSetting),
    Calibrate,
    Ping,
    SetStreaming(bool),
}

type Envelope = (LinkRequest, Sender<Result<()>>);

/// Handle to the link worker thread
///
/// Every operation is validated by the worker and answered synchronously; the
/// protocol outcome arrives later as a [`LinkEvent`] through the sink given to
/// [`LinkHandle::spawn`]. The thread is stopped and joined on drop.
pub struct LinkHandle {
    requests: Sender<Envelope>,
    snapshot: Arc<RwLock<LinkSnapshot>>,
    stop_signal: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl LinkHandle {
    /// Start a worker driving `link`; `sink` receives every event on the worker thread
    pub fn spawn<L, F>(link: L, config: LinkConfig, sink: F) -> Result<Self>
    where
        L: Link + 'static,
        F: FnMut(LinkEvent) + Send + 'static,
    {
        let sensor_link = SensorLink::new(link, config)?;
        let (tx, rx) = crossbeam_channel::unbounded::<Envelope>();
        let snapshot = Arc::new(RwLock::new(sensor_link.snapshot()));
        let stop_signal = Arc::new(AtomicBool::new(false));

        let snapshot_clone = Arc::clone(&snapshot);
        let stop_clone = Arc::clone(&stop_signal);
        let thread = thread::Builder::new()
            .name("sensor-link".to_string())
            .spawn(move || run_link_worker(sensor_link, rx, snapshot_clone, stop_clone, sink))?;

        Ok(Self { requests: tx, snapshot, stop_signal, thread: Some(thread) })
    }

    pub fn connect(&self) -> Result<()> {
        self.request(LinkRequest::Connect)
    }

    pub fn reconnect(&self) -> Result<()> {
        self.request(LinkRequest::Reconnect)
    }

    pub fn disconnect(&self) -> Result<()> {
        self.request(LinkRequest::Disconnect)
    }

    pub fn set_scale(&self, scale: ScaleSetting) -> Result<()> {
        self.request(LinkRequest::SetScale(scale))
    }

    pub fn calibrate(&self) -> Result<()> {
        self.request(LinkRequest::Calibrate)
    }

    pub fn ping(&self) -> Result<()> {
        self.request(LinkRequest::Ping)
    }

    pub fn set_streaming(&self, enabled: bool) -> Result<()> {
        self.request(LinkRequest::SetStreaming(enabled))
    }

    /// State of the link as of the last worker iteration
    pub fn snapshot(&self) -> LinkSnapshot {
        self.snapshot.read().clone()
    }

    /// Signal the worker to stop
    pub fn stop(&self) {
        self.stop_signal.store(true, Ordering::SeqCst);
    }

    /// Check if the worker is still running
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    fn request(&self, request: LinkRequest) -> Result<()> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.requests
            .send((request, reply_tx))
            .map_err(|_| TelemetryError::WorkerStopped)?;
        reply_rx.recv().map_err(|_| TelemetryError::WorkerStopped)?
    }
}

impl Drop for LinkHandle {
    fn drop(&mut self) {
        self.stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Link worker panicked");
            }
        }
    }
}

fn apply<L: Link>(link: &mut SensorLink<L>, request: LinkRequest) -> Result<()> {
    let now = Instant::now();
    match request {
        LinkRequest::Connect => {
            link.connect(now);
            Ok(())
        }
        LinkRequest::Reconnect => {
            link.reconnect(now);
            Ok(())
        }
        LinkRequest::Disconnect => {
            link.disconnect();
            Ok(())
        }
        LinkRequest::SetScale(scale) => link.set_scale(scale, now),
        LinkRequest::Calibrate => link.calibrate(now),
        LinkRequest::Ping => link.ping(now),
        LinkRequest::SetStreaming(enabled) => link.set_streaming(enabled, now),
    }
}

/// Worker main loop: commands, one frame, deadlines, events
fn run_link_worker<L, F>(
    mut link: SensorLink<L>,
    requests: Receiver<Envelope>,
    snapshot: Arc<RwLock<LinkSnapshot>>,
    stop_signal: Arc<AtomicBool>,
    mut sink: F,
) where
    L: Link,
    F: FnMut(LinkEvent),
{
    log::info!("Link worker started");
    let poll_interval = link.config().poll_interval();

    while !stop_signal.load(Ordering::Relaxed) {
        while let Ok((request, reply)) = requests.try_recv() {
            let result = apply(&mut link, request);
            *snapshot.write() = link.snapshot();
            // Caller may have given up waiting
            let _ = reply.send(result);
        }
        for event in link.drain_events() {
            sink(event);
        }

        link.pump(poll_interval);

        *snapshot.write() = link.snapshot();
        for event in link.drain_events() {
            sink(event);
        }
    }

    link.disconnect();
    *snapshot.write() = link.snapshot();
    for event in link.drain_events() {
        sink(event);
    }
    log::info!("Link worker stopped");
}
