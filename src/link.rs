//! Transport abstraction consumed by [`SensorLink`](crate::sensor_link::SensorLink)
//!
//! A link moves whole frames. Order is preserved but frames may be lost.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, TelemetryError};

/// Largest datagram accepted from the base station
const MAX_DATAGRAM_LEN: usize = 512;

/// Bidirectional frame transport
pub trait Link: Send {
    /// Send one encoded frame
    fn send(&mut self, frame: &[u8]) -> Result<()>;

    /// Wait up to `timeout` for one frame; `Ok(None)` if none arrived
    fn receive(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>>;

    /// Whether the transport can still carry frames
    fn is_open(&self) -> bool;
}

/// In-process link backed by a pair of crossbeam channels
///
/// Closing either end closes both.
pub struct ChannelLink {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    closed: Arc<AtomicBool>,
}

impl ChannelLink {
    /// Create two connected ends: `(host, node)`
    pub fn pair() -> (ChannelLink, ChannelLink) {
        let (host_tx, node_rx) = crossbeam_channel::unbounded();
        let (node_tx, host_rx) = crossbeam_channel::unbounded();
        let closed = Arc::new(AtomicBool::new(false));

        let host = ChannelLink { tx: host_tx, rx: host_rx, closed: Arc::clone(&closed) };
        let node = ChannelLink { tx: node_tx, rx: node_rx, closed };
        (host, node)
    }

    /// Close both ends
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl Link for ChannelLink {
    fn send(&mut self, frame: &[u8]) -> Result<()> {
        if !self.is_open() {
            return Err(TelemetryError::LinkTransport("channel closed".to_string()));
        }
        self.tx
            .send(frame.to_vec())
            .map_err(|_| TelemetryError::LinkTransport("peer dropped".to_string()))
    }

    fn receive(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        if !self.is_open() {
            return Err(TelemetryError::LinkTransport("channel closed".to_string()));
        }
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(TelemetryError::LinkTransport("peer dropped".to_string()))
            }
        }
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }
}

/// Link to a radio base station that bridges frames over UDP datagrams
///
/// One datagram carries exactly one frame.
pub struct UdpLink {
    socket: UdpSocket,
    peer: SocketAddr,
    buffer: Vec<u8>,
    open: bool,
}

impl UdpLink {
    /// Bind `bind_addr` and exchange datagrams with `peer`
    pub fn bind(bind_addr: &str, peer: SocketAddr) -> Result<Self> {
        log::info!("Binding UDP link on {} (peer {})", bind_addr, peer);

        let socket = UdpSocket::bind(bind_addr)
            .map_err(|e| TelemetryError::LinkTransport(format!("UDP bind failed: {}", e)))?;
        socket
            .connect(peer)
            .map_err(|e| TelemetryError::LinkTransport(format!("UDP connect failed: {}", e)))?;

        Ok(Self { socket, peer, buffer: vec![0u8; MAX_DATAGRAM_LEN], open: true })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl Link for UdpLink {
    fn send(&mut self, frame: &[u8]) -> Result<()> {
        self.socket.send(frame).map_err(|e| {
            self.open = false;
            TelemetryError::LinkTransport(format!("UDP send failed: {}", e))
        })?;
        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        // A zero read timeout is rejected by the OS
        let timeout = timeout.max(Duration::from_millis(1));
        self.socket
            .set_read_timeout(Some(timeout))
            .map_err(|e| TelemetryError::LinkTransport(format!("UDP configure failed: {}", e)))?;

        match self.socket.recv(&mut self.buffer) {
            Ok(len) => {
                self.open = true;
                Ok(Some(self.buffer[..len].to_vec()))
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                Ok(None)
            }
            Err(e) => {
                self.open = false;
                Err(TelemetryError::LinkTransport(format!("UDP receive failed: {}", e)))
            }
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_pair_delivers_in_order() {
        let (mut host, mut node) = ChannelLink::pair();
        host.send(&[1, 2]).unwrap();
        host.send(&[3]).unwrap();

        let timeout = Duration::from_millis(10);
        assert_eq!(node.receive(timeout).unwrap(), Some(vec![1, 2]));
        assert_eq!(node.receive(timeout).unwrap(), Some(vec![3]));
        assert_eq!(node.receive(timeout).unwrap(), None);
    }

    #[test]
    fn test_channel_close_affects_both_ends() {
        let (mut host, node) = ChannelLink::pair();
        node.close();
        assert!(!host.is_open());
        assert!(host.send(&[0]).is_err());
        assert!(host.receive(Duration::from_millis(1)).is_err());
    }

    #[test]
    fn test_channel_dropped_peer_is_transport_error() {
        let (mut host, node) = ChannelLink::pair();
        drop(node);
        assert!(matches!(
            host.receive(Duration::from_millis(1)),
            Err(TelemetryError::LinkTransport(_))
        ));
    }

    #[test]
    fn test_udp_link_exchanges_datagrams() {
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        let peer_addr = peer.local_addr().unwrap();

        let mut link = UdpLink::bind("127.0.0.1:0", peer_addr).unwrap();
        link.send(&[0xA5, 1]).unwrap();

        let mut buf = [0u8; 16];
        let (len, from) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], &[0xA5, 1]);

        peer.send_to(&[9, 9, 9], from).unwrap();
        let frame = link.receive(Duration::from_millis(500)).unwrap();
        assert_eq!(frame, Some(vec![9, 9, 9]));
        assert_eq!(link.receive(Duration::from_millis(5)).unwrap(), None);
    }
}
