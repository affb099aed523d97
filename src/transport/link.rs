//! In-memory link between two connection workers
//!
//! Every packet is encoded to bytes and decoded again before it reaches the
//! peer, so links exercise the same wire format as a socket would. A
//! [`DropPolicy`] loses packets deterministically to force retransmissions.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use tracing::{debug, trace, warn};

use super::Transport;
use crate::broker::ConnectionHandle;
use crate::codec::{Decoder, Encoder};
use crate::metrics::Metrics;
use crate::protocol::{Packet, ProtocolVersion};
use crate::session::ConnectionId;

/// Which packets a link loses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DropPolicy {
    #[default]
    Never,
    /// Lose the n-th, 2n-th, ... packet written to the link
    EveryNth(usize),
}

impl DropPolicy {
    /// `0` disables dropping
    pub fn every(n: usize) -> Self {
        if n == 0 {
            DropPolicy::Never
        } else {
            DropPolicy::EveryNth(n)
        }
    }

    fn drops(&self, sequence: usize) -> bool {
        match *self {
            DropPolicy::Never => false,
            DropPolicy::EveryNth(n) => sequence % n == 0,
        }
    }
}

/// One direction of a lossy, codec-backed in-memory link
pub struct LinkTransport {
    peer: ConnectionHandle,
    encoder: Encoder,
    decoder: Decoder,
    policy: DropPolicy,
    written: AtomicUsize,
    dropped: AtomicUsize,
    metrics: Option<Arc<Metrics>>,
}

impl LinkTransport {
    pub fn new(peer: ConnectionHandle, version: ProtocolVersion, policy: DropPolicy) -> Self {
        Self {
            peer,
            encoder: Encoder::new(version),
            decoder: Decoder::new(version),
            policy,
            written: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Packets handed to the link so far
    pub fn written(&self) -> usize {
        self.written.load(Ordering::Relaxed)
    }

    /// Packets lost by the drop policy so far
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Transport for LinkTransport {
    fn send(&self, connection: &ConnectionId, packet: Packet) {
        let sequence = self.written.fetch_add(1, Ordering::Relaxed) + 1;

        let mut buf = BytesMut::new();
        if let Err(e) = self.encoder.encode(&packet, &mut buf) {
            warn!("Failed to encode {} for {}: {}", packet.packet_type(), connection, e);
            return;
        }

        if self.policy.drops(sequence) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            if let Some(ref metrics) = self.metrics {
                metrics.link_packets_dropped.inc();
            }
            trace!(
                "Link to {} dropped {} packet_id={:?}",
                self.peer.id(),
                packet.packet_type(),
                packet.packet_id()
            );
            return;
        }

        let decoded = match self.decoder.decode(&buf) {
            Ok(Some((packet, _))) => packet,
            Ok(None) => {
                warn!("Link to {} produced a partial frame", self.peer.id());
                return;
            }
            Err(e) => {
                warn!("Link to {} failed to decode frame: {}", self.peer.id(), e);
                return;
            }
        };

        if let Err(e) = self.peer.packet(decoded) {
            debug!("Link to {} lost a packet: {}", self.peer.id(), e);
        }
    }
}
