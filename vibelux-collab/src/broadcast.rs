//! Fan-out of encoded frames to the peers of one document hub.
//!
//! Each peer gets its own bounded channel. An event is encoded once and the
//! frame (a cheaply cloneable [`Utf8Bytes`]) is handed to every receiver;
//! a peer whose buffer is full misses the frame instead of stalling the hub.
//!
//! The group is owned by a single hub task, so membership needs no lock.
//! Counters are atomics so handles outside the task can read them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite::Utf8Bytes;

use crate::error::Result;
use crate::protocol::CollaborationEvent;

/// Connection-scoped peer id assigned by the server.
pub type PeerId = u64;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

struct Peer {
    user_id: Option<String>,
    tx: mpsc::Sender<Utf8Bytes>,
}

pub struct BroadcastGroup {
    peers: HashMap<PeerId, Peer>,
    /// Frames buffered per peer before it starts missing frames
    capacity: usize,
    stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        Self {
            peers: HashMap::new(),
            capacity: capacity.max(1),
            stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    /// Register a connection; the receiver yields frames addressed to it.
    pub fn add_peer(&mut self, peer_id: PeerId) -> mpsc::Receiver<Utf8Bytes> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.peers.insert(peer_id, Peer { user_id: None, tx });
        rx
    }

    /// Remove a peer, returning the user it identified as (if any).
    pub fn remove_peer(&mut self, peer_id: PeerId) -> Option<String> {
        self.peers.remove(&peer_id).and_then(|p| p.user_id)
    }

    /// Bind a connection to the user id it sends as.
    pub fn identify(&mut self, peer_id: PeerId, user_id: &str) {
        if let Some(peer) = self.peers.get_mut(&peer_id) {
            if peer.user_id.as_deref() != Some(user_id) {
                peer.user_id = Some(user_id.to_string());
            }
        }
    }

    pub fn user_of(&self, peer_id: PeerId) -> Option<&str> {
        self.peers.get(&peer_id).and_then(|p| p.user_id.as_deref())
    }

    /// Whether any connection is currently bound to `user_id`.
    pub fn has_user(&self, user_id: &str) -> bool {
        self.peers
            .values()
            .any(|p| p.user_id.as_deref() == Some(user_id))
    }

    /// Encode once and send to every peer except `except`.
    /// Returns the number of peers that accepted the frame.
    pub fn broadcast(&self, event: &CollaborationEvent, except: Option<PeerId>) -> Result<usize> {
        let frame = Utf8Bytes::from(event.encode()?);
        Ok(self.broadcast_raw(frame, except))
    }

    /// Send a pre-encoded frame to every peer except `except`.
    pub fn broadcast_raw(&self, frame: Utf8Bytes, except: Option<PeerId>) -> usize {
        let mut delivered = 0;
        for (id, peer) in &self.peers {
            if Some(*id) == except {
                continue;
            }
            if self.deliver(*id, peer, frame.clone()) {
                delivered += 1;
            }
        }
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        delivered
    }

    /// Send to a single peer. Returns false when it is unknown or lagging.
    pub fn unicast(&self, peer_id: PeerId, event: &CollaborationEvent) -> Result<bool> {
        let Some(peer) = self.peers.get(&peer_id) else {
            return Ok(false);
        };
        let frame = Utf8Bytes::from(event.encode()?);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(self.deliver(peer_id, peer, frame))
    }

    fn deliver(&self, peer_id: PeerId, peer: &Peer, frame: Utf8Bytes) -> bool {
        match peer.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("Peer {peer_id} lagging, frame dropped");
                false
            }
            // The connection task is already gone; it will leave shortly.
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn has_peer(&self, peer_id: PeerId) -> bool {
        self.peers.contains_key(&peer_id)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peers.len(),
        }
    }
}
