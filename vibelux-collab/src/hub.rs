//! Server-side document hubs.
//!
//! ```text
//!  conn task A ─┐                       ┌─► peer channel A ─► ws A
//!  conn task B ─┼─HubCommand─► DocumentHub ──┼─► peer channel B ─► ws B
//!  conn task C ─┘   (one task/doc)      └─► peer channel C ─► ws C
//!                     │
//!                     ├── content + DocumentVersion
//!                     ├── history: (version, op)
//!                     └── PresenceRegistry, comments
//! ```
//!
//! A hub is the only writer of its document. Connection tasks forward
//! decoded envelopes and never touch document state themselves.
//!
//! An edit names the version it was written against. The hub rebases it
//! over every history entry after that version, whoever wrote them, applies
//! it, acknowledges the new version to the sending connection, and
//! forwards it to everyone else. Sessions send their next edit only after
//! the ack, so the base always covers their own earlier edits.

use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_tungstenite::tungstenite::Utf8Bytes;

use crate::broadcast::{BroadcastGroup, BroadcastStats, PeerId};
use crate::error::{CollabError, Result};
use crate::model::{Comment, PresenceStatus};
use crate::ot::{self, Operation, Priority};
use crate::presence::PresenceRegistry;
use crate::protocol::{CollaborationEvent, EventType, PresencePayload, SyncPayload, HUB_USER_ID};
use crate::server::{ServerConfig, ServerStats};

#[derive(Debug, Clone, PartialEq)]
struct HistoryEntry {
    version: u64,
    operation: Operation,
}

enum HubCommand {
    Join {
        peer_id: PeerId,
        reply: oneshot::Sender<Result<mpsc::Receiver<Utf8Bytes>>>,
    },
    Inbound {
        peer_id: PeerId,
        event: CollaborationEvent,
    },
    Leave {
        peer_id: PeerId,
        reply: oneshot::Sender<usize>,
    },
    Snapshot(oneshot::Sender<(u64, String)>),
    Stats(oneshot::Sender<BroadcastStats>),
}

/// Cloneable handle to a running [`DocumentHub`].
#[derive(Clone)]
pub struct HubHandle {
    document_id: Arc<str>,
    commands: mpsc::UnboundedSender<HubCommand>,
}

impl HubHandle {
    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Join as `peer_id`. The receiver first yields the snapshot, the
    /// presence of everyone already here, and the open comments.
    pub async fn join(&self, peer_id: PeerId) -> Result<mpsc::Receiver<Utf8Bytes>> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Join { peer_id, reply })?;
        rx.await.map_err(|_| CollabError::ConnectionClosed)?
    }

    pub fn inbound(&self, peer_id: PeerId, event: CollaborationEvent) -> Result<()> {
        self.send(HubCommand::Inbound { peer_id, event })
    }

    /// Leave and return the number of peers still connected.
    pub async fn leave(&self, peer_id: PeerId) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.send(HubCommand::Leave { peer_id, reply }).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Current `(version, content)`.
    pub async fn snapshot(&self) -> Result<(u64, String)> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Snapshot(reply))?;
        rx.await.map_err(|_| CollabError::ConnectionClosed)
    }

    pub async fn stats(&self) -> Result<BroadcastStats> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Stats(reply))?;
        rx.await.map_err(|_| CollabError::ConnectionClosed)
    }

    fn send(&self, command: HubCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| CollabError::ConnectionClosed)
    }
}

pub struct DocumentHub {
    document_id: Arc<str>,
    config: ServerConfig,
    content: String,
    version: u64,
    history: VecDeque<HistoryEntry>,
    presence: PresenceRegistry,
    comments: Vec<Comment>,
    peers: BroadcastGroup,
    stats: Arc<RwLock<ServerStats>>,
}

impl DocumentHub {
    pub fn new(document_id: &str, config: ServerConfig, stats: Arc<RwLock<ServerStats>>) -> Self {
        Self {
            document_id: Arc::from(document_id),
            content: String::new(),
            version: 0,
            history: VecDeque::with_capacity(config.history_limit.min(1024)),
            presence: PresenceRegistry::new(HUB_USER_ID, config.presence_timeout()),
            comments: Vec::new(),
            peers: BroadcastGroup::new(config.peer_buffer),
            stats,
            config,
        }
    }

    /// Start the hub task. It stops once every handle is dropped.
    pub fn spawn(self) -> HubHandle {
        let (commands, rx) = mpsc::unbounded_channel();
        let handle = HubHandle {
            document_id: self.document_id.clone(),
            commands,
        };
        tokio::spawn(self.run(rx));
        handle
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<HubCommand>) {
        while let Some(command) = commands.recv().await {
            match command {
                HubCommand::Join { peer_id, reply } => {
                    let _ = reply.send(self.join(peer_id));
                }
                HubCommand::Inbound { peer_id, event } => self.handle_event(peer_id, event).await,
                HubCommand::Leave { peer_id, reply } => {
                    self.leave(peer_id);
                    let _ = reply.send(self.peers.peer_count());
                }
                HubCommand::Snapshot(reply) => {
                    let _ = reply.send((self.version, self.content.clone()));
                }
                HubCommand::Stats(reply) => {
                    let _ = reply.send(self.peers.stats());
                }
            }
        }
        log::debug!("Hub {} stopped", self.document_id);
    }

    fn join(&mut self, peer_id: PeerId) -> Result<mpsc::Receiver<Utf8Bytes>> {
        if self.peers.peer_count() >= self.config.max_peers_per_room {
            log::warn!(
                "Hub {} full ({} peers), refusing peer {peer_id}",
                self.document_id,
                self.config.max_peers_per_room
            );
            return Err(CollabError::Transport(format!(
                "document {} is full",
                self.document_id
            )));
        }

        let rx = self.peers.add_peer(peer_id);
        let mut welcome = vec![self.snapshot_event()];
        welcome.extend(self.presence.active_users().iter().map(|p| {
            CollaborationEvent::presence(p.user.id.clone(), &PresencePayload::from(p))
        }));
        welcome.extend(
            self.comments
                .iter()
                .map(|c| CollaborationEvent::comment(c.user_id.clone(), c)),
        );
        for event in &welcome {
            if let Err(e) = self.peers.unicast(peer_id, event) {
                log::error!("Hub {}: failed to greet peer {peer_id}: {e}", self.document_id);
            }
        }

        log::info!(
            "Peer {peer_id} joined hub {} ({} peers, v{})",
            self.document_id,
            self.peers.peer_count(),
            self.version
        );
        Ok(rx)
    }

    fn leave(&mut self, peer_id: PeerId) {
        let Some(user_id) = self.peers.remove_peer(peer_id) else {
            log::debug!("Anonymous peer {peer_id} left hub {}", self.document_id);
            return;
        };
        log::info!("{user_id} (peer {peer_id}) left hub {}", self.document_id);

        // Another tab of the same user keeps the presence alive.
        if self.peers.has_user(&user_id) {
            return;
        }
        if self.presence.remove(&user_id).is_some() {
            let away = CollaborationEvent::presence(
                user_id,
                &PresencePayload::status_only(PresenceStatus::Away),
            );
            self.fan_out(&away, None);
        }
    }

    async fn handle_event(&mut self, peer_id: PeerId, event: CollaborationEvent) {
        if !self.peers.has_peer(peer_id) {
            log::debug!("Dropping event from departed peer {peer_id}");
            return;
        }
        self.peers.identify(peer_id, &event.user_id);

        match event.event_type {
            EventType::Edit => self.handle_edit(peer_id, event).await,
            EventType::Sync => match event.sync_payload() {
                Ok(SyncPayload::Request { since }) => {
                    log::debug!("Peer {peer_id} requested sync (since v{since})");
                    self.send_snapshot(peer_id);
                }
                Ok(SyncPayload::Snapshot { .. } | SyncPayload::Ack { .. }) => {
                    log::warn!("Ignoring hub-only sync message from {}", event.user_id);
                }
                Err(e) => log::warn!("Bad sync event from {}: {e}", event.user_id),
            },
            EventType::Presence => {
                if let Err(e) = self.presence.apply_event(&event) {
                    log::warn!("Bad presence event from {}: {e}", event.user_id);
                    return;
                }
                self.fan_out(&event, Some(peer_id));
            }
            EventType::Cursor | EventType::Selection => {
                self.presence.record_activity(&event.user_id, Utc::now());
                self.fan_out(&event, Some(peer_id));
            }
            EventType::Comment => {
                match event.comment_payload() {
                    Ok(comment) => self.upsert_comment(comment),
                    Err(e) => {
                        log::warn!("Bad comment event from {}: {e}", event.user_id);
                        return;
                    }
                }
                self.fan_out(&event, Some(peer_id));
            }
            EventType::Error => {
                let message = event.error_payload().map(|p| p.message).unwrap_or_default();
                log::warn!("Peer {peer_id} ({}) reported: {message}", event.user_id);
            }
        }
    }

    /// Rebase an edit onto the current document, apply it, acknowledge it
    /// to the sender and fan it out with the next version.
    async fn handle_edit(&mut self, peer_id: PeerId, event: CollaborationEvent) {
        let author = event.user_id.clone();
        let (operation, origin) = match event.edit_payload() {
            Ok(payload) => (payload.operation, payload.origin),
            Err(e) => return self.reject_edit(peer_id, &author, e.to_string()).await,
        };
        let base = event.version.unwrap_or(self.version);

        if base > self.version {
            let reason = format!("base version {base} is ahead of v{}", self.version);
            return self.reject_edit(peer_id, &author, reason).await;
        }
        let oldest = self
            .history
            .front()
            .map_or(self.version.saturating_add(1), |entry| entry.version);
        if base < self.version && base.saturating_add(1) < oldest {
            let reason = format!("base version {base} predates retained history (v{oldest})");
            return self.reject_edit(peer_id, &author, reason).await;
        }

        let concurrent = self
            .history
            .iter()
            .filter(|entry| entry.version > base)
            .map(|entry| &entry.operation);
        let rebased = ot::transform_against(&operation, concurrent, Priority::Right);

        let content = match ot::apply(&self.content, &rebased) {
            Ok(content) => content,
            Err(e) => return self.reject_edit(peer_id, &author, e.to_string()).await,
        };

        self.content = content;
        self.version += 1;
        self.history.push_back(HistoryEntry {
            version: self.version,
            operation: rebased.clone(),
        });
        while self.history.len() > self.config.history_limit {
            self.history.pop_front();
        }
        self.stats.write().await.applied_edits += 1;

        log::debug!(
            "Hub {}: {author} edit applied as v{} (base v{base})",
            self.document_id,
            self.version
        );
        if let Err(e) = self.peers.unicast(peer_id, &CollaborationEvent::sync_ack(self.version)) {
            log::error!("Hub {}: failed to acknowledge edit: {e}", self.document_id);
        }
        let accepted = CollaborationEvent::edit_from(author, origin, rebased, Some(self.version));
        self.fan_out(&accepted, Some(peer_id));
    }

    async fn reject_edit(&mut self, peer_id: PeerId, author: &str, reason: String) {
        log::error!("Hub {}: rejected edit from {author}: {reason}", self.document_id);
        self.stats.write().await.rejected_edits += 1;
        let error = CollaborationEvent::error(HUB_USER_ID, format!("edit rejected: {reason}"));
        if let Err(e) = self.peers.unicast(peer_id, &error) {
            log::error!("Hub {}: {e}", self.document_id);
        }
        self.send_snapshot(peer_id);
    }

    fn send_snapshot(&self, peer_id: PeerId) {
        if let Err(e) = self.peers.unicast(peer_id, &self.snapshot_event()) {
            log::error!("Hub {}: failed to send snapshot: {e}", self.document_id);
        }
    }

    fn snapshot_event(&self) -> CollaborationEvent {
        CollaborationEvent::sync_snapshot(HUB_USER_ID, self.version, self.content.clone())
    }

    fn fan_out(&self, event: &CollaborationEvent, except: Option<PeerId>) {
        if let Err(e) = self.peers.broadcast(event, except) {
            log::error!("Hub {}: failed to broadcast {}: {e}", self.document_id, event.event_type);
        }
    }

    fn upsert_comment(&mut self, comment: Comment) {
        match self.comments.iter_mut().find(|c| c.id == comment.id) {
            Some(existing) => *existing = comment,
            None => self.comments.push(comment),
        }
    }
}

/// Document id → running hub.
pub struct HubRegistry {
    hubs: RwLock<HashMap<String, HubHandle>>,
    config: ServerConfig,
    stats: Arc<RwLock<ServerStats>>,
}

impl HubRegistry {
    pub fn new(config: ServerConfig, stats: Arc<RwLock<ServerStats>>) -> Self {
        Self {
            hubs: RwLock::new(HashMap::new()),
            config,
            stats,
        }
    }

    /// Join the hub for `document_id`, starting it if needed.
    ///
    /// Joins and leaves hold the registry write lock, so a hub is never
    /// removed between lookup and join.
    pub async fn join(
        &self,
        document_id: &str,
        peer_id: PeerId,
    ) -> Result<(HubHandle, mpsc::Receiver<Utf8Bytes>)> {
        let mut hubs = self.hubs.write().await;
        let hub = match hubs.get(document_id) {
            Some(hub) => hub.clone(),
            None => {
                log::info!("Starting hub for document {document_id}");
                let hub = DocumentHub::new(document_id, self.config.clone(), self.stats.clone())
                    .spawn();
                hubs.insert(document_id.to_string(), hub.clone());
                hub
            }
        };
        let joined = hub.join(peer_id).await;
        self.stats.write().await.active_rooms = hubs.len();
        joined.map(|rx| (hub, rx))
    }

    /// Leave, dropping the hub once its last peer is gone.
    pub async fn leave(&self, document_id: &str, peer_id: PeerId) {
        let mut hubs = self.hubs.write().await;
        let Some(hub) = hubs.get(document_id) else {
            return;
        };
        if hub.leave(peer_id).await == 0 {
            hubs.remove(document_id);
            log::info!("Hub {document_id} removed (empty)");
        }
        self.stats.write().await.active_rooms = hubs.len();
    }

    pub async fn get(&self, document_id: &str) -> Option<HubHandle> {
        self.hubs.read().await.get(document_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.hubs.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.hubs.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CursorPosition, User};

    fn registry() -> HubRegistry {
        HubRegistry::new(ServerConfig::default(), Arc::new(RwLock::new(ServerStats::default())))
    }

    async fn next(rx: &mut mpsc::Receiver<Utf8Bytes>) -> CollaborationEvent {
        let frame = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("channel closed");
        CollaborationEvent::decode(frame.as_str()).unwrap()
    }

    fn announce(user: &str) -> CollaborationEvent {
        let presence = crate::model::Presence::new(User::new(user, user, format!("{user}@example.com")));
        CollaborationEvent::presence(user, &PresencePayload::from(&presence))
    }

    #[tokio::test]
    async fn test_join_receives_snapshot() {
        let registry = registry();
        let (_hub, mut rx) = registry.join("doc", 1).await.unwrap();

        let snapshot = next(&mut rx).await;
        assert_eq!(snapshot.user_id, HUB_USER_ID);
        assert_eq!(
            snapshot.sync_payload().unwrap(),
            SyncPayload::Snapshot { version: 0, content: String::new() }
        );
        assert_eq!(registry.room_count().await, 1);
    }

    /// Read the next frame as an edit acknowledgement.
    async fn ack(rx: &mut mpsc::Receiver<Utf8Bytes>) -> u64 {
        match next(rx).await.sync_payload() {
            Ok(SyncPayload::Ack { version }) => version,
            other => panic!("expected ack, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_edits_are_versioned_and_forwarded() {
        let registry = registry();
        let (hub, mut alice) = registry.join("doc", 1).await.unwrap();
        let (_, mut bob) = registry.join("doc", 2).await.unwrap();
        next(&mut alice).await;
        next(&mut bob).await;

        hub.inbound(1, CollaborationEvent::edit("alice", Operation::insert(0, "hello"), Some(0))).unwrap();
        let forwarded = next(&mut bob).await;
        assert_eq!(forwarded.version, Some(1));
        assert_eq!(forwarded.edit_payload().unwrap().operation, Operation::insert(0, "hello"));

        // The author gets an ack instead of its own edit back.
        assert_eq!(ack(&mut alice).await, 1);
        assert!(alice.try_recv().is_err());
        assert_eq!(hub.snapshot().await.unwrap(), (1, "hello".to_string()));
    }

    #[tokio::test]
    async fn test_concurrent_inserts_converge() {
        let registry = registry();
        let (hub, mut alice) = registry.join("doc", 1).await.unwrap();
        let (_, mut bob) = registry.join("doc", 2).await.unwrap();
        next(&mut alice).await;
        next(&mut bob).await;

        // Both typed at position 0 of the empty v0 document.
        hub.inbound(1, CollaborationEvent::edit("alice", Operation::insert(0, "A"), Some(0))).unwrap();
        hub.inbound(2, CollaborationEvent::edit("bob", Operation::insert(0, "B"), Some(0))).unwrap();

        assert_eq!(ack(&mut alice).await, 1);
        let to_alice = next(&mut alice).await;
        assert_eq!(to_alice.version, Some(2));
        let to_bob = next(&mut bob).await;
        assert_eq!(to_bob.version, Some(1));
        assert_eq!(ack(&mut bob).await, 2);

        let alice_doc = ot::apply("A", &to_alice.edit_payload().unwrap().operation).unwrap();
        let bob_doc = ot::apply("B", &to_bob.edit_payload().unwrap().operation).unwrap();
        assert_eq!(alice_doc, "AB");
        assert_eq!(bob_doc, "AB");
        assert_eq!(hub.snapshot().await.unwrap(), (2, "AB".to_string()));
    }

    #[tokio::test]
    async fn test_edit_chain_rebased_over_interleaved_edit() {
        let registry = registry();
        let (hub, mut alice) = registry.join("doc", 1).await.unwrap();
        let (_, mut bob) = registry.join("doc", 2).await.unwrap();
        next(&mut alice).await;
        next(&mut bob).await;

        hub.inbound(1, CollaborationEvent::edit("alice", Operation::insert(0, "xy"), Some(0))).unwrap();
        assert_eq!(ack(&mut alice).await, 1);
        next(&mut bob).await;

        // Alice replaces "xy" with "AAA" in two edits; bob appends "B"
        // concurrently and reaches the hub first.
        let mut alice_doc = "xy".to_string();
        let mut pending = crate::pending::PendingEdits::new();
        for op in [Operation::insert(0, "AAA"), Operation::delete(3, 2)] {
            alice_doc = ot::apply(&alice_doc, &op).unwrap();
            pending.push(op);
        }
        hub.inbound(2, CollaborationEvent::edit("bob", Operation::insert(2, "B"), Some(1))).unwrap();
        let first = pending.next_to_send().unwrap();
        hub.inbound(1, CollaborationEvent::edit("alice", first, Some(1))).unwrap();

        let from_bob = next(&mut alice).await;
        assert_eq!(from_bob.version, Some(2));
        let remote = pending.transform_remote(&from_bob.edit_payload().unwrap().operation);
        alice_doc = ot::apply(&alice_doc, &remote).unwrap();

        let base = ack(&mut alice).await;
        assert_eq!(base, 3);
        assert!(pending.acknowledge());
        let second = pending.next_to_send().unwrap();
        hub.inbound(1, CollaborationEvent::edit("alice", second, Some(base))).unwrap();
        assert_eq!(ack(&mut alice).await, 4);

        assert_eq!(alice_doc, "AAAB");
        assert_eq!(hub.snapshot().await.unwrap(), (4, "AAAB".to_string()));
    }

    #[tokio::test]
    async fn test_sessions_of_one_user_rebase_against_each_other() {
        let registry = registry();
        let (hub, mut tab1) = registry.join("doc", 1).await.unwrap();
        let (_, mut tab2) = registry.join("doc", 2).await.unwrap();
        next(&mut tab1).await;
        next(&mut tab2).await;

        hub.inbound(1, CollaborationEvent::edit("alice", Operation::insert(0, "hello"), Some(0))).unwrap();
        assert_eq!(ack(&mut tab1).await, 1);
        next(&mut tab2).await;

        let bang = CollaborationEvent::edit_from("alice", Some("tab-1".into()), Operation::insert(5, "!"), Some(1));
        let query = CollaborationEvent::edit_from("alice", Some("tab-2".into()), Operation::insert(5, "?"), Some(1));
        hub.inbound(1, bang).unwrap();
        hub.inbound(2, query).unwrap();

        let forwarded = next(&mut tab2).await;
        assert_eq!(forwarded.edit_payload().unwrap().origin.as_deref(), Some("tab-1"));
        assert_eq!(ack(&mut tab2).await, 3);
        assert_eq!(hub.snapshot().await.unwrap(), (3, "hello!?".to_string()));
    }

    #[tokio::test]
    async fn test_overflowing_edit_is_rejected_and_hub_survives() {
        let registry = registry();
        let (hub, mut rx) = registry.join("doc", 1).await.unwrap();
        next(&mut rx).await;
        hub.inbound(1, CollaborationEvent::edit("alice", Operation::insert(0, "ok"), Some(0))).unwrap();
        assert_eq!(ack(&mut rx).await, 1);

        let evil = CollaborationEvent::edit("mallory", Operation::insert(usize::MAX, "evil"), Some(0));
        hub.inbound(1, evil).unwrap();
        assert_eq!(next(&mut rx).await.event_type, EventType::Error);
        assert_eq!(next(&mut rx).await.event_type, EventType::Sync);

        let wide = CollaborationEvent::edit("mallory", Operation::delete(usize::MAX, usize::MAX), Some(0));
        hub.inbound(1, wide).unwrap();
        assert_eq!(next(&mut rx).await.event_type, EventType::Error);
        assert_eq!(next(&mut rx).await.event_type, EventType::Sync);

        assert_eq!(hub.snapshot().await.unwrap(), (1, "ok".to_string()));
    }

    #[tokio::test]
    async fn test_bad_edit_answered_with_error_and_snapshot() {
        let registry = registry();
        let (hub, mut rx) = registry.join("doc", 1).await.unwrap();
        next(&mut rx).await;

        hub.inbound(1, CollaborationEvent::edit("alice", Operation::delete(3, 1), Some(0))).unwrap();
        assert_eq!(next(&mut rx).await.event_type, EventType::Error);
        assert_eq!(next(&mut rx).await.event_type, EventType::Sync);

        hub.inbound(1, CollaborationEvent::edit("alice", Operation::insert(0, "x"), Some(9))).unwrap();
        assert_eq!(next(&mut rx).await.event_type, EventType::Error);
        assert_eq!(hub.snapshot().await.unwrap().0, 0);
    }

    #[tokio::test]
    async fn test_sync_request_gets_snapshot() {
        let registry = registry();
        let (hub, mut rx) = registry.join("doc", 1).await.unwrap();
        next(&mut rx).await;

        hub.inbound(1, CollaborationEvent::sync_request("alice", 0)).unwrap();
        assert_eq!(next(&mut rx).await.sync_payload().unwrap(), SyncPayload::Snapshot { version: 0, content: String::new() });
    }

    #[tokio::test]
    async fn test_late_joiner_sees_presence_and_comments() {
        let registry = registry();
        let (hub, mut alice) = registry.join("doc", 1).await.unwrap();
        next(&mut alice).await;
        hub.inbound(1, announce("alice")).unwrap();
        let comment = crate::model::CommentDraft::new("check the vents").into_comment("alice");
        hub.inbound(1, CollaborationEvent::comment("alice", &comment)).unwrap();

        let (_, mut bob) = registry.join("doc", 2).await.unwrap();
        assert_eq!(next(&mut bob).await.event_type, EventType::Sync);
        let presence = next(&mut bob).await;
        assert_eq!(presence.user_id, "alice");
        assert_eq!(presence.presence_payload().unwrap().status, PresenceStatus::Active);
        assert_eq!(next(&mut bob).await.comment_payload().unwrap(), comment);
    }

    #[tokio::test]
    async fn test_leave_broadcasts_away_and_drops_empty_hub() {
        let registry = registry();
        let (hub, mut alice) = registry.join("doc", 1).await.unwrap();
        let (_, mut bob) = registry.join("doc", 2).await.unwrap();
        next(&mut alice).await;
        next(&mut bob).await;

        hub.inbound(2, announce("bob")).unwrap();
        hub.inbound(2, CollaborationEvent::cursor("bob", CursorPosition::new(1.0, 1.0))).unwrap();
        next(&mut alice).await;
        next(&mut alice).await;

        registry.leave("doc", 2).await;
        let away = next(&mut alice).await;
        assert_eq!(away.user_id, "bob");
        assert_eq!(away.presence_payload().unwrap().status, PresenceStatus::Away);

        registry.leave("doc", 1).await;
        assert_eq!(registry.room_count().await, 0);
        assert!(registry.get("doc").await.is_none());
    }

    #[tokio::test]
    async fn test_room_full() {
        let config = ServerConfig {
            max_peers_per_room: 1,
            ..ServerConfig::default()
        };
        let registry = HubRegistry::new(config, Arc::new(RwLock::new(ServerStats::default())));
        let _first = registry.join("doc", 1).await.unwrap();
        assert!(registry.join("doc", 2).await.is_err());
    }

    #[tokio::test]
    async fn test_documents_are_isolated() {
        let registry = registry();
        let (hub_a, _rx_a) = registry.join("a", 1).await.unwrap();
        let (hub_b, _rx_b) = registry.join("b", 2).await.unwrap();

        hub_a.inbound(1, CollaborationEvent::edit("alice", Operation::insert(0, "x"), Some(0))).unwrap();
        assert_eq!(hub_a.snapshot().await.unwrap(), (1, "x".to_string()));
        assert_eq!(hub_b.snapshot().await.unwrap(), (0, String::new()));
        assert_eq!(registry.active_documents().await, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let config = ServerConfig {
            history_limit: 2,
            ..ServerConfig::default()
        };
        let registry = HubRegistry::new(config, Arc::new(RwLock::new(ServerStats::default())));
        let (hub, mut rx) = registry.join("doc", 1).await.unwrap();
        next(&mut rx).await;

        // A lone editor bases each edit on the previous ack, so trimming
        // history never catches up with it.
        let mut base = 0;
        for _ in 0..4 {
            hub.inbound(1, CollaborationEvent::edit("alice", Operation::insert(0, "a"), Some(base))).unwrap();
            base = ack(&mut rx).await;
        }
        assert_eq!(base, 4);
        assert_eq!(hub.snapshot().await.unwrap(), (4, "aaaa".to_string()));

        // v0 is older than anything retained.
        hub.inbound(1, CollaborationEvent::edit("bob", Operation::insert(0, "b"), Some(0))).unwrap();
        assert_eq!(next(&mut rx).await.event_type, EventType::Error);
        assert_eq!(hub.snapshot().await.unwrap().0, 4);
    }
}
