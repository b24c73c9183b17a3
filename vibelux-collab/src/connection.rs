//! Connection manager: the per-session actor that owns the transport.
//!
//! ```text
//!  CollaborationSession ──Command──► ConnectionManager::run()  (one task)
//!                                      │ select! {
//!                                      │   command      → send / queue / query
//!                                      │   local edit   → pending edits → one in flight
//!                                      │   ws frame     → EventRouter → SessionEvent / ack
//!                                      │   heartbeat    → presence{heartbeat}
//!                                      │   idle check   → active/idle/away, evict stale
//!                                      │   reconnect    → connect()
//!                                      │ }
//!                                      ▼
//!                             {baseUrl}/collaborate/{documentId}
//! ```
//!
//! Everything a session knows lives in this task, so no state is shared
//! behind locks. Timers are `Option` slots: `None` means cancelled, and at
//! most one reconnect can be pending.
//!
//! Edits bypass the outbound queue. They wait in the router's pending
//! edits until the hub acknowledges the previous one.

use std::collections::VecDeque;
use std::future::pending;
use std::pin::Pin;

use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, Sleep};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::config::{OverflowPolicy, SessionConfig};
use crate::error::{CollabError, Result};
use crate::model::{Comment, Presence, PresencePatch, PresenceStatus, User};
use crate::ot::Operation;
use crate::protocol::{CollaborationEvent, PresencePayload};
use crate::router::{EventRouter, RouteAction, SessionEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

// ───────────────────────────────────────────────────────────────────
// Outbound queue
// ───────────────────────────────────────────────────────────────────

/// Result of [`OutboundQueue::enqueue`].
#[derive(Debug, Clone, PartialEq)]
pub enum Enqueued {
    Queued,
    /// The queue was full; this (oldest) event was evicted.
    DroppedOldest(CollaborationEvent),
    /// The queue was full; the new event was refused.
    Rejected(CollaborationEvent),
}

/// Events sent while disconnected, replayed in FIFO order on reconnect.
pub struct OutboundQueue {
    queue: VecDeque<CollaborationEvent>,
    capacity: usize,
    policy: OverflowPolicy,
}

impl OutboundQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            policy,
        }
    }

    pub fn enqueue(&mut self, event: CollaborationEvent) -> Enqueued {
        if self.queue.len() < self.capacity {
            self.queue.push_back(event);
            return Enqueued::Queued;
        }
        match self.policy {
            OverflowPolicy::RejectNewest => Enqueued::Rejected(event),
            OverflowPolicy::DropOldest => {
                let dropped = self.queue.pop_front();
                self.queue.push_back(event);
                match dropped {
                    Some(dropped) => Enqueued::DroppedOldest(dropped),
                    None => Enqueued::Queued,
                }
            }
        }
    }

    /// Put unsent events back ahead of anything queued since.
    pub fn requeue_front(&mut self, events: VecDeque<CollaborationEvent>) {
        for event in events.into_iter().rev() {
            self.queue.push_front(event);
        }
    }

    /// Take every queued event, oldest first.
    pub fn drain(&mut self) -> VecDeque<CollaborationEvent> {
        std::mem::take(&mut self.queue)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

// ───────────────────────────────────────────────────────────────────
// Commands
// ───────────────────────────────────────────────────────────────────

/// Requests from the session façade into the actor.
pub(crate) enum Command {
    /// Open the transport; the ack carries the outcome of the first attempt.
    Connect(oneshot::Sender<Result<()>>),
    /// Send (or queue) an event; `activity` marks it as user-initiated.
    Send { event: CollaborationEvent, activity: bool },
    SendEdit { operation: Operation, version: Option<u64> },
    SendComment(Comment),
    UpdatePresence(PresencePatch),
    RequestSync,
    Disconnect(oneshot::Sender<()>),
    Query(Query),
}

pub(crate) enum Query {
    ActiveUsers(oneshot::Sender<Vec<Presence>>),
    DocumentVersion(oneshot::Sender<u64>),
    Comments(oneshot::Sender<Vec<Comment>>),
    State(oneshot::Sender<ConnectionState>),
    QueuedEvents(oneshot::Sender<usize>),
    PendingEdits(oneshot::Sender<usize>),
}

// ───────────────────────────────────────────────────────────────────
// Actor
// ───────────────────────────────────────────────────────────────────

pub struct ConnectionManager {
    config: SessionConfig,
    user_id: String,
    router: EventRouter,
    queue: OutboundQueue,
    events: broadcast::Sender<SessionEvent>,
    state: ConnectionState,

    writer: Option<WsWriter>,
    reader: Option<WsReader>,

    heartbeat: Option<Interval>,
    idle_check: Option<Interval>,
    reconnect: Option<Pin<Box<Sleep>>>,
    reconnect_attempt: u32,
    /// Set by `connect()`, cleared by `disconnect()`; gates reconnects.
    wants_connection: bool,

    self_presence: Presence,
    last_activity: Instant,
}

impl ConnectionManager {
    pub fn new(config: SessionConfig, events: broadcast::Sender<SessionEvent>) -> Self {
        let user = config
            .user
            .clone()
            .unwrap_or_else(|| User::anonymous(config.user_id()));
        let user_id = user.id.clone();
        Self {
            router: EventRouter::new(user_id.clone(), config.idle_timeout())
                .with_origin(Uuid::new_v4().to_string()),
            queue: OutboundQueue::new(config.outbound_queue_capacity, config.overflow_policy),
            user_id,
            events,
            state: ConnectionState::Disconnected,
            writer: None,
            reader: None,
            heartbeat: None,
            idle_check: None,
            reconnect: None,
            reconnect_attempt: 0,
            wants_connection: false,
            self_presence: Presence::new(user),
            last_activity: Instant::now(),
            config,
        }
    }

    /// Spawn the actor, returning its command channel.
    pub(crate) fn spawn(
        config: SessionConfig,
        events: broadcast::Sender<SessionEvent>,
    ) -> (mpsc::UnboundedSender<Command>, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = Self::new(config, events);
        let handle = tokio::spawn(manager.run(rx));
        (tx, handle)
    }

    /// Main loop. Exits when every command sender is gone.
    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            // Commands first: a remote edit is rebased over every local
            // edit submitted before it was read.
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.disconnect().await;
                        break;
                    }
                },
                frame = next_frame(&mut self.reader) => self.handle_frame(frame).await,
                _ = tick(&mut self.heartbeat) => self.send_heartbeat().await,
                _ = tick(&mut self.idle_check) => self.check_idle().await,
                _ = fire(&mut self.reconnect) => {
                    self.reconnect = None;
                    let _ = self.connect().await;
                }
            }
        }
        log::debug!("Connection manager for {} stopped", self.user_id);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(ack) => {
                let outcome = self.connect().await;
                let _ = ack.send(outcome);
            }
            Command::Send { event, activity } => {
                if activity {
                    self.record_activity().await;
                }
                self.send(event).await;
            }
            Command::SendEdit { operation, version } => {
                self.record_activity().await;
                let delivered = self.router.delivered_version();
                match version {
                    Some(seen) if seen != delivered => {
                        log::warn!("Refusing edit written at v{seen}, v{delivered} already delivered");
                        self.emit(SessionEvent::Error(format!(
                            "edit written against v{seen} but v{delivered} was already delivered"
                        )));
                    }
                    _ => {
                        self.router.submit_local_edit(operation);
                        self.send_pending_edit().await;
                    }
                }
            }
            Command::SendComment(comment) => {
                self.record_activity().await;
                let event = CollaborationEvent::comment(self.user_id.clone(), &comment);
                self.router.upsert_comment(comment);
                self.send(event).await;
            }
            Command::UpdatePresence(patch) => {
                self.last_activity = Instant::now();
                self.self_presence.merge(&patch);
                if patch.status.is_none() {
                    self.self_presence.status = PresenceStatus::Active;
                }
                self.self_presence.last_active = Utc::now();
                self.broadcast_presence().await;
            }
            Command::RequestSync => {
                let since = self.router.document_version();
                self.send(CollaborationEvent::sync_request(self.user_id.clone(), since)).await;
            }
            Command::Disconnect(ack) => {
                self.disconnect().await;
                let _ = ack.send(());
            }
            Command::Query(query) => self.answer(query),
        }
    }

    fn answer(&self, query: Query) {
        match query {
            Query::ActiveUsers(tx) => {
                let _ = tx.send(self.router.active_users());
            }
            Query::DocumentVersion(tx) => {
                let _ = tx.send(self.router.document_version());
            }
            Query::Comments(tx) => {
                let _ = tx.send(self.router.comments().to_vec());
            }
            Query::State(tx) => {
                let _ = tx.send(self.state);
            }
            Query::QueuedEvents(tx) => {
                let _ = tx.send(self.queue.len());
            }
            Query::PendingEdits(tx) => {
                let _ = tx.send(self.router.pending_edits());
            }
        }
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    async fn connect(&mut self) -> Result<()> {
        self.wants_connection = true;
        if self.writer.is_some() {
            log::debug!("connect() while already connected, ignoring");
            return Ok(());
        }
        self.reconnect = None;
        self.set_state(if self.reconnect_attempt > 0 {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Connecting
        });

        let url = self.config.endpoint();
        log::debug!("Connecting to {url}");
        let attempt = time::timeout(
            self.config.connect_timeout(),
            tokio_tungstenite::connect_async(url.as_str()),
        )
        .await;

        let error = match attempt {
            Ok(Ok((stream, _response))) => return self.on_open(stream).await,
            Ok(Err(e)) => CollabError::from(e),
            Err(_) => CollabError::Timeout,
        };

        log::warn!("Connect to {url} failed: {error}");
        self.set_state(ConnectionState::Disconnected);
        self.emit(SessionEvent::Error(error.to_string()));
        self.schedule_reconnect();
        Err(error)
    }

    async fn on_open(&mut self, stream: WsStream) -> Result<()> {
        let (writer, reader) = stream.split();
        self.writer = Some(writer);
        self.reader = Some(reader);
        self.reconnect_attempt = 0;
        self.router.expect_welcome();
        self.set_state(ConnectionState::Connected);
        log::info!("Connected to {}", self.config.endpoint());

        if let Err(e) = self.flush_queue().await {
            self.on_transport_lost(e.clone());
            return Err(e);
        }

        let heartbeat = self.config.heartbeat_interval();
        self.heartbeat = Some(time::interval_at(Instant::now() + heartbeat, heartbeat));
        let idle_check = self.config.idle_check_interval();
        self.idle_check = Some(time::interval_at(Instant::now() + idle_check, idle_check));

        let announce = CollaborationEvent::presence(
            self.user_id.clone(),
            &PresencePayload::from(&self.self_presence),
        );
        if let Err(e) = self.transmit(&announce).await {
            self.on_transport_lost(e.clone());
            return Err(e);
        }

        self.emit(SessionEvent::Connected);
        Ok(())
    }

    /// Replay queued events in order. On a write failure the failed event
    /// and everything after it go back to the front of the queue.
    async fn flush_queue(&mut self) -> Result<()> {
        if self.queue.is_empty() {
            return Ok(());
        }
        let mut replay = self.queue.drain();
        log::info!("Replaying {} queued events", replay.len());

        while let Some(event) = replay.pop_front() {
            if let Err(e) = self.transmit(&event).await {
                replay.push_front(event);
                log::warn!("Replay interrupted, {} events re-queued", replay.len());
                self.queue.requeue_front(replay);
                return Err(e);
            }
        }
        Ok(())
    }

    fn on_transport_lost(&mut self, error: CollabError) {
        if self.writer.is_none() && self.reader.is_none() {
            return;
        }
        log::warn!("Connection to {} lost: {error}", self.config.endpoint());
        self.writer = None;
        self.reader = None;
        self.heartbeat = None;
        self.idle_check = None;

        for user_id in self.router.clear_presence() {
            self.emit(SessionEvent::UserLeft(user_id));
        }
        self.set_state(ConnectionState::Disconnected);
        self.emit(SessionEvent::Error(error.to_string()));
        self.emit(SessionEvent::Disconnected);
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        if !self.wants_connection || self.reconnect.is_some() {
            return;
        }
        let delay = self.config.reconnect_delay(self.reconnect_attempt);
        self.reconnect_attempt = self.reconnect_attempt.saturating_add(1);
        log::info!(
            "Reconnecting in {}ms (attempt {})",
            delay.as_millis(),
            self.reconnect_attempt
        );
        self.set_state(ConnectionState::Reconnecting);
        self.reconnect = Some(Box::pin(time::sleep(delay)));
    }

    /// Cancel every timer, say goodbye, and close. Safe to repeat.
    async fn disconnect(&mut self) {
        self.wants_connection = false;
        self.reconnect = None;
        self.heartbeat = None;
        self.idle_check = None;
        self.reconnect_attempt = 0;

        if let Some(mut writer) = self.writer.take() {
            let away = CollaborationEvent::presence(
                self.user_id.clone(),
                &PresencePayload::status_only(PresenceStatus::Away),
            );
            let goodbye = async {
                if let Ok(text) = away.encode() {
                    writer.send(Message::Text(text.into())).await?;
                }
                writer.close().await
            };
            match time::timeout(self.config.connect_timeout(), goodbye).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::debug!("Close handshake failed: {e}"),
                Err(_) => log::debug!("Close handshake timed out"),
            }
        }
        self.reader = None;
        self.router.clear_presence();

        if self.state != ConnectionState::Disconnected {
            self.set_state(ConnectionState::Disconnected);
            self.emit(SessionEvent::Disconnected);
            log::info!("Disconnected from {}", self.config.endpoint());
        }
    }

    // ── Outbound ───────────────────────────────────────────────────

    /// Transmit now when connected, otherwise queue for replay.
    async fn send(&mut self, event: CollaborationEvent) {
        if self.writer.is_none() {
            self.enqueue(event);
            return;
        }
        if let Err(e) = self.transmit(&event).await {
            self.enqueue(event);
            self.on_transport_lost(e);
        }
    }

    /// Write one event. Unserializable events are logged and dropped;
    /// only transport failures are returned.
    async fn transmit(&mut self, event: &CollaborationEvent) -> Result<()> {
        let text = match event.encode() {
            Ok(text) => text,
            Err(e) => {
                log::error!("Dropping unserializable {} event: {e}", event.event_type);
                return Ok(());
            }
        };
        let writer = self.writer.as_mut().ok_or(CollabError::ConnectionClosed)?;
        writer.send(Message::Text(text.into())).await?;
        Ok(())
    }

    /// Put the next pending local edit on the wire if the hub is ready
    /// for it. A failed write leaves it in flight until the next greeting.
    async fn send_pending_edit(&mut self) {
        if self.writer.is_none() {
            return;
        }
        let Some(event) = self.router.next_outgoing_edit() else {
            return;
        };
        if let Err(e) = self.transmit(&event).await {
            self.on_transport_lost(e);
        }
    }

    fn enqueue(&mut self, event: CollaborationEvent) {
        match self.queue.enqueue(event) {
            Enqueued::Queued => {
                log::trace!("Queued event ({} pending)", self.queue.len());
            }
            Enqueued::DroppedOldest(dropped) => {
                log::warn!(
                    "Outbound queue full ({}), dropped oldest {} event",
                    self.queue.capacity(),
                    dropped.event_type
                );
                self.emit(SessionEvent::Error(format!(
                    "outbound queue full, dropped oldest {} event",
                    dropped.event_type
                )));
            }
            Enqueued::Rejected(rejected) => {
                let error = CollabError::QueueFull(self.queue.capacity());
                log::warn!("{error}, rejected {} event", rejected.event_type);
                self.emit(SessionEvent::Error(error.to_string()));
            }
        }
    }

    async fn send_heartbeat(&mut self) {
        let beat = CollaborationEvent::presence(
            self.user_id.clone(),
            &PresencePayload::heartbeat(&self.self_presence),
        );
        if let Err(e) = self.transmit(&beat).await {
            self.on_transport_lost(e);
        }
    }

    async fn broadcast_presence(&mut self) {
        let event = CollaborationEvent::presence(
            self.user_id.clone(),
            &PresencePayload::from(&self.self_presence),
        );
        self.send(event).await;
    }

    // ── Idle detection ─────────────────────────────────────────────

    async fn record_activity(&mut self) {
        self.last_activity = Instant::now();
        self.self_presence.last_active = Utc::now();
        if self.self_presence.status != PresenceStatus::Active {
            log::debug!("Local presence back to active");
            self.self_presence.status = PresenceStatus::Active;
            self.broadcast_presence().await;
        }
    }

    async fn check_idle(&mut self) {
        let status = PresenceStatus::for_inactivity(
            self.last_activity.elapsed(),
            self.config.idle_timeout(),
        );
        if status != self.self_presence.status {
            log::info!("Local presence {:?} -> {:?}", self.self_presence.status, status);
            self.self_presence.status = status;
            self.broadcast_presence().await;
        }

        let actions = self.router.evict_stale();
        self.execute(actions).await;
    }

    // ── Inbound ────────────────────────────────────────────────────

    async fn handle_frame(&mut self, frame: Option<std::result::Result<Message, tungstenite::Error>>) {
        match frame {
            Some(Ok(Message::Text(text))) => {
                self.handle_inbound(CollaborationEvent::decode(text.as_str())).await
            }
            Some(Ok(Message::Binary(bytes))) => {
                self.handle_inbound(CollaborationEvent::decode_bytes(&bytes)).await
            }
            Some(Ok(Message::Close(frame))) => {
                log::info!("Hub closed the connection: {frame:?}");
                self.on_transport_lost(CollabError::ConnectionClosed);
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => self.on_transport_lost(e.into()),
            None => self.on_transport_lost(CollabError::ConnectionClosed),
        }
    }

    async fn handle_inbound(&mut self, decoded: Result<CollaborationEvent>) {
        match decoded {
            Ok(event) => {
                let actions = self.router.route(event);
                self.execute(actions).await;
            }
            Err(e) => log::warn!("Discarding malformed message: {e}"),
        }
    }

    async fn execute(&mut self, actions: Vec<RouteAction>) {
        for action in actions {
            match action {
                RouteAction::Emit(event) => self.emit(event),
                RouteAction::RequestResync { since } => {
                    let request = CollaborationEvent::sync_request(self.user_id.clone(), since);
                    self.send(request).await;
                }
                RouteAction::SendPendingEdits => self.send_pending_edit().await,
            }
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            log::trace!("Connection state {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }
}

async fn next_frame(
    reader: &mut Option<WsReader>,
) -> Option<std::result::Result<Message, tungstenite::Error>> {
    match reader {
        Some(reader) => reader.next().await,
        None => pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending::<()>().await,
    }
}

async fn fire(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => pending::<()>().await,
    }
}
