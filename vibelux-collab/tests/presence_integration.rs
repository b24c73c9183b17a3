//! Integration tests for presence, cursors, selections and comments.
//!
//! These tests start a real hub and connect two or three sessions,
//! verifying that ephemeral state travels through the full network stack.

use tokio::time::{timeout, Duration};
use vibelux_collab::{
    CollaborationSession, CommentDraft, CursorPosition, EventKind, PresencePatch, PresenceStatus,
    Selection, ServerConfig, SessionConfig, SessionEvent, Subscription, SyncServer, User, Viewport,
};

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a hub on a free port, return the port.
async fn start_test_server() -> u16 {
    let port = free_port().await;
    let server = SyncServer::new(ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..ServerConfig::default()
    });
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}

fn session(port: u16, doc: &str, user: &str) -> CollaborationSession {
    CollaborationSession::new(session_config(port, doc, user))
}

fn session_config(port: u16, doc: &str, user: &str) -> SessionConfig {
    SessionConfig::new(
        format!("ws://127.0.0.1:{port}"),
        doc,
        User::new(user, user.to_uppercase(), format!("{user}@example.com")),
    )
}

async fn wait_for(
    sub: &mut Subscription,
    pred: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    timeout(Duration::from_secs(3), async {
        loop {
            match sub.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("session closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn joined(id: &str) -> impl Fn(&SessionEvent) -> bool + '_ {
    move |e| matches!(e, SessionEvent::UserJoined(p) if p.user.id == id)
}

// ─── Presence lifecycle ──────────────────────────────────────────

#[tokio::test]
async fn test_join_and_leave_fire_once() {
    let port = start_test_server().await;
    let alice = session(port, "room-presence", "alice");
    let bob = session(port, "room-presence", "bob");
    let mut lifecycle = alice.subscribe_to([EventKind::UserJoined, EventKind::UserLeft]);

    alice.connect().await.unwrap();
    bob.connect().await.unwrap();

    match wait_for(&mut lifecycle, |_| true).await {
        SessionEvent::UserJoined(presence) => {
            assert_eq!(presence.user.id, "bob");
            assert_eq!(presence.user.display_name, "BOB");
            assert_eq!(presence.status, PresenceStatus::Active);
        }
        other => panic!("expected bob to join, got {other:?}"),
    }
    let users = alice.active_users().await.unwrap();
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].user.id, "bob");

    bob.disconnect().await;
    assert_eq!(
        wait_for(&mut lifecycle, |_| true).await,
        SessionEvent::UserLeft("bob".into())
    );
    assert!(alice.active_users().await.unwrap().is_empty());

    // The hub's own leave notice must not produce a second user-left.
    let again = timeout(Duration::from_millis(300), lifecycle.recv()).await;
    assert!(again.is_err(), "user-left fired twice: {again:?}");
}

#[tokio::test]
async fn test_late_joiner_sees_existing_participants() {
    let port = start_test_server().await;
    let alice = session(port, "room-late", "alice");
    let bob = session(port, "room-late", "bob");
    let carol = session(port, "room-late", "carol");
    let mut alice_sees = alice.subscribe_to([EventKind::UserJoined]);

    alice.connect().await.unwrap();
    bob.connect().await.unwrap();
    wait_for(&mut alice_sees, joined("bob")).await;

    let mut carol_sees = carol.subscribe_to([EventKind::UserJoined]);
    carol.connect().await.unwrap();
    let mut ids = Vec::new();
    while ids.len() < 2 {
        if let SessionEvent::UserJoined(p) = wait_for(&mut carol_sees, |_| true).await {
            ids.push(p.user.id);
        }
    }
    ids.sort();
    assert_eq!(ids, vec!["alice".to_string(), "bob".to_string()]);
}

#[tokio::test]
async fn test_presence_patch_is_broadcast() {
    let port = start_test_server().await;
    let alice = session(port, "room-patch", "alice");
    let bob = session(port, "room-patch", "bob");
    let mut updates = alice.subscribe_to([EventKind::UserJoined, EventKind::PresenceUpdate]);

    alice.connect().await.unwrap();
    bob.connect().await.unwrap();
    wait_for(&mut updates, joined("bob")).await;

    let viewport = Viewport { x: 0.0, y: 0.0, width: 800.0, height: 600.0, zoom: 1.5 };
    bob.update_presence(PresencePatch {
        viewport: Some(viewport),
        ..PresencePatch::default()
    })
    .unwrap();

    wait_for(&mut updates, |e| match e {
        SessionEvent::PresenceUpdate(users) => users
            .iter()
            .any(|p| p.user.id == "bob" && p.viewport == Some(viewport)),
        _ => false,
    })
    .await;
}

#[tokio::test]
async fn test_idle_and_away_transitions() {
    let port = start_test_server().await;
    let alice = session(port, "room-idle", "alice");
    let mut sleepy = session_config(port, "room-idle", "bob");
    sleepy.idle_timeout_ms = 200;
    sleepy.idle_check_interval_ms = 50;
    let bob = CollaborationSession::new(sleepy);
    let mut seen = alice.subscribe_to([
        EventKind::UserJoined,
        EventKind::UserLeft,
        EventKind::PresenceUpdate,
    ]);

    alice.connect().await.unwrap();
    bob.connect().await.unwrap();
    wait_for(&mut seen, joined("bob")).await;

    wait_for(&mut seen, |e| match e {
        SessionEvent::PresenceUpdate(users) => users
            .iter()
            .any(|p| p.user.id == "bob" && p.status == PresenceStatus::Idle),
        _ => false,
    })
    .await;

    assert_eq!(
        wait_for(&mut seen, |e| e.kind() == EventKind::UserLeft).await,
        SessionEvent::UserLeft("bob".into())
    );

    // Any activity brings bob back.
    bob.send_cursor(CursorPosition::new(4.0, 4.0)).unwrap();
    wait_for(&mut seen, joined("bob")).await;
}

#[tokio::test]
async fn test_heartbeats_keep_presence_fresh() {
    let port = start_test_server().await;
    let alice = session(port, "room-heartbeat", "alice");
    let mut chatty = session_config(port, "room-heartbeat", "bob");
    chatty.heartbeat_interval_ms = 50;
    let bob = CollaborationSession::new(chatty);
    let mut updates = alice.subscribe_to([EventKind::UserJoined, EventKind::PresenceUpdate]);

    alice.connect().await.unwrap();
    bob.connect().await.unwrap();
    wait_for(&mut updates, joined("bob")).await;

    // Each heartbeat refreshes bob's entry and yields a snapshot.
    for _ in 0..3 {
        wait_for(&mut updates, |e| e.kind() == EventKind::PresenceUpdate).await;
    }
    assert_eq!(alice.active_users().await.unwrap().len(), 1);
}

// ─── Cursors, selections, comments ───────────────────────────────

#[tokio::test]
async fn test_cursor_and_selection_relay() {
    let port = start_test_server().await;
    let alice = session(port, "room-cursor", "alice");
    let bob = session(port, "room-cursor", "bob");
    let mut seen = alice.subscribe_to([EventKind::UserJoined, EventKind::Cursor, EventKind::Selection]);

    alice.connect().await.unwrap();
    bob.connect().await.unwrap();
    wait_for(&mut seen, joined("bob")).await;

    bob.send_cursor(CursorPosition::new(120.5, 88.0)).unwrap();
    bob.send_selection(&Selection::new("fixture-12", 2, 7)).unwrap();

    assert_eq!(
        wait_for(&mut seen, |e| e.kind() == EventKind::Cursor).await,
        SessionEvent::Cursor {
            user_id: "bob".into(),
            position: CursorPosition::new(120.5, 88.0),
        }
    );
    assert_eq!(
        wait_for(&mut seen, |e| e.kind() == EventKind::Selection).await,
        SessionEvent::Selection {
            user_id: "bob".into(),
            selection: Selection::new("fixture-12", 2, 7),
        }
    );
}

#[tokio::test]
async fn test_comment_thread_round_trip() {
    let port = start_test_server().await;
    let alice = session(port, "room-comments", "alice");
    let bob = session(port, "room-comments", "bob");
    let mut alice_sees = alice.subscribe_to([EventKind::UserJoined, EventKind::Comment]);
    let mut bob_sees = bob.subscribe_to([EventKind::Comment]);

    alice.connect().await.unwrap();
    bob.connect().await.unwrap();
    wait_for(&mut alice_sees, joined("bob")).await;

    let root = alice
        .send_comment(CommentDraft::new("PPFD too low on bench 3").on_element("bench-3"))
        .unwrap();
    let received = match wait_for(&mut bob_sees, |_| true).await {
        SessionEvent::Comment(comment) => comment,
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(received, root);

    let replied = bob.reply_to_comment(&received, "Adding a fixture").unwrap();
    match wait_for(&mut alice_sees, |e| e.kind() == EventKind::Comment).await {
        SessionEvent::Comment(thread) => {
            assert_eq!(thread.id, root.id);
            assert_eq!(thread.replies.len(), 1);
            assert_eq!(thread.replies[0].user_id, "bob");
        }
        other => panic!("unexpected {other:?}"),
    }

    bob.resolve_comment(&replied).unwrap();
    wait_for(&mut alice_sees, |e| matches!(e, SessionEvent::Comment(c) if c.resolved)).await;

    let comments = alice.comments().await.unwrap();
    assert_eq!(comments.len(), 1);
    assert!(comments[0].resolved);
}

#[tokio::test]
async fn test_documents_do_not_leak_presence() {
    let port = start_test_server().await;
    let alice = session(port, "room-a", "alice");
    let bob = session(port, "room-b", "bob");
    let mut alice_sees = alice.subscribe_to([EventKind::UserJoined, EventKind::Cursor]);

    alice.connect().await.unwrap();
    bob.connect().await.unwrap();
    bob.send_cursor(CursorPosition::new(1.0, 1.0)).unwrap();

    let leaked = timeout(Duration::from_millis(300), alice_sees.recv()).await;
    assert!(leaked.is_err(), "event crossed documents: {leaked:?}");
}
