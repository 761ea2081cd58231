//! Room lifecycle integration tests.
//!
//! Verifies:
//! - Concurrent loads read the adapter exactly once
//! - Save/load roundtrip through a fresh room
//! - Unload flushes, releases, and re-reads on the next load
//! - Ticket reconnects keep the actor's clock and id namespace
//! - Duplicate-actor sessions kick the older one
//! - Shutdown and registry close paths
//! - Tearing down a never-loaded room leaves the stored snapshot alone
//!
//! Everything runs in-process over channel sockets.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{timeout, Duration};

use tandem_store::{Entry, NodeId};
use tandem_sync::client::ClientReplica;
use tandem_sync::mutation::MutationRegistry;
use tandem_sync::persist::{MemoryAdapter, PersistenceAdapter, SnapshotEntry};
use tandem_sync::protocol::{Op, ServerMsg};
use tandem_sync::room::{LoadState, RoomConfig, RoomError, RoomRegistry, RoomSessionManager};
use tandem_sync::socket::{ChannelSocket, SocketEvent, CLOSE_KICKED, CLOSE_NORMAL};

// ─── Helpers ─────────────────────────────────────────────────────────

fn room_with(adapter: Arc<MemoryAdapter>) -> Arc<RoomSessionManager> {
    Arc::new(RoomSessionManager::new(
        "lifecycle",
        Arc::new(MutationRegistry::standard()),
        adapter,
        RoomConfig::for_testing(),
    ))
}

async fn next_message(rx: &mut UnboundedReceiver<SocketEvent>) -> ServerMsg {
    match timeout(Duration::from_secs(2), rx.recv()).await {
        Ok(Some(SocketEvent::Message(msg))) => msg,
        other => panic!("expected a server message, got {:?}", other),
    }
}

async fn next_close(rx: &mut UnboundedReceiver<SocketEvent>) -> (u16, String) {
    match timeout(Duration::from_secs(2), rx.recv()).await {
        Ok(Some(SocketEvent::Closed { code, reason })) => (code, reason),
        other => panic!("expected a close event, got {:?}", other),
    }
}

/// Stamp and submit `setChild("root", key, value)` for this replica.
async fn write_cell(
    room: &RoomSessionManager,
    replica: &mut ClientReplica,
    key: &str,
    value: serde_json::Value,
) {
    let msg = replica
        .prepare_op(Op::new(
            "setChild",
            vec![json!("root"), json!(key), value],
        ))
        .unwrap();
    let session_key = replica.session_key().unwrap().to_string();
    room.submit(session_key, msg).await.unwrap();
}

// ─── Loading ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_concurrent_loads_read_the_adapter_once() {
    let adapter = Arc::new(MemoryAdapter::with_entries(vec![SnapshotEntry::new(
        "root",
        "title",
        Entry::value(json!("seeded")),
    )]));
    let room = room_with(adapter.clone());
    assert_eq!(room.loading_state(), LoadState::Initial);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let room = room.clone();
        handles.push(tokio::spawn(async move { room.load().await }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(adapter.load_count(), 1);
    assert_eq!(room.loading_state(), LoadState::Loaded);
    assert_eq!(
        room.data().await.unwrap(),
        json!({"root": {"title": "seeded"}})
    );
}

#[tokio::test]
async fn test_save_load_roundtrip_across_rooms() {
    let adapter = Arc::new(MemoryAdapter::new());

    // Phase 1: build a document, flush it, drop the room.
    {
        let room = room_with(adapter.clone());
        room.load().await.unwrap();

        let (socket, mut rx) = ChannelSocket::pair();
        let mut replica = ClientReplica::new();
        room.connect(socket).await.unwrap();
        replica.handle_server_msg(next_message(&mut rx).await);

        write_cell(&room, &mut replica, "title", json!("survives")).await;
        let child = replica.allocate_node_id().unwrap();
        let msg = replica
            .prepare_op(Op::new(
                "attachChild",
                vec![json!("root"), json!("kid"), json!(child.as_str())],
            ))
            .unwrap();
        room.submit(replica.session_key().unwrap().to_string(), msg)
            .await
            .unwrap();

        room.persist().await.unwrap();
        room.shutdown().await;
    }
    assert_eq!(adapter.save_count(), 1);
    assert!(adapter
        .stored()
        .contains(&SnapshotEntry::new("root", "title", Entry::value(json!("survives")))));

    // Phase 2: a fresh room over the same adapter sees the document.
    {
        let room = room_with(adapter.clone());
        room.load().await.unwrap();
        assert_eq!(
            room.data().await.unwrap(),
            json!({"root": {"title": "survives", "kid": {"$ref": "1:1"}}})
        );
        room.shutdown().await;
    }
}

#[tokio::test]
async fn test_unload_flushes_and_rereads_on_next_load() {
    let adapter = Arc::new(MemoryAdapter::new());
    let room = room_with(adapter.clone());
    room.load().await.unwrap();

    let (socket, mut rx) = ChannelSocket::pair();
    let mut replica = ClientReplica::new();
    room.connect(socket).await.unwrap();
    replica.handle_server_msg(next_message(&mut rx).await);
    write_cell(&room, &mut replica, "phase", json!("one")).await;
    next_message(&mut rx).await;

    room.unload().await.unwrap();
    assert_eq!(room.loading_state(), LoadState::Initial);
    assert_eq!(adapter.save_count(), 1);

    // Someone else rewrites the snapshot while the room is unloaded.
    adapter
        .save(&[SnapshotEntry::new(
            "root",
            "phase",
            Entry::value(json!("two")),
        )])
        .unwrap();

    room.load().await.unwrap();
    assert_eq!(adapter.load_count(), 2);
    assert_eq!(room.data().await.unwrap(), json!({"root": {"phase": "two"}}));
    room.shutdown().await;
}

// ─── Tickets & sessions ──────────────────────────────────────────────

#[tokio::test]
async fn test_ticket_reconnect_continues_the_clock_sequence() {
    let room = room_with(Arc::new(MemoryAdapter::new()));
    let mut replica = ClientReplica::new();

    // First visit.
    let (socket, mut rx1) = ChannelSocket::pair();
    let (actor, key1) = room.connect(socket).await.unwrap();
    replica.handle_server_msg(next_message(&mut rx1).await);
    write_cell(&room, &mut replica, "visit", json!(1)).await;
    replica.handle_server_msg(next_message(&mut rx1).await);
    let before = replica.allocate_node_id().unwrap();

    room.end_browser_session(key1, CLOSE_NORMAL, "tab closed")
        .await
        .unwrap();
    assert_eq!(next_close(&mut rx1).await.0, CLOSE_NORMAL);

    // Come back as the same actor through a ticket.
    let ticket = room.create_ticket(Some(actor)).await.unwrap();
    assert_eq!(ticket.actor, actor);
    let (socket, mut rx2) = ChannelSocket::pair();
    let resumed = room
        .start_browser_session(ticket.session_key, socket)
        .await
        .unwrap();
    assert_eq!(resumed, actor);
    replica.handle_server_msg(next_message(&mut rx2).await);
    assert_eq!(replica.actor(), Some(actor));

    // Same id namespace, next clock, no duplicate suspicion.
    let after = replica.allocate_node_id().unwrap();
    assert_ne!(before, after);
    assert!(after.as_str().starts_with(&format!("{}:", actor)));

    write_cell(&room, &mut replica, "visit", json!(2)).await;
    replica.handle_server_msg(next_message(&mut rx2).await);
    assert_eq!(replica.data(), json!({"root": {"visit": 2}}));

    let status = room.status().await.unwrap();
    assert_eq!(status.stats.ops_applied, 2);
    assert_eq!(status.stats.ops_duplicated, 0);
    assert_eq!(status.stats.sessions_kicked, 0);
    room.shutdown().await;
}

#[tokio::test]
async fn test_second_session_for_the_same_actor_kicks_the_first() {
    let room = room_with(Arc::new(MemoryAdapter::new()));

    let (socket, mut rx1) = ChannelSocket::pair();
    let (actor, key1) = room.connect(socket).await.unwrap();
    next_message(&mut rx1).await;

    let ticket = room.create_ticket(Some(actor)).await.unwrap();
    let (socket, mut rx2) = ChannelSocket::pair();
    room.start_browser_session(ticket.session_key.clone(), socket)
        .await
        .unwrap();
    next_message(&mut rx2).await;

    let (code, reason) = next_close(&mut rx1).await;
    assert_eq!(code, CLOSE_KICKED);
    assert!(reason.contains("superseded"), "unexpected reason: {reason}");

    let status = room.status().await.unwrap();
    assert_eq!(status.session_count, 1);
    assert_eq!(status.stats.sessions_kicked, 1);

    // The dead session key no longer reaches the engine.
    let mut stale = ClientReplica::new();
    stale.handle_server_msg(ServerMsg::first(actor, key1.clone(), 0));
    let msg = stale
        .prepare_op(Op::new(
            "setChild",
            vec![json!("root"), json!("ghost"), json!(true)],
        ))
        .unwrap();
    room.submit(key1, msg).await.unwrap();
    room.status().await.unwrap();
    assert_eq!(room.data().await.unwrap(), json!({}));
    room.shutdown().await;
}

#[tokio::test]
async fn test_redeemed_and_unknown_tickets_are_rejected() {
    let room = room_with(Arc::new(MemoryAdapter::new()));
    let ticket = room.create_ticket(None).await.unwrap();

    let (socket, mut rx) = ChannelSocket::pair();
    room.start_browser_session(ticket.session_key.clone(), socket)
        .await
        .unwrap();
    next_message(&mut rx).await;

    let (socket, _rx) = ChannelSocket::pair();
    let again = room.start_browser_session(ticket.session_key, socket).await;
    assert!(matches!(again, Err(RoomError::InvalidTicket)));

    let (socket, _rx) = ChannelSocket::pair();
    let unknown = room.start_browser_session("no-such-ticket", socket).await;
    assert!(matches!(unknown, Err(RoomError::InvalidTicket)));
    room.shutdown().await;
}

#[tokio::test]
async fn test_end_browser_session_reports_existence() {
    let room = room_with(Arc::new(MemoryAdapter::new()));
    let (socket, mut rx) = ChannelSocket::pair();
    let (_actor, key) = room.connect(socket).await.unwrap();
    next_message(&mut rx).await;

    let ended = room
        .end_browser_session(key.clone(), CLOSE_NORMAL, "done for today")
        .await
        .unwrap();
    assert!(ended);
    let (code, reason) = next_close(&mut rx).await;
    assert_eq!(code, CLOSE_NORMAL);
    assert_eq!(reason, "done for today");

    let ended = room
        .end_browser_session(key, CLOSE_NORMAL, "again")
        .await
        .unwrap();
    assert!(!ended);
    room.shutdown().await;
}

// ─── Teardown ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_shutdown_rejects_further_use() {
    let room = room_with(Arc::new(MemoryAdapter::new()));
    let (socket, mut rx) = ChannelSocket::pair();
    room.connect(socket).await.unwrap();
    next_message(&mut rx).await;

    room.shutdown().await;
    let (code, reason) = next_close(&mut rx).await;
    assert_eq!(code, CLOSE_NORMAL);
    assert_eq!(reason, "room closed");

    let (socket, _rx) = ChannelSocket::pair();
    assert!(matches!(room.connect(socket).await, Err(RoomError::Closed)));
    assert!(matches!(room.status().await, Err(RoomError::Closed)));

    // A second shutdown is a no-op.
    room.shutdown().await;
}

#[tokio::test]
async fn test_registry_close_room_persists_the_document() {
    let adapter = Arc::new(MemoryAdapter::new());
    let factory_adapter = adapter.clone();
    let registry = RoomRegistry::new(
        Arc::new(MutationRegistry::standard()),
        RoomConfig::for_testing(),
        move |_room_id| factory_adapter.clone() as Arc<dyn PersistenceAdapter>,
    );

    let room = registry.get_or_create("alpha").await;
    room.load().await.unwrap();
    let (socket, mut rx) = ChannelSocket::pair();
    let mut replica = ClientReplica::new();
    room.connect(socket).await.unwrap();
    replica.handle_server_msg(next_message(&mut rx).await);
    write_cell(&room, &mut replica, "kept", json!("yes")).await;
    next_message(&mut rx).await;
    drop(room);

    assert!(registry.close_room("alpha").await.unwrap());
    assert_eq!(adapter.save_count(), 1);
    assert_eq!(
        adapter.stored(),
        vec![SnapshotEntry::new(
            NodeId::root(),
            "kept",
            Entry::value(json!("yes")),
        )]
    );
    assert!(registry.get("alpha").await.is_none());
    assert!(!registry.close_room("alpha").await.unwrap());
}

#[tokio::test]
async fn test_never_loaded_room_teardown_keeps_stored_snapshot() {
    let seeded = vec![SnapshotEntry::new(
        "root",
        "title",
        Entry::value(json!("kept")),
    )];

    // Unload a room whose load never ran.
    let adapter = Arc::new(MemoryAdapter::with_entries(seeded.clone()));
    let room = room_with(adapter.clone());
    room.unload().await.unwrap();
    assert_eq!(adapter.save_count(), 0);
    assert_eq!(adapter.stored(), seeded);
    room.shutdown().await;

    // Registry teardown of rooms that only ever issued a ticket.
    let adapter = Arc::new(MemoryAdapter::with_entries(seeded.clone()));
    let factory_adapter = adapter.clone();
    let registry = RoomRegistry::new(
        Arc::new(MutationRegistry::standard()),
        RoomConfig::for_testing(),
        move |_room_id| factory_adapter.clone() as Arc<dyn PersistenceAdapter>,
    );

    let room = registry.get_or_create("alpha").await;
    room.create_ticket(None).await.unwrap();
    drop(room);
    assert!(registry.close_room("alpha").await.unwrap());

    registry.get_or_create("alpha").await;
    assert!(registry.remove_if_empty("alpha").await.unwrap());

    assert_eq!(adapter.save_count(), 0);
    assert_eq!(adapter.stored(), seeded);
}
