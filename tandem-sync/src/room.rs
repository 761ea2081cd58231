//! Room lifecycle: single-owner task, tickets, and the load state
//! machine.
//!
//! One tokio task exclusively owns a document's [`SyncServer`]. Every
//! interaction goes through a bounded command queue, so the task's
//! serial drain order is the document's op order and the engine never
//! needs a lock:
//!
//! ```text
//!  handle.connect() ──┐
//!  handle.submit()  ──┤  mpsc::channel(queue_capacity)
//!  handle.status()  ──┼────────────────────────────────► room task
//!  handle.load()    ──┘         (oneshot replies           │
//!                                for control calls)    SyncServer
//! ```
//!
//! Tickets bridge out-of-band handshakes (an HTTP exchange, a spawned
//! viewer) to sessions: `create_ticket` reserves an actor and a session
//! key, `start_browser_session` redeems the ticket exactly once.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications,
//! Chapter 8 (The Trouble with Distributed Systems)

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use tandem_store::Json;

use crate::mutation::MutationRegistry;
use crate::persist::{PersistError, PersistenceAdapter, SnapshotEntry};
use crate::protocol::{Actor, ClientMsg};
use crate::server::{ServerStats, SyncServer};
use crate::socket::{SessionSocket, CLOSE_NORMAL};

/// Room configuration.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Command queue capacity; senders wait when the queue is full.
    pub queue_capacity: usize,
    /// Cap on issued-but-unredeemed tickets; `create_ticket` refuses
    /// past it.
    pub max_pending_tickets: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            max_pending_tickets: 1024,
        }
    }
}

impl RoomConfig {
    /// Small limits for tests.
    pub fn for_testing() -> Self {
        Self {
            queue_capacity: 16,
            max_pending_tickets: 8,
        }
    }
}

/// Why a room handle call failed.
#[derive(Debug, Error)]
pub enum RoomError {
    /// The room task has stopped; no further commands can run.
    #[error("room is closed")]
    Closed,
    /// The ticket was never issued or was already redeemed.
    #[error("unknown or already-redeemed ticket")]
    InvalidTicket,
    /// Too many issued-but-unredeemed tickets.
    #[error("pending ticket limit reached")]
    TicketLimit,
    /// The persistence adapter failed.
    #[error("persistence failed: {0}")]
    Persist(#[from] PersistError),
}

/// Where the room is in its load lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    /// No snapshot loaded yet (or the last load failed / was unloaded).
    Initial = 0,
    /// A load is in flight.
    Loading = 1,
    /// The snapshot is in the engine.
    Loaded = 2,
}

impl LoadState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => LoadState::Initial,
            1 => LoadState::Loading,
            _ => LoadState::Loaded,
        }
    }
}

/// A reserved identity awaiting its session.
#[derive(Debug, Clone, PartialEq)]
pub struct Ticket {
    /// Actor the redeeming session will speak as.
    pub actor: Actor,
    /// One-time session key; presenting it redeems the ticket.
    pub session_key: String,
    /// Server clock when the ticket was issued.
    pub server_clock: u64,
}

/// Point-in-time room readout.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomStatus {
    /// Current server clock.
    pub server_clock: u64,
    /// Live sessions.
    pub session_count: usize,
    /// Issued but unredeemed tickets.
    pub pending_tickets: usize,
    /// Engine counters.
    pub stats: ServerStats,
}

enum RoomCmd {
    Connect {
        socket: Arc<dyn SessionSocket>,
        reply: oneshot::Sender<(Actor, String)>,
    },
    CreateTicket {
        actor: Option<Actor>,
        reply: oneshot::Sender<Result<Ticket, RoomError>>,
    },
    StartSession {
        session_key: String,
        socket: Arc<dyn SessionSocket>,
        reply: oneshot::Sender<Result<Actor, RoomError>>,
    },
    EndSession {
        session_key: String,
        code: u16,
        reason: String,
        reply: oneshot::Sender<bool>,
    },
    /// Fire-and-forget: outcomes surface only on session sockets.
    Inbound {
        session_key: String,
        msg: ClientMsg,
    },
    Bootstrap {
        entries: Vec<SnapshotEntry>,
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<SnapshotEntry>>,
    },
    Data {
        reply: oneshot::Sender<Json>,
    },
    Status {
        reply: oneshot::Sender<RoomStatus>,
    },
    Shutdown,
}

/// Everything the room task owns.
struct RoomState {
    room_id: String,
    server: SyncServer,
    /// Pending tickets keyed by session key.
    tickets: HashMap<String, Ticket>,
    /// Refuse new tickets once `tickets` holds this many.
    max_pending_tickets: usize,
}

impl RoomState {
    async fn run(mut self, mut rx: mpsc::Receiver<RoomCmd>) {
        while let Some(cmd) = rx.recv().await {
            if !self.handle(cmd) {
                break;
            }
        }
        self.server.close_all_sessions(CLOSE_NORMAL, "room closed");
        log::info!("room {} stopped", self.room_id);
    }

    /// Handle one command; `false` stops the task.
    fn handle(&mut self, cmd: RoomCmd) -> bool {
        match cmd {
            RoomCmd::Connect { socket, reply } => {
                let _ = reply.send(self.server.connect(socket));
            }
            RoomCmd::CreateTicket { actor, reply } => {
                let result = if self.tickets.len() >= self.max_pending_tickets {
                    log::warn!(
                        "room {}: ticket refused, {} pending",
                        self.room_id,
                        self.tickets.len()
                    );
                    Err(RoomError::TicketLimit)
                } else {
                    let actor = match actor {
                        Some(actor) => {
                            self.server.reserve_actor(actor);
                            actor
                        }
                        None => self.server.allocate_actor(),
                    };
                    let ticket = Ticket {
                        actor,
                        session_key: Uuid::new_v4().to_string(),
                        server_clock: self.server.server_clock(),
                    };
                    log::debug!("room {}: ticket issued for actor {}", self.room_id, actor);
                    self.tickets.insert(ticket.session_key.clone(), ticket.clone());
                    Ok(ticket)
                };
                let _ = reply.send(result);
            }
            RoomCmd::StartSession {
                session_key,
                socket,
                reply,
            } => {
                let result = match self.tickets.remove(&session_key) {
                    Some(ticket) => {
                        self.server.register_session(ticket.actor, session_key, socket);
                        Ok(ticket.actor)
                    }
                    None => {
                        log::warn!("room {}: rejected unknown ticket", self.room_id);
                        Err(RoomError::InvalidTicket)
                    }
                };
                let _ = reply.send(result);
            }
            RoomCmd::EndSession {
                session_key,
                code,
                reason,
                reply,
            } => {
                let _ = reply.send(self.server.end_session(&session_key, code, &reason));
            }
            RoomCmd::Inbound { session_key, msg } => match msg {
                ClientMsg::Op { op, op_id } => {
                    self.server.handle_op(&session_key, &op, op_id);
                }
                ClientMsg::CatchUp {} => {
                    self.server.handle_catch_up(&session_key);
                }
            },
            RoomCmd::Bootstrap { entries, reply } => {
                self.server
                    .bootstrap(entries.into_iter().map(SnapshotEntry::into_cell));
                let _ = reply.send(());
            }
            RoomCmd::Snapshot { reply } => {
                let entries = self
                    .server
                    .dump()
                    .into_iter()
                    .map(SnapshotEntry::from_cell)
                    .collect();
                let _ = reply.send(entries);
            }
            RoomCmd::Data { reply } => {
                let _ = reply.send(self.server.data());
            }
            RoomCmd::Status { reply } => {
                let _ = reply.send(RoomStatus {
                    server_clock: self.server.server_clock(),
                    session_count: self.server.session_count(),
                    pending_tickets: self.tickets.len(),
                    stats: self.server.stats(),
                });
            }
            RoomCmd::Shutdown => return false,
        }
        true
    }
}

/// Handle to one room. Clone-free by design: share it behind an `Arc`.
pub struct RoomSessionManager {
    room_id: String,
    cmd_tx: mpsc::Sender<RoomCmd>,
    adapter: Arc<dyn PersistenceAdapter>,
    load_state: AtomicU8,
    /// Serializes load/unload so the adapter's `load` runs once per
    /// transition.
    load_gate: Mutex<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RoomSessionManager {
    /// Spawn the room task and return its handle. Call inside a tokio
    /// runtime.
    pub fn new(
        room_id: impl Into<String>,
        mutations: Arc<MutationRegistry>,
        adapter: Arc<dyn PersistenceAdapter>,
        config: RoomConfig,
    ) -> Self {
        let room_id = room_id.into();
        let (cmd_tx, cmd_rx) = mpsc::channel(config.queue_capacity);
        let state = RoomState {
            room_id: room_id.clone(),
            server: SyncServer::new(mutations),
            tickets: HashMap::new(),
            max_pending_tickets: config.max_pending_tickets,
        };
        let task = tokio::spawn(state.run(cmd_rx));
        log::info!(
            "room {} started (queue capacity {})",
            room_id,
            config.queue_capacity
        );
        Self {
            room_id,
            cmd_tx,
            adapter,
            load_state: AtomicU8::new(LoadState::Initial as u8),
            load_gate: Mutex::new(()),
            task: Mutex::new(Some(task)),
        }
    }

    /// The room's identifier.
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Where the room is in its load lifecycle.
    pub fn loading_state(&self) -> LoadState {
        LoadState::from_u8(self.load_state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: LoadState) {
        self.load_state.store(state as u8, Ordering::SeqCst);
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> RoomCmd,
    ) -> Result<T, RoomError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| RoomError::Closed)?;
        rx.await.map_err(|_| RoomError::Closed)
    }

    // ────────────────────────────────────────────────────────────────
    // Load lifecycle
    // ────────────────────────────────────────────────────────────────

    /// Bring the snapshot into the engine.
    ///
    /// Safe to call repeatedly and concurrently: callers that arrive
    /// while a load is in flight wait for it, and the adapter's `load`
    /// runs exactly once per transition out of `Initial`. A failed load
    /// leaves the room in `Initial`.
    pub async fn load(&self) -> Result<(), RoomError> {
        if self.loading_state() == LoadState::Loaded {
            return Ok(());
        }
        let _gate = self.load_gate.lock().await;
        if self.loading_state() == LoadState::Loaded {
            return Ok(());
        }

        self.set_state(LoadState::Loading);
        let result = match self.adapter.load() {
            Ok(entries) => {
                log::info!(
                    "room {}: loaded {} cells from the adapter",
                    self.room_id,
                    entries.len()
                );
                self.request(|reply| RoomCmd::Bootstrap { entries, reply }).await
            }
            Err(err) => Err(RoomError::Persist(err)),
        };
        match result {
            Ok(()) => {
                self.set_state(LoadState::Loaded);
                Ok(())
            }
            Err(err) => {
                self.set_state(LoadState::Initial);
                log::warn!("room {}: load failed: {}", self.room_id, err);
                Err(err)
            }
        }
    }

    /// Persist the document and return the room to `Initial`; the next
    /// `load` re-reads the adapter. A room that never finished loading
    /// has nothing of its own to save and leaves the stored snapshot
    /// untouched.
    pub async fn unload(&self) -> Result<(), RoomError> {
        let _gate = self.load_gate.lock().await;
        if self.loading_state() == LoadState::Loaded {
            self.persist().await?;
        }
        self.set_state(LoadState::Initial);
        log::info!("room {}: unloaded", self.room_id);
        Ok(())
    }

    /// Hand the full document to the persistence adapter.
    pub async fn persist(&self) -> Result<(), RoomError> {
        let entries = self.snapshot().await?;
        self.adapter.save(&entries)?;
        log::info!("room {}: persisted {} cells", self.room_id, entries.len());
        Ok(())
    }

    // ────────────────────────────────────────────────────────────────
    // Sessions
    // ────────────────────────────────────────────────────────────────

    /// Auto-allocate an actor and start a session for it.
    pub async fn connect(
        &self,
        socket: Arc<dyn SessionSocket>,
    ) -> Result<(Actor, String), RoomError> {
        self.request(|reply| RoomCmd::Connect { socket, reply }).await
    }

    /// Reserve an identity for a session that starts later. Pass an
    /// actor to reconnect as an existing identity. Refuses with
    /// [`RoomError::TicketLimit`] once `max_pending_tickets`
    /// reservations are waiting.
    pub async fn create_ticket(&self, actor: Option<Actor>) -> Result<Ticket, RoomError> {
        self.request(|reply| RoomCmd::CreateTicket { actor, reply }).await?
    }

    /// Redeem a ticket's session key and start its session. Each
    /// ticket redeems exactly once; a repeat is `InvalidTicket`.
    pub async fn start_browser_session(
        &self,
        session_key: impl Into<String>,
        socket: Arc<dyn SessionSocket>,
    ) -> Result<Actor, RoomError> {
        let session_key = session_key.into();
        self.request(|reply| RoomCmd::StartSession {
            session_key,
            socket,
            reply,
        })
        .await?
    }

    /// Close one session's socket, returning whether it existed.
    pub async fn end_browser_session(
        &self,
        session_key: impl Into<String>,
        code: u16,
        reason: impl Into<String>,
    ) -> Result<bool, RoomError> {
        let session_key = session_key.into();
        let reason = reason.into();
        self.request(|reply| RoomCmd::EndSession {
            session_key,
            code,
            reason,
            reply,
        })
        .await
    }

    /// Queue one inbound client message.
    pub async fn submit(
        &self,
        session_key: impl Into<String>,
        msg: ClientMsg,
    ) -> Result<(), RoomError> {
        self.cmd_tx
            .send(RoomCmd::Inbound {
                session_key: session_key.into(),
                msg,
            })
            .await
            .map_err(|_| RoomError::Closed)
    }

    // ────────────────────────────────────────────────────────────────
    // Inspection & teardown
    // ────────────────────────────────────────────────────────────────

    /// Every visible cell of the document.
    pub async fn snapshot(&self) -> Result<Vec<SnapshotEntry>, RoomError> {
        self.request(|reply| RoomCmd::Snapshot { reply }).await
    }

    /// The visible document as JSON.
    pub async fn data(&self) -> Result<Json, RoomError> {
        self.request(|reply| RoomCmd::Data { reply }).await
    }

    /// Clock, session count, ticket count, and engine counters.
    pub async fn status(&self) -> Result<RoomStatus, RoomError> {
        self.request(|reply| RoomCmd::Status { reply }).await
    }

    /// Stop the room task after it drains what is already queued, then
    /// wait for it. Sessions are closed with the normal close code.
    /// Idempotent.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(RoomCmd::Shutdown).await;
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            if handle.await.is_err() {
                log::warn!("room {}: task ended abnormally", self.room_id);
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────
// Registry
// ────────────────────────────────────────────────────────────────────

/// Maps room ids to shared room handles, creating rooms on demand.
pub struct RoomRegistry {
    mutations: Arc<MutationRegistry>,
    config: RoomConfig,
    adapters: Box<dyn Fn(&str) -> Arc<dyn PersistenceAdapter> + Send + Sync>,
    rooms: RwLock<HashMap<String, Arc<RoomSessionManager>>>,
}

impl RoomRegistry {
    /// A registry that builds each room's adapter through `adapters`.
    pub fn new(
        mutations: Arc<MutationRegistry>,
        config: RoomConfig,
        adapters: impl Fn(&str) -> Arc<dyn PersistenceAdapter> + Send + Sync + 'static,
    ) -> Self {
        Self {
            mutations,
            config,
            adapters: Box::new(adapters),
            rooms: RwLock::new(HashMap::new()),
        }
    }

    /// The shared handle for a room, creating it on first use.
    pub async fn get_or_create(&self, room_id: &str) -> Arc<RoomSessionManager> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(room_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring the write lock.
        if let Some(room) = rooms.get(room_id) {
            return room.clone();
        }

        let adapter = (self.adapters)(room_id);
        let room = Arc::new(RoomSessionManager::new(
            room_id,
            self.mutations.clone(),
            adapter,
            self.config.clone(),
        ));
        rooms.insert(room_id.to_string(), room.clone());
        room
    }

    /// The room's handle, if it exists.
    pub async fn get(&self, room_id: &str) -> Option<Arc<RoomSessionManager>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Persist and stop a room, removing it from the registry. Returns
    /// whether the room existed; a persist failure still stops the
    /// room.
    pub async fn close_room(&self, room_id: &str) -> Result<bool, RoomError> {
        let room = self.rooms.write().await.remove(room_id);
        match room {
            Some(room) => {
                Self::stop_room(room).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove a room that has no live sessions, persisting and
    /// stopping it. Returns whether a room was removed.
    pub async fn remove_if_empty(&self, room_id: &str) -> Result<bool, RoomError> {
        let room = {
            let mut rooms = self.rooms.write().await;
            let empty = match rooms.get(room_id) {
                Some(room) => room.status().await?.session_count == 0,
                None => false,
            };
            if empty {
                rooms.remove(room_id)
            } else {
                None
            }
        };
        match room {
            Some(room) => {
                Self::stop_room(room).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Persist first, then stop; a persist failure still stops the
    /// room and surfaces afterwards. Rooms that never reached `Loaded`
    /// are stopped without saving, keeping the stored snapshot intact.
    async fn stop_room(room: Arc<RoomSessionManager>) -> Result<(), RoomError> {
        let persisted = if room.loading_state() == LoadState::Loaded {
            room.persist().await
        } else {
            Ok(())
        };
        room.shutdown().await;
        persisted
    }

    /// Number of live rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Ids of all live rooms.
    pub async fn room_ids(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
