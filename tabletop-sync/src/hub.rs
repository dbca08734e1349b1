//! Per-room connection hub with bounded, non-blocking fan-out.
//!
//! ```text
//!  HubHandle (cloned per connection)
//!     │ register ─┐
//!     │ unregister┤  bounded mpsc, try_send
//!     │ broadcast ┤
//!     │ direct   ─┘
//!     ▼
//!  Hub::run ── owns HashMap<ClientId, ClientHandle>
//!     │
//!     ├── try_send ──► client queue A ──► writer task A
//!     ├── try_send ──► client queue B ──► writer task B
//!     └── try_send ──► client queue C ──► writer task C
//! ```
//!
//! Nothing on either side of the hub ever waits for room in a queue. A full
//! mailbox drops the request; a full client queue evicts that client (its
//! queue is closed, which ends its writer) while the fan-out carries on.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::{RoomId, UserId};

/// One outbound text frame, shared between every recipient.
pub type Frame = Arc<str>;

/// Opaque identity of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The hub's view of a connection: who it is and where its frames go.
#[derive(Debug)]
pub struct ClientHandle {
    id: ClientId,
    user_id: UserId,
    queue: mpsc::Sender<Frame>,
}

impl ClientHandle {
    /// Create a handle and the receiving end of its outbound queue.
    pub fn new(user_id: UserId, capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (queue, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id: ClientId::new(),
            user_id,
            queue,
        };
        (handle, rx)
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }
}

/// Mailbox capacities.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub register_capacity: usize,
    pub unregister_capacity: usize,
    pub broadcast_capacity: usize,
    pub direct_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            register_capacity: 16,
            unregister_capacity: 16,
            broadcast_capacity: 256,
            direct_capacity: 256,
        }
    }
}

/// Snapshot of hub counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub active_clients: usize,
    pub frames_delivered: u64,
    pub requests_dropped: u64,
    pub clients_evicted: u64,
}

/// Lock-free counters shared by the hub task and its handles.
#[derive(Default)]
struct AtomicHubStats {
    active_clients: AtomicUsize,
    frames_delivered: AtomicU64,
    requests_dropped: AtomicU64,
    clients_evicted: AtomicU64,
}

struct Broadcast {
    except: Option<ClientId>,
    frame: Frame,
}

struct Direct {
    target: ClientId,
    frame: Frame,
}

/// Cloneable sender side of a room's hub.
#[derive(Clone)]
pub struct HubHandle {
    room_id: RoomId,
    register: mpsc::Sender<ClientHandle>,
    unregister: mpsc::Sender<ClientId>,
    broadcast: mpsc::Sender<Broadcast>,
    direct: mpsc::Sender<Direct>,
    stats: Arc<AtomicHubStats>,
}

impl HubHandle {
    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    /// Add a client. Returns false if the request was dropped.
    pub fn register(&self, client: ClientHandle) -> bool {
        self.enqueue("register", &self.register, client)
    }

    /// Remove a client and close its queue. Unknown ids are ignored.
    pub fn unregister(&self, id: ClientId) -> bool {
        self.enqueue("unregister", &self.unregister, id)
    }

    /// Deliver to every registered client.
    pub fn broadcast_all(&self, frame: impl Into<Frame>) -> bool {
        let request = Broadcast {
            except: None,
            frame: frame.into(),
        };
        self.enqueue("broadcast", &self.broadcast, request)
    }

    /// Deliver to every registered client except `sender`.
    pub fn broadcast_from(&self, sender: ClientId, frame: impl Into<Frame>) -> bool {
        let request = Broadcast {
            except: Some(sender),
            frame: frame.into(),
        };
        self.enqueue("broadcast", &self.broadcast, request)
    }

    /// Deliver to one client, if it is still registered.
    pub fn reply_to(&self, target: ClientId, frame: impl Into<Frame>) -> bool {
        let request = Direct {
            target,
            frame: frame.into(),
        };
        self.enqueue("direct", &self.direct, request)
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            active_clients: self.stats.active_clients.load(Ordering::Relaxed),
            frames_delivered: self.stats.frames_delivered.load(Ordering::Relaxed),
            requests_dropped: self.stats.requests_dropped.load(Ordering::Relaxed),
            clients_evicted: self.stats.clients_evicted.load(Ordering::Relaxed),
        }
    }

    fn enqueue<T>(&self, mailbox: &str, tx: &mpsc::Sender<T>, request: T) -> bool {
        match tx.try_send(request) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::warn!("room {}: {mailbox} mailbox full, request dropped", self.room_id);
                self.stats.requests_dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(TrySendError::Closed(_)) => {
                log::warn!("room {}: hub stopped, {mailbox} request dropped", self.room_id);
                self.stats.requests_dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

/// The hub task's state. Only [`Hub::run`] touches the client map.
pub struct Hub {
    room_id: RoomId,
    clients: HashMap<ClientId, ClientHandle>,
    register: mpsc::Receiver<ClientHandle>,
    unregister: mpsc::Receiver<ClientId>,
    broadcast: mpsc::Receiver<Broadcast>,
    direct: mpsc::Receiver<Direct>,
    stats: Arc<AtomicHubStats>,
}

impl Hub {
    /// Build a hub and its handle without starting it.
    pub fn new(room_id: RoomId, config: &HubConfig) -> (Hub, HubHandle) {
        let (register_tx, register) = mpsc::channel(config.register_capacity.max(1));
        let (unregister_tx, unregister) = mpsc::channel(config.unregister_capacity.max(1));
        let (broadcast_tx, broadcast) = mpsc::channel(config.broadcast_capacity.max(1));
        let (direct_tx, direct) = mpsc::channel(config.direct_capacity.max(1));
        let stats = Arc::new(AtomicHubStats::default());

        let hub = Hub {
            room_id,
            clients: HashMap::new(),
            register,
            unregister,
            broadcast,
            direct,
            stats: stats.clone(),
        };
        let handle = HubHandle {
            room_id,
            register: register_tx,
            unregister: unregister_tx,
            broadcast: broadcast_tx,
            direct: direct_tx,
            stats,
        };
        (hub, handle)
    }

    /// Start a hub on the current runtime.
    pub fn spawn(room_id: RoomId, config: &HubConfig) -> HubHandle {
        let (hub, handle) = Self::new(room_id, config);
        tokio::spawn(hub.run());
        handle
    }

    /// Event loop. Runs until every handle has been dropped.
    ///
    /// Mailboxes are polled in a fixed order: registrations first, so one
    /// queued before a broadcast is applied first, then replies ahead of
    /// broadcasts, so a requester's ACK is not held back behind room traffic.
    pub async fn run(mut self) {
        log::debug!("room {}: hub started", self.room_id);
        loop {
            tokio::select! {
                biased;
                Some(client) = self.register.recv() => self.add(client),
                Some(id) = self.unregister.recv() => self.remove(id),
                Some(request) = self.direct.recv() => self.deliver(request),
                Some(request) = self.broadcast.recv() => self.fan_out(request),
                else => break,
            }
        }
        log::debug!("room {}: hub stopped", self.room_id);
    }

    fn add(&mut self, client: ClientHandle) {
        log::debug!(
            "room {}: client {} (user {}) registered",
            self.room_id,
            client.id,
            client.user_id
        );
        self.clients.insert(client.id, client);
        self.update_active();
    }

    fn remove(&mut self, id: ClientId) {
        // Dropping the handle drops the last queue sender, closing the queue.
        if self.clients.remove(&id).is_some() {
            log::debug!("room {}: client {id} unregistered", self.room_id);
            self.update_active();
        }
    }

    fn fan_out(&mut self, request: Broadcast) {
        let mut failed = Vec::new();
        for (id, client) in &self.clients {
            if request.except == Some(*id) {
                continue;
            }
            if !self.push(client, request.frame.clone()) {
                failed.push(*id);
            }
        }
        for id in failed {
            self.evict(id);
        }
    }

    fn deliver(&mut self, request: Direct) {
        let Some(client) = self.clients.get(&request.target) else {
            return;
        };
        if !self.push(client, request.frame) {
            self.evict(request.target);
        }
    }

    fn push(&self, client: &ClientHandle, frame: Frame) -> bool {
        match client.queue.try_send(frame) {
            Ok(()) => {
                self.stats.frames_delivered.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) => {
                log::warn!(
                    "room {}: client {} queue full, disconnecting",
                    self.room_id,
                    client.id
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    fn evict(&mut self, id: ClientId) {
        if self.clients.remove(&id).is_some() {
            self.stats.clients_evicted.fetch_add(1, Ordering::Relaxed);
            self.update_active();
        }
    }

    fn update_active(&self) {
        self.stats
            .active_clients
            .store(self.clients.len(), Ordering::Relaxed);
    }
}

/// A running hub and the number of connections that joined it.
struct RoomEntry {
    hub: HubHandle,
    connections: AtomicUsize,
}

/// Maps room ids to their hubs, starting a hub on first use and dropping it
/// once the last connection has left.
///
/// Removal happens under the write lock and only when the connection count
/// is zero, so a connection that joined through the read path is always
/// counted before the room can go away.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<RoomId, RoomEntry>>,
    config: HubConfig,
}

impl RoomRegistry {
    pub fn new(config: HubConfig) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Get or start the hub for `room_id` and count one more connection.
    /// Every `join` must be paired with a [`leave`](Self::leave).
    pub async fn join(&self, room_id: RoomId) -> HubHandle {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(entry) = rooms.get(&room_id) {
                entry.connections.fetch_add(1, Ordering::SeqCst);
                return entry.hub.clone();
            }
        }

        // Slow path: write lock to create
        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(entry) = rooms.get(&room_id) {
            entry.connections.fetch_add(1, Ordering::SeqCst);
            return entry.hub.clone();
        }

        log::info!("room {room_id}: starting hub");
        let hub = Hub::spawn(room_id, &self.config);
        rooms.insert(
            room_id,
            RoomEntry {
                hub: hub.clone(),
                connections: AtomicUsize::new(1),
            },
        );
        hub
    }

    /// Count one connection out of `room_id`, removing the room when it was
    /// the last. Returns true if the room was removed.
    pub async fn leave(&self, room_id: RoomId) -> bool {
        {
            let rooms = self.rooms.read().await;
            let Some(entry) = rooms.get(&room_id) else {
                return false;
            };
            let _ = entry
                .connections
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        }
        self.remove_if_empty(room_id).await
    }

    /// Drop the room if no connection holds it. The hub task ends once the
    /// handles still held by closing connections are gone.
    pub async fn remove_if_empty(&self, room_id: RoomId) -> bool {
        let mut rooms = self.rooms.write().await;
        let empty = rooms
            .get(&room_id)
            .is_some_and(|entry| entry.connections.load(Ordering::SeqCst) == 0);
        if empty {
            rooms.remove(&room_id);
            log::info!("room {room_id}: last connection left, hub released");
        }
        empty
    }

    /// Connections currently counted in `room_id`.
    pub async fn connections(&self, room_id: RoomId) -> usize {
        self.rooms
            .read()
            .await
            .get(&room_id)
            .map_or(0, |entry| entry.connections.load(Ordering::SeqCst))
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<RoomId> {
        self.rooms.read().await.keys().copied().collect()
    }
}
