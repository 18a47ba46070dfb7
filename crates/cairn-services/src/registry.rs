//! Peer registry — the authoritative map of cluster members.
//!
//! Every entry owns an async mutex. Upsert, remove, connection
//! establishment and retirement for one name all run under that lock, so
//! two callers can never race to dial or retire the same peer, and calls
//! for one name are applied in the order they reach the lock.
//!
//! Readers never touch those locks. Each mutation republishes a
//! `PeerSnapshot` into a second map while still holding the entry lock, and
//! `snapshot()` reads only that map. A slow dial therefore never blocks a
//! reader; the reader sees the state from before the dial started.
//!
//! A dial holds its entry lock for up to the connect timeout. An upsert that
//! changes the descriptor, or a removal, arriving while that dial is in
//! flight interrupts it rather than waiting it out.

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{watch, Mutex, Notify};

use cairn_core::{Health, InstanceId, NodeIdentity, PeerDescriptor};

use crate::connection::{ConnectError, ConnectionFactory};

/// Read-only copy of one registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerSnapshot {
    pub name: String,
    pub addr: SocketAddr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<InstanceId>,
    pub health: Health,
    /// A live connection handle is currently held.
    pub connected: bool,
}

impl PeerSnapshot {
    pub fn descriptor(&self) -> PeerDescriptor {
        PeerDescriptor {
            name: self.name.clone(),
            addr: self.addr,
            instance: self.instance,
        }
    }
}

/// What `upsert` did with a sighting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// New entry.
    Inserted,
    /// Existing entry replaced; any held connection was retired.
    Superseded,
    /// Identical descriptor already registered.
    Unchanged,
    /// Sighting of ourselves, or the registry is shut down.
    Ignored,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("peer {0} is not registered")]
    PeerUnknown(String),

    #[error("connecting to peer {name} failed: {source}")]
    ConnectFailed {
        name: String,
        #[source]
        source: ConnectError,
    },

    /// The entry was superseded or removed while the dial was in flight.
    #[error("peer {0} changed while connecting")]
    Interrupted(String),

    #[error("registry is shutting down")]
    ShuttingDown,
}

/// Mutable per-peer state, only touched under its entry lock.
struct Slot<C> {
    /// `None` only between slot creation and the first upsert landing.
    descriptor: Option<PeerDescriptor>,
    conn: Option<C>,
    health: Health,
    /// Set once the entry has left the map. A caller that was waiting on
    /// this lock must look the name up again.
    removed: bool,
}

impl<C> Slot<C> {
    fn vacant() -> Self {
        Self {
            descriptor: None,
            conn: None,
            health: Health::Unknown,
            removed: false,
        }
    }

    fn snapshot(&self) -> Option<PeerSnapshot> {
        self.descriptor.as_ref().map(|d| PeerSnapshot {
            name: d.name.clone(),
            addr: d.addr,
            instance: d.instance,
            health: self.health,
            connected: self.conn.is_some(),
        })
    }
}

struct Entry<C> {
    state: Mutex<Slot<C>>,
    /// Wakes a dial in progress under `state` so a pending change can land.
    interrupt: Notify,
}

impl<C> Entry<C> {
    fn vacant() -> Self {
        Self {
            state: Mutex::new(Slot::vacant()),
            interrupt: Notify::new(),
        }
    }
}

type SharedSlot<C> = Arc<Entry<C>>;

enum Dial<C> {
    Done(Result<C, ConnectError>),
    Interrupted,
    Closed,
}

pub struct PeerRegistry<F: ConnectionFactory> {
    local: Arc<NodeIdentity>,
    factory: F,
    slots: DashMap<String, SharedSlot<F::Conn>>,
    view: DashMap<String, PeerSnapshot>,
    closed: watch::Sender<bool>,
}

impl<F: ConnectionFactory> PeerRegistry<F> {
    pub fn new(local: Arc<NodeIdentity>, factory: F) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            local,
            factory,
            slots: DashMap::new(),
            view: DashMap::new(),
            closed,
        }
    }

    pub fn local(&self) -> &NodeIdentity {
        &self.local
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub fn is_shut_down(&self) -> bool {
        *self.closed.borrow()
    }

    // ── Mutation ──────────────────────────────────────────────────────────────

    /// Insert or supersede the entry for `descriptor.name`.
    ///
    /// An identical descriptor is a no-op. A different address or instance
    /// id retires the held connection before the descriptor is replaced,
    /// and resets health to `unknown`.
    pub async fn upsert(&self, descriptor: PeerDescriptor) -> UpsertOutcome {
        if self.is_shut_down() {
            return UpsertOutcome::Ignored;
        }
        if self.local.is_self(&descriptor) {
            tracing::debug!(peer = %descriptor.name, addr = %descriptor.addr, "ignoring self sighting");
            return UpsertOutcome::Ignored;
        }

        loop {
            let slot = self.slot_or_insert(&descriptor.name);
            let changes = self
                .view
                .get(&descriptor.name)
                .is_some_and(|current| current.descriptor() != descriptor);
            if changes {
                slot.interrupt.notify_waiters();
            }

            let mut entry = slot.state.lock().await;
            if entry.removed {
                continue;
            }
            if self.is_shut_down() {
                self.evict(&descriptor.name, &slot, &mut *entry).await;
                return UpsertOutcome::Ignored;
            }

            let previous = entry.descriptor.clone();
            let outcome = match previous {
                Some(current) if current == descriptor => return UpsertOutcome::Unchanged,
                Some(current) => {
                    tracing::info!(
                        peer = %descriptor.name,
                        old_addr = %current.addr,
                        new_addr = %descriptor.addr,
                        "peer superseded"
                    );
                    if let Some(stale) = entry.conn.take() {
                        self.factory.retire(stale).await;
                    }
                    UpsertOutcome::Superseded
                }
                None => {
                    tracing::info!(peer = %descriptor.name, addr = %descriptor.addr, "peer registered");
                    UpsertOutcome::Inserted
                }
            };

            entry.descriptor = Some(descriptor);
            entry.health = Health::Unknown;
            self.publish(&*entry);
            return outcome;
        }
    }

    /// Delete an entry and retire its connection. Returns whether the
    /// name was registered.
    pub async fn remove(&self, name: &str) -> bool {
        self.remove_matching(name, None).await
    }

    /// Apply a departure announcement. With an instance id, only the
    /// incarnation that announced it is removed; a late departure from a
    /// peer's previous process leaves the restarted one registered.
    pub async fn depart(&self, name: &str, instance: Option<InstanceId>) -> bool {
        self.remove_matching(name, instance).await
    }

    /// Record a keepalive failure: drop the held connection and mark the
    /// peer unreachable. The entry stays registered.
    pub async fn report_failure(&self, name: &str) -> bool {
        let Some(slot) = self.existing_slot(name) else {
            return false;
        };
        let mut entry = slot.state.lock().await;
        if entry.removed || entry.descriptor.is_none() {
            return false;
        }
        if let Some(conn) = entry.conn.take() {
            self.factory.retire(conn).await;
        }
        entry.health = Health::Unreachable;
        self.publish(&*entry);
        tracing::warn!(peer = %name, "peer marked unreachable");
        true
    }

    // ── Connections ───────────────────────────────────────────────────────────

    /// Live connection for `name`, dialing one if none is held or the held
    /// one has died.
    ///
    /// A failed dial marks the peer unreachable but keeps it registered.
    pub async fn connection_for(&self, name: &str) -> Result<F::Conn, RegistryError> {
        if self.is_shut_down() {
            return Err(RegistryError::ShuttingDown);
        }
        let slot = self
            .existing_slot(name)
            .ok_or_else(|| RegistryError::PeerUnknown(name.to_string()))?;
        let mut entry = slot.state.lock().await;
        if entry.removed {
            return Err(RegistryError::PeerUnknown(name.to_string()));
        }
        let addr = match entry.descriptor.as_ref() {
            Some(d) => d.addr,
            None => return Err(RegistryError::PeerUnknown(name.to_string())),
        };
        if let Some(conn) = entry.conn.take() {
            if self.factory.is_live(&conn) {
                entry.conn = Some(conn.clone());
                return Ok(conn);
            }
            tracing::debug!(peer = %name, addr = %addr, "held connection is dead, redialing");
            self.factory.retire(conn).await;
            self.publish(&*entry);
        }

        let interrupted = slot.interrupt.notified();
        let closed = self.closed.subscribe();
        let dialed = tokio::select! {
            biased;
            _ = wait_closed(closed) => Dial::Closed,
            _ = interrupted => Dial::Interrupted,
            result = self.factory.establish(addr) => Dial::Done(result),
        };

        match dialed {
            Dial::Closed => Err(RegistryError::ShuttingDown),
            Dial::Interrupted => {
                tracing::debug!(peer = %name, addr = %addr, "dial interrupted by membership change");
                Err(RegistryError::Interrupted(name.to_string()))
            }
            Dial::Done(Ok(conn)) => {
                entry.conn = Some(conn.clone());
                entry.health = Health::Reachable;
                self.publish(&*entry);
                tracing::info!(peer = %name, addr = %addr, "peer connected");
                Ok(conn)
            }
            Dial::Done(Err(source)) => {
                entry.health = Health::Unreachable;
                self.publish(&*entry);
                tracing::warn!(peer = %name, addr = %addr, error = %source, "peer connect failed");
                Err(RegistryError::ConnectFailed {
                    name: name.to_string(),
                    source,
                })
            }
        }
    }

    // ── Reads ─────────────────────────────────────────────────────────────────

    /// Point-in-time copy of every entry, in no particular order.
    pub fn snapshot(&self) -> Vec<PeerSnapshot> {
        self.view.iter().map(|e| e.value().clone()).collect()
    }

    pub fn get(&self, name: &str) -> Option<PeerSnapshot> {
        self.view.get(name).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.view.len()
    }

    pub fn is_empty(&self) -> bool {
        self.view.is_empty()
    }

    // ── Teardown ──────────────────────────────────────────────────────────────

    /// Stop accepting work, cancel in-flight dials and retire every held
    /// connection. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.closed.send_replace(true) {
            return;
        }

        let slots: Vec<(String, SharedSlot<F::Conn>)> = self
            .slots
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut retired = 0usize;
        for (name, slot) in slots {
            let mut entry = slot.state.lock().await;
            if entry.removed {
                continue;
            }
            if entry.conn.is_some() {
                retired += 1;
            }
            self.evict(&name, &slot, &mut *entry).await;
        }

        tracing::info!(retired, "peer registry shut down");
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn existing_slot(&self, name: &str) -> Option<SharedSlot<F::Conn>> {
        self.slots.get(name).map(|e| e.value().clone())
    }

    fn slot_or_insert(&self, name: &str) -> SharedSlot<F::Conn> {
        self.slots
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Entry::vacant()))
            .value()
            .clone()
    }

    /// Remove `name` unless `instance` names a different incarnation than
    /// the registered one.
    async fn remove_matching(&self, name: &str, instance: Option<InstanceId>) -> bool {
        let Some(slot) = self.existing_slot(name) else {
            return false;
        };
        let applies = self
            .view
            .get(name)
            .is_some_and(|current| same_incarnation(current.instance, instance));
        if applies {
            slot.interrupt.notify_waiters();
        }

        let mut entry = slot.state.lock().await;
        if entry.removed {
            return false;
        }
        let registered = entry.descriptor.as_ref().map(|d| d.instance);
        if let Some(current) = registered {
            if !same_incarnation(current, instance) {
                tracing::debug!(peer = %name, "ignoring departure of a previous instance");
                return false;
            }
        }
        self.evict(name, &slot, &mut *entry).await;
        if registered.is_some() {
            tracing::info!(peer = %name, "peer removed");
        }
        registered.is_some()
    }

    /// Take an entry out of both maps. Caller holds the entry lock.
    ///
    /// The view entry goes first: a replacement slot can only be created
    /// after the map entry below is gone, so its publish always lands after
    /// this removal.
    async fn evict(&self, name: &str, slot: &SharedSlot<F::Conn>, entry: &mut Slot<F::Conn>) {
        entry.removed = true;
        if let Some(conn) = entry.conn.take() {
            self.factory.retire(conn).await;
        }
        self.view.remove(name);
        self.slots.remove_if(name, |_, current| Arc::ptr_eq(current, slot));
    }

    fn publish(&self, entry: &Slot<F::Conn>) {
        if let Some(snapshot) = entry.snapshot() {
            self.view.insert(snapshot.name.clone(), snapshot);
        }
    }
}

/// An unversioned side matches anything.
fn same_incarnation(registered: Option<InstanceId>, leaving: Option<InstanceId>) -> bool {
    match (registered, leaving) {
        (Some(registered), Some(leaving)) => registered == leaving,
        _ => true,
    }
}

/// Resolves once the registry has been shut down.
async fn wait_closed(mut closed: watch::Receiver<bool>) {
    loop {
        let is_closed = *closed.borrow_and_update();
        if is_closed {
            return;
        }
        if closed.changed().await.is_err() {
            // Sender lives as long as the registry; nothing left to wait for.
            std::future::pending::<()>().await;
        }
    }
}
