//! Connection registry and event fan-out.
//!
//! ```text
//!                        ┌──────────── Registry (one RwLock) ─────────────┐
//!  register_connection ─►│ connections: ConnectionId → Connection          │
//!                        │ sessions:    (user, session) → ConnectionId     │
//!                        │ by_user:     UserId → {ConnectionId}            │
//!                        │ by_workspace: WorkspaceId → {ConnectionId}      │
//!                        └────────────────────────────────────────────────┘
//!  publish(event) ─► audience (under read lock) ─► sink.send() per connection
//!                                                  (lock released first)
//!                 ─► recent-event ring buffer ─► typed handlers
//! ```
//!
//! A failed send affects only that connection. Direct messages to users
//! without a live connection go to a bounded per-user [`OfflineQueue`].

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::config::BusConfig;
use crate::error::TransportError;
use crate::ids::{ConnectionId, SessionId, SessionIdentity, UserId, WorkspaceId};
use crate::offline::OfflineQueue;
use crate::protocol::{CollaborationEvent, EventKind, OutboundMessage};

/// Outbound half of a connection.
pub trait MessageSink: Send + Sync {
    /// Hand over a message without waiting.
    fn send(&self, message: Arc<OutboundMessage>) -> Result<(), TransportError>;
}

impl MessageSink for mpsc::Sender<Arc<OutboundMessage>> {
    fn send(&self, message: Arc<OutboundMessage>) -> Result<(), TransportError> {
        self.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Full,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }
}

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Callback run after an event of a given kind has been delivered.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &CollaborationEvent) -> Result<(), HandlerError>;
}

impl<F> EventHandler for F
where
    F: Fn(&CollaborationEvent) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, event: &CollaborationEvent) -> Result<(), HandlerError> {
        self(event)
    }
}

struct Connection {
    identity: SessionIdentity,
    sink: Arc<dyn MessageSink>,
    connected_at: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    workspaces: HashSet<WorkspaceId>,
}

/// Read-only view of a registered connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub identity: SessionIdentity,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub workspaces: Vec<WorkspaceId>,
}

impl Connection {
    fn info(&self, id: ConnectionId) -> ConnectionInfo {
        ConnectionInfo {
            id,
            identity: self.identity.clone(),
            connected_at: self.connected_at,
            last_seen: self.last_seen,
            workspaces: self.workspaces.iter().copied().collect(),
        }
    }
}

/// Result of removing a connection.
#[derive(Debug, Clone)]
pub struct Unregistered {
    pub connection: ConnectionInfo,
    /// Whether the user still has other live connections.
    pub user_still_connected: bool,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    connections: HashMap<ConnectionId, Connection>,
    sessions: HashMap<(UserId, SessionId), ConnectionId>,
    by_user: HashMap<UserId, HashSet<ConnectionId>>,
    by_workspace: HashMap<WorkspaceId, HashSet<ConnectionId>>,
}

impl Registry {
    /// Remove a connection from every index in one pass.
    fn remove(&mut self, id: ConnectionId) -> Option<Unregistered> {
        let conn = self.connections.remove(&id)?;
        let user = &conn.identity.user_id;

        let session_key = (user.clone(), conn.identity.session_id.clone());
        if self.sessions.get(&session_key) == Some(&id) {
            self.sessions.remove(&session_key);
        }

        for ws in &conn.workspaces {
            if let Some(subscribers) = self.by_workspace.get_mut(ws) {
                subscribers.remove(&id);
                if subscribers.is_empty() {
                    self.by_workspace.remove(ws);
                }
            }
        }

        let user_still_connected = match self.by_user.get_mut(user) {
            Some(conns) => {
                conns.remove(&id);
                if conns.is_empty() {
                    self.by_user.remove(user);
                    false
                } else {
                    true
                }
            }
            None => false,
        };

        Some(Unregistered {
            connection: conn.info(id),
            user_still_connected,
        })
    }

    fn sinks_of_user(&self, user: &UserId) -> Vec<(ConnectionId, Arc<dyn MessageSink>)> {
        self.by_user
            .get(user)
            .into_iter()
            .flatten()
            .filter_map(|id| self.connections.get(id).map(|c| (*id, c.sink.clone())))
            .collect()
    }

    /// Subscribers of `workspaces`, deduplicated, plus or minus the actor.
    fn audience(
        &self,
        workspaces: &[WorkspaceId],
        actor: &UserId,
        include_actor: bool,
    ) -> Vec<(ConnectionId, Arc<dyn MessageSink>)> {
        let mut ids: HashSet<ConnectionId> = workspaces
            .iter()
            .filter_map(|ws| self.by_workspace.get(ws))
            .flatten()
            .copied()
            .collect();

        let actor_conns = self.by_user.get(actor);
        if include_actor {
            ids.extend(actor_conns.into_iter().flatten().copied());
        } else if let Some(own) = actor_conns {
            ids.retain(|id| !own.contains(id));
        }

        ids.into_iter()
            .filter_map(|id| self.connections.get(&id).map(|c| (id, c.sink.clone())))
            .collect()
    }
}

/// Outcome of one publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// A message for every connection of one user.
#[derive(Debug, Clone)]
pub struct DirectMessage {
    pub target: UserId,
    pub message: OutboundMessage,
    /// Queue for later if the user has no live connection.
    pub delivery_required: bool,
    /// Queue lifetime; falls back to the bus default.
    pub ttl: Option<Duration>,
}

impl DirectMessage {
    pub fn new(target: UserId, message: OutboundMessage) -> Self {
        Self {
            target,
            message,
            delivery_required: false,
            ttl: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.delivery_required = true;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectOutcome {
    /// Delivered to this many connections.
    Delivered(usize),
    Queued,
    Dropped,
}

/// Snapshot of bus counters.
#[derive(Debug, Clone, Default)]
pub struct BusStats {
    pub connections: usize,
    pub users: usize,
    pub workspaces: usize,
    pub events_published: u64,
    pub deliveries: u64,
    pub delivery_failures: u64,
    pub direct_queued: u64,
    pub offline_dropped: u64,
    pub handler_failures: u64,
}

#[derive(Default)]
struct AtomicBusStats {
    events_published: AtomicU64,
    deliveries: AtomicU64,
    delivery_failures: AtomicU64,
    direct_queued: AtomicU64,
    offline_dropped: AtomicU64,
    handler_failures: AtomicU64,
}

/// The event bus. See the module docs.
pub struct EventBus {
    config: BusConfig,
    registry: RwLock<Registry>,
    offline: Mutex<HashMap<UserId, OfflineQueue<Arc<OutboundMessage>>>>,
    recent: Mutex<VecDeque<CollaborationEvent>>,
    handlers: RwLock<HashMap<EventKind, Vec<Arc<dyn EventHandler>>>>,
    stats: AtomicBusStats,
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        let recent_capacity = config.recent_events_capacity.min(4096);
        Self {
            config,
            registry: RwLock::new(Registry::default()),
            offline: Mutex::new(HashMap::new()),
            recent: Mutex::new(VecDeque::with_capacity(recent_capacity)),
            handlers: RwLock::new(HashMap::new()),
            stats: AtomicBusStats::default(),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    // ─── Connections ──────────────────────────────────────────────────

    /// Register a connection and flush the user's offline queue into it.
    ///
    /// A second registration for the same `(user, session)` replaces the
    /// first one.
    pub async fn register_connection(
        &self,
        identity: SessionIdentity,
        sink: Arc<dyn MessageSink>,
    ) -> ConnectionId {
        let user = identity.user_id.clone();
        // Held until the flush is done; `send_direct` re-checks the registry
        // under the same lock, so nothing is queued behind the flush.
        let mut offline = self.offline.lock().await;
        let id = {
            let mut registry = self.registry.write().await;
            registry.next_id += 1;
            let id = ConnectionId(registry.next_id);

            let session_key = (user.clone(), identity.session_id.clone());
            if let Some(previous) = registry.sessions.get(&session_key).copied() {
                registry.remove(previous);
                log::info!("{previous} replaced by {id} for session {}", identity.session_id);
            }

            let now = Utc::now();
            registry.connections.insert(
                id,
                Connection {
                    identity,
                    sink: sink.clone(),
                    connected_at: now,
                    last_seen: now,
                    workspaces: HashSet::new(),
                },
            );
            registry.sessions.insert(session_key, id);
            registry.by_user.entry(user.clone()).or_default().insert(id);
            id
        };

        let flushed = Self::flush_offline(&mut offline, &user, sink.as_ref());
        drop(offline);
        if flushed > 0 {
            log::debug!("Flushed {flushed} offline messages to {user} on {id}");
        }
        log::debug!("Registered {id} for {user}");
        id
    }

    fn flush_offline(
        offline: &mut HashMap<UserId, OfflineQueue<Arc<OutboundMessage>>>,
        user: &UserId,
        sink: &dyn MessageSink,
    ) -> usize {
        let Some(queue) = offline.get_mut(user) else {
            return 0;
        };

        let mut sent = 0;
        while let Some(message) = queue.front().cloned() {
            if let Err(e) = sink.send(message) {
                // The rest stays queued, TTLs intact, for the next connection.
                log::warn!("Offline flush to {user} interrupted: {e}");
                break;
            }
            queue.pop_front();
            sent += 1;
        }
        if queue.is_empty() {
            offline.remove(user);
        }
        sent
    }

    /// Remove a connection from every index. Returns `None` for unknown or
    /// already removed handles.
    pub async fn unregister_connection(&self, id: ConnectionId) -> Option<Unregistered> {
        let removed = self.registry.write().await.remove(id);
        if let Some(removed) = &removed {
            log::debug!(
                "Unregistered {id} for {} ({} workspaces)",
                removed.connection.identity.user_id,
                removed.connection.workspaces.len()
            );
        }
        removed
    }

    pub async fn connection(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.registry
            .read()
            .await
            .connections
            .get(&id)
            .map(|c| c.info(id))
    }

    pub async fn connections_of_user(&self, user: &UserId) -> Vec<ConnectionId> {
        self.registry
            .read()
            .await
            .by_user
            .get(user)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn is_online(&self, user: &UserId) -> bool {
        self.registry.read().await.by_user.contains_key(user)
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.read().await.connections.len()
    }

    /// Record activity on a connection.
    pub async fn touch(&self, id: ConnectionId) -> bool {
        match self.registry.write().await.connections.get_mut(&id) {
            Some(conn) => {
                conn.last_seen = Utc::now();
                true
            }
            None => false,
        }
    }

    // ─── Subscriptions ────────────────────────────────────────────────

    pub async fn subscribe_to_workspace(&self, id: ConnectionId, ws: WorkspaceId) -> bool {
        let mut registry = self.registry.write().await;
        let Some(conn) = registry.connections.get_mut(&id) else {
            return false;
        };
        conn.workspaces.insert(ws);
        registry.by_workspace.entry(ws).or_default().insert(id);
        true
    }

    pub async fn unsubscribe_from_workspace(&self, id: ConnectionId, ws: WorkspaceId) -> bool {
        let mut registry = self.registry.write().await;
        let Some(conn) = registry.connections.get_mut(&id) else {
            return false;
        };
        let was_subscribed = conn.workspaces.remove(&ws);
        if let Some(subscribers) = registry.by_workspace.get_mut(&ws) {
            subscribers.remove(&id);
            if subscribers.is_empty() {
                registry.by_workspace.remove(&ws);
            }
        }
        was_subscribed
    }

    /// Subscribe every live connection of `user`. Returns how many.
    pub async fn subscribe_user(&self, user: &UserId, ws: WorkspaceId) -> usize {
        let mut registry = self.registry.write().await;
        let ids: Vec<ConnectionId> = registry
            .by_user
            .get(user)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        for id in &ids {
            if let Some(conn) = registry.connections.get_mut(id) {
                conn.workspaces.insert(ws);
            }
        }
        if !ids.is_empty() {
            registry.by_workspace.entry(ws).or_default().extend(ids.iter().copied());
        }
        ids.len()
    }

    /// Unsubscribe every live connection of `user`. Returns how many.
    pub async fn unsubscribe_user(&self, user: &UserId, ws: WorkspaceId) -> usize {
        let mut registry = self.registry.write().await;
        let ids: Vec<ConnectionId> = registry
            .by_user
            .get(user)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        let mut removed = 0;
        for id in &ids {
            if let Some(conn) = registry.connections.get_mut(id) {
                if conn.workspaces.remove(&ws) {
                    removed += 1;
                }
            }
        }
        if let Some(subscribers) = registry.by_workspace.get_mut(&ws) {
            subscribers.retain(|id| !ids.contains(id));
            if subscribers.is_empty() {
                registry.by_workspace.remove(&ws);
            }
        }
        removed
    }

    pub async fn subscribers(&self, ws: WorkspaceId) -> Vec<ConnectionId> {
        self.registry
            .read()
            .await
            .by_workspace
            .get(&ws)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    // ─── Publishing ───────────────────────────────────────────────────

    /// Deliver to the event's workspace subscribers and every connection
    /// of the actor.
    pub async fn publish(&self, event: CollaborationEvent) -> DeliveryReport {
        let workspaces: Vec<WorkspaceId> = event.workspace_id.into_iter().collect();
        self.publish_to(event, &workspaces, true).await
    }

    /// Like [`publish`](Self::publish) but skips the actor's connections.
    pub async fn publish_excluding_actor(&self, event: CollaborationEvent) -> DeliveryReport {
        let workspaces: Vec<WorkspaceId> = event.workspace_id.into_iter().collect();
        self.publish_to(event, &workspaces, false).await
    }

    /// Deliver once to the union of several workspaces' subscribers,
    /// excluding the actor.
    pub async fn publish_to_workspaces(
        &self,
        event: CollaborationEvent,
        workspaces: &[WorkspaceId],
    ) -> DeliveryReport {
        self.publish_to(event, workspaces, false).await
    }

    async fn publish_to(
        &self,
        event: CollaborationEvent,
        workspaces: &[WorkspaceId],
        include_actor: bool,
    ) -> DeliveryReport {
        let audience = self
            .registry
            .read()
            .await
            .audience(workspaces, &event.actor, include_actor);

        let message = Arc::new(OutboundMessage::from_event(&event));
        let report = self.deliver(&audience, &message);
        self.stats.events_published.fetch_add(1, Ordering::Relaxed);
        log::trace!(
            "{} by {}: {}/{} delivered",
            event.kind,
            event.actor,
            report.delivered,
            report.attempted
        );

        self.remember(event.clone()).await;
        self.run_handlers(&event).await;
        report
    }

    fn deliver(
        &self,
        audience: &[(ConnectionId, Arc<dyn MessageSink>)],
        message: &Arc<OutboundMessage>,
    ) -> DeliveryReport {
        let mut report = DeliveryReport {
            attempted: audience.len(),
            ..DeliveryReport::default()
        };
        for (id, sink) in audience {
            match sink.send(message.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    log::warn!("Delivery of {} to {id} failed: {e}", message.message_id);
                }
            }
        }
        self.stats
            .deliveries
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.stats
            .delivery_failures
            .fetch_add(report.failed as u64, Ordering::Relaxed);
        report
    }

    /// Deliver to every connection of one user, queueing if required.
    pub async fn send_direct(&self, direct: DirectMessage) -> DirectOutcome {
        let sinks = self.registry.read().await.sinks_of_user(&direct.target);
        let message = Arc::new(direct.message);
        let report = self.deliver(&sinks, &message);
        if report.delivered > 0 {
            return DirectOutcome::Delivered(report.delivered);
        }
        if !direct.delivery_required {
            return DirectOutcome::Dropped;
        }

        let ttl = direct.ttl.or(self
            .config
            .offline_message_ttl_secs
            .map(Duration::from_secs));
        let mut offline = self.offline.lock().await;
        // A connection registered since the first lookup has already flushed.
        let sinks = self.registry.read().await.sinks_of_user(&direct.target);
        if !sinks.is_empty() {
            let report = self.deliver(&sinks, &message);
            if report.delivered > 0 {
                return DirectOutcome::Delivered(report.delivered);
            }
        }
        let queue = offline
            .entry(direct.target.clone())
            .or_insert_with(|| OfflineQueue::new(self.config.offline_queue_capacity));
        if let Some(evicted) = queue.enqueue(message, ttl) {
            self.stats.offline_dropped.fetch_add(1, Ordering::Relaxed);
            log::debug!(
                "Offline queue for {} full, dropped {}",
                direct.target,
                evicted.message_id
            );
        }
        self.stats.direct_queued.fetch_add(1, Ordering::Relaxed);
        DirectOutcome::Queued
    }

    /// Deliver to exactly one connection.
    pub async fn send_to_connection(
        &self,
        id: ConnectionId,
        message: OutboundMessage,
    ) -> Result<(), TransportError> {
        let sink = self
            .registry
            .read()
            .await
            .connections
            .get(&id)
            .map(|c| c.sink.clone())
            .ok_or(TransportError::Closed)?;
        sink.send(Arc::new(message))
    }

    pub async fn offline_queue_len(&self, user: &UserId) -> usize {
        self.offline
            .lock()
            .await
            .get(user)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    // ─── Handlers & diagnostics ───────────────────────────────────────

    /// Handlers run in registration order.
    pub async fn register_handler(&self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .await
            .entry(kind)
            .or_default()
            .push(handler);
    }

    async fn run_handlers(&self, event: &CollaborationEvent) {
        let handlers = match self.handlers.read().await.get(&event.kind) {
            Some(list) => list.clone(),
            None => return,
        };
        for handler in handlers {
            let outcome = catch_unwind(AssertUnwindSafe(|| handler.handle(event)));
            let failure = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(_) => "handler panicked".to_string(),
            };
            self.stats.handler_failures.fetch_add(1, Ordering::Relaxed);
            log::error!("Handler for {} failed on event {}: {failure}", event.kind, event.id);
        }
    }

    async fn remember(&self, event: CollaborationEvent) {
        let capacity = self.config.recent_events_capacity;
        if capacity == 0 {
            return;
        }
        let mut recent = self.recent.lock().await;
        while recent.len() >= capacity {
            recent.pop_front();
        }
        recent.push_back(event);
    }

    /// Up to `limit` most recent events, oldest first.
    pub async fn recent_events(&self, limit: usize) -> Vec<CollaborationEvent> {
        let recent = self.recent.lock().await;
        let skip = recent.len().saturating_sub(limit);
        recent.iter().skip(skip).cloned().collect()
    }

    pub async fn stats(&self) -> BusStats {
        let registry = self.registry.read().await;
        BusStats {
            connections: registry.connections.len(),
            users: registry.by_user.len(),
            workspaces: registry.by_workspace.len(),
            events_published: self.stats.events_published.load(Ordering::Relaxed),
            deliveries: self.stats.deliveries.load(Ordering::Relaxed),
            delivery_failures: self.stats.delivery_failures.load(Ordering::Relaxed),
            direct_queued: self.stats.direct_queued.load(Ordering::Relaxed),
            offline_dropped: self.stats.offline_dropped.load(Ordering::Relaxed),
            handler_failures: self.stats.handler_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn identity(user: &str, session: &str) -> SessionIdentity {
        SessionIdentity::new(user, session, "laptop")
    }

    fn bus() -> EventBus {
        EventBus::new(BusConfig::default())
    }

    fn channel() -> (
        Arc<mpsc::Sender<Arc<OutboundMessage>>>,
        mpsc::Receiver<Arc<OutboundMessage>>,
    ) {
        let (tx, rx) = mpsc::channel(256);
        (Arc::new(tx), rx)
    }

    /// Always fails, counting attempts.
    #[derive(Default)]
    struct BrokenSink {
        attempts: AtomicUsize,
    }

    impl MessageSink for BrokenSink {
        fn send(&self, _message: Arc<OutboundMessage>) -> Result<(), TransportError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::Closed)
        }
    }

    fn event(kind: EventKind, actor: &str, ws: WorkspaceId) -> CollaborationEvent {
        CollaborationEvent::new(kind, UserId::new(actor), Some(ws))
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers_and_actor() {
        let bus = bus();
        let ws = WorkspaceId::new();
        let (alice_tx, mut alice_rx) = channel();
        let (bob_tx, mut bob_rx) = channel();
        let (carol_tx, mut carol_rx) = channel();

        let _alice = bus.register_connection(identity("alice", "s1"), alice_tx).await;
        let bob = bus.register_connection(identity("bob", "s2"), bob_tx).await;
        let _carol = bus.register_connection(identity("carol", "s3"), carol_tx).await;
        bus.subscribe_to_workspace(bob, ws).await;

        let report = bus.publish(event(EventKind::Edit, "alice", ws)).await;
        assert_eq!(report, DeliveryReport { attempted: 2, delivered: 2, failed: 0 });

        assert_eq!(bob_rx.recv().await.unwrap().event_kind(), Some(EventKind::Edit));
        assert!(alice_rx.try_recv().is_ok());
        assert!(carol_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_k_subscribers_k_attempts_with_failure_isolation() {
        let bus = bus();
        let ws = WorkspaceId::new();
        let broken = Arc::new(BrokenSink::default());
        let mut receivers = Vec::new();

        for i in 0..4 {
            let (tx, rx) = channel();
            let id = bus
                .register_connection(identity(&format!("user{i}"), "s"), tx)
                .await;
            bus.subscribe_to_workspace(id, ws).await;
            receivers.push(rx);
        }
        let bad = bus.register_connection(identity("broken", "s"), broken.clone()).await;
        bus.subscribe_to_workspace(bad, ws).await;

        let report = bus.publish_excluding_actor(event(EventKind::Update, "system", ws)).await;
        assert_eq!(report.attempted, 5);
        assert_eq!(report.delivered, 4);
        assert_eq!(report.failed, 1);
        assert_eq!(broken.attempts.load(Ordering::SeqCst), 1);
        for rx in &mut receivers {
            assert!(rx.try_recv().is_ok());
        }
        assert_eq!(bus.stats().await.delivery_failures, 1);
    }

    #[tokio::test]
    async fn test_excluding_actor() {
        let bus = bus();
        let ws = WorkspaceId::new();
        let (tx, mut rx) = channel();
        let alice = bus.register_connection(identity("alice", "s1"), tx).await;
        bus.subscribe_to_workspace(alice, ws).await;

        let report = bus.publish_excluding_actor(event(EventKind::Typing, "alice", ws)).await;
        assert_eq!(report.attempted, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unregister_cleans_every_index() {
        let bus = bus();
        let ws1 = WorkspaceId::new();
        let ws2 = WorkspaceId::new();
        let (tx, _rx) = channel();
        let conn = bus.register_connection(identity("alice", "s1"), tx).await;
        bus.subscribe_to_workspace(conn, ws1).await;
        bus.subscribe_to_workspace(conn, ws2).await;

        let removed = bus.unregister_connection(conn).await.unwrap();
        assert_eq!(removed.connection.workspaces.len(), 2);
        assert!(!removed.user_still_connected);
        assert!(bus.subscribers(ws1).await.is_empty());
        assert!(bus.subscribers(ws2).await.is_empty());
        assert!(!bus.is_online(&UserId::new("alice")).await);

        let report = bus.publish(event(EventKind::Edit, "bob", ws1)).await;
        assert_eq!(report.attempted, 0);
        assert!(bus.unregister_connection(conn).await.is_none());
    }

    #[tokio::test]
    async fn test_same_session_replaces_connection() {
        let bus = bus();
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();
        let first = bus.register_connection(identity("alice", "s1"), tx1).await;
        let second = bus.register_connection(identity("alice", "s1"), tx2).await;

        assert_ne!(first, second);
        assert!(bus.connection(first).await.is_none());
        assert_eq!(bus.connections_of_user(&UserId::new("alice")).await, vec![second]);

        let (tx3, _rx3) = channel();
        bus.register_connection(identity("alice", "s2"), tx3).await;
        assert_eq!(bus.connection_count().await, 2);
    }

    #[tokio::test]
    async fn test_offline_queue_keeps_most_recent() {
        let bus = EventBus::new(BusConfig {
            offline_queue_capacity: 100,
            ..BusConfig::default()
        });
        let bob = UserId::new("bob");
        for i in 0..150 {
            let message = OutboundMessage::direct(None, &bob, json!({ "seq": i }));
            let outcome = bus.send_direct(DirectMessage::new(bob.clone(), message).required()).await;
            assert_eq!(outcome, DirectOutcome::Queued);
        }
        assert_eq!(bus.offline_queue_len(&bob).await, 100);
        assert_eq!(bus.stats().await.offline_dropped, 50);

        let (tx, mut rx) = channel();
        bus.register_connection(identity("bob", "s1"), tx).await;
        let first = rx.recv().await.unwrap();
        assert_eq!(first.payload["seq"], 50);
        let mut last = first;
        while let Ok(message) = rx.try_recv() {
            last = message;
        }
        assert_eq!(last.payload["seq"], 149);
        assert_eq!(bus.offline_queue_len(&bob).await, 0);
    }

    #[tokio::test]
    async fn test_direct_not_required_is_dropped() {
        let bus = bus();
        let bob = UserId::new("bob");
        let message = OutboundMessage::direct(None, &bob, json!({}));
        assert_eq!(
            bus.send_direct(DirectMessage::new(bob.clone(), message)).await,
            DirectOutcome::Dropped
        );
        assert_eq!(bus.offline_queue_len(&bob).await, 0);
    }

    #[tokio::test]
    async fn test_direct_to_all_user_connections() {
        let bus = bus();
        let (tx1, mut rx1) = channel();
        let (tx2, mut rx2) = channel();
        bus.register_connection(identity("bob", "phone"), tx1).await;
        bus.register_connection(identity("bob", "laptop"), tx2).await;

        let bob = UserId::new("bob");
        let message = OutboundMessage::direct(Some(UserId::new("alice")), &bob, json!({"hi": 1}));
        assert_eq!(
            bus.send_direct(DirectMessage::new(bob, message).required()).await,
            DirectOutcome::Delivered(2)
        );
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_all_sends_failing_falls_back_to_queue() {
        let bus = bus();
        bus.register_connection(identity("bob", "s1"), Arc::new(BrokenSink::default()))
            .await;
        let bob = UserId::new("bob");
        let message = OutboundMessage::direct(None, &bob, json!({}));
        assert_eq!(
            bus.send_direct(DirectMessage::new(bob.clone(), message).required()).await,
            DirectOutcome::Queued
        );
        assert_eq!(bus.offline_queue_len(&bob).await, 1);
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_message_ttl() {
        let bus = bus();
        let bob = UserId::new("bob");
        let message = OutboundMessage::direct(None, &bob, json!({"seq": 1}));
        bus.send_direct(
            DirectMessage::new(bob.clone(), message)
                .required()
                .with_ttl(Duration::from_millis(20)),
        )
        .await;

        let broken = Arc::new(BrokenSink::default());
        bus.register_connection(identity("bob", "s1"), broken.clone()).await;
        assert_eq!(broken.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(bus.offline_queue_len(&bob).await, 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let (tx, mut rx) = channel();
        bus.register_connection(identity("bob", "s2"), tx).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(bus.offline_queue_len(&bob).await, 0);
    }

    #[tokio::test]
    async fn test_huge_offline_ttl_is_accepted() {
        let bus = EventBus::new(BusConfig {
            offline_message_ttl_secs: Some(u64::MAX),
            ..BusConfig::default()
        });
        let bob = UserId::new("bob");
        let message = OutboundMessage::direct(None, &bob, json!({}));
        assert_eq!(
            bus.send_direct(DirectMessage::new(bob.clone(), message).required()).await,
            DirectOutcome::Queued
        );

        let (tx, mut rx) = channel();
        bus.register_connection(identity("bob", "s1"), tx).await;
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_direct_racing_registration_is_not_stranded() {
        for round in 0..200 {
            let bus = Arc::new(bus());
            let bob = UserId::new("bob");
            let (tx, mut rx) = channel();

            let sender = {
                let bus = bus.clone();
                let bob = bob.clone();
                tokio::spawn(async move {
                    let message = OutboundMessage::direct(None, &bob, json!({ "round": round }));
                    bus.send_direct(DirectMessage::new(bob, message).required()).await
                })
            };
            let registrar = {
                let bus = bus.clone();
                tokio::spawn(async move { bus.register_connection(identity("bob", "s1"), tx).await })
            };
            sender.await.unwrap();
            registrar.await.unwrap();

            assert!(rx.try_recv().is_ok(), "round {round}: message stranded");
            assert_eq!(bus.offline_queue_len(&bob).await, 0);
        }
    }

    #[tokio::test]
    async fn test_handlers_run_in_order_and_failures_are_isolated() {
        let bus = bus();
        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));

        let first = calls.clone();
        bus.register_handler(
            EventKind::Comment,
            Arc::new(move |_: &CollaborationEvent| -> Result<(), HandlerError> {
                first.lock().unwrap().push("first");
                Err("boom".into())
            }),
        )
        .await;
        bus.register_handler(
            EventKind::Comment,
            Arc::new(|_: &CollaborationEvent| -> Result<(), HandlerError> {
                panic!("handler bug")
            }),
        )
        .await;
        let third = calls.clone();
        bus.register_handler(
            EventKind::Comment,
            Arc::new(move |_: &CollaborationEvent| -> Result<(), HandlerError> {
                third.lock().unwrap().push("third");
                Ok(())
            }),
        )
        .await;

        bus.publish(event(EventKind::Comment, "alice", WorkspaceId::new())).await;
        bus.publish(event(EventKind::Edit, "alice", WorkspaceId::new())).await;

        assert_eq!(*calls.lock().unwrap(), vec!["first", "third"]);
        assert_eq!(bus.stats().await.handler_failures, 2);
    }

    #[tokio::test]
    async fn test_recent_events_ring_buffer() {
        let bus = EventBus::new(BusConfig {
            recent_events_capacity: 3,
            ..BusConfig::default()
        });
        let ws = WorkspaceId::new();
        for _ in 0..5 {
            bus.publish(event(EventKind::Cursor, "alice", ws)).await;
        }
        assert_eq!(bus.recent_events(10).await.len(), 3);
        assert_eq!(bus.recent_events(2).await.len(), 2);
        assert_eq!(bus.stats().await.events_published, 5);
    }

    #[tokio::test]
    async fn test_presence_fan_out_deduplicates() {
        let bus = bus();
        let ws1 = WorkspaceId::new();
        let ws2 = WorkspaceId::new();
        let (tx, mut rx) = channel();
        let bob = bus.register_connection(identity("bob", "s"), tx).await;
        bus.subscribe_to_workspace(bob, ws1).await;
        bus.subscribe_to_workspace(bob, ws2).await;

        let presence = CollaborationEvent::new(EventKind::Presence, UserId::new("alice"), None);
        let report = bus.publish_to_workspaces(presence, &[ws1, ws2]).await;
        assert_eq!(report.attempted, 1);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_user_subscription_helpers() {
        let bus = bus();
        let ws = WorkspaceId::new();
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();
        bus.register_connection(identity("alice", "a"), tx1).await;
        bus.register_connection(identity("alice", "b"), tx2).await;
        let alice = UserId::new("alice");

        assert_eq!(bus.subscribe_user(&alice, ws).await, 2);
        assert_eq!(bus.subscribers(ws).await.len(), 2);
        assert_eq!(bus.unsubscribe_user(&alice, ws).await, 2);
        assert!(bus.subscribers(ws).await.is_empty());
    }

    #[tokio::test]
    async fn test_touch_and_send_to_connection() {
        let bus = bus();
        let (tx, mut rx) = channel();
        let conn = bus.register_connection(identity("alice", "s"), tx).await;
        assert!(bus.touch(conn).await);
        bus.send_to_connection(conn, OutboundMessage::error("validation", "bad"))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().payload["code"], "validation");

        bus.unregister_connection(conn).await;
        assert!(!bus.touch(conn).await);
        assert_eq!(
            bus.send_to_connection(conn, OutboundMessage::error("x", "y")).await,
            Err(TransportError::Closed)
        );
    }
}
