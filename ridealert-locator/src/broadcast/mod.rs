//! Real-time fan-out of corrected fixes
//!
//! [`BroadcastHub`] keeps a registry of live connections keyed by
//! [`ScopeKey`] and delivers every published [`CorrectedFix`] to each
//! connection subscribed under any of the fix's scope keys, once per
//! connection.
//!
//! Every connection owns a bounded queue (a `tokio::sync::broadcast` channel
//! with a single receiver). When the queue is full the oldest undelivered fix
//! is overwritten, so `publish` never waits on a slow consumer. Draining the
//! queue into the actual socket is the job of [`forward_to_sink`], which runs
//! in the connection's own task.

mod forward;

pub use forward::{forward_to_sink, ForwardEnd};

use ridealert_common::{CorrectedFix, ScopeKey};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

/// Identity of one live connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Hub registration errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
    #[error("Connection {0} is already subscribed")]
    AlreadySubscribed(ConnectionId),

    #[error("Subscription needs at least one scope")]
    NoScopes,
}

/// Token for removing a subscription
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    connection: ConnectionId,
}

impl SubscriptionHandle {
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }
}

/// Counters reported by `/health`
#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    pub connections: usize,
    pub scope_keys: usize,
    pub published: u64,
    pub delivered: u64,
}

struct Connection {
    scopes: Vec<ScopeKey>,
    tx: broadcast::Sender<Arc<CorrectedFix>>,
}

#[derive(Default)]
struct Registry {
    by_scope: HashMap<ScopeKey, HashSet<ConnectionId>>,
    connections: HashMap<ConnectionId, Connection>,
}

impl Registry {
    fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        let connection = self.connections.remove(&id)?;
        for scope in &connection.scopes {
            if let Some(ids) = self.by_scope.get_mut(scope) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.by_scope.remove(scope);
                }
            }
        }
        Some(connection)
    }
}

struct HubInner {
    registry: RwLock<Registry>,
    queue_capacity: usize,
    published: AtomicU64,
    delivered: AtomicU64,
}

/// Subscription registry plus fan-out dispatcher
///
/// Cheap to clone; every clone shares the same registry.
#[derive(Clone)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl BroadcastHub {
    /// `queue_capacity` bounds each connection's outbound queue (minimum 1)
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                registry: RwLock::new(Registry::default()),
                queue_capacity: queue_capacity.max(1),
                published: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        match self.inner.registry.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        match self.inner.registry.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register `connection` under `scopes`
    ///
    /// Scopes are fixed for the connection's lifetime. Dropping the returned
    /// [`Subscriber`] unsubscribes it.
    pub fn subscribe(
        &self,
        connection: ConnectionId,
        scopes: Vec<ScopeKey>,
    ) -> Result<Subscriber, HubError> {
        let mut scopes = scopes;
        scopes.sort();
        scopes.dedup();
        if scopes.is_empty() {
            return Err(HubError::NoScopes);
        }

        let (tx, rx) = broadcast::channel(self.inner.queue_capacity);

        {
            let mut registry = self.write();
            if registry.connections.contains_key(&connection) {
                return Err(HubError::AlreadySubscribed(connection));
            }
            for scope in &scopes {
                registry
                    .by_scope
                    .entry(scope.clone())
                    .or_default()
                    .insert(connection);
            }
            registry.connections.insert(
                connection,
                Connection {
                    scopes: scopes.clone(),
                    tx,
                },
            );
        }

        info!(
            connection_id = %connection,
            scopes = ?scopes.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "Subscriber connected"
        );

        Ok(Subscriber {
            handle: SubscriptionHandle { connection },
            rx,
            hub: self.clone(),
            dropped: 0,
        })
    }

    /// Remove a subscription; returns whether it was still registered
    ///
    /// Idempotent. Safe to call while a publish is in flight: the publish
    /// either reached the connection's queue already or skips it.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let removed = self.write().remove(handle.connection).is_some();
        if removed {
            info!(connection_id = %handle.connection, "Subscriber disconnected");
        }
        removed
    }

    /// Deliver `fix` to every matching connection; returns how many got it
    ///
    /// Never blocks on a consumer. A connection whose receiver is gone is
    /// unsubscribed.
    pub fn publish(&self, fix: &CorrectedFix) -> usize {
        self.inner.published.fetch_add(1, Ordering::Relaxed);

        // snapshot targets, then send without holding the registry lock
        let targets: Vec<(ConnectionId, broadcast::Sender<Arc<CorrectedFix>>)> = {
            let registry = self.read();
            let mut seen = HashSet::new();
            let mut targets = Vec::new();
            for key in fix.scope_keys() {
                let Some(ids) = registry.by_scope.get(&key) else {
                    continue;
                };
                for id in ids {
                    if seen.insert(*id) {
                        if let Some(connection) = registry.connections.get(id) {
                            targets.push((*id, connection.tx.clone()));
                        }
                    }
                }
            }
            targets
        };

        if targets.is_empty() {
            return 0;
        }

        let event = Arc::new(fix.clone());
        let mut delivered = 0;
        let mut dead = Vec::new();
        for (id, tx) in targets {
            match tx.send(event.clone()) {
                Ok(_) => delivered += 1,
                Err(_) => dead.push(id),
            }
        }

        if !dead.is_empty() {
            let mut registry = self.write();
            for id in dead {
                if registry.remove(id).is_some() {
                    debug!(connection_id = %id, "Removed subscriber with closed queue");
                }
            }
        }

        self.inner
            .delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.read().connections.len()
    }

    pub fn is_subscribed(&self, connection: ConnectionId) -> bool {
        self.read().connections.contains_key(&connection)
    }

    pub fn stats(&self) -> HubStats {
        let registry = self.read();
        HubStats {
            connections: registry.connections.len(),
            scope_keys: registry.by_scope.len(),
            published: self.inner.published.load(Ordering::Relaxed),
            delivered: self.inner.delivered.load(Ordering::Relaxed),
        }
    }
}

/// Receiving end of one subscription
///
/// Unsubscribes itself when dropped.
pub struct Subscriber {
    handle: SubscriptionHandle,
    rx: broadcast::Receiver<Arc<CorrectedFix>>,
    hub: BroadcastHub,
    dropped: u64,
}

impl Subscriber {
    pub fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }

    /// Fixes overwritten in the queue before this subscriber read them
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Next queued fix; `None` once the subscription has been removed and
    /// the queue is drained
    pub async fn recv(&mut self) -> Option<Arc<CorrectedFix>> {
        loop {
            match self.rx.recv().await {
                Ok(fix) => return Some(fix),
                Err(broadcast::error::RecvError::Lagged(skipped)) => self.note_lag(skipped),
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`Subscriber::recv`]
    pub fn try_recv(&mut self) -> Option<Arc<CorrectedFix>> {
        loop {
            match self.rx.try_recv() {
                Ok(fix) => return Some(fix),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => self.note_lag(skipped),
                Err(_) => return None,
            }
        }
    }

    fn note_lag(&mut self, skipped: u64) {
        self.dropped += skipped;
        debug!(
            connection_id = %self.handle.connection,
            skipped,
            "Subscriber queue full, oldest fixes dropped"
        );
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.hub.unsubscribe(&self.handle);
    }
}
