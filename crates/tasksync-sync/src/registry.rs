//! Session registry
//!
//! Process-wide table of in-flight sessions. Sync transactions are keyed by
//! [`SessionKey`](tasksync_core::domain::SessionKey), batch runs by user.
//!
//! ```text
//! try_start(key) ──► DashMap::entry ──► Vacant   ──► SessionGuard
//!                                   └─► Occupied ──► None (fail fast)
//!
//! SessionGuard::drop ──► remove(key)     (every exit path, panics included)
//! SessionGuard::finish(ts) ──► history[key] = ts, then drop
//! ```

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use dashmap::{mapref::entry::Entry, DashMap};
use tracing::debug;

use tasksync_core::domain::Timestamp;
use tasksync_telemetry::MetricsRegistry;

/// Concurrent map of active sessions with atomic check-and-insert
///
/// Cloning is cheap and clones share the same table.
pub struct SessionRegistry<K: Eq + Hash, V> {
    kind: &'static str,
    active: Arc<DashMap<K, V>>,
    history: Arc<DashMap<K, Timestamp>>,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl<K: Eq + Hash, V> Clone for SessionRegistry<K, V> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            active: Arc::clone(&self.active),
            history: Arc::clone(&self.history),
            metrics: self.metrics.clone(),
        }
    }
}

impl<K, V> SessionRegistry<K, V>
where
    K: Eq + Hash + Clone + fmt::Display,
{
    /// Creates an empty registry; `kind` labels logs and the session gauge
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            active: Arc::new(DashMap::new()),
            history: Arc::new(DashMap::new()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Registers `key` unless it is already running
    ///
    /// The returned guard releases the entry when dropped.
    pub fn try_start(&self, key: K, value: V) -> Option<SessionGuard<K, V>> {
        match self.active.entry(key.clone()) {
            Entry::Occupied(_) => {
                debug!(kind = self.kind, key = %key, "Session already running");
                return None;
            }
            Entry::Vacant(slot) => {
                slot.insert(value);
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.adjust_active_sessions(self.kind, 1);
        }
        debug!(kind = self.kind, key = %key, "Session started");

        Some(SessionGuard {
            key,
            kind: self.kind,
            active: Arc::clone(&self.active),
            history: Arc::clone(&self.history),
            metrics: self.metrics.clone(),
        })
    }

    pub fn is_running(&self, key: &K) -> bool {
        self.active.contains_key(key)
    }

    /// When the last session for `key` finished successfully
    pub fn last_completed(&self, key: &K) -> Option<Timestamp> {
        self.history.get(key).map(|entry| *entry.value())
    }

    /// Number of running sessions
    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

impl<K, V> SessionRegistry<K, V>
where
    K: Eq + Hash + Clone + fmt::Display,
    V: Clone,
{
    /// Value registered for a running session
    pub fn get(&self, key: &K) -> Option<V> {
        self.active.get(key).map(|entry| entry.value().clone())
    }
}

/// Ownership of one registry entry
pub struct SessionGuard<K: Eq + Hash, V> {
    key: K,
    kind: &'static str,
    active: Arc<DashMap<K, V>>,
    history: Arc<DashMap<K, Timestamp>>,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl<K: Eq + Hash, V> SessionGuard<K, V> {
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K: Eq + Hash + Clone, V> SessionGuard<K, V> {
    /// Releases the session, recording `completed_at` as its last completion
    pub fn finish(self, completed_at: Timestamp) {
        self.history.insert(self.key.clone(), completed_at);
    }
}

impl<K: Eq + Hash, V> Drop for SessionGuard<K, V> {
    fn drop(&mut self) {
        if self.active.remove(&self.key).is_some() {
            if let Some(metrics) = &self.metrics {
                metrics.adjust_active_sessions(self.kind, -1);
            }
            debug!(kind = self.kind, "Session released");
        }
    }
}

impl<K: Eq + Hash + fmt::Debug, V> fmt::Debug for SessionGuard<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionGuard")
            .field("kind", &self.kind)
            .field("key", &self.key)
            .finish()
    }
}
