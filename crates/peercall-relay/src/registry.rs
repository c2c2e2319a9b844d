//! Identity → connection registry.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Outbox of one WebSocket connection.
pub type Outbox = mpsc::Sender<String>;

/// Tracks which connection currently answers for each identity.
pub struct Registry {
    /// Map of identity → Registration
    entries: Arc<RwLock<HashMap<String, Registration>>>,
}

#[derive(Clone)]
pub struct Registration {
    pub connection: Uuid,
    pub outbox: Outbox,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub registered: usize,
    pub oldest_registration: Option<DateTime<Utc>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Bind `id` to a connection. Returns the connection it replaced, if any.
    pub async fn register(&self, id: &str, connection: Uuid, outbox: Outbox) -> Option<Uuid> {
        let registration = Registration {
            connection,
            outbox,
            registered_at: Utc::now(),
        };
        self.entries
            .write()
            .await
            .insert(id.to_string(), registration)
            .map(|old| old.connection)
            .filter(|old| *old != connection)
    }

    /// Remove `id` only while it still belongs to `connection`.
    pub async fn unregister(&self, id: &str, connection: Uuid) -> bool {
        let mut entries = self.entries.write().await;
        if entries.get(id).is_some_and(|r| r.connection == connection) {
            entries.remove(id);
            true
        } else {
            false
        }
    }

    pub async fn lookup(&self, id: &str) -> Option<Registration> {
        self.entries.read().await.get(id).cloned()
    }

    pub async fn stats(&self) -> RegistryStats {
        let entries = self.entries.read().await;
        RegistryStats {
            registered: entries.len(),
            oldest_registration: entries.values().map(|r| r.registered_at).min(),
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
