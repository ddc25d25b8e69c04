//! Connection registry
//!
//! The single source of truth for which connections have joined and under
//! which nickname. Nicknames are free-form and need not be unique; a
//! connection appears at most once.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::debug;

use crate::transport::{ConnectionHandle, ConnectionId};

/// A joined connection and its current nickname
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub connection: ConnectionHandle,
    pub nickname: String,
}

/// Joined connections indexed by connection ID
#[derive(Debug, Default)]
pub struct Registry {
    entries: RwLock<HashMap<ConnectionId, RegistryEntry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or re-join. Returns the nickname this replaced, if any.
    pub async fn register(
        &self,
        connection: &ConnectionHandle,
        nickname: impl Into<String>,
    ) -> Option<String> {
        let nickname = nickname.into();
        let mut entries = self.entries.write().await;
        let previous = entries.insert(
            connection.id(),
            RegistryEntry {
                connection: connection.clone(),
                nickname,
            },
        );
        previous.map(|entry| entry.nickname)
    }

    /// Current nickname of a connection, if it has joined
    pub async fn lookup(&self, id: ConnectionId) -> Option<String> {
        let entries = self.entries.read().await;
        entries.get(&id).map(|entry| entry.nickname.clone())
    }

    /// Remove a connection. Returns the nickname it held right before removal;
    /// removing an absent connection is a no-op.
    pub async fn remove(&self, id: ConnectionId) -> Option<String> {
        let removed = self.entries.write().await.remove(&id);
        if let Some(entry) = &removed {
            debug!(
                "Deregistered {} ({}) as \"{}\"",
                id,
                entry.connection.remote_addr(),
                entry.nickname
            );
        }
        removed.map(|entry| entry.nickname)
    }

    /// Point-in-time copy of every entry
    pub async fn snapshot(&self) -> Vec<RegistryEntry> {
        let entries = self.entries.read().await;
        entries.values().cloned().collect()
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.entries.read().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// All current nicknames, sorted
    pub async fn nicknames(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .read()
            .await
            .values()
            .map(|entry| entry.nickname.clone())
            .collect();
        names.sort();
        names
    }
}
