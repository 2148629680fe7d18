//! At most one live connection per gateway unique id.

use crate::connection::Connection;
use dashmap::{mapref::entry::Entry, DashMap};
use lora_gs_error::{GSError, GSResult};
use std::sync::Arc;
use tracing::debug;

/// Live connections keyed by gateway unique id.
///
/// Lookups never block behind an install: displacement waits happen outside the
/// map lock.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live connection of the gateway, if any.
    #[inline]
    pub fn get(&self, unique_id: &str) -> Option<Arc<Connection>> {
        self.connections.get(unique_id).map(|c| Arc::clone(c.value()))
    }

    /// Stores `conn` under its unique id, displacing any predecessor.
    ///
    /// A predecessor is disconnected with `NewConnection` and its background
    /// tasks are awaited before the install is retried. No map lock is held
    /// while waiting. Fails with the cause of `conn` if it gets cancelled
    /// meanwhile.
    pub async fn install(&self, conn: &Arc<Connection>) -> GSResult<()> {
        let uid = conn.unique_id().to_string();
        loop {
            let existing = match self.connections.entry(uid.clone()) {
                Entry::Vacant(v) => {
                    v.insert(Arc::clone(conn));
                    return Ok(());
                }
                Entry::Occupied(o) => Arc::clone(o.get()),
            };

            debug!(gateway_uid = %uid, "Displacing existing connection");
            existing.disconnect(GSError::NewConnection);
            tokio::select! {
                _ = conn.context().done() => {
                    return Err(conn.disconnect_cause().cloned().unwrap_or(GSError::Canceled));
                }
                _ = existing.wait_tasks() => {}
            }
            self.remove(&existing);
        }
    }

    /// Removes `conn` if it is still the registered entry for its unique id.
    pub fn remove(&self, conn: &Arc<Connection>) -> bool {
        self.connections
            .remove_if(conn.unique_id(), |_, c| Arc::ptr_eq(c, conn))
            .is_some()
    }

    /// Snapshot of every live connection.
    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.connections.iter().map(|c| Arc::clone(c.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
