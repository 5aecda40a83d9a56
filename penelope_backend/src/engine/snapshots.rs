//! Handles to saved compute states and the engine-side ledger behind them.
//!
//! A [`StateHandle`] is a lease: clones share it, and once the last clone is
//! dropped the issuing engine is told the snapshot may be reclaimed. Engines
//! reclaim lazily, on their next save or load, via [`SnapshotLedger::collect`].

use std::collections::HashMap;
use std::sync::Arc;

use flume::{Receiver, Sender};
use uuid::Uuid;

use crate::error::{PenelopeError, PenelopeResult};

struct Lease {
    id: Uuid,
    released: Sender<Uuid>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        // The engine may already be gone.
        let _ = self.released.send(self.id);
    }
}

/// Opaque snapshot of an engine's working cache.
///
/// Handles are only meaningful to the engine instance that issued them.
#[derive(Clone)]
pub struct StateHandle {
    engine_id: Uuid,
    id: Uuid,
    lease: Arc<Lease>,
}

impl StateHandle {
    pub fn engine_id(&self) -> Uuid {
        self.engine_id
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl PartialEq for StateHandle {
    fn eq(&self, other: &Self) -> bool {
        self.engine_id == other.engine_id && self.id == other.id
    }
}

impl Eq for StateHandle {}

impl std::hash::Hash for StateHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.engine_id.hash(state);
        self.id.hash(state);
    }
}

impl std::fmt::Debug for StateHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateHandle")
            .field("engine_id", &self.engine_id)
            .field("id", &self.id)
            .field("holders", &Arc::strong_count(&self.lease))
            .finish()
    }
}

impl std::fmt::Display for StateHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id, self.engine_id)
    }
}

/// Snapshots an engine has handed out, keyed by handle id.
///
/// `T` is whatever the engine needs to find the snapshot again: the cached
/// prompt for an in-process engine, a slot file number for a server.
pub struct SnapshotLedger<T> {
    engine_id: Uuid,
    live: HashMap<Uuid, T>,
    released_tx: Sender<Uuid>,
    released_rx: Receiver<Uuid>,
}

impl<T> SnapshotLedger<T> {
    pub fn new() -> Self {
        let (released_tx, released_rx) = flume::unbounded();
        Self {
            engine_id: Uuid::new_v4(),
            live: HashMap::new(),
            released_tx,
            released_rx,
        }
    }

    pub fn engine_id(&self) -> Uuid {
        self.engine_id
    }

    pub fn issue(&mut self, value: T) -> StateHandle {
        let id = Uuid::new_v4();
        self.live.insert(id, value);
        StateHandle {
            engine_id: self.engine_id,
            id,
            lease: Arc::new(Lease {
                id,
                released: self.released_tx.clone(),
            }),
        }
    }

    /// Look up a handle, rejecting foreign and reclaimed ones.
    pub fn get(&self, handle: &StateHandle) -> PenelopeResult<&T> {
        if handle.engine_id != self.engine_id {
            return Err(PenelopeError::StateHandleInvalid(format!(
                "{handle} was issued by another engine"
            )));
        }
        self.live
            .get(&handle.id)
            .ok_or_else(|| PenelopeError::StateHandleInvalid(format!("{handle} is stale")))
    }

    /// Forget a snapshot while handles to it may still exist.
    pub fn revoke(&mut self, handle: &StateHandle) -> Option<T> {
        self.live.remove(&handle.id)
    }

    /// Take back every snapshot whose handles have all been dropped.
    pub fn collect(&mut self) -> Vec<T> {
        self.released_rx
            .try_iter()
            .filter_map(|id| self.live.remove(&id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

impl<T> Default for SnapshotLedger<T> {
    fn default() -> Self {
        Self::new()
    }
}
