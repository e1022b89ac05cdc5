//! Session registry
//!
//! Tracks which party, per namespace, currently owns a live connection.
//! Each party key has its own slot guarded by an async mutex. The relay
//! holds that lock across every operation that must not interleave for a
//! party: login (check, drain queue, register), delivery (live send or
//! enqueue) and logout (unregister, requeue unsent messages).
//!
//! A slot exists while its party is live or some task holds it. Callers
//! hand idle slots back with [`SessionRegistry::release`], so the map is
//! bounded by live parties plus in-flight operations.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tracing::debug;

use super::queue::PartyKey;

/// Sending half of a connection's outbound channel
pub type Outbox = mpsc::UnboundedSender<String>;

/// Receiving half of a connection's outbound channel
pub type Inbox = mpsc::UnboundedReceiver<String>;

/// Handle the registry keeps for a live connection
#[derive(Clone, Debug)]
pub struct SessionHandle {
    conn_id: u64,
    outbox: Outbox,
}

impl SessionHandle {
    /// Wrap a connection's outbox
    pub fn new(conn_id: u64, outbox: Outbox) -> Self {
        SessionHandle { conn_id, outbox }
    }

    /// Identifier of the owning connection
    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }
}

/// Per-party registry entry
#[derive(Debug, Default)]
pub struct Slot {
    live: Option<SessionHandle>,
}

impl Slot {
    /// Whether the party currently has a live connection
    pub fn is_live(&self) -> bool {
        self.live.is_some()
    }

    /// Connection id of the live session, if any
    pub fn live_conn(&self) -> Option<u64> {
        self.live.as_ref().map(SessionHandle::conn_id)
    }

    /// Mark the party live on `handle`
    pub fn register(&mut self, handle: SessionHandle) {
        self.live = Some(handle);
    }

    /// Release the slot if it is owned by `conn_id`
    ///
    /// Returns whether the slot was released.
    pub fn unregister(&mut self, conn_id: u64) -> bool {
        if self.live_conn() == Some(conn_id) {
            self.live = None;
            true
        } else {
            false
        }
    }

    /// Hand a message to the live connection
    ///
    /// Gives the message back if there is no live connection or the
    /// connection is already shutting down.
    pub fn deliver(&self, message: String) -> Result<(), String> {
        match &self.live {
            Some(handle) => handle.outbox.send(message).map_err(|e| e.0),
            None => Err(message),
        }
    }
}

/// Live sessions of all parties in all namespaces
#[derive(Default)]
pub struct SessionRegistry {
    // A slot is only removed while no task holds a clone of it, so every
    // task locking a key at the same time shares one mutex.
    slots: DashMap<PartyKey, Arc<Mutex<Slot>>>,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the slot of `key`, creating it if needed
    pub async fn lock(&self, key: &PartyKey) -> OwnedMutexGuard<Slot> {
        let slot = Arc::clone(self.slots.entry(key.clone()).or_default().value());
        let guard = slot.lock_owned().await;
        debug!(%key, live = guard.is_live(), "Locked session slot");
        guard
    }

    /// Drop the slot of `key` if it is idle
    ///
    /// A slot is idle when it has no live connection and nobody else holds
    /// it. The check runs under the map's entry lock, which `lock` also
    /// takes to clone a slot, so a slot that is about to be locked stays.
    /// Returns whether the slot was removed.
    pub fn release(&self, key: &PartyKey) -> bool {
        let removed = self
            .slots
            .remove_if(key, |_, slot| {
                Arc::strong_count(slot) == 1
                    && slot.try_lock().map(|slot| !slot.is_live()).unwrap_or(false)
            })
            .is_some();
        if removed {
            debug!(%key, "Released session slot");
        }
        removed
    }

    /// Whether `key` currently has a live connection
    pub async fn is_live(&self, key: &PartyKey) -> bool {
        let live = self.lock(key).await.is_live();
        self.release(key);
        live
    }

    /// Number of slots currently held in memory
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Number of parties with a live connection
    pub async fn live_count(&self) -> usize {
        let slots: Vec<_> = self
            .slots
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut live = 0;
        for slot in slots {
            if slot.lock().await.is_live() {
                live += 1;
            }
        }
        live
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{Namespace, PartyId};

    fn key(party: &str) -> PartyKey {
        PartyKey::new(Namespace::default(), PartyId::parse(party).unwrap())
    }

    #[tokio::test]
    async fn test_register_and_deliver() {
        let registry = SessionRegistry::new();
        let (outbox, mut inbox) = mpsc::unbounded_channel();

        {
            let mut slot = registry.lock(&key("Alice")).await;
            assert_eq!(slot.deliver("early".to_string()), Err("early".to_string()));
            slot.register(SessionHandle::new(1, outbox));
            slot.deliver("hello".to_string()).unwrap();
        }

        assert!(registry.is_live(&key("Alice")).await);
        assert!(!registry.is_live(&key("Bob")).await);
        assert_eq!(registry.live_count().await, 1);
        assert_eq!(inbox.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_unregister_only_by_owner() {
        let registry = SessionRegistry::new();
        let (outbox, _inbox) = mpsc::unbounded_channel();

        let mut slot = registry.lock(&key("Alice")).await;
        slot.register(SessionHandle::new(7, outbox));
        assert!(!slot.unregister(8));
        assert!(slot.is_live());
        assert!(slot.unregister(7));
        assert!(!slot.is_live());
    }

    #[tokio::test]
    async fn test_deliver_to_closed_connection_returns_message() {
        let registry = SessionRegistry::new();
        let (outbox, inbox) = mpsc::unbounded_channel();
        drop(inbox);

        let mut slot = registry.lock(&key("Alice")).await;
        slot.register(SessionHandle::new(1, outbox));
        assert_eq!(slot.deliver("lost?".to_string()), Err("lost?".to_string()));
    }

    #[tokio::test]
    async fn test_slot_lock_serializes_per_key() {
        let registry = Arc::new(SessionRegistry::new());
        let guard = registry.lock(&key("Alice")).await;

        // Another key is not blocked.
        let _bob = registry.lock(&key("Bob")).await;

        let contender = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.lock(&key("Alice")).await.is_live() })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        assert!(!contender.await.unwrap());
    }

    #[tokio::test]
    async fn test_release_drops_only_idle_slots() {
        let registry = SessionRegistry::new();
        let (outbox, _inbox) = mpsc::unbounded_channel();

        // Locked: kept.
        let guard = registry.lock(&key("Alice")).await;
        assert!(!registry.release(&key("Alice")));
        drop(guard);
        assert!(registry.release(&key("Alice")));
        assert_eq!(registry.slot_count(), 0);

        // Live: kept until logged out.
        registry
            .lock(&key("Bob"))
            .await
            .register(SessionHandle::new(3, outbox));
        assert!(!registry.release(&key("Bob")));
        assert!(registry.is_live(&key("Bob")).await);
        assert_eq!(registry.slot_count(), 1);

        assert!(registry.lock(&key("Bob")).await.unregister(3));
        assert!(registry.release(&key("Bob")));
        assert_eq!(registry.slot_count(), 0);

        // Looking up a party that never connected leaves nothing behind.
        assert!(!registry.is_live(&key("Carol")).await);
        assert_eq!(registry.slot_count(), 0);
    }

    #[tokio::test]
    async fn test_waiting_locker_keeps_slot() {
        let registry = Arc::new(SessionRegistry::new());
        let guard = registry.lock(&key("Alice")).await;

        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                let mut slot = registry.lock(&key("Alice")).await;
                let (outbox, inbox) = mpsc::unbounded_channel();
                slot.register(SessionHandle::new(9, outbox));
                inbox
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        // The waiter holds its own clone, so releasing after the guard
        // is dropped must not split the key across two mutexes.
        drop(guard);
        assert!(!registry.release(&key("Alice")));
        let _inbox = waiter.await.unwrap();
        assert!(registry.is_live(&key("Alice")).await);
        assert_eq!(registry.slot_count(), 1);
    }
}
