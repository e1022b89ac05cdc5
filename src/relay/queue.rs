//! Offline queues
//!
//! Messages for parties without a live session are parked here, per
//! `(namespace, party)` key and strictly FIFO, until the party logs in and
//! the relay drains its queue.

use async_trait::async_trait;
use rusqlite::Connection;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info};

use crate::ids::{Namespace, PartyId};

/// Offline queue failures
#[derive(Error, Debug)]
pub enum QueueError {
    /// The backing database failed
    #[error("queue store error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A background storage task died
    #[error("queue store task failed: {0}")]
    Task(String),

    /// The store lock was poisoned by a panicking writer
    #[error("queue store lock poisoned")]
    Poisoned,
}

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Identifies a party within a namespace
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PartyKey {
    /// Tenant the party logged into
    pub namespace: Namespace,
    /// The party itself
    pub party: PartyId,
}

impl PartyKey {
    /// Create a key
    pub fn new(namespace: Namespace, party: PartyId) -> Self {
        PartyKey { namespace, party }
    }

    /// Key under which the durable store files this party's messages
    pub fn store_key(&self) -> String {
        format!("queue:{}:{}", self.namespace.as_str(), self.party)
    }
}

impl fmt::Display for PartyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.party, self.namespace)
    }
}

/// Store for undelivered raw messages
#[async_trait]
pub trait OfflineQueue: Send + Sync {
    /// Append a message to the party's queue
    async fn enqueue(&self, key: &PartyKey, message: String) -> QueueResult<()>;

    /// Remove and return every queued message for the party, oldest first
    async fn dequeue_all(&self, key: &PartyKey) -> QueueResult<Vec<String>>;
}

/// Process-local queue, lost on restart
#[derive(Default)]
pub struct MemoryQueue {
    queues: Mutex<HashMap<PartyKey, VecDeque<String>>>,
}

impl MemoryQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OfflineQueue for MemoryQueue {
    async fn enqueue(&self, key: &PartyKey, message: String) -> QueueResult<()> {
        let mut queues = self.queues.lock().map_err(|_| QueueError::Poisoned)?;
        queues.entry(key.clone()).or_default().push_back(message);
        Ok(())
    }

    async fn dequeue_all(&self, key: &PartyKey) -> QueueResult<Vec<String>> {
        let mut queues = self.queues.lock().map_err(|_| QueueError::Poisoned)?;
        Ok(queues
            .remove(key)
            .map(Vec::from)
            .unwrap_or_default())
    }
}

/// SQLite-backed queue, survives relay restarts
///
/// Rows are ordered by an autoincrement sequence number; a drain selects
/// and deletes a party's rows in one transaction.
pub struct SqliteQueue {
    db: Arc<Mutex<Connection>>,
}

impl SqliteQueue {
    /// Open or create the queue database at `path`
    pub fn open(path: &Path) -> QueueResult<Self> {
        let db = Connection::open(path)?;
        db.execute_batch("PRAGMA journal_mode=WAL;")?;
        info!(path = %path.display(), "Durable offline queue opened");
        Self::init(db)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> QueueResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(db: Connection) -> QueueResult<Self> {
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS offline_queue (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                queue_key TEXT NOT NULL,
                message TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS offline_queue_key ON offline_queue (queue_key, seq);",
        )?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    async fn with_db<T, F>(&self, f: F) -> QueueResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> QueueResult<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let mut db = db.lock().map_err(|_| QueueError::Poisoned)?;
            f(&mut db)
        })
        .await
        .map_err(|e| QueueError::Task(e.to_string()))?
    }
}

#[async_trait]
impl OfflineQueue for SqliteQueue {
    async fn enqueue(&self, key: &PartyKey, message: String) -> QueueResult<()> {
        let store_key = key.store_key();
        self.with_db(move |db| {
            db.execute(
                "INSERT INTO offline_queue (queue_key, message) VALUES (?1, ?2)",
                rusqlite::params![store_key, message],
            )?;
            Ok(())
        })
        .await
    }

    async fn dequeue_all(&self, key: &PartyKey) -> QueueResult<Vec<String>> {
        let store_key = key.store_key();
        let messages = self
            .with_db(move |db| {
                let tx = db.transaction()?;
                let messages = {
                    let mut stmt = tx.prepare_cached(
                        "SELECT message FROM offline_queue WHERE queue_key = ?1 ORDER BY seq",
                    )?;
                    let rows = stmt.query_map([&store_key], |row| row.get::<_, String>(0))?;
                    rows.collect::<Result<Vec<_>, _>>()?
                };
                tx.execute(
                    "DELETE FROM offline_queue WHERE queue_key = ?1",
                    [&store_key],
                )?;
                tx.commit()?;
                Ok(messages)
            })
            .await?;
        if !messages.is_empty() {
            debug!(%key, count = messages.len(), "Drained durable queue");
        }
        Ok(messages)
    }
}
