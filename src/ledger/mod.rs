//! Node-local contract storage
//!
//! The replication protocol only needs a keyed table of contracts. Two
//! implementations are provided:
//! - `MemoryLedger`: a `BTreeMap`, for tests and throwaway nodes
//! - `SqliteLedger`: a single SQLite table holding each contract as JSON

use rusqlite::{Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::info;

use crate::contract::Contract;
use crate::ids::ContractId;

/// Ledger failures
#[derive(Error, Debug)]
pub enum StorageError {
    /// `create` was called for an id that already exists
    #[error("contract {0} already exists")]
    AlreadyExists(ContractId),

    /// `update` was called for an id that does not exist
    #[error("contract {0} does not exist")]
    NotFound(ContractId),

    /// The backing database failed
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored row could not be decoded
    #[error("corrupt ledger row: {0}")]
    Corrupt(String),
}

/// Result type for ledger operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Persistent table of contracts, keyed by id
pub trait Ledger: Send {
    /// Ids of all stored contracts
    fn list(&self) -> StorageResult<Vec<ContractId>>;

    /// Look a contract up
    fn fetch(&self, id: &ContractId) -> StorageResult<Option<Contract>>;

    /// All stored contracts with their ids
    fn fetch_all(&self) -> StorageResult<Vec<(ContractId, Contract)>>;

    /// Store a new contract, failing if the id exists
    fn create(&mut self, id: &ContractId, contract: &Contract) -> StorageResult<()>;

    /// Replace an existing contract, failing if the id is absent
    fn update(&mut self, id: &ContractId, contract: &Contract) -> StorageResult<()>;
}

/// In-memory ledger
#[derive(Debug, Default, Clone)]
pub struct MemoryLedger {
    contracts: BTreeMap<ContractId, Contract>,
}

impl MemoryLedger {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::default()
    }
}

impl Ledger for MemoryLedger {
    fn list(&self) -> StorageResult<Vec<ContractId>> {
        Ok(self.contracts.keys().cloned().collect())
    }

    fn fetch(&self, id: &ContractId) -> StorageResult<Option<Contract>> {
        Ok(self.contracts.get(id).cloned())
    }

    fn fetch_all(&self) -> StorageResult<Vec<(ContractId, Contract)>> {
        Ok(self
            .contracts
            .iter()
            .map(|(id, contract)| (id.clone(), contract.clone()))
            .collect())
    }

    fn create(&mut self, id: &ContractId, contract: &Contract) -> StorageResult<()> {
        if self.contracts.contains_key(id) {
            return Err(StorageError::AlreadyExists(id.clone()));
        }
        self.contracts.insert(id.clone(), contract.clone());
        Ok(())
    }

    fn update(&mut self, id: &ContractId, contract: &Contract) -> StorageResult<()> {
        match self.contracts.get_mut(id) {
            Some(stored) => {
                *stored = contract.clone();
                Ok(())
            }
            None => Err(StorageError::NotFound(id.clone())),
        }
    }
}

/// SQLite-backed ledger
pub struct SqliteLedger {
    db: Connection,
}

impl SqliteLedger {
    /// Open or create the ledger database at `path`
    pub fn open(path: &Path) -> StorageResult<Self> {
        let db = Connection::open(path)?;
        db.execute_batch("PRAGMA journal_mode=WAL;")?;
        info!(path = %path.display(), "Ledger opened");
        Self::init(db)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(db: Connection) -> StorageResult<Self> {
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS contracts (
                id TEXT NOT NULL PRIMARY KEY,
                contract TEXT NOT NULL
            );",
        )?;
        Ok(Self { db })
    }
}

fn decode_row(id: String, contract: String) -> StorageResult<(ContractId, Contract)> {
    let id = ContractId::parse(id).map_err(|e| StorageError::Corrupt(e.to_string()))?;
    let contract =
        serde_json::from_str(&contract).map_err(|e| StorageError::Corrupt(format!("{id}: {e}")))?;
    Ok((id, contract))
}

fn encode_contract(contract: &Contract) -> StorageResult<String> {
    serde_json::to_string(contract).map_err(|e| StorageError::Corrupt(e.to_string()))
}

impl Ledger for SqliteLedger {
    fn list(&self) -> StorageResult<Vec<ContractId>> {
        let mut stmt = self.db.prepare_cached("SELECT id FROM contracts ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        ids.into_iter()
            .map(|id| ContractId::parse(id).map_err(|e| StorageError::Corrupt(e.to_string())))
            .collect()
    }

    fn fetch(&self, id: &ContractId) -> StorageResult<Option<Contract>> {
        let mut stmt = self
            .db
            .prepare_cached("SELECT contract FROM contracts WHERE id = ?1")?;
        let row: Option<String> = stmt
            .query_row([id.as_str()], |row| row.get(0))
            .optional()?;
        row.map(|json| decode_row(id.to_string(), json).map(|(_, contract)| contract))
            .transpose()
    }

    fn fetch_all(&self) -> StorageResult<Vec<(ContractId, Contract)>> {
        let mut stmt = self
            .db
            .prepare_cached("SELECT id, contract FROM contracts ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(id, contract)| decode_row(id, contract))
            .collect()
    }

    fn create(&mut self, id: &ContractId, contract: &Contract) -> StorageResult<()> {
        let json = encode_contract(contract)?;
        let inserted = self.db.execute(
            "INSERT OR IGNORE INTO contracts (id, contract) VALUES (?1, ?2)",
            rusqlite::params![id.as_str(), json],
        )?;
        if inserted == 0 {
            return Err(StorageError::AlreadyExists(id.clone()));
        }
        Ok(())
    }

    fn update(&mut self, id: &ContractId, contract: &Contract) -> StorageResult<()> {
        let json = encode_contract(contract)?;
        let updated = self.db.execute(
            "UPDATE contracts SET contract = ?2 WHERE id = ?1",
            rusqlite::params![id.as_str(), json],
        )?;
        if updated == 0 {
            return Err(StorageError::NotFound(id.clone()));
        }
        Ok(())
    }
}
