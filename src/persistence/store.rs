use crate::model::{Intent, Position, TradeRecord};
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

// Logical tables mirror the service's SQL layout: positions, trade history,
// regime snapshots and system events; the events table is append-only.
const POSITIONS_TABLE: TableDefinition<&str, Vec<u8>> = TableDefinition::new("positions");
const INTENTS_TABLE: TableDefinition<&str, Vec<u8>> = TableDefinition::new("intents");
const TRADES_TABLE: TableDefinition<&str, Vec<u8>> = TableDefinition::new("trades");
const EVENTS_TABLE: TableDefinition<u64, Vec<u8>> = TableDefinition::new("system_events");
const REGIME_TABLE: TableDefinition<u64, Vec<u8>> = TableDefinition::new("regime_snapshots");

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Redb error: {0}")]
    Redb(#[from] redb::Error),
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Embedded append-only sink. Writers go through `persistence::sink`; this
/// type is the synchronous storage layer underneath it plus startup hydration.
pub struct PersistenceStore {
    db: Arc<Database>,
}

impl PersistenceStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = Database::create(path)?;
        info!("📦 Persistence store opened");
        Ok(Self { db: Arc::new(db) })
    }

    pub fn load_positions(&self) -> Result<Vec<Position>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = match txn.open_table(POSITIONS_TABLE) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut items = Vec::new();
        for res in table.range::<&str>(..)? {
            let (_, v) = res?;
            items.push(serde_json::from_slice(&v.value())?);
        }
        Ok(items)
    }

    pub fn load_intents(&self) -> Result<Vec<Intent>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = match txn.open_table(INTENTS_TABLE) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut items = Vec::new();
        for res in table.range::<&str>(..)? {
            let (_, v) = res?;
            items.push(serde_json::from_slice(&v.value())?);
        }
        Ok(items)
    }

    pub fn load_trades(&self) -> Result<Vec<TradeRecord>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = match txn.open_table(TRADES_TABLE) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut items: Vec<TradeRecord> = Vec::new();
        for res in table.range::<&str>(..)? {
            let (_, v) = res?;
            items.push(serde_json::from_slice(&v.value())?);
        }
        // History is kept oldest -> newest.
        items.sort_by(|a, b| a.closed_at.cmp(&b.closed_at));
        Ok(items)
    }

    pub fn save_position(&self, position: &Position) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(POSITIONS_TABLE)?;
            table.insert(position.symbol.as_str(), serde_json::to_vec(position)?)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn delete_position(&self, symbol: &str) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(POSITIONS_TABLE)?;
            table.remove(symbol)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn save_intent(&self, intent: &Intent) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(INTENTS_TABLE)?;
            table.insert(intent.signal_id.as_str(), serde_json::to_vec(intent)?)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn delete_intent(&self, signal_id: &str) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(INTENTS_TABLE)?;
            table.remove(signal_id)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn save_trade(&self, trade: &TradeRecord) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(TRADES_TABLE)?;
            // Keyed by signal_id + close time so partial exits don't collide.
            let key = format!("{}:{}", trade.signal_id, trade.closed_at.timestamp_millis());
            table.insert(key.as_str(), serde_json::to_vec(trade)?)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn append_event(&self, seq: u64, event: &serde_json::Value) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(EVENTS_TABLE)?;
            table.insert(seq, serde_json::to_vec(event)?)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn append_regime_snapshot(
        &self,
        seq: u64,
        snapshot: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(REGIME_TABLE)?;
            table.insert(seq, serde_json::to_vec(snapshot)?)?;
        }
        txn.commit()?;
        Ok(())
    }
}
