//! SQLite storage adapter.
//!
//! Persists blocks, events, and the cursor to a single SQLite file (or an
//! in-memory database for tests). Uses `sqlx` with WAL mode for concurrent
//! read performance.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, Sqlite, SqlitePool, Transaction, TypeInfo};
use tracing::debug;

use starkindex_core::error::StorageError;
use starkindex_core::storage::{QueryRows, Storage, StorageTxn};
use starkindex_core::types::{normalize_felt, BlockHeader, BlockStatus, Cursor, StoredEvent};

/// SQLite-backed implementation of the storage port.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./index.db"`) or a full SQLite
    /// URL (`"sqlite:./index.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, StorageError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };
        let pool = SqlitePool::connect(&url).await.map_err(map_err)?;
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&pool)
            .await
            .map_err(map_err)?;
        Ok(Self { pool })
    }

    /// Open an in-memory SQLite database. All data is lost when the pool is
    /// dropped; ideal for tests. Pinned to a single connection so every
    /// caller sees the same database.
    pub async fn in_memory() -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(map_err)?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS blocks (
                block_number INTEGER PRIMARY KEY,
                block_hash   TEXT    NOT NULL,
                parent_hash  TEXT    NOT NULL,
                timestamp    INTEGER NOT NULL,
                status       TEXT    NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(map_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS events (
                block_hash       TEXT    NOT NULL,
                tx_hash          TEXT    NOT NULL,
                event_index      INTEGER NOT NULL,
                contract_address TEXT    NOT NULL,
                event_name       TEXT,
                keys             TEXT    NOT NULL,
                data             TEXT    NOT NULL,
                decoded          TEXT,
                block_number     INTEGER NOT NULL,
                PRIMARY KEY (block_hash, tx_hash, event_index)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(map_err)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_events_block_number ON events (block_number);",
        )
        .execute(&self.pool)
        .await
        .map_err(map_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS cursor (
                id           INTEGER PRIMARY KEY CHECK (id = 0),
                block_number INTEGER NOT NULL,
                block_hash   TEXT    NOT NULL,
                updated_at   INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(map_err)?;

        debug!("sqlite schema ready");
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn StorageTxn>, StorageError> {
        let txn = self.pool.begin().await.map_err(map_err)?;
        Ok(Box::new(SqliteTxn { txn }))
    }

    async fn get_cursor(&self) -> Result<Option<Cursor>, StorageError> {
        let row =
            sqlx::query("SELECT block_number, block_hash, updated_at FROM cursor WHERE id = 0")
                .fetch_optional(&self.pool)
                .await
                .map_err(map_err)?;
        Ok(row.map(|r| Cursor {
            block_number: r.get::<i64, _>("block_number") as u64,
            block_hash: r.get("block_hash"),
            updated_at: r.get("updated_at"),
        }))
    }

    async fn block_at(&self, number: u64) -> Result<Option<BlockHeader>, StorageError> {
        let row = sqlx::query(
            "SELECT block_number, block_hash, parent_hash, timestamp, status
             FROM blocks WHERE block_number = ?",
        )
        .bind(number as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(row.map(|r| block_from_row(&r)))
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryRows, StorageError> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_param(query, param);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(map_err)?;
        Ok(rows.iter().map(row_to_json).collect())
    }
}

struct SqliteTxn {
    txn: Transaction<'static, Sqlite>,
}

#[async_trait]
impl StorageTxn for SqliteTxn {
    async fn upsert_block(&mut self, block: &BlockHeader) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT OR REPLACE INTO blocks (block_number, block_hash, parent_hash, timestamp, status)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(block.number as i64)
        .bind(normalize_felt(&block.hash))
        .bind(normalize_felt(&block.parent_hash))
        .bind(block.timestamp as i64)
        .bind(block.status.as_str())
        .execute(&mut *self.txn)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn insert_events(&mut self, events: &[StoredEvent]) -> Result<(), StorageError> {
        for event in events {
            let keys = serde_json::to_string(&event.raw.keys)
                .map_err(|e| StorageError::Fatal(e.to_string()))?;
            let data = serde_json::to_string(&event.raw.data)
                .map_err(|e| StorageError::Fatal(e.to_string()))?;
            let decoded = event
                .decoded
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(|e| StorageError::Fatal(e.to_string()))?;

            // `OR IGNORE` keeps re-processing after a restart idempotent.
            sqlx::query(
                "INSERT OR IGNORE INTO events
                 (block_hash, tx_hash, event_index, contract_address, event_name,
                  keys, data, decoded, block_number)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(normalize_felt(&event.raw.block_hash))
            .bind(normalize_felt(&event.raw.tx_hash))
            .bind(event.raw.event_index as i64)
            .bind(normalize_felt(&event.raw.from_address))
            .bind(event.event_name.as_deref())
            .bind(keys)
            .bind(data)
            .bind(decoded)
            .bind(event.raw.block_number as i64)
            .execute(&mut *self.txn)
            .await
            .map_err(map_err)?;
        }
        Ok(())
    }

    async fn set_cursor(&mut self, cursor: &Cursor) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT OR REPLACE INTO cursor (id, block_number, block_hash, updated_at)
             VALUES (0, ?, ?, ?)",
        )
        .bind(cursor.block_number as i64)
        .bind(normalize_felt(&cursor.block_hash))
        .bind(cursor.updated_at)
        .execute(&mut *self.txn)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn delete_from(&mut self, block_number: u64) -> Result<u64, StorageError> {
        sqlx::query("DELETE FROM events WHERE block_number >= ?")
            .bind(block_number as i64)
            .execute(&mut *self.txn)
            .await
            .map_err(map_err)?;
        let result = sqlx::query("DELETE FROM blocks WHERE block_number >= ?")
            .bind(block_number as i64)
            .execute(&mut *self.txn)
            .await
            .map_err(map_err)?;
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        self.txn.commit().await.map_err(map_err)
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        self.txn.rollback().await.map_err(map_err)
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn map_err(e: sqlx::Error) -> StorageError {
    match &e {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => StorageError::Transient(e.to_string()),
        sqlx::Error::Database(db)
            if db.message().contains("locked") || db.message().contains("busy") =>
        {
            StorageError::Transient(e.to_string())
        }
        _ => StorageError::Fatal(e.to_string()),
    }
}

fn block_from_row(row: &SqliteRow) -> BlockHeader {
    BlockHeader {
        number: row.get::<i64, _>("block_number") as u64,
        hash: row.get("block_hash"),
        parent_hash: row.get("parent_hash"),
        timestamp: row.get::<i64, _>("timestamp") as u64,
        status: match row.get::<String, _>("status").as_str() {
            "pending" => BlockStatus::Pending,
            _ => BlockStatus::Accepted,
        },
    }
}

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>>;

fn bind_param<'q>(query: SqliteQuery<'q>, param: &'q Value) -> SqliteQuery<'q> {
    match param {
        Value::Null => query.bind(Option::<String>::None),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else {
                query.bind(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => query.bind(s.as_str()),
        other => query.bind(other.to_string()),
    }
}

fn row_to_json(row: &SqliteRow) -> Value {
    let mut object = serde_json::Map::new();
    for column in row.columns() {
        let idx = column.ordinal();
        let value = match column.type_info().name() {
            "INTEGER" => row
                .try_get::<i64, _>(idx)
                .map(Value::from)
                .unwrap_or(Value::Null),
            "REAL" => row
                .try_get::<f64, _>(idx)
                .map(Value::from)
                .unwrap_or(Value::Null),
            "BLOB" => row
                .try_get::<Vec<u8>, _>(idx)
                .map(|b| Value::String(format!("0x{}", hex::encode(b))))
                .unwrap_or(Value::Null),
            _ => row
                .try_get::<String, _>(idx)
                .map(Value::from)
                .unwrap_or(Value::Null),
        };
        object.insert(column.name().to_string(), value);
    }
    Value::Object(object)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
