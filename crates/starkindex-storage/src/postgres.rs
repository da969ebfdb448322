//! PostgreSQL storage adapter.
//!
//! Pool-backed `sqlx` implementation of the storage port for production
//! deployments. Schema and semantics mirror the SQLite adapter.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Column, PgPool, Postgres, Row, Transaction, TypeInfo};
use tracing::debug;

use starkindex_core::error::StorageError;
use starkindex_core::storage::{QueryRows, Storage, StorageTxn};
use starkindex_core::types::{
    normalize_felt, BlockHeader, BlockStatus, Cursor, StoredEvent,
};

/// Pool options for [`PostgresStorage`].
#[derive(Debug, Clone)]
pub struct PostgresOptions {
    /// Maximum number of connections in the pool.
    pub max_connections: u32,
    /// Connection acquire timeout.
    pub acquire_timeout: Duration,
}

impl Default for PostgresOptions {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// PostgreSQL-backed implementation of the storage port.
///
/// Cheaply cloneable — wraps a connection pool.
#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    /// Connect using libpq-style URL:
    /// `postgresql://[user[:password]@][host][:port][/dbname]`.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        Self::connect_with_options(database_url, PostgresOptions::default()).await
    }

    pub async fn connect_with_options(
        database_url: &str,
        options: PostgresOptions,
    ) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(options.max_connections)
            .acquire_timeout(options.acquire_timeout)
            .connect(database_url)
            .await
            .map_err(map_err)?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS blocks (
                block_number BIGINT PRIMARY KEY,
                block_hash   TEXT   NOT NULL,
                parent_hash  TEXT   NOT NULL,
                timestamp    BIGINT NOT NULL,
                status       TEXT   NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(map_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS events (
                block_hash       TEXT   NOT NULL,
                tx_hash          TEXT   NOT NULL,
                event_index      BIGINT NOT NULL,
                contract_address TEXT   NOT NULL,
                event_name       TEXT,
                keys             JSONB  NOT NULL,
                data             JSONB  NOT NULL,
                decoded          JSONB,
                block_number     BIGINT NOT NULL,
                PRIMARY KEY (block_hash, tx_hash, event_index)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(map_err)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_events_block_number ON events (block_number)",
        )
        .execute(&self.pool)
        .await
        .map_err(map_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS cursor (
                id           INT PRIMARY KEY CHECK (id = 0),
                block_number BIGINT NOT NULL,
                block_hash   TEXT   NOT NULL,
                updated_at   BIGINT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(map_err)?;

        debug!("postgres schema ready");
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn StorageTxn>, StorageError> {
        let txn = self.pool.begin().await.map_err(map_err)?;
        Ok(Box::new(PostgresTxn { txn }))
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
             FROM blocks WHERE block_number = $1",
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

struct PostgresTxn {
    txn: Transaction<'static, Postgres>,
}

#[async_trait]
impl StorageTxn for PostgresTxn {
    async fn upsert_block(&mut self, block: &BlockHeader) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO blocks (block_number, block_hash, parent_hash, timestamp, status)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (block_number) DO UPDATE SET
                 block_hash = EXCLUDED.block_hash,
                 parent_hash = EXCLUDED.parent_hash,
                 timestamp = EXCLUDED.timestamp,
                 status = EXCLUDED.status",
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
            let keys = serde_json::to_value(&event.raw.keys)
                .map_err(|e| StorageError::Fatal(e.to_string()))?;
            let data = serde_json::to_value(&event.raw.data)
                .map_err(|e| StorageError::Fatal(e.to_string()))?;
            let decoded = event.decoded.clone().map(Value::Object);

            sqlx::query(
                "INSERT INTO events
                 (block_hash, tx_hash, event_index, contract_address, event_name,
                  keys, data, decoded, block_number)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                 ON CONFLICT (block_hash, tx_hash, event_index) DO NOTHING",
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
            "INSERT INTO cursor (id, block_number, block_hash, updated_at)
             VALUES (0, $1, $2, $3)
             ON CONFLICT (id) DO UPDATE SET
                 block_number = EXCLUDED.block_number,
                 block_hash = EXCLUDED.block_hash,
                 updated_at = EXCLUDED.updated_at",
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
        sqlx::query("DELETE FROM events WHERE block_number >= $1")
            .bind(block_number as i64)
            .execute(&mut *self.txn)
            .await
            .map_err(map_err)?;
        let result = sqlx::query("DELETE FROM blocks WHERE block_number >= $1")
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
        sqlx::Error::Database(db) if db.code().as_deref() == Some("40001") => {
            // serialization_failure
            StorageError::Transient(e.to_string())
        }
        _ => StorageError::Fatal(e.to_string()),
    }
}

fn block_from_row(row: &PgRow) -> BlockHeader {
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

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>;

fn bind_param<'q>(query: PgQuery<'q>, param: &'q Value) -> PgQuery<'q> {
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
        other => query.bind(other.clone()),
    }
}

fn row_to_json(row: &PgRow) -> Value {
    let mut object = serde_json::Map::new();
    for column in row.columns() {
        let idx = column.ordinal();
        let value = match column.type_info().name() {
            "INT2" | "INT4" | "INT8" => row
                .try_get::<i64, _>(idx)
                .map(Value::from)
                .unwrap_or(Value::Null),
            "FLOAT4" | "FLOAT8" => row
                .try_get::<f64, _>(idx)
                .map(Value::from)
                .unwrap_or(Value::Null),
            "BOOL" => row
                .try_get::<bool, _>(idx)
                .map(Value::from)
                .unwrap_or(Value::Null),
            "JSON" | "JSONB" => row.try_get::<Value, _>(idx).unwrap_or(Value::Null),
            "BYTEA" => row
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
