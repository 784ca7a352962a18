//! SQLite store backend (sqlx).
//!
//! Three tables: `peppers` (the two-slot record), `hashes` (the catalog) and
//! `user_history` (append-only audit trail). Atomicity of individual
//! statements comes from SQLite itself; the single-rotation-instance
//! assumption means no cross-statement transactions are needed here.

use super::{
    CatalogStore, FieldKind, HashRecord, MatrixAddress, Pepper, PepperSlot, PepperStore,
    StoreError, UserHistoryEntry,
};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS peppers (
    slot  TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS hashes (
    digest  TEXT NOT NULL,
    pepper  TEXT NOT NULL,
    kind    TEXT NOT NULL,
    address TEXT NOT NULL,
    active  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_hashes_pepper ON hashes (pepper);
CREATE INDEX IF NOT EXISTS idx_hashes_address ON hashes (address);
CREATE TABLE IF NOT EXISTS user_history (
    address TEXT NOT NULL,
    ts      INTEGER NOT NULL,
    active  INTEGER NOT NULL
);
";

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// sqlx-backed SQLite store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `path` and apply the
    /// schema.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    /// Open a private in-memory database. One connection only: each SQLite
    /// in-memory connection is its own database.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new().in_memory(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl PepperStore for SqliteStore {
    async fn pepper(&self, slot: PepperSlot) -> Result<Option<Pepper>, StoreError> {
        let row = sqlx::query("SELECT value FROM peppers WHERE slot = ?1")
            .bind(slot.as_str())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(Pepper::new(row.try_get::<String, _>("value")?))),
            None => Ok(None),
        }
    }

    async fn set_pepper(&self, slot: PepperSlot, value: &Pepper) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO peppers (slot, value) VALUES (?1, ?2)
             ON CONFLICT (slot) DO UPDATE SET value = excluded.value",
        )
        .bind(slot.as_str())
        .bind(value.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for SqliteStore {
    async fn insert_hash(&self, record: HashRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO hashes (digest, pepper, kind, address, active)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&record.digest)
        .bind(&record.pepper)
        .bind(record.kind.as_str())
        .bind(record.address.as_str())
        .bind(record.active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_hashes_by_pepper(&self, pepper: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM hashes WHERE pepper = ?1")
            .bind(pepper)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn catalog_addresses(&self) -> Result<Vec<(MatrixAddress, bool)>, StoreError> {
        let rows = sqlx::query("SELECT address, active FROM hashes")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                let address: String = row.try_get("address")?;
                let active: bool = row.try_get("active")?;
                Ok((MatrixAddress(address), active))
            })
            .collect()
    }

    async fn set_active(&self, address: &MatrixAddress, active: bool) -> Result<u64, StoreError> {
        let result = sqlx::query("UPDATE hashes SET active = ?1 WHERE address = ?2")
            .bind(active)
            .bind(address.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn count_hashes(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM hashes")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as u64)
    }

    async fn append_history(&self, entry: UserHistoryEntry) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO user_history (address, ts, active) VALUES (?1, ?2, ?3)")
            .bind(entry.address.as_str())
            .bind(entry.timestamp as i64)
            .bind(entry.active)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn history_for(
        &self,
        address: &MatrixAddress,
    ) -> Result<Vec<UserHistoryEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT address, ts, active FROM user_history WHERE address = ?1 ORDER BY ts, rowid",
        )
        .bind(address.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                let address: String = row.try_get("address")?;
                let ts: i64 = row.try_get("ts")?;
                let active: bool = row.try_get("active")?;
                Ok(UserHistoryEntry {
                    address: MatrixAddress(address),
                    timestamp: ts as u64,
                    active,
                })
            })
            .collect()
    }
}
