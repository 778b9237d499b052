use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{migrate::MigrateError, sqlite::SqlitePoolOptions, Row, SqlitePool};
use thiserror::Error;

use mailcheck_core::types::{EmailAddress, ProcessedEmail};

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(StorageError::Connect)?;

        apply_pragmas(&pool).await?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle to the `processed_emails` table.
    pub fn processed_emails(&self) -> ProcessedEmailRepository {
        ProcessedEmailRepository {
            pool: self.pool.clone(),
        }
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn apply_pragmas(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query("PRAGMA foreign_keys = ON;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA journal_mode = WAL;")
        .fetch_one(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA synchronous = NORMAL;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    Ok(())
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to apply pragma: {0}")]
    Pragma(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
}

/// Repository for the `processed_emails` table.
///
/// Every call is a standalone statement; nothing here opens a transaction.
#[derive(Clone)]
pub struct ProcessedEmailRepository {
    pool: SqlitePool,
}

impl ProcessedEmailRepository {
    /// Inserts a new, unverified record.
    pub async fn create(
        &self,
        record: NewProcessedEmail,
    ) -> Result<ProcessedEmail, ProcessedEmailError> {
        let row = sqlx::query(
            "INSERT INTO processed_emails (email, is_verified, timestamp) \
             VALUES (?, 0, ?) \
             RETURNING id",
        )
        .bind(record.email.as_str())
        .bind(to_rfc3339(record.timestamp))
        .fetch_one(&self.pool)
        .await?;

        Ok(ProcessedEmail {
            id: row.get("id"),
            email: record.email.into_inner(),
            is_verified: false,
            timestamp: truncate_to_millis(record.timestamp),
        })
    }

    /// Lists every record in insertion order.
    pub async fn list_all(&self) -> Result<Vec<ProcessedEmail>, ProcessedEmailError> {
        let rows = sqlx::query_as::<_, ProcessedEmailRow>(
            "SELECT id, email, is_verified, timestamp FROM processed_emails ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(ProcessedEmailRow::into_domain).collect())
    }

    /// Lists every record with the newest timestamp first.
    pub async fn list_recent_first(&self) -> Result<Vec<ProcessedEmail>, ProcessedEmailError> {
        let rows = sqlx::query_as::<_, ProcessedEmailRow>(
            "SELECT id, email, is_verified, timestamp FROM processed_emails \
             ORDER BY timestamp DESC, id DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(ProcessedEmailRow::into_domain).collect())
    }

    /// Writes every field of `record` back to its row.
    pub async fn save(&self, record: &ProcessedEmail) -> Result<(), ProcessedEmailError> {
        let result = sqlx::query(
            "UPDATE processed_emails \
             SET email = ?, is_verified = ?, timestamp = ? \
             WHERE id = ?",
        )
        .bind(&record.email)
        .bind(if record.is_verified { 1_i64 } else { 0_i64 })
        .bind(to_rfc3339(record.timestamp))
        .bind(record.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ProcessedEmailError::NotFound(record.id));
        }

        Ok(())
    }

    /// Returns the number of stored records.
    pub async fn count(&self) -> Result<u64, ProcessedEmailError> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM processed_emails")
            .fetch_one(&self.pool)
            .await?;
        let total: i64 = row.get("total");
        Ok(total as u64)
    }
}

/// Data required to create a new processed email record.
#[derive(Debug, Clone)]
pub struct NewProcessedEmail {
    pub email: EmailAddress,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct ProcessedEmailRow {
    id: i64,
    email: String,
    is_verified: i64,
    timestamp: DateTime<Utc>,
}

impl ProcessedEmailRow {
    fn into_domain(self) -> ProcessedEmail {
        ProcessedEmail {
            id: self.id,
            email: self.email,
            is_verified: self.is_verified != 0,
            timestamp: self.timestamp,
        }
    }
}

/// Errors that can occur while reading or writing processed emails.
#[derive(Debug, Error)]
pub enum ProcessedEmailError {
    #[error("processed email {0} does not exist")]
    NotFound(i64),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn truncate_to_millis(value: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&to_rfc3339(value))
        .map(|parsed| parsed.with_timezone(&Utc))
        .unwrap_or(value)
}
