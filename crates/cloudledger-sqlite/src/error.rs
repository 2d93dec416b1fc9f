//! Error types for the SQLite backend

use cloudledger::LedgerError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SqliteStoreError {
    #[error("Database error: {0}")]
    Database(#[source] sqlx::Error),

    /// Raised by the one-open-record index on history tables
    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("Invalid value in {table}.{column}: {message}")]
    Decode {
        table: String,
        column: String,
        message: String,
    },

    #[error("Unknown table for {0}")]
    UnknownTable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SqliteStoreError {
    pub(crate) fn decode(table: &str, column: &str, message: impl Into<String>) -> Self {
        SqliteStoreError::Decode {
            table: table.to_string(),
            column: column.to_string(),
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for SqliteStoreError {
    fn from(e: sqlx::Error) -> Self {
        let unique = e
            .as_database_error()
            .filter(|db| db.is_unique_violation())
            .map(|db| db.message().to_string());
        match unique {
            Some(message) => SqliteStoreError::UniqueViolation(message),
            None => SqliteStoreError::Database(e),
        }
    }
}

impl From<SqliteStoreError> for LedgerError {
    fn from(e: SqliteStoreError) -> Self {
        match e {
            SqliteStoreError::UniqueViolation(_) => LedgerError::Invariant(e.to_string()),
            other => LedgerError::Storage(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SqliteStoreError>;
