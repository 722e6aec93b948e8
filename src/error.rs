use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum BiblioError {
    #[error("invalid OpenAlex institution id: {0}")]
    InvalidInstitutionId(String),

    #[error("invalid year range: {0}")]
    InvalidYearRange(String),

    #[error("invalid snapshot id: {0}")]
    InvalidSnapshotId(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("OpenAlex request failed: {0}")]
    NetworkTransient(String),

    #[error("OpenAlex rate limit hit (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("OpenAlex returned status {status}: {message}")]
    ApiStatus { status: u16, message: String },

    #[error("OpenAlex request failed after {attempts} attempts: {last_error}")]
    #[diagnostic(help("run `biblio-etl fallback` to keep serving the latest snapshot"))]
    RetryExhausted { attempts: u32, last_error: String },

    #[error("unexpected record shape: {0}")]
    SchemaMismatch(String),

    #[error("snapshot not found: {0}")]
    #[diagnostic(help("run `biblio-etl refresh` to build the first snapshot"))]
    SnapshotNotFound(String),

    #[error("another refresh holds the write lock: {0}")]
    #[diagnostic(help("wait for it to finish, or run `biblio-etl unlock` if that process is gone"))]
    WriteConflict(String),

    #[error("illegal refresh transition: {from} -> {to}")]
    InvalidState { from: String, to: String },

    #[error("snapshot tables violate an invariant: {0}")]
    InvariantViolation(String),

    #[error("parquet error: {0}")]
    Parquet(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl BiblioError {
    /// Errors the client retries with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BiblioError::NetworkTransient(_) | BiblioError::RateLimited { .. }
        )
    }
}

impl From<parquet::errors::ParquetError> for BiblioError {
    fn from(err: parquet::errors::ParquetError) -> Self {
        BiblioError::Parquet(err.to_string())
    }
}

impl From<arrow_schema::ArrowError> for BiblioError {
    fn from(err: arrow_schema::ArrowError) -> Self {
        BiblioError::Parquet(err.to_string())
    }
}
