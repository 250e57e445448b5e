// ABOUTME: Error taxonomy for the synchronizer
// ABOUTME: Separates connectivity, constraint and configuration failures

use std::time::Duration;

/// Result alias used by the library layer.
pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// Errors produced by stores and sync components.
///
/// The split matters to callers: connectivity failures flip the engine
/// offline and are never fatal, constraint failures are recorded per pending
/// record, and configuration failures only happen at startup.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    /// Refused connection, dropped socket, TLS failure.
    #[error("connection error: {0}")]
    Connectivity(String),

    /// A remote call exceeded its deadline. Treated like a connectivity error.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    /// Unique key, foreign key, not-null or check violation.
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// The targeted row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller supplied a row the engine cannot handle.
    #[error("invalid row: {0}")]
    InvalidRow(String),

    /// Unknown table, bad identifier, missing credentials.
    #[error("configuration error: {0}")]
    Config(String),

    /// Any other server-side failure.
    #[error("database error: {0}")]
    Database(String),
}

impl SyncError {
    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        SyncError::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    /// True for failures that mean "the server is unreachable".
    pub fn is_connectivity(&self) -> bool {
        matches!(self, SyncError::Connectivity(_) | SyncError::Timeout { .. })
    }

    pub fn is_constraint(&self) -> bool {
        matches!(self, SyncError::Constraint(_))
    }
}

impl From<tokio_postgres::Error> for SyncError {
    fn from(err: tokio_postgres::Error) -> Self {
        classify_postgres_error(&err)
    }
}

/// Map a driver error onto the taxonomy using its SQLSTATE class.
///
/// Errors without a SQLSTATE come from the client side: a closed connection
/// or an I/O / TLS failure is connectivity, anything else (e.g. a value
/// conversion problem) is a plain database error.
pub fn classify_postgres_error(err: &tokio_postgres::Error) -> SyncError {
    if let Some(state) = err.code() {
        let message = err
            .as_db_error()
            .map(|db| db.message().to_string())
            .unwrap_or_else(|| err.to_string());
        return classify_sqlstate(state.code(), message);
    }

    if err.is_closed() || has_transport_source(err) {
        return SyncError::Connectivity(err.to_string());
    }

    SyncError::Database(err.to_string())
}

/// Classify by SQLSTATE class (first two characters).
pub fn classify_sqlstate(code: &str, message: String) -> SyncError {
    match code.get(..2) {
        // 08: connection exception, 57: operator intervention (admin shutdown etc.)
        Some("08") | Some("57") => SyncError::Connectivity(message),
        Some("23") => SyncError::Constraint(message),
        // 42P01: undefined_table, 42703: undefined_column
        _ if code == "42P01" || code == "42703" => SyncError::Config(message),
        _ => SyncError::Database(message),
    }
}

fn has_transport_source(err: &tokio_postgres::Error) -> bool {
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        if inner.is::<std::io::Error>() || inner.is::<native_tls::Error>() {
            return true;
        }
        source = inner.source();
    }
    false
}
