// ABOUTME: Utility functions for identifier handling, deadlines and retries
// ABOUTME: Shared by the Postgres backend, the sync components and the CLI

use std::future::Future;
use std::time::Duration;

use crate::error::{SyncError, SyncResult};

/// Validate a PostgreSQL identifier (schema, table or column name).
///
/// Table names end up inside generated SQL, so only plain identifiers are
/// accepted: a letter or underscore followed by letters, digits or
/// underscores, at most 63 bytes.
///
/// # Examples
///
/// ```
/// # use replica_sync::utils::validate_identifier;
/// assert!(validate_identifier("users").is_ok());
/// assert!(validate_identifier("_audit_log").is_ok());
/// assert!(validate_identifier("123abc").is_err());
/// assert!(validate_identifier("users\"; DROP TABLE x; --").is_err());
/// ```
pub fn validate_identifier(identifier: &str) -> SyncResult<()> {
    if identifier.trim().is_empty() {
        return Err(SyncError::Config(
            "identifier cannot be empty or whitespace-only".to_string(),
        ));
    }

    if identifier.len() > 63 {
        return Err(SyncError::Config(format!(
            "identifier '{}' exceeds maximum length of 63 characters (got {})",
            sanitize_identifier(identifier),
            identifier.len()
        )));
    }

    let mut chars = identifier.chars();
    if let Some(first) = chars.next() {
        if !first.is_ascii_alphabetic() && first != '_' {
            return Err(SyncError::Config(format!(
                "identifier '{}' must start with a letter or underscore",
                sanitize_identifier(identifier)
            )));
        }
    }

    if let Some((pos, c)) = identifier
        .chars()
        .enumerate()
        .find(|(_, c)| !c.is_ascii_alphanumeric() && *c != '_')
    {
        return Err(SyncError::Config(format!(
            "identifier '{}' contains invalid character '{}' at position {}",
            sanitize_identifier(identifier),
            if c.is_control() {
                format!("\\x{:02x}", c as u32)
            } else {
                c.to_string()
            },
            pos
        )));
    }

    Ok(())
}

/// Strip control characters and cap length so identifiers are safe to log.
pub fn sanitize_identifier(identifier: &str) -> String {
    identifier
        .chars()
        .filter(|c| !c.is_control())
        .take(100)
        .collect()
}

/// Quote a PostgreSQL identifier, doubling embedded quotes.
pub fn quote_ident(identifier: &str) -> String {
    let mut quoted = String::with_capacity(identifier.len() + 2);
    quoted.push('"');
    for ch in identifier.chars() {
        if ch == '"' {
            quoted.push('"');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}

/// `"schema"."table"`
pub fn qualified_name(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// Run a future under a deadline, turning expiry into [`SyncError::Timeout`].
pub async fn with_deadline<T, F>(operation: &str, timeout: Duration, fut: F) -> SyncResult<T>
where
    F: Future<Output = SyncResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::timeout(operation, timeout)),
    }
}

/// Retry an async operation with exponential backoff.
///
/// Used for the local store at startup; the master is never retried this
/// way because an unreachable master is a normal operating state.
///
/// # Arguments
///
/// * `operation` - Async closure to retry
/// * `max_retries` - Retries after the first attempt (0 = single attempt)
/// * `initial_delay` - Delay before the first retry, doubled each time
pub async fn retry_with_backoff<F, Fut, T, E>(
    mut operation: F,
    max_retries: u32,
    initial_delay: Duration,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = initial_delay;
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt < max_retries => {
                tracing::warn!(
                    "Operation failed (attempt {}/{}): {}. Retrying in {:?}...",
                    attempt + 1,
                    max_retries + 1,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
