//! The database driver boundary.
//!
//! SQL execution, transactions, and identifier quoting are supplied by an
//! external driver. The persistence runtime talks to it exclusively through
//! the [`Driver`] trait: every call is synchronous and blocking, and a
//! session issues them from a single logical execution context.

use crate::error::{Error, Result};
use crate::row::Row;
use crate::value::Value;

/// Quote an identifier with ANSI double quotes.
///
/// This is the default quoting used when the driver does not override
/// [`Driver::quote_identifier`].
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// A database driver capable of executing queries and statements.
///
/// All operations are synchronous; cancellation and timeouts, if any, are the
/// driver's responsibility. Implementations must be `Send + Sync` so session
/// state can be shared behind `Arc`, but the runtime itself never issues
/// concurrent calls on one session.
pub trait Driver: Send + Sync {
    /// Execute a query and return all rows.
    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Execute a statement (INSERT, UPDATE, DELETE) and return rows affected.
    fn execute(&self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Return the key generated by the most recent INSERT.
    fn last_insert_id(&self) -> Result<i64>;

    /// Begin a transaction.
    fn begin(&self) -> Result<()>;

    /// Commit the current transaction.
    fn commit(&self) -> Result<()>;

    /// Roll back the current transaction.
    fn rollback(&self) -> Result<()>;

    /// Execute a query expected to return at most one row.
    ///
    /// Fails with [`Error::DuplicateRow`] when more than one row comes back.
    fn query_one(&self, sql: &str, params: &[Value]) -> Result<Option<Row>> {
        let mut rows = self.query(sql, params)?;
        if rows.len() > 1 {
            return Err(Error::DuplicateRow(format!(
                "query returned {} rows where at most one was expected: {}",
                rows.len(),
                sql
            )));
        }
        Ok(rows.pop())
    }

    /// Quote an identifier for inclusion in SQL text.
    fn quote_identifier(&self, name: &str) -> String {
        quote_ident(name)
    }

    /// Render the placeholder for the 1-based parameter `index`.
    fn placeholder(&self, index: usize) -> String {
        format!("${index}")
    }

    /// Whether the driver supports `COUNT(DISTINCT col, ...)`.
    ///
    /// Count-query derivation falls back to wrapping the whole select in a
    /// subquery when this is false.
    fn supports_distinct_count(&self) -> bool {
        true
    }
}

/// Run `body` inside a driver transaction.
///
/// Commits on success; rolls back and returns the original error on failure.
/// A rollback failure is logged and the body's error is still returned.
pub fn within_transaction<T>(
    driver: &dyn Driver,
    body: impl FnOnce() -> Result<T>,
) -> Result<T> {
    driver.begin()?;
    match body() {
        Ok(value) => {
            driver.commit()?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rb) = driver.rollback() {
                tracing::warn!(error = %rb, "rollback failed after transaction error");
            }
            Err(err)
        }
    }
}
