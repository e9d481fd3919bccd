//! Contract between the engine and the database it exports from or restores into.

use crate::error::DbError;
use crate::value::Row;

/// One live column definition as reported by the target engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    /// Engine type string exactly as declared, e.g. `VARCHAR(255)` or `datetime(3)`.
    pub data_type: String,
    pub primary_key: bool,
    /// True when the engine assigns this key itself.
    pub auto_increment: bool,
}

/// A row of the generic key/value options table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionRow {
    pub name: String,
    pub value: Option<String>,
}

pub trait Database {
    type Tx<'a>: Transaction
    where
        Self: 'a;

    /// Short engine identifier recorded in archive manifests.
    fn engine(&self) -> &str;

    /// Whether foreign-key enforcement can be suspended inside a transaction.
    fn supports_deferred_foreign_keys(&self) -> bool;

    /// Read every row of `table` outside any transaction.
    ///
    /// # Errors
    /// Returns an error when the table is missing or the query fails.
    fn query_rows(&self, table: &str) -> Result<Vec<Row>, DbError>;

    /// # Errors
    /// Returns an error when the engine refuses to start a transaction.
    fn begin(&mut self) -> Result<Self::Tx<'_>, DbError>;
}

/// An open transaction. Dropping it without [`Transaction::commit`] must roll back.
pub trait Transaction {
    /// # Errors
    /// Returns an error when the table's definition cannot be read.
    fn columns(&self, table: &str) -> Result<Vec<ColumnInfo>, DbError>;

    /// Suspend or restore foreign-key enforcement for the rest of the transaction.
    ///
    /// # Errors
    /// Returns an error when the engine rejects the toggle.
    fn set_foreign_key_checks(&self, enabled: bool) -> Result<(), DbError>;

    /// # Errors
    /// Returns an error when the delete statement fails.
    fn delete_all(&self, table: &str) -> Result<u64, DbError>;

    /// Insert one row whose keys are all known columns of `table`.
    ///
    /// # Errors
    /// Returns [`DbError::UniqueViolation`] on duplicate keys and another
    /// variant for every other failure.
    fn insert_row(&self, table: &str, row: &Row) -> Result<(), DbError>;

    /// # Errors
    /// Returns an error when the options table cannot be read.
    fn list_options(&self) -> Result<Vec<OptionRow>, DbError>;

    /// Insert or fully replace the option named `name`.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    fn put_option(&self, name: &str, value: &str) -> Result<(), DbError>;

    /// # Errors
    /// Returns an error when the commit fails; the transaction is then gone.
    fn commit(self) -> Result<(), DbError>;

    /// # Errors
    /// Returns an error when the rollback fails.
    fn rollback(self) -> Result<(), DbError>;
}
