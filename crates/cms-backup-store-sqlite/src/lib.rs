use std::path::Path;

use anyhow::{Context, Result};
use cms_backup_core::{ColumnInfo, Database, DbError, OptionRow, Row, RowValue, Transaction};
use rusqlite::types::{Value, ValueRef};
use rusqlite::{ffi, params, Connection, OptionalExtension};
use time::format_description::well_known::Rfc3339;

/// DDL for every canonical table, used to initialise an empty target.
pub const SCHEMA_SQL: &str = include_str!("schema.sql");

const ENGINE: &str = "sqlite";
const OPTIONS_TABLE: &str = "options";

pub struct SqliteDatabase {
    conn: Connection,
}

impl SqliteDatabase {
    /// Open a database file and configure the runtime pragmas restore relies on.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;
        Self::configure(conn)
    }

    /// # Errors
    /// Returns an error when pragmas cannot be applied.
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("failed to open in-memory sqlite database")?;
        Self::configure(conn)
    }

    fn configure(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;
        Ok(Self { conn })
    }

    /// Create any missing canonical tables.
    ///
    /// # Errors
    /// Returns an error when the DDL fails.
    pub fn apply_schema(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA_SQL).context("failed to apply reference schema")?;
        tracing::info!("reference schema applied");
        Ok(())
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// # Errors
    /// Returns an error when the table does not exist.
    pub fn row_count(&self, table: &str) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
        let count: i64 = self
            .conn
            .query_row(&sql, [], |row| row.get(0))
            .with_context(|| format!("failed to count rows in {table}"))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// # Errors
    /// Returns an error when the options table cannot be read.
    pub fn option(&self, name: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row("SELECT value FROM options WHERE name = ?1", params![name], |row| {
                row.get::<_, Option<String>>(0)
            })
            .optional()
            .with_context(|| format!("failed to read option {name}"))?;
        Ok(value.flatten())
    }
}

impl Database for SqliteDatabase {
    type Tx<'a> = SqliteTransaction<'a>;

    fn engine(&self) -> &str {
        ENGINE
    }

    fn supports_deferred_foreign_keys(&self) -> bool {
        true
    }

    fn query_rows(&self, table: &str) -> Result<Vec<Row>, DbError> {
        ensure_table(&self.conn, table)?;
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT * FROM {} ORDER BY rowid", quote_ident(table)))
            .map_err(db_error)?;
        let names: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();
        let mut rows = stmt.query([]).map_err(db_error)?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(db_error)? {
            let mut record = Row::new();
            for (index, name) in names.iter().enumerate() {
                let value = row.get_ref(index).map_err(db_error)?;
                record.insert(name.clone(), from_sql(value));
            }
            out.push(record);
        }
        Ok(out)
    }

    fn begin(&mut self) -> Result<SqliteTransaction<'_>, DbError> {
        let tx = self.conn.transaction().map_err(db_error)?;
        Ok(SqliteTransaction { tx })
    }
}

/// Restore transaction. Dropping it without commit rolls back.
pub struct SqliteTransaction<'a> {
    tx: rusqlite::Transaction<'a>,
}

impl Transaction for SqliteTransaction<'_> {
    fn columns(&self, table: &str) -> Result<Vec<ColumnInfo>, DbError> {
        ensure_table(&self.tx, table)?;
        let mut stmt = self
            .tx
            .prepare(&format!("PRAGMA table_info({})", quote_ident(table)))
            .map_err(db_error)?;
        let mut rows = stmt.query([]).map_err(db_error)?;

        let mut columns = Vec::new();
        while let Some(row) = rows.next().map_err(db_error)? {
            let name: String = row.get(1).map_err(db_error)?;
            let data_type: String = row.get(2).map_err(db_error)?;
            let pk: i64 = row.get(5).map_err(db_error)?;
            columns.push(ColumnInfo {
                name,
                data_type,
                primary_key: pk > 0,
                auto_increment: false,
            });
        }

        // Only a lone INTEGER primary key aliases the rowid.
        let keys: Vec<usize> = columns
            .iter()
            .enumerate()
            .filter(|(_, column)| column.primary_key)
            .map(|(index, _)| index)
            .collect();
        if let [only] = keys.as_slice() {
            let column = &mut columns[*only];
            column.auto_increment = column.data_type.eq_ignore_ascii_case("INTEGER");
        }
        Ok(columns)
    }

    fn set_foreign_key_checks(&self, enabled: bool) -> Result<(), DbError> {
        // Toggling deferral clears pending violations, so references written
        // while checks are off are never enforced.
        let pragma = if enabled {
            "PRAGMA defer_foreign_keys = OFF"
        } else {
            "PRAGMA defer_foreign_keys = ON"
        };
        self.tx.execute_batch(pragma).map_err(db_error)
    }

    fn delete_all(&self, table: &str) -> Result<u64, DbError> {
        let deleted = self
            .tx
            .execute(&format!("DELETE FROM {}", quote_ident(table)), [])
            .map_err(db_error)?;
        Ok(u64::try_from(deleted).unwrap_or_default())
    }

    fn insert_row(&self, table: &str, row: &Row) -> Result<(), DbError> {
        let columns: Vec<String> = row.keys().map(|column| quote_ident(column.as_str())).collect();
        let placeholders: Vec<String> = (1..=row.len()).map(|index| format!("?{index}")).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(table),
            columns.join(", "),
            placeholders.join(", ")
        );
        let values: Vec<Value> = row.values().map(to_sql).collect();
        self.tx
            .execute(&sql, rusqlite::params_from_iter(values))
            .map_err(db_error)?;
        Ok(())
    }

    fn list_options(&self) -> Result<Vec<OptionRow>, DbError> {
        let mut stmt = self
            .tx
            .prepare("SELECT name, value FROM options ORDER BY name")
            .map_err(db_error)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(OptionRow { name: row.get(0)?, value: option_text(row.get_ref(1)?) })
            })
            .map_err(db_error)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_error)
    }

    fn put_option(&self, name: &str, value: &str) -> Result<(), DbError> {
        ensure_table(&self.tx, OPTIONS_TABLE)?;
        self.tx
            .execute(
                "INSERT INTO options(name, value) VALUES (?1, ?2)
                 ON CONFLICT(name) DO UPDATE SET value = excluded.value",
                params![name, value],
            )
            .map_err(db_error)?;
        Ok(())
    }

    fn commit(self) -> Result<(), DbError> {
        self.tx.commit().map_err(db_error)
    }

    fn rollback(self) -> Result<(), DbError> {
        self.tx.rollback().map_err(db_error)
    }
}

fn ensure_table(conn: &Connection, table: &str) -> Result<(), DbError> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table],
            |row| row.get::<_, i64>(0),
        )
        .map_err(db_error)?;
    if exists == 1 {
        Ok(())
    } else {
        Err(DbError::MissingTable(table.to_string()))
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn db_error(err: rusqlite::Error) -> DbError {
    if let rusqlite::Error::SqliteFailure(failure, message) = &err {
        if matches!(
            failure.extended_code,
            ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY
        ) {
            return DbError::UniqueViolation(message.clone().unwrap_or_else(|| err.to_string()));
        }
    }
    DbError::Other(err.to_string())
}

/// Option values are text; blobs that are not UTF-8 read as NULL.
fn option_text(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(number) => Some(number.to_string()),
        ValueRef::Real(number) => Some(number.to_string()),
        ValueRef::Text(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => std::str::from_utf8(bytes).ok().map(str::to_string),
    }
}

fn to_sql(value: &RowValue) -> Value {
    match value {
        RowValue::Null => Value::Null,
        RowValue::Bool(flag) => Value::Integer(i64::from(*flag)),
        RowValue::Int(number) => Value::Integer(*number),
        RowValue::Float(number) => Value::Real(*number),
        RowValue::Text(text) => Value::Text(text.clone()),
        RowValue::Bytes(bytes) => Value::Blob(bytes.clone()),
        RowValue::Timestamp(at) => {
            at.format(&Rfc3339).map_or_else(|_| Value::Integer(at.unix_timestamp()), Value::Text)
        }
        RowValue::List(_) | RowValue::Map(_) => Value::Text(value.to_json_text()),
    }
}

fn from_sql(value: ValueRef<'_>) -> RowValue {
    match value {
        ValueRef::Null => RowValue::Null,
        ValueRef::Integer(number) => RowValue::Int(number),
        ValueRef::Real(number) => RowValue::Float(number),
        ValueRef::Text(bytes) => RowValue::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => RowValue::Bytes(bytes.to_vec()),
    }
}
