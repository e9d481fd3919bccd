//! In-memory database used by the engine's unit tests.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};

use crate::db::{ColumnInfo, Database, OptionRow, Transaction};
use crate::error::DbError;
use crate::value::{Row, RowValue};

#[derive(Debug, Clone, Default)]
pub struct FakeTable {
    pub columns: Vec<ColumnInfo>,
    pub unique: Vec<String>,
    pub rows: Vec<Row>,
}

impl FakeTable {
    pub fn with_columns(definitions: &[(&str, &str)]) -> Self {
        let columns = definitions
            .iter()
            .map(|(name, data_type)| ColumnInfo {
                name: (*name).to_string(),
                data_type: (*data_type).to_string(),
                primary_key: *name == "id",
                auto_increment: false,
            })
            .collect();
        Self { columns, unique: vec!["id".to_string()], rows: Vec::new() }
    }

    pub fn unique_on(mut self, column: &str) -> Self {
        self.unique.push(column.to_string());
        self
    }

    pub fn row(mut self, fields: &[(&str, RowValue)]) -> Self {
        self.rows
            .push(fields.iter().map(|(key, value)| ((*key).to_string(), value.clone())).collect());
        self
    }
}

#[derive(Debug, Default)]
pub struct FakeDb {
    pub tables: BTreeMap<String, FakeTable>,
    pub deferred_foreign_keys: bool,
    /// Tables whose query fails during export.
    pub broken: HashSet<String>,
    /// Fail the nth (1-based) insert into the named table with a non-duplicate error.
    pub fail_insert: Option<(String, usize)>,
    pub fail_commit: bool,
    /// Every foreign-key toggle observed, in order.
    pub foreign_key_log: Vec<bool>,
    pub commits: usize,
    pub rollbacks: usize,
}

impl FakeDb {
    pub fn with_table(mut self, name: &str, table: FakeTable) -> Self {
        self.tables.insert(name.to_string(), table);
        self
    }

    pub fn rows(&self, table: &str) -> &[Row] {
        self.tables.get(table).map(|table| table.rows.as_slice()).unwrap_or_default()
    }

    pub fn option(&self, name: &str) -> Option<String> {
        self.rows("options").iter().find_map(|row| match (row.get("name"), row.get("value")) {
            (Some(RowValue::Text(key)), Some(RowValue::Text(value))) if key == name => {
                Some(value.clone())
            }
            _ => None,
        })
    }
}

impl Database for FakeDb {
    type Tx<'a> = FakeTx<'a>;

    fn engine(&self) -> &str {
        "fake"
    }

    fn supports_deferred_foreign_keys(&self) -> bool {
        self.deferred_foreign_keys
    }

    fn query_rows(&self, table: &str) -> Result<Vec<Row>, DbError> {
        if self.broken.contains(table) {
            return Err(DbError::Other(format!("{table} is broken")));
        }
        self.tables
            .get(table)
            .map(|table| table.rows.clone())
            .ok_or_else(|| DbError::MissingTable(table.to_string()))
    }

    fn begin(&mut self) -> Result<FakeTx<'_>, DbError> {
        let work = RefCell::new(self.tables.clone());
        Ok(FakeTx {
            db: self,
            work,
            inserts: RefCell::new(BTreeMap::new()),
            toggles: RefCell::new(Vec::new()),
        })
    }
}

pub struct FakeTx<'a> {
    db: &'a mut FakeDb,
    work: RefCell<BTreeMap<String, FakeTable>>,
    inserts: RefCell<BTreeMap<String, usize>>,
    toggles: RefCell<Vec<bool>>,
}

impl FakeTx<'_> {
    fn finish(self, commit: bool) {
        let FakeTx { db, work, toggles, .. } = self;
        db.foreign_key_log.extend(toggles.into_inner());
        if commit {
            db.tables = work.into_inner();
            db.commits += 1;
        } else {
            db.rollbacks += 1;
        }
    }
}

impl Transaction for FakeTx<'_> {
    fn columns(&self, table: &str) -> Result<Vec<ColumnInfo>, DbError> {
        self.work
            .borrow()
            .get(table)
            .map(|table| table.columns.clone())
            .ok_or_else(|| DbError::MissingTable(table.to_string()))
    }

    fn set_foreign_key_checks(&self, enabled: bool) -> Result<(), DbError> {
        self.toggles.borrow_mut().push(enabled);
        Ok(())
    }

    fn delete_all(&self, table: &str) -> Result<u64, DbError> {
        let mut work = self.work.borrow_mut();
        let target = work.get_mut(table).ok_or_else(|| DbError::MissingTable(table.to_string()))?;
        let deleted = target.rows.len() as u64;
        target.rows.clear();
        Ok(deleted)
    }

    fn insert_row(&self, table: &str, row: &Row) -> Result<(), DbError> {
        let attempt = {
            let mut inserts = self.inserts.borrow_mut();
            let count = inserts.entry(table.to_string()).or_default();
            *count += 1;
            *count
        };
        let injected = self.db.fail_insert.as_ref();
        if injected.is_some_and(|(name, nth)| name == table && *nth == attempt) {
            return Err(DbError::Other(format!("injected failure on {table} insert {attempt}")));
        }

        let mut work = self.work.borrow_mut();
        let target = work.get_mut(table).ok_or_else(|| DbError::MissingTable(table.to_string()))?;
        for key in row.keys() {
            if !target.columns.iter().any(|column| &column.name == key) {
                return Err(DbError::Other(format!("no such column: {table}.{key}")));
            }
        }
        for column in &target.unique {
            let Some(value) = row.get(column).filter(|value| !value.is_null()) else {
                continue;
            };
            if target.rows.iter().any(|existing| existing.get(column) == Some(value)) {
                return Err(DbError::UniqueViolation(format!("{table}.{column}")));
            }
        }
        target.rows.push(row.clone());
        Ok(())
    }

    fn list_options(&self) -> Result<Vec<OptionRow>, DbError> {
        let work = self.work.borrow();
        let options =
            work.get("options").ok_or_else(|| DbError::MissingTable("options".to_string()))?;
        Ok(options
            .rows
            .iter()
            .filter_map(|row| {
                let name = row.get("name")?.as_str()?.to_string();
                let value = row.get("value").and_then(RowValue::as_str).map(str::to_string);
                Some(OptionRow { name, value })
            })
            .collect())
    }

    fn put_option(&self, name: &str, value: &str) -> Result<(), DbError> {
        let mut work = self.work.borrow_mut();
        let options =
            work.get_mut("options").ok_or_else(|| DbError::MissingTable("options".to_string()))?;
        options.rows.retain(|row| row.get("name").and_then(RowValue::as_str) != Some(name));
        let mut row = Row::new();
        row.insert("name".to_string(), RowValue::from(name));
        row.insert("value".to_string(), RowValue::from(value));
        options.rows.push(row);
        Ok(())
    }

    fn commit(self) -> Result<(), DbError> {
        if self.db.fail_commit {
            self.finish(false);
            return Err(DbError::Other("injected commit failure".to_string()));
        }
        self.finish(true);
        Ok(())
    }

    fn rollback(self) -> Result<(), DbError> {
        self.finish(false);
        Ok(())
    }
}

/// Column layout shared by the restore and export tests.
pub fn blog_db() -> FakeDb {
    FakeDb::default()
        .with_table(
            "posts",
            FakeTable::with_columns(&[
                ("id", "TEXT"),
                ("title", "TEXT"),
                ("slug", "VARCHAR(255)"),
                ("text", "TEXT"),
                ("created_at", "DATETIME"),
                ("modified_at", "DATETIME"),
                ("read_count", "INTEGER"),
                ("like_count", "INTEGER"),
            ])
            .unique_on("slug"),
        )
        .with_table(
            "comments",
            FakeTable::with_columns(&[
                ("id", "TEXT"),
                ("ref_id", "TEXT"),
                ("ref_type", "VARCHAR(32)"),
                ("text", "TEXT"),
                ("created_at", "DATETIME"),
            ]),
        )
        .with_table(
            "options",
            FakeTable::with_columns(&[("name", "VARCHAR(255)"), ("value", "TEXT")])
                .unique_on("name"),
        )
}
