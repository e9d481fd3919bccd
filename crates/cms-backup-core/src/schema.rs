use std::collections::HashMap;

use crate::db::{ColumnInfo, Transaction};
use crate::error::{BackupError, BackupResult};

/// Coercion class of a target column, derived from its engine type string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnCategory {
    TimeLike,
    JsonLike,
    TextLike,
    Opaque,
}

impl ColumnCategory {
    #[must_use]
    pub fn classify(data_type: &str) -> Self {
        let lowered = data_type.to_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|needle| lowered.contains(needle));

        if has(&["time", "date", "year"]) {
            Self::TimeLike
        } else if has(&["json"]) {
            Self::JsonLike
        } else if has(&["char", "text", "clob", "enum", "set"]) {
            Self::TextLike
        } else {
            Self::Opaque
        }
    }

    /// JSON-like and text-like columns both accept serialized documents.
    #[must_use]
    pub fn stores_text(self) -> bool {
        matches!(self, Self::JsonLike | Self::TextLike)
    }
}

/// Columns of one target table, keyed by lower-cased name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnSet {
    columns: HashMap<String, ColumnCategory>,
    auto_increment_key: Option<String>,
}

impl ColumnSet {
    #[must_use]
    pub fn from_columns(columns: &[ColumnInfo]) -> Self {
        let auto_increment_key = columns
            .iter()
            .find(|column| column.primary_key && column.auto_increment)
            .map(|column| column.name.to_lowercase());
        let columns = columns
            .iter()
            .map(|column| (column.name.to_lowercase(), ColumnCategory::classify(&column.data_type)))
            .collect();
        Self { columns, auto_increment_key }
    }

    #[must_use]
    pub fn category(&self, column: &str) -> Option<ColumnCategory> {
        self.columns.get(column).copied()
    }

    #[must_use]
    pub fn contains(&self, column: &str) -> bool {
        self.columns.contains_key(column)
    }

    /// Name of the engine-assigned primary key, if the table has one.
    #[must_use]
    pub fn auto_increment_key(&self) -> Option<&str> {
        self.auto_increment_key.as_deref()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Introspect the live definition of `table` inside the restore transaction.
///
/// The result is never cached across runs: the target schema may have moved
/// on since the archive was written.
///
/// # Errors
/// Returns [`BackupError::SchemaIntrospection`] when the columns cannot be read.
pub fn load_columns<T: Transaction>(tx: &T, table: &str) -> BackupResult<ColumnSet> {
    let columns = tx
        .columns(table)
        .map_err(|source| BackupError::SchemaIntrospection { table: table.to_string(), source })?;
    Ok(ColumnSet::from_columns(&columns))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, data_type: &str) -> ColumnInfo {
        ColumnInfo {
            name: name.to_string(),
            data_type: data_type.to_string(),
            primary_key: false,
            auto_increment: false,
        }
    }

    #[test]
    fn engine_types_are_classified_by_substring() {
        assert_eq!(ColumnCategory::classify("DATETIME(3)"), ColumnCategory::TimeLike);
        assert_eq!(ColumnCategory::classify("timestamp with time zone"), ColumnCategory::TimeLike);
        assert_eq!(ColumnCategory::classify("YEAR"), ColumnCategory::TimeLike);
        assert_eq!(ColumnCategory::classify("jsonb"), ColumnCategory::JsonLike);
        assert_eq!(ColumnCategory::classify("VARCHAR(255)"), ColumnCategory::TextLike);
        assert_eq!(ColumnCategory::classify("longtext"), ColumnCategory::TextLike);
        assert_eq!(ColumnCategory::classify("enum('a','b')"), ColumnCategory::TextLike);
        assert_eq!(ColumnCategory::classify("INTEGER"), ColumnCategory::Opaque);
        assert_eq!(ColumnCategory::classify(""), ColumnCategory::Opaque);
    }

    #[test]
    fn column_names_are_lower_cased() {
        let set =
            ColumnSet::from_columns(&[column("Title", "TEXT"), column("Created_At", "DATETIME")]);
        assert_eq!(set.category("title"), Some(ColumnCategory::TextLike));
        assert_eq!(set.category("created_at"), Some(ColumnCategory::TimeLike));
        assert!(!set.contains("Title"));
    }

    #[test]
    fn auto_increment_key_is_detected() {
        let mut id = column("id", "INTEGER");
        id.primary_key = true;
        id.auto_increment = true;
        let set = ColumnSet::from_columns(&[id, column("slug", "TEXT")]);
        assert_eq!(set.auto_increment_key(), Some("id"));
        assert_eq!(set.len(), 2);
    }
}
