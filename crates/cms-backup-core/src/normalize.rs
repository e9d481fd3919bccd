//! Maps decoded archive rows onto the live columns of a target table.
//!
//! This is where format drift is absorbed: legacy field spellings are
//! resolved to canonical columns, values are coerced per column category, and
//! table-specific rewrites are applied. Anything that cannot be placed is
//! dropped rather than reported as an error.

use crate::aliases::{
    EXCLUDED_FIELDS, GLOBAL_COLUMN_ALIASES, LEGACY_ID_FIELD, REF_TYPE_ALIASES, REF_TYPE_TABLES,
    TABLE_COLUMN_ALIASES,
};
use crate::coerce::{coerce, is_zero_time};
use crate::naming::camel_to_snake;
use crate::schema::ColumnSet;
use crate::value::{Row, RowValue};

/// Column that the target database re-derives on its own.
pub const MODIFIED_AT_COLUMN: &str = "modified_at";
/// Column carrying the kind of entity a comment or slug tracker points at.
pub const REF_TYPE_COLUMN: &str = "ref_type";
/// Legacy composite counter field and the columns it splits into.
pub const COUNT_FIELD: &str = "count";
pub const COUNT_PARTS: &[(&str, &str)] = &[("read", "read_count"), ("like", "like_count")];

const ID_COLUMN: &str = "id";

/// Normalize one decoded row for `table`. `None` means nothing survived.
#[must_use]
pub fn normalize_row(table: &str, raw: Row, columns: &ColumnSet) -> Option<Row> {
    let mut out = Row::new();
    let mut exact = Vec::new();

    for (field, value) in raw {
        if EXCLUDED_FIELDS.contains(field.as_str()) {
            continue;
        }
        if field == LEGACY_ID_FIELD && columns.auto_increment_key() == Some(ID_COLUMN) {
            continue;
        }

        let Some(column) = resolve_column(table, &field, columns) else {
            tracing::debug!(
                table,
                field = field.as_str(),
                "dropping field without a target column"
            );
            continue;
        };

        if column == COUNT_FIELD {
            if let RowValue::Map(parts) = value {
                split_counts(parts, columns, &mut out);
                continue;
            }
            if !columns.contains(COUNT_FIELD) {
                continue;
            }
        }

        // A field already spelled as the column wins over an aliased one.
        let is_exact = field == column;
        if !is_exact && exact.contains(&column) {
            continue;
        }
        if is_exact {
            exact.push(column.clone());
        }

        let value = if column == MODIFIED_AT_COLUMN {
            RowValue::Null
        } else {
            match columns.category(&column) {
                Some(category) => coerce(&column, category, value),
                None => value,
            }
        };
        out.insert(column, value);
    }

    if REF_TYPE_TABLES.contains(&table) {
        if let Some(RowValue::Text(kind)) = out.get_mut(REF_TYPE_COLUMN) {
            *kind = canonical_ref_type(kind);
        }
    }

    if out.get(MODIFIED_AT_COLUMN).is_some_and(is_zero_time) {
        out.insert(MODIFIED_AT_COLUMN.to_string(), RowValue::Null);
    }

    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Resolve `field` to an existing column of `table`, trying the per-table
/// alias, the global alias, the snake_case form and the lower-cased name.
fn resolve_column(table: &str, field: &str, columns: &ColumnSet) -> Option<String> {
    if field == LEGACY_ID_FIELD {
        return columns.contains(ID_COLUMN).then(|| ID_COLUMN.to_string());
    }

    let per_table = TABLE_COLUMN_ALIASES.get(table).and_then(|aliases| aliases.get(field)).copied();
    let global = GLOBAL_COLUMN_ALIASES.get(field).copied();

    let candidates = per_table
        .map(str::to_string)
        .into_iter()
        .chain(global.map(str::to_string))
        .chain([camel_to_snake(field), field.to_lowercase()]);

    for candidate in candidates {
        if candidate == COUNT_FIELD || columns.contains(&candidate) {
            return Some(candidate);
        }
    }
    None
}

fn split_counts(parts: Row, columns: &ColumnSet, out: &mut Row) {
    for (part, value) in parts {
        let Some((_, column)) = COUNT_PARTS.iter().find(|(name, _)| *name == part) else {
            continue;
        };
        if columns.contains(column) {
            out.insert((*column).to_string(), value);
        }
    }
}

/// Canonicalize a reference-type value. Unknown kinds are kept, lower-cased.
#[must_use]
pub fn canonical_ref_type(kind: &str) -> String {
    let lowered = kind.trim().to_lowercase();
    REF_TYPE_ALIASES.get(lowered.as_str()).map_or(lowered, |canonical| (*canonical).to_string())
}
