//! Column-category directed value coercion.

use time::format_description::well_known::Rfc3339;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime};

use crate::legacy::millis_to_datetime;
use crate::schema::ColumnCategory;
use crate::value::RowValue;

/// Epoch values at or above this are milliseconds.
pub const EPOCH_MILLIS_THRESHOLD: f64 = 1e11;
/// Epoch values at or above this (and below the millisecond threshold) are seconds.
pub const EPOCH_SECONDS_THRESHOLD: f64 = 1e8;

const NAIVE_LAYOUTS: &[&[BorrowedFormatItem<'static>]] = &[
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond]"),
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]"),
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]"),
];

const DATE_LAYOUT: &[BorrowedFormatItem<'static>] = format_description!("[year]-[month]-[day]");

/// Coerce `value` for a column of `category`.
///
/// `column` is only used for diagnostics.
#[must_use]
pub fn coerce(column: &str, category: ColumnCategory, value: RowValue) -> RowValue {
    match category {
        ColumnCategory::TimeLike => coerce_time(column, value),
        ColumnCategory::JsonLike | ColumnCategory::TextLike => coerce_text(value),
        ColumnCategory::Opaque => value,
    }
}

fn coerce_text(value: RowValue) -> RowValue {
    match value {
        RowValue::Map(_) | RowValue::List(_) => RowValue::Text(value.to_json_text()),
        RowValue::Bytes(bytes) => match String::from_utf8(bytes) {
            Ok(text) => RowValue::Text(text),
            Err(err) => RowValue::Bytes(err.into_bytes()),
        },
        other => other,
    }
}

/// Coerce a value headed for a time-like column. Unparseable input becomes
/// NULL with a warning; it never fails the restore.
#[must_use]
pub fn coerce_time(column: &str, value: RowValue) -> RowValue {
    match value {
        RowValue::Null => value,
        RowValue::Timestamp(at) => to_utc(column, at),
        #[allow(clippy::cast_precision_loss)]
        RowValue::Int(number) => epoch_to_time(column, number as f64),
        RowValue::Float(number) => epoch_to_time(column, number),
        RowValue::Text(text) => parse_time_text(column, &text),
        RowValue::Bytes(bytes) => match String::from_utf8(bytes) {
            Ok(text) => parse_time_text(column, &text),
            Err(_) => invalid(column, "binary"),
        },
        RowValue::Bool(_) | RowValue::List(_) | RowValue::Map(_) => invalid(column, value.kind()),
    }
}

/// True for the legacy encodings of "no timestamp".
#[must_use]
pub fn is_zero_time(value: &RowValue) -> bool {
    match value {
        RowValue::Null => true,
        RowValue::Int(number) => *number == 0,
        RowValue::Float(number) => *number == 0.0,
        RowValue::Text(text) => is_zero_time_text(text),
        RowValue::Timestamp(at) => at.unix_timestamp() == 0,
        _ => false,
    }
}

fn is_zero_time_text(text: &str) -> bool {
    let trimmed = text.trim();
    trimmed.is_empty()
        || trimmed == "0"
        || trimmed.eq_ignore_ascii_case("null")
        || trimmed.starts_with("0000-00-00")
}

fn parse_time_text(column: &str, text: &str) -> RowValue {
    let trimmed = text.trim();
    if is_zero_time_text(trimmed) {
        return RowValue::Null;
    }
    if let Ok(at) = OffsetDateTime::parse(trimmed, &Rfc3339) {
        return to_utc(column, at);
    }
    for layout in NAIVE_LAYOUTS {
        if let Ok(at) = PrimitiveDateTime::parse(trimmed, layout) {
            return RowValue::Timestamp(at.assume_utc());
        }
    }
    if let Ok(date) = Date::parse(trimmed, DATE_LAYOUT) {
        return RowValue::Timestamp(date.midnight().assume_utc());
    }
    if let Ok(number) = trimmed.parse::<f64>() {
        return epoch_to_time(column, number);
    }
    invalid(column, "text")
}

/// Interpret a bare number as a Unix epoch using the magnitude heuristic
/// observed in legacy exports: at least 1e11 is milliseconds, at least 1e8 is
/// seconds, and anything smaller is not a plausible instant.
fn epoch_to_time(column: &str, number: f64) -> RowValue {
    if number == 0.0 {
        return RowValue::Null;
    }
    if !number.is_finite() {
        return invalid(column, "non-finite number");
    }
    let millis = if number >= EPOCH_MILLIS_THRESHOLD {
        number
    } else if number >= EPOCH_SECONDS_THRESHOLD {
        number * 1000.0
    } else {
        return invalid(column, "epoch below threshold");
    };
    #[allow(clippy::cast_possible_truncation)]
    let millis = millis.round() as i64;
    match millis_to_datetime(millis) {
        Some(at) => RowValue::Timestamp(at),
        None => invalid(column, "epoch out of range"),
    }
}

/// Re-anchor an instant at UTC so stored text sorts chronologically.
fn to_utc(column: &str, at: OffsetDateTime) -> RowValue {
    match OffsetDateTime::from_unix_timestamp_nanos(at.unix_timestamp_nanos()) {
        Ok(utc) => RowValue::Timestamp(utc),
        Err(_) => invalid(column, "instant out of range"),
    }
}

fn invalid(column: &str, reason: &str) -> RowValue {
    tracing::warn!(column, reason, "unparseable time value stored as NULL");
    RowValue::Null
}
