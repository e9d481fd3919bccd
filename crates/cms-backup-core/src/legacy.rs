//! Document-database primitives that only appear in archives written by the
//! legacy exporter.
//!
//! Every variant collapses into a [`RowValue`] through [`LegacyPrimitive::normalize`];
//! nothing downstream of the codec sees these types.

use base64::{engine::general_purpose, Engine as _};
use serde_json::{Map, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::value::RowValue;

const BINARY_SUBTYPE_UUID_OLD: u8 = 0x03;
const BINARY_SUBTYPE_UUID: u8 = 0x04;
const DECIMAL128_EXPONENT_BIAS: i32 = 6176;
const DECIMAL128_MAX_COEFFICIENT: u128 = 9_999_999_999_999_999_999_999_999_999_999;
const DECIMAL128_PLAIN_EXPONENT_LIMIT: i32 = 40;

#[derive(Debug, Clone, PartialEq)]
pub enum LegacyPrimitive {
    ObjectId([u8; 12]),
    /// Milliseconds since the Unix epoch.
    DateTime(i64),
    /// Decimal128 already rendered as decimal text.
    Decimal(String),
    Binary { subtype: u8, bytes: Vec<u8> },
    Regex { pattern: String, options: String },
    /// Replication timestamp: seconds plus an ordinal within that second.
    Timestamp { seconds: u32, increment: u32 },
    Symbol(String),
    JavaScript(String),
    DbPointer { namespace: String, id: [u8; 12] },
    Undefined,
    MinKey,
    MaxKey,
}

impl LegacyPrimitive {
    /// Convert into the engine's value model.
    #[must_use]
    pub fn normalize(self) -> RowValue {
        match self {
            Self::ObjectId(id) | Self::DbPointer { id, .. } => RowValue::Text(hex::encode(id)),
            Self::DateTime(millis) => millis_to_datetime(millis)
                .map_or(RowValue::Null, RowValue::Timestamp),
            Self::Decimal(text) | Self::Symbol(text) | Self::JavaScript(text) => {
                RowValue::Text(text)
            }
            Self::Binary { subtype, bytes } => {
                let uuid = matches!(subtype, BINARY_SUBTYPE_UUID | BINARY_SUBTYPE_UUID_OLD);
                if uuid && bytes.len() == 16 {
                    RowValue::Text(format_uuid(&bytes))
                } else {
                    RowValue::Bytes(bytes)
                }
            }
            Self::Regex { pattern, options } => RowValue::Text(format!("/{pattern}/{options}")),
            Self::Timestamp { seconds, .. } => {
                OffsetDateTime::from_unix_timestamp(i64::from(seconds))
                    .map_or(RowValue::Null, RowValue::Timestamp)
            }
            Self::Undefined | Self::MinKey | Self::MaxKey => RowValue::Null,
        }
    }

    /// Recognise a canonical or relaxed extended-JSON wrapper object.
    ///
    /// Returns `None` for ordinary objects so the caller can treat them as maps.
    #[must_use]
    pub fn from_extended_json(object: &Map<String, Value>) -> Option<Self> {
        let (key, value) = match object.len() {
            1 => object.iter().next()?,
            2 if object.contains_key("$binary") && object.contains_key("$type") => {
                return legacy_binary(object);
            }
            _ => return None,
        };

        match key.as_str() {
            "$oid" => parse_object_id(value.as_str()?).map(Self::ObjectId),
            "$date" => parse_extended_date(value).map(Self::DateTime),
            "$numberDecimal" => Some(Self::Decimal(value.as_str()?.to_string())),
            "$binary" => {
                let inner = value.as_object()?;
                let bytes = general_purpose::STANDARD.decode(inner.get("base64")?.as_str()?).ok()?;
                let subtype = u8::from_str_radix(inner.get("subType")?.as_str()?, 16).ok()?;
                Some(Self::Binary { subtype, bytes })
            }
            "$regularExpression" => {
                let inner = value.as_object()?;
                Some(Self::Regex {
                    pattern: inner.get("pattern")?.as_str()?.to_string(),
                    options: inner.get("options")?.as_str()?.to_string(),
                })
            }
            "$timestamp" => {
                let inner = value.as_object()?;
                Some(Self::Timestamp {
                    seconds: u32::try_from(inner.get("t")?.as_u64()?).ok()?,
                    increment: u32::try_from(inner.get("i")?.as_u64()?).ok()?,
                })
            }
            "$symbol" => Some(Self::Symbol(value.as_str()?.to_string())),
            "$code" => Some(Self::JavaScript(value.as_str()?.to_string())),
            "$undefined" => Some(Self::Undefined),
            "$minKey" => Some(Self::MinKey),
            "$maxKey" => Some(Self::MaxKey),
            _ => None,
        }
    }
}

fn legacy_binary(object: &Map<String, Value>) -> Option<LegacyPrimitive> {
    let bytes = general_purpose::STANDARD.decode(object.get("$binary")?.as_str()?).ok()?;
    let subtype = u8::from_str_radix(object.get("$type")?.as_str()?, 16).ok()?;
    Some(LegacyPrimitive::Binary { subtype, bytes })
}

fn parse_object_id(raw: &str) -> Option<[u8; 12]> {
    let decoded = hex::decode(raw).ok()?;
    decoded.try_into().ok()
}

fn parse_extended_date(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => {
            let at = OffsetDateTime::parse(text, &Rfc3339).ok()?;
            i64::try_from(at.unix_timestamp_nanos() / 1_000_000).ok()
        }
        Value::Object(inner) => inner.get("$numberLong")?.as_str()?.parse().ok(),
        _ => None,
    }
}

pub(crate) fn millis_to_datetime(millis: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000).ok()
}

fn format_uuid(bytes: &[u8]) -> String {
    let hex = hex::encode(bytes);
    format!("{}-{}-{}-{}-{}", &hex[0..8], &hex[8..12], &hex[12..16], &hex[16..20], &hex[20..32])
}

/// Render an IEEE 754-2008 BID-encoded decimal128 (little-endian) as text.
#[must_use]
pub fn decimal128_to_string(bytes: [u8; 16]) -> String {
    let bits = u128::from_le_bytes(bytes);
    let negative = bits >> 127 == 1;
    let sign = if negative { "-" } else { "" };

    match (bits >> 122) & 0x1f {
        0x1f => return "NaN".to_string(),
        0x1e => return format!("{sign}Infinity"),
        _ => {}
    }

    let (biased_exponent, coefficient) = if (bits >> 125) & 0b11 == 0b11 {
        // The implicit 0b100 prefix always pushes the coefficient past 10^34.
        ((bits >> 111) & 0x3fff, 0)
    } else {
        let coefficient = bits & ((1_u128 << 113) - 1);
        let coefficient = if coefficient > DECIMAL128_MAX_COEFFICIENT { 0 } else { coefficient };
        ((bits >> 113) & 0x3fff, coefficient)
    };
    let exponent = i32::try_from(biased_exponent).unwrap_or(0) - DECIMAL128_EXPONENT_BIAS;
    let digits = coefficient.to_string();

    if exponent.abs() > DECIMAL128_PLAIN_EXPONENT_LIMIT {
        return format!("{sign}{digits}E{exponent:+}");
    }
    if exponent >= 0 {
        if coefficient == 0 {
            return format!("{sign}0");
        }
        let zeros = "0".repeat(usize::try_from(exponent).unwrap_or(0));
        return format!("{sign}{digits}{zeros}");
    }

    let scale = usize::try_from(-exponent).unwrap_or(0);
    if digits.len() > scale {
        let (whole, fraction) = digits.split_at(digits.len() - scale);
        format!("{sign}{whole}.{fraction}")
    } else {
        let padding = "0".repeat(scale - digits.len());
        format!("{sign}0.{padding}{digits}")
    }
}
