//! Row codec.
//!
//! The primary wire format is a flat concatenation of BSON documents. Each
//! document starts with its own little-endian `i32` total length, so a table
//! dump is decoded by repeatedly reading one length prefix and one document.
//! The legacy fallback is a JSON array of row objects, optionally carrying
//! Mongo extended-JSON wrappers.

use std::path::Path;

use serde_json::Value;

use crate::legacy::{decimal128_to_string, LegacyPrimitive};
use crate::value::{Row, RowValue};

/// Hard upper bound for one encoded document, matching the legacy exporter.
pub const MAX_DOCUMENT_SIZE: usize = 16 * 1024 * 1024;
const MAX_NESTING_DEPTH: usize = 100;
const MIN_DOCUMENT_SIZE: usize = 5;

const TAG_DOUBLE: u8 = 0x01;
const TAG_STRING: u8 = 0x02;
const TAG_DOCUMENT: u8 = 0x03;
const TAG_ARRAY: u8 = 0x04;
const TAG_BINARY: u8 = 0x05;
const TAG_UNDEFINED: u8 = 0x06;
const TAG_OBJECT_ID: u8 = 0x07;
const TAG_BOOL: u8 = 0x08;
const TAG_DATETIME: u8 = 0x09;
const TAG_NULL: u8 = 0x0a;
const TAG_REGEX: u8 = 0x0b;
const TAG_DB_POINTER: u8 = 0x0c;
const TAG_JAVASCRIPT: u8 = 0x0d;
const TAG_SYMBOL: u8 = 0x0e;
const TAG_JAVASCRIPT_WITH_SCOPE: u8 = 0x0f;
const TAG_INT32: u8 = 0x10;
const TAG_TIMESTAMP: u8 = 0x11;
const TAG_INT64: u8 = 0x12;
const TAG_DECIMAL128: u8 = 0x13;
const TAG_MIN_KEY: u8 = 0xff;
const TAG_MAX_KEY: u8 = 0x7f;

const BINARY_SUBTYPE_GENERIC: u8 = 0x00;
const BINARY_SUBTYPE_OLD: u8 = 0x02;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("truncated input at byte {offset}: needed {needed} more bytes")]
    Truncated { offset: usize, needed: usize },
    #[error("invalid document length {length} at byte {offset}")]
    InvalidLength { offset: usize, length: i64 },
    #[error("unsupported element type 0x{tag:02x} at byte {offset}")]
    UnsupportedElement { tag: u8, offset: usize },
    #[error("invalid UTF-8 at byte {offset}")]
    InvalidUtf8 { offset: usize },
    #[error("document nesting exceeds the depth limit")]
    TooDeep,
    #[error("malformed JSON payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("JSON payload must be an array of row objects")]
    NotAnArray,
    #[error("JSON array element {0} is not an object")]
    NotAnObject(usize),
    #[error("field name contains a NUL byte: {0:?}")]
    KeyContainsNul(String),
    #[error("encoded document is {0} bytes, above the 16 MiB limit")]
    DocumentTooLarge(usize),
}

/// Serialization of one table entry, selected by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RowFormat {
    Bson,
    Json,
}

impl RowFormat {
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Bson => "bson",
            Self::Json => "json",
        }
    }

    #[must_use]
    pub fn from_path(path: &str) -> Option<Self> {
        let extension = Path::new(path).extension()?.to_str()?;
        if extension.eq_ignore_ascii_case("bson") {
            Some(Self::Bson)
        } else if extension.eq_ignore_ascii_case("json") {
            Some(Self::Json)
        } else {
            None
        }
    }

    /// Lower is preferred when two entries land on the same table.
    #[must_use]
    pub fn precedence(self) -> u8 {
        match self {
            Self::Bson => 0,
            Self::Json => 1,
        }
    }
}

/// Encode rows into the primary format. An empty slice encodes to zero bytes.
///
/// # Errors
/// Returns an error when a field name contains NUL or a document exceeds
/// [`MAX_DOCUMENT_SIZE`].
pub fn encode_rows(rows: &[Row]) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    for row in rows {
        encode_document(row.iter().map(|(key, value)| (key.as_str(), value)), &mut out)?;
    }
    Ok(out)
}

/// Decode a whole table payload eagerly.
///
/// # Errors
/// Returns an error on any malformed document or JSON payload.
pub fn decode_rows(bytes: &[u8], format: RowFormat) -> Result<Vec<Row>, CodecError> {
    decode_stream(bytes, format)?.collect()
}

/// Decode a table payload one document at a time.
///
/// JSON payloads are parsed up front; binary payloads are decoded lazily.
///
/// # Errors
/// Returns an error when a JSON payload is malformed.
pub fn decode_stream(bytes: &[u8], format: RowFormat) -> Result<RowStream<'_>, CodecError> {
    match format {
        RowFormat::Bson => Ok(RowStream::Bson(DocumentStream::new(bytes))),
        RowFormat::Json => Ok(RowStream::Json(decode_json_rows(bytes)?.into_iter())),
    }
}

pub enum RowStream<'a> {
    Bson(DocumentStream<'a>),
    Json(std::vec::IntoIter<Row>),
}

impl Iterator for RowStream<'_> {
    type Item = Result<Row, CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Self::Bson(stream) => stream.next(),
            Self::Json(rows) => rows.next().map(Ok),
        }
    }
}

/// Sequential reader over concatenated length-prefixed documents.
pub struct DocumentStream<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> DocumentStream<'a> {
    #[must_use]
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }
}

impl Iterator for DocumentStream<'_> {
    type Item = Result<Row, CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.bytes.len() {
            return None;
        }
        match document_span(self.bytes, self.offset) {
            Ok(length) => {
                let start = self.offset;
                self.offset += length;
                let mut reader = Reader::new(&self.bytes[start..start + length], start);
                Some(reader.document_body(length, 0).map(|fields| fields.into_iter().collect()))
            }
            Err(err) => {
                self.offset = self.bytes.len();
                Some(Err(err))
            }
        }
    }
}

/// Validate the length prefix at `offset` and return the document length.
fn document_span(bytes: &[u8], offset: usize) -> Result<usize, CodecError> {
    let available = bytes.len() - offset;
    if available < 4 {
        return Err(CodecError::Truncated { offset, needed: 4 - available });
    }
    let mut prefix = [0_u8; 4];
    prefix.copy_from_slice(&bytes[offset..offset + 4]);
    let declared = i32::from_le_bytes(prefix);
    let length = usize::try_from(declared)
        .ok()
        .filter(|length| *length >= MIN_DOCUMENT_SIZE)
        .ok_or(CodecError::InvalidLength { offset, length: i64::from(declared) })?;
    if length > available {
        return Err(CodecError::Truncated { offset, needed: length - available });
    }
    Ok(length)
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
    base: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8], base: usize) -> Self {
        Self { bytes, pos: 0, base }
    }

    fn offset(&self) -> usize {
        self.base + self.pos
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], CodecError> {
        let remaining = self.bytes.len() - self.pos;
        if count > remaining {
            return Err(CodecError::Truncated { offset: self.offset(), needed: count - remaining });
        }
        let slice = &self.bytes[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0_u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn i32(&mut self) -> Result<i32, CodecError> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64, CodecError> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    fn f64(&mut self) -> Result<f64, CodecError> {
        Ok(f64::from_le_bytes(self.array()?))
    }

    fn length(&mut self, minimum: usize) -> Result<usize, CodecError> {
        let offset = self.offset();
        let declared = self.i32()?;
        usize::try_from(declared)
            .ok()
            .filter(|length| *length >= minimum)
            .ok_or(CodecError::InvalidLength { offset, length: i64::from(declared) })
    }

    fn cstring(&mut self) -> Result<String, CodecError> {
        let offset = self.offset();
        let rest = &self.bytes[self.pos..];
        let end = rest
            .iter()
            .position(|byte| *byte == 0)
            .ok_or(CodecError::Truncated { offset, needed: 1 })?;
        let text =
            std::str::from_utf8(&rest[..end]).map_err(|_| CodecError::InvalidUtf8 { offset })?;
        self.pos += end + 1;
        Ok(text.to_string())
    }

    fn string(&mut self) -> Result<String, CodecError> {
        let length = self.length(1)?;
        let offset = self.offset();
        let raw = self.take(length)?;
        let (text, terminator) = raw.split_at(length - 1);
        if terminator != [0] {
            return Err(CodecError::InvalidLength {
                offset,
                length: i64::try_from(length).unwrap_or(i64::MAX),
            });
        }
        std::str::from_utf8(text)
            .map(str::to_string)
            .map_err(|_| CodecError::InvalidUtf8 { offset })
    }

    /// Parse the elements of a document whose length prefix has already been
    /// validated as `length` and sits at the current position.
    fn document_body(
        &mut self,
        length: usize,
        depth: usize,
    ) -> Result<Vec<(String, RowValue)>, CodecError> {
        if depth > MAX_NESTING_DEPTH {
            return Err(CodecError::TooDeep);
        }
        let start = self.pos;
        self.take(4)?;
        let end = start + length - 1;
        let mut fields = Vec::new();
        while self.pos < end {
            let tag_offset = self.offset();
            let tag = self.u8()?;
            let key = self.cstring()?;
            let value = self.element(tag, tag_offset, depth)?;
            fields.push((key, value));
        }
        if self.pos != end || self.u8()? != 0 {
            return Err(CodecError::InvalidLength {
                offset: self.base + start,
                length: i64::try_from(length).unwrap_or(i64::MAX),
            });
        }
        Ok(fields)
    }

    fn nested(&mut self, depth: usize) -> Result<Vec<(String, RowValue)>, CodecError> {
        let offset = self.offset();
        let length = document_span(self.bytes, self.pos).map_err(|err| match err {
            CodecError::InvalidLength { length, .. } => {
                CodecError::InvalidLength { offset, length }
            }
            CodecError::Truncated { needed, .. } => CodecError::Truncated { offset, needed },
            other => other,
        })?;
        self.document_body(length, depth + 1)
    }

    fn element(&mut self, tag: u8, offset: usize, depth: usize) -> Result<RowValue, CodecError> {
        let value = match tag {
            TAG_DOUBLE => RowValue::Float(self.f64()?),
            TAG_STRING => RowValue::Text(self.string()?),
            TAG_DOCUMENT => RowValue::Map(self.nested(depth)?.into_iter().collect()),
            TAG_ARRAY => {
                RowValue::List(self.nested(depth)?.into_iter().map(|(_, value)| value).collect())
            }
            TAG_BINARY => {
                let length = self.length(0)?;
                let subtype = self.u8()?;
                let mut bytes = self.take(length)?;
                if subtype == BINARY_SUBTYPE_OLD && bytes.len() >= 4 {
                    bytes = &bytes[4..];
                }
                LegacyPrimitive::Binary { subtype, bytes: bytes.to_vec() }.normalize()
            }
            TAG_UNDEFINED => LegacyPrimitive::Undefined.normalize(),
            TAG_OBJECT_ID => LegacyPrimitive::ObjectId(self.array()?).normalize(),
            TAG_BOOL => RowValue::Bool(self.u8()? != 0),
            TAG_DATETIME => LegacyPrimitive::DateTime(self.i64()?).normalize(),
            TAG_NULL => RowValue::Null,
            TAG_REGEX => {
                let pattern = self.cstring()?;
                let options = self.cstring()?;
                LegacyPrimitive::Regex { pattern, options }.normalize()
            }
            TAG_DB_POINTER => {
                let namespace = self.string()?;
                let id = self.array()?;
                LegacyPrimitive::DbPointer { namespace, id }.normalize()
            }
            TAG_JAVASCRIPT => LegacyPrimitive::JavaScript(self.string()?).normalize(),
            TAG_SYMBOL => LegacyPrimitive::Symbol(self.string()?).normalize(),
            TAG_JAVASCRIPT_WITH_SCOPE => {
                let total_offset = self.offset();
                let total = self.length(4)?;
                let start = self.pos;
                let code = self.string()?;
                let consumed = self.pos - start;
                let scope = (total - 4).checked_sub(consumed).ok_or(CodecError::InvalidLength {
                    offset: total_offset,
                    length: i64::try_from(total).unwrap_or(i64::MAX),
                })?;
                self.take(scope)?;
                LegacyPrimitive::JavaScript(code).normalize()
            }
            TAG_INT32 => RowValue::Int(i64::from(self.i32()?)),
            TAG_TIMESTAMP => {
                let increment = self.u32()?;
                let seconds = self.u32()?;
                LegacyPrimitive::Timestamp { seconds, increment }.normalize()
            }
            TAG_INT64 => RowValue::Int(self.i64()?),
            TAG_DECIMAL128 => {
                LegacyPrimitive::Decimal(decimal128_to_string(self.array()?)).normalize()
            }
            TAG_MIN_KEY => LegacyPrimitive::MinKey.normalize(),
            TAG_MAX_KEY => LegacyPrimitive::MaxKey.normalize(),
            other => return Err(CodecError::UnsupportedElement { tag: other, offset }),
        };
        Ok(value)
    }
}

fn encode_document<'v>(
    fields: impl Iterator<Item = (&'v str, &'v RowValue)>,
    out: &mut Vec<u8>,
) -> Result<(), CodecError> {
    let start = out.len();
    out.extend_from_slice(&[0; 4]);
    for (key, value) in fields {
        encode_element(key, value, out)?;
    }
    out.push(0);

    let length = out.len() - start;
    if length > MAX_DOCUMENT_SIZE {
        return Err(CodecError::DocumentTooLarge(length));
    }
    let prefix = i32::try_from(length).map_err(|_| CodecError::DocumentTooLarge(length))?;
    out[start..start + 4].copy_from_slice(&prefix.to_le_bytes());
    Ok(())
}

fn encode_element(key: &str, value: &RowValue, out: &mut Vec<u8>) -> Result<(), CodecError> {
    let tag = match value {
        RowValue::Null => TAG_NULL,
        RowValue::Bool(_) => TAG_BOOL,
        RowValue::Int(number) if i32::try_from(*number).is_ok() => TAG_INT32,
        RowValue::Int(_) => TAG_INT64,
        RowValue::Float(_) => TAG_DOUBLE,
        RowValue::Text(_) => TAG_STRING,
        RowValue::Bytes(_) => TAG_BINARY,
        RowValue::Timestamp(_) => TAG_DATETIME,
        RowValue::List(_) => TAG_ARRAY,
        RowValue::Map(_) => TAG_DOCUMENT,
    };
    out.push(tag);
    write_cstring(key, out)?;

    match value {
        RowValue::Null => {}
        RowValue::Bool(flag) => out.push(u8::from(*flag)),
        RowValue::Int(number) => match i32::try_from(*number) {
            Ok(small) => out.extend_from_slice(&small.to_le_bytes()),
            Err(_) => out.extend_from_slice(&number.to_le_bytes()),
        },
        RowValue::Float(number) => out.extend_from_slice(&number.to_le_bytes()),
        RowValue::Text(text) => write_string(text, out)?,
        RowValue::Bytes(bytes) => {
            write_length(bytes.len(), out)?;
            out.push(BINARY_SUBTYPE_GENERIC);
            out.extend_from_slice(bytes);
        }
        RowValue::Timestamp(at) => {
            let millis = i64::try_from(at.unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX);
            out.extend_from_slice(&millis.to_le_bytes());
        }
        RowValue::List(items) => {
            let keys = (0..items.len()).map(|index| index.to_string()).collect::<Vec<_>>();
            encode_document(keys.iter().map(String::as_str).zip(items.iter()), out)?;
        }
        RowValue::Map(row) => {
            encode_document(row.iter().map(|(key, value)| (key.as_str(), value)), out)?;
        }
    }
    Ok(())
}

fn write_cstring(text: &str, out: &mut Vec<u8>) -> Result<(), CodecError> {
    if text.as_bytes().contains(&0) {
        return Err(CodecError::KeyContainsNul(text.to_string()));
    }
    out.extend_from_slice(text.as_bytes());
    out.push(0);
    Ok(())
}

fn write_string(text: &str, out: &mut Vec<u8>) -> Result<(), CodecError> {
    write_length(text.len() + 1, out)?;
    out.extend_from_slice(text.as_bytes());
    out.push(0);
    Ok(())
}

fn write_length(length: usize, out: &mut Vec<u8>) -> Result<(), CodecError> {
    if length > MAX_DOCUMENT_SIZE {
        return Err(CodecError::DocumentTooLarge(length));
    }
    let prefix = i32::try_from(length).map_err(|_| CodecError::DocumentTooLarge(length))?;
    out.extend_from_slice(&prefix.to_le_bytes());
    Ok(())
}

fn decode_json_rows(bytes: &[u8]) -> Result<Vec<Row>, CodecError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    let Value::Array(items) = serde_json::from_slice::<Value>(bytes)? else {
        return Err(CodecError::NotAnArray);
    };
    items
        .iter()
        .enumerate()
        .map(|(index, item)| match json_to_value(item) {
            RowValue::Map(row) => Ok(row),
            _ => Err(CodecError::NotAnObject(index)),
        })
        .collect()
}

fn json_to_value(value: &Value) -> RowValue {
    match value {
        Value::Object(object) => {
            if let Some(primitive) = LegacyPrimitive::from_extended_json(object) {
                return primitive.normalize();
            }
            if let Some(number) = extended_json_number(object) {
                return number;
            }
            RowValue::Map(
                object.iter().map(|(key, value)| (key.clone(), json_to_value(value))).collect(),
            )
        }
        Value::Array(items) => RowValue::List(items.iter().map(json_to_value).collect()),
        other => RowValue::from(other),
    }
}

fn extended_json_number(object: &serde_json::Map<String, Value>) -> Option<RowValue> {
    if object.len() != 1 {
        return None;
    }
    let (key, value) = object.iter().next()?;
    let raw = value.as_str()?;
    match key.as_str() {
        "$numberLong" | "$numberInt" => raw.parse().ok().map(RowValue::Int),
        "$numberDouble" => raw.parse().ok().map(RowValue::Float),
        _ => None,
    }
}
