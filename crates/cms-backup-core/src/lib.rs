//! Backup and restore engine for the CMS relational store.
//!
//! Export walks the canonical table catalog and writes a zip archive of
//! per-table document streams plus a manifest. Restore reads any generation
//! of that archive back inside a single transaction, absorbing legacy table
//! names, field spellings and value encodings on the way in.

pub mod aliases;
pub mod archive;
pub mod assets;
pub mod codec;
pub mod coerce;
pub mod config_migrate;
pub mod db;
pub mod error;
pub mod export;
pub mod legacy;
pub mod naming;
pub mod normalize;
pub mod registry;
pub mod restore;
pub mod schema;
pub mod settings;
pub mod upload;
pub mod value;

#[cfg(test)]
mod testing;

pub use archive::{ArchiveReader, FileDigest, Manifest, ScanPlan, TableEntry};
pub use codec::{decode_rows, decode_stream, encode_rows, CodecError, DocumentStream, RowFormat};
pub use config_migrate::CONFIG_OPTION_NAME;
pub use db::{ColumnInfo, Database, OptionRow, Transaction};
pub use error::{BackupError, BackupResult, DbError};
pub use export::{export_archive, ExportSummary, SkippedTable};
pub use legacy::LegacyPrimitive;
pub use registry::TableRegistry;
pub use restore::{inspect_archive, restore_archive, RestoreStage, RestoreSummary, TableReport};
pub use schema::{ColumnCategory, ColumnSet};
pub use settings::{BackupSettings, Compression};
pub use upload::{export_to_object_store, ObjectStore, UploadedArchive};
pub use value::{Row, RowValue};
