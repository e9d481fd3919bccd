use std::io::{Seek, Write};

use serde::Serialize;
use time::OffsetDateTime;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use crate::archive::{
    manifest_path, table_entry_path, FileDigest, Manifest, MANIFEST_FORMAT, MANIFEST_VERSION,
};
use crate::codec::encode_rows;
use crate::db::Database;
use crate::error::BackupResult;
use crate::registry::TableRegistry;
use crate::settings::BackupSettings;

/// Summary of an export run.
#[derive(Debug, Clone, Serialize)]
pub struct ExportSummary {
    pub manifest: Manifest,
    /// Tables that could not be queried or encoded, with the reason.
    pub skipped: Vec<SkippedTable>,
    pub total_rows: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedTable {
    pub table: String,
    pub reason: String,
}

/// Export every canonical table into a zip archive written to `writer`.
///
/// Best effort: a table that fails to query or encode is logged, left out of
/// the archive and the manifest, and the export carries on. No transaction
/// is held, so concurrent writers may be partially reflected.
///
/// # Errors
/// Returns an error only when the archive itself cannot be written.
pub fn export_archive<D, W>(
    db: &D,
    writer: W,
    settings: &BackupSettings,
) -> BackupResult<ExportSummary>
where
    D: Database,
    W: Write + Seek,
{
    let root = settings.root();
    let options = SimpleFileOptions::default().compression_method(settings.compression.method());
    let mut zip = ZipWriter::new(writer);

    let mut tables = Vec::new();
    let mut files = Vec::new();
    let mut skipped = Vec::new();
    let mut total_rows = 0;

    for table in TableRegistry::global().tables() {
        let rows = match db.query_rows(table) {
            Ok(rows) => rows,
            Err(err) => {
                tracing::warn!(table, error = %err, "skipping table that could not be queried");
                skipped.push(SkippedTable { table: (*table).to_string(), reason: err.to_string() });
                continue;
            }
        };
        let bytes = match encode_rows(&rows) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(table, error = %err, "skipping table that could not be encoded");
                skipped.push(SkippedTable { table: (*table).to_string(), reason: err.to_string() });
                continue;
            }
        };

        let path = table_entry_path(root, table);
        zip.start_file(path.as_str(), options)?;
        zip.write_all(&bytes)?;

        tracing::info!(table, rows = rows.len(), "exported table");
        total_rows += rows.len();
        files.push(FileDigest::compute(&path, &bytes, rows.len()));
        tables.push((*table).to_string());
    }

    let manifest = Manifest {
        format: MANIFEST_FORMAT.to_string(),
        version: MANIFEST_VERSION,
        engine: db.engine().to_string(),
        created_at: OffsetDateTime::now_utc(),
        tables,
        files,
    };
    zip.start_file(manifest_path(root), options)?;
    zip.write_all(serde_json::to_string_pretty(&manifest)?.as_bytes())?;
    zip.finish()?;

    tracing::info!(
        tables = manifest.tables.len(),
        skipped = skipped.len(),
        total_rows,
        "export complete"
    );
    Ok(ExportSummary { manifest, skipped, total_rows })
}
