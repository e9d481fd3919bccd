use std::io::Cursor;

use time::macros::format_description;
use time::OffsetDateTime;

use crate::db::Database;
use crate::error::{BackupError, BackupResult};
use crate::export::{export_archive, ExportSummary};
use crate::settings::BackupSettings;

pub const ARCHIVE_CONTENT_TYPE: &str = "application/zip";

/// Destination for finished archives, e.g. an S3-compatible bucket.
pub trait ObjectStore {
    /// Store `body` under `key` and return a URL where it can be fetched.
    ///
    /// # Errors
    /// Returns a human-readable reason when the upload fails.
    fn put_object(&self, key: &str, body: &[u8], content_type: &str) -> Result<String, String>;
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct UploadedArchive {
    pub key: String,
    pub url: String,
    pub size: usize,
    pub export: ExportSummary,
}

/// Object key for an archive created at `at`: `<prefix>/<YYYY-MM-DD-HH-MM-SS>.zip`.
#[must_use]
pub fn archive_key(prefix: &str, at: OffsetDateTime) -> String {
    let stamp = at
        .format(format_description!("[year]-[month]-[day]-[hour]-[minute]-[second]"))
        .unwrap_or_else(|_| at.unix_timestamp().to_string());
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("{stamp}.zip")
    } else {
        format!("{prefix}/{stamp}.zip")
    }
}

/// Export into memory and hand the archive to `store`.
///
/// # Errors
/// Returns an error when the export fails or the store rejects the upload.
pub fn export_to_object_store<D, S>(
    db: &D,
    store: &S,
    prefix: &str,
    settings: &BackupSettings,
) -> BackupResult<UploadedArchive>
where
    D: Database,
    S: ObjectStore + ?Sized,
{
    let mut buffer = Cursor::new(Vec::new());
    let export = export_archive(db, &mut buffer, settings)?;
    let body = buffer.into_inner();
    let key = archive_key(prefix, export.manifest.created_at);

    let url = store.put_object(&key, &body, ARCHIVE_CONTENT_TYPE).map_err(|reason| {
        BackupError::Io(std::io::Error::other(format!("upload of {key} failed: {reason}")))
    })?;
    tracing::info!(key = key.as_str(), size = body.len(), "uploaded archive");
    Ok(UploadedArchive { key, url, size: body.len(), export })
}
