use std::io::{Read, Seek};

use crate::archive::{ArchiveReader, LEGACY_ASSET_DIR};
use crate::db::Transaction;
use crate::error::{BackupError, BackupResult};

/// Legacy template files and the option rows they are restored into.
pub const LEGACY_TEMPLATES: &[(&str, &str)] = &[
    ("owner.template.ejs", "email_template_owner"),
    ("guest.template.ejs", "email_template_guest"),
    ("newsletter.template.ejs", "email_template_newsletter"),
];

/// Option name for a legacy asset path, if the file is one of the known templates.
#[must_use]
pub fn template_option(path: &str) -> Option<&'static str> {
    let (_, file) = path.rsplit_once(LEGACY_ASSET_DIR)?;
    LEGACY_TEMPLATES.iter().find(|(name, _)| *name == file).map(|(_, option)| *option)
}

/// Store each recognised template's trimmed text as its own option row.
/// Returns the option names written.
///
/// # Errors
/// Returns an error when an entry cannot be read or the option write fails.
pub fn import_legacy_assets<R, T>(
    archive: &mut ArchiveReader<R>,
    paths: &[String],
    tx: &T,
) -> BackupResult<Vec<String>>
where
    R: Read + Seek,
    T: Transaction,
{
    let mut imported = Vec::new();
    for path in paths {
        let Some(option) = template_option(path) else {
            tracing::debug!(entry = path.as_str(), "ignoring unrecognised legacy asset");
            continue;
        };
        let bytes = archive.read_entry(path)?;
        let text = String::from_utf8_lossy(&bytes);
        let content = text.trim();
        if content.is_empty() {
            tracing::debug!(entry = path.as_str(), "skipping empty legacy template");
            continue;
        }
        tx.put_option(option, content)
            .map_err(|source| BackupError::Database { table: "options".to_string(), source })?;
        tracing::info!(entry = path.as_str(), option, "imported legacy template");
        imported.push(option.to_string());
    }
    Ok(imported)
}
