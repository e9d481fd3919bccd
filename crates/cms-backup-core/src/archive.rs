//! Archive container: entry paths, the manifest, and the read side used by
//! restore and inspection.

use std::collections::BTreeMap;
use std::io::{Read, Seek};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use zip::ZipArchive;

use crate::codec::RowFormat;
use crate::error::{BackupError, BackupResult};
use crate::registry::TableRegistry;

pub const MANIFEST_FORMAT: &str = "cms-backup";
pub const MANIFEST_VERSION: u32 = 2;
pub const MANIFEST_FILE: &str = "manifest.json";
const METADATA_SUFFIX: &str = ".metadata.json";
/// Directory in which older archives shipped customizable templates.
pub const LEGACY_ASSET_DIR: &str = "assets/email-template/";

#[must_use]
pub fn table_entry_path(root: &str, table: &str) -> String {
    format!("{root}/db/{table}.{}", RowFormat::Bson.extension())
}

#[must_use]
pub fn manifest_path(root: &str) -> String {
    format!("{root}/{MANIFEST_FILE}")
}

/// Provenance record written next to the table entries. Informational only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub format: String,
    pub version: u32,
    pub engine: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub tables: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileDigest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDigest {
    pub path: String,
    pub sha256: String,
    pub rows: usize,
}

impl FileDigest {
    #[must_use]
    pub fn compute(path: &str, bytes: &[u8], rows: usize) -> Self {
        Self { path: path.to_string(), sha256: sha256_hex(bytes), rows }
    }
}

#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// The archive entry chosen for one canonical table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableEntry {
    pub table: &'static str,
    pub path: String,
    pub format: RowFormat,
}

/// Result of the scanning stage.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanPlan {
    /// Chosen entry per table, keyed by canonical name.
    pub tables: BTreeMap<&'static str, TableEntry>,
    /// Entries that lost to a preferred entry for the same table.
    pub shadowed: Vec<String>,
    /// Entries that resolve to no canonical table.
    pub ignored: Vec<String>,
    /// Legacy template files, by archive path.
    pub assets: Vec<String>,
    pub manifest: Option<Manifest>,
}

impl ScanPlan {
    /// Chosen entries in registry order.
    #[must_use]
    pub fn in_import_order(&self) -> Vec<&TableEntry> {
        TableRegistry::global().tables().iter().filter_map(|table| self.tables.get(table)).collect()
    }

    fn offer(&mut self, candidate: TableEntry) {
        let Some(current) = self.tables.get(candidate.table) else {
            self.tables.insert(candidate.table, candidate);
            return;
        };
        if candidate.rank() < current.rank() {
            tracing::debug!(
                table = candidate.table,
                preferred = candidate.path.as_str(),
                replaced = current.path.as_str(),
                "preferring archive entry"
            );
            self.shadowed.push(current.path.clone());
            self.tables.insert(candidate.table, candidate);
        } else {
            self.shadowed.push(candidate.path);
        }
    }
}

impl TableEntry {
    /// Lower ranks win: binary over JSON, then canonical file names over aliases.
    fn rank(&self) -> (u8, u8) {
        let canonical = match classify_entry(&self.path) {
            EntryKind::Table { stem, .. } => stem == self.table,
            _ => false,
        };
        (self.format.precedence(), u8::from(!canonical))
    }
}

/// Read-only view of an archive.
pub struct ArchiveReader<R> {
    zip: ZipArchive<R>,
}

impl<R: Read + Seek> ArchiveReader<R> {
    /// # Errors
    /// Returns [`BackupError::ArchiveFormat`] when the container is unreadable.
    pub fn open(reader: R) -> BackupResult<Self> {
        let zip =
            ZipArchive::new(reader).map_err(|err| BackupError::ArchiveFormat(err.to_string()))?;
        Ok(Self { zip })
    }

    /// File entries in archive order, directories excluded.
    ///
    /// # Errors
    /// Returns [`BackupError::ArchiveFormat`] when the central directory is corrupt.
    pub fn entry_names(&mut self) -> BackupResult<Vec<String>> {
        let mut names = Vec::with_capacity(self.zip.len());
        for index in 0..self.zip.len() {
            let entry = self
                .zip
                .by_index(index)
                .map_err(|err| BackupError::ArchiveFormat(err.to_string()))?;
            if !entry.is_dir() {
                names.push(entry.name().to_string());
            }
        }
        Ok(names)
    }

    /// # Errors
    /// Returns an error when the entry is missing or its data is corrupt.
    pub fn read_entry(&mut self, name: &str) -> BackupResult<Vec<u8>> {
        let mut entry = self.zip.by_name(name)?;
        let mut bytes = Vec::with_capacity(usize::try_from(entry.size()).unwrap_or_default());
        entry.read_to_end(&mut bytes)?;
        Ok(bytes)
    }

    /// Classify every entry and choose one entry per canonical table.
    ///
    /// Preference when several entries land on the same table: the binary
    /// format beats JSON, then an entry already named canonically beats an
    /// aliased one, then the earlier entry in archive order wins.
    ///
    /// # Errors
    /// Returns [`BackupError::ArchiveFormat`] when the entry list is unreadable.
    pub fn scan(&mut self) -> BackupResult<ScanPlan> {
        let registry = TableRegistry::global();
        let mut plan = ScanPlan::default();
        let mut manifest_entry = None;

        for name in self.entry_names()? {
            match classify_entry(&name) {
                EntryKind::Manifest => {
                    if manifest_entry.is_none() {
                        manifest_entry = Some(name);
                    }
                }
                EntryKind::Metadata => {}
                EntryKind::Asset => plan.assets.push(name),
                EntryKind::Table { stem, format } => match registry.resolve(stem) {
                    Some(table) => plan.offer(TableEntry { table, path: name.clone(), format }),
                    None => {
                        tracing::info!(entry = name.as_str(), "ignoring entry for unknown table");
                        plan.ignored.push(name);
                    }
                },
                EntryKind::Other => plan.ignored.push(name),
            }
        }

        if let Some(path) = manifest_entry {
            plan.manifest = self.read_manifest(&path);
        }
        Ok(plan)
    }

    fn read_manifest(&mut self, path: &str) -> Option<Manifest> {
        let parsed = self.read_entry(path).and_then(|bytes| {
            serde_json::from_slice::<Manifest>(&bytes).map_err(BackupError::from)
        });
        match parsed {
            Ok(manifest) => Some(manifest),
            Err(err) => {
                tracing::warn!(entry = path, error = %err, "ignoring unreadable manifest");
                None
            }
        }
    }
}

enum EntryKind<'a> {
    Manifest,
    Metadata,
    Asset,
    Table { stem: &'a str, format: RowFormat },
    Other,
}

fn classify_entry(name: &str) -> EntryKind<'_> {
    let file_name = name.rsplit('/').next().unwrap_or(name);
    if file_name == MANIFEST_FILE {
        return EntryKind::Manifest;
    }
    if file_name.ends_with(METADATA_SUFFIX) {
        return EntryKind::Metadata;
    }
    if is_asset_path(name) {
        return EntryKind::Asset;
    }
    match RowFormat::from_path(file_name) {
        Some(format) => {
            let stem = &file_name[..file_name.len() - format.extension().len() - 1];
            EntryKind::Table { stem, format }
        }
        None => EntryKind::Other,
    }
}

/// Whether `name` lives in the legacy asset directory, under any root prefix.
#[must_use]
pub fn is_asset_path(name: &str) -> bool {
    name.starts_with(LEGACY_ASSET_DIR) || name.contains(&format!("/{LEGACY_ASSET_DIR}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn archive(entries: &[(&str, &[u8])]) -> anyhow::Result<ArchiveReader<Cursor<Vec<u8>>>> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        for (name, bytes) in entries {
            zip.start_file(*name, options)?;
            zip.write_all(bytes)?;
        }
        let cursor = zip.finish()?;
        Ok(ArchiveReader::open(Cursor::new(cursor.into_inner()))?)
    }

    #[test]
    fn binary_entry_beats_json_alias() -> anyhow::Result<()> {
        let mut reader = archive(&[
            ("backup/db/sessions.json", b"[]"),
            ("backup/db/user_sessions.bson", b""),
        ])?;
        let plan = reader.scan()?;
        let entry = plan.tables.get("sessions").ok_or_else(|| anyhow::anyhow!("sessions missing"))?;
        assert_eq!(entry.path, "backup/db/user_sessions.bson");
        assert_eq!(plan.shadowed, vec!["backup/db/sessions.json".to_string()]);
        Ok(())
    }

    #[test]
    fn canonical_stem_beats_alias_within_a_format() -> anyhow::Result<()> {
        let mut reader = archive(&[("dump/post.bson", b""), ("dump/posts.bson", b"")])?;
        let plan = reader.scan()?;
        assert_eq!(
            plan.tables.get("posts").map(|entry| entry.path.as_str()),
            Some("dump/posts.bson")
        );
        Ok(())
    }

    #[test]
    fn first_entry_wins_remaining_ties() -> anyhow::Result<()> {
        let mut reader = archive(&[("a/posts.bson", b""), ("b/posts.bson", b"")])?;
        let plan = reader.scan()?;
        assert_eq!(plan.tables.get("posts").map(|entry| entry.path.as_str()), Some("a/posts.bson"));
        Ok(())
    }

    #[test]
    fn entries_are_classified() -> anyhow::Result<()> {
        let mut reader = archive(&[
            ("backup/manifest.json", b"not json"),
            ("backup/db/posts.metadata.json", b"{}"),
            ("backup/db/system.profile.bson", b""),
            ("backup/readme.txt", b"hi"),
            ("backup/assets/email-template/owner.template.ejs", b"<p>"),
            ("backup/db/Comments.BSON", b""),
        ])?;
        let plan = reader.scan()?;
        assert!(plan.manifest.is_none());
        assert_eq!(plan.ignored.len(), 2);
        assert_eq!(
            plan.assets,
            vec!["backup/assets/email-template/owner.template.ejs".to_string()]
        );
        assert!(plan.tables.contains_key("comments"));
        Ok(())
    }

    #[test]
    fn import_order_follows_the_registry() -> anyhow::Result<()> {
        let mut reader = archive(&[
            ("x/options.bson", b""),
            ("x/comments.bson", b""),
            ("x/posts.bson", b""),
        ])?;
        let plan = reader.scan()?;
        let order: Vec<&str> = plan.in_import_order().iter().map(|entry| entry.table).collect();
        assert_eq!(order, vec!["posts", "comments", "options"]);
        Ok(())
    }

    #[test]
    fn garbage_is_an_archive_format_error() {
        let result = ArchiveReader::open(Cursor::new(b"definitely not a zip".to_vec()));
        assert!(matches!(result, Err(BackupError::ArchiveFormat(_))));
    }
}
