//! Transactional restore.
//!
//! Stages run strictly in order inside one transaction:
//! scanning, per-table import, legacy config migration, legacy asset import,
//! then commit. Any fatal error rolls the whole transaction back, so a
//! failed restore can simply be retried.

use std::fmt;
use std::io::{Read, Seek};

use serde::Serialize;

use crate::archive::{sha256_hex, ArchiveReader, Manifest, ScanPlan, TableEntry};
use crate::assets::import_legacy_assets;
use crate::codec::decode_stream;
use crate::config_migrate::migrate_legacy_config;
use crate::db::{Database, Transaction};
use crate::error::{BackupError, BackupResult, DbError};
use crate::normalize::normalize_row;
use crate::schema::load_columns;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreStage {
    Scanning,
    Importing,
    LegacyConfigMigration,
    LegacyAssetImport,
    Commit,
    Rollback,
}

impl RestoreStage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scanning => "scanning",
            Self::Importing => "importing",
            Self::LegacyConfigMigration => "legacy_config_migration",
            Self::LegacyAssetImport => "legacy_asset_import",
            Self::Commit => "commit",
            Self::Rollback => "rollback",
        }
    }
}

impl fmt::Display for RestoreStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-table outcome of a restore.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TableReport {
    pub table: String,
    pub entry: String,
    pub decoded: usize,
    /// Rows that normalized to nothing.
    pub dropped: usize,
    pub inserted: usize,
    /// Rows skipped on a unique-key collision.
    pub duplicates: usize,
    /// Rows removed from the target before loading.
    pub replaced: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RestoreSummary {
    pub tables: Vec<TableReport>,
    pub ignored_entries: Vec<String>,
    pub shadowed_entries: Vec<String>,
    pub migrated_sections: Vec<String>,
    pub imported_assets: Vec<String>,
    /// Entries whose content no longer matches the manifest digest.
    pub digest_mismatches: Vec<String>,
    pub manifest: Option<Manifest>,
}

impl RestoreSummary {
    #[must_use]
    pub fn table(&self, name: &str) -> Option<&TableReport> {
        self.tables.iter().find(|report| report.table == name)
    }
}

/// Run only the scanning stage: no transaction is opened.
///
/// # Errors
/// Returns [`BackupError::ArchiveFormat`] when the container is unreadable.
pub fn inspect_archive<R: Read + Seek>(reader: R) -> BackupResult<ScanPlan> {
    ArchiveReader::open(reader)?.scan()
}

/// Restore an archive into `db`, replacing the contents of every table the
/// archive carries.
///
/// # Errors
/// Returns the first fatal error. The transaction has been rolled back by
/// the time the error is returned.
pub fn restore_archive<D, R>(db: &mut D, reader: R) -> BackupResult<RestoreSummary>
where
    D: Database,
    R: Read + Seek,
{
    tracing::info!(stage = %RestoreStage::Scanning, "restore started");
    let mut archive = ArchiveReader::open(reader)?;
    let plan = archive.scan()?;
    tracing::info!(
        tables = plan.tables.len(),
        ignored = plan.ignored.len(),
        assets = plan.assets.len(),
        "archive scanned"
    );

    let defer_foreign_keys = db.supports_deferred_foreign_keys();
    let tx = db.begin().map_err(BackupError::Transaction)?;
    if defer_foreign_keys {
        if let Err(err) = tx.set_foreign_key_checks(false) {
            roll_back(tx, RestoreStage::Scanning);
            return Err(BackupError::Transaction(err));
        }
    }

    let mut stage = RestoreStage::Importing;
    let outcome = run_stages(&mut archive, &plan, &tx, &mut stage);
    let checks_restored = if defer_foreign_keys { tx.set_foreign_key_checks(true) } else { Ok(()) };

    let mut summary = match (outcome, checks_restored) {
        (Ok(summary), Ok(())) => summary,
        (Err(err), _) => {
            roll_back(tx, stage);
            return Err(err);
        }
        (Ok(_), Err(err)) => {
            roll_back(tx, stage);
            return Err(BackupError::Transaction(err));
        }
    };

    tracing::info!(stage = %RestoreStage::Commit, "committing restore");
    tx.commit().map_err(BackupError::Transaction)?;

    summary.ignored_entries = plan.ignored;
    summary.shadowed_entries = plan.shadowed;
    summary.manifest = plan.manifest;
    tracing::info!(
        tables = summary.tables.len(),
        inserted = summary.tables.iter().map(|report| report.inserted).sum::<usize>(),
        duplicates = summary.tables.iter().map(|report| report.duplicates).sum::<usize>(),
        "restore complete"
    );
    Ok(summary)
}

fn roll_back<T: Transaction>(tx: T, failed_in: RestoreStage) {
    tracing::warn!(stage = %RestoreStage::Rollback, failed_in = %failed_in, "rolling back restore");
    if let Err(err) = tx.rollback() {
        tracing::error!(error = %err, "rollback failed");
    }
}

fn run_stages<R, T>(
    archive: &mut ArchiveReader<R>,
    plan: &ScanPlan,
    tx: &T,
    stage: &mut RestoreStage,
) -> BackupResult<RestoreSummary>
where
    R: Read + Seek,
    T: Transaction,
{
    let mut summary = RestoreSummary::default();

    for entry in plan.in_import_order() {
        let bytes = archive.read_entry(&entry.path)?;
        if let Some(manifest) = &plan.manifest {
            if !digest_matches(manifest, &entry.path, &bytes) {
                tracing::warn!(
                    entry = entry.path.as_str(),
                    "archive entry does not match its manifest digest"
                );
                summary.digest_mismatches.push(entry.path.clone());
            }
        }
        summary.tables.push(import_table(entry, &bytes, tx)?);
    }

    *stage = RestoreStage::LegacyConfigMigration;
    tracing::info!(stage = %stage, "migrating legacy config rows");
    summary.migrated_sections = migrate_legacy_config(tx)?;

    *stage = RestoreStage::LegacyAssetImport;
    tracing::info!(stage = %stage, assets = plan.assets.len(), "importing legacy assets");
    summary.imported_assets = import_legacy_assets(archive, &plan.assets, tx)?;

    Ok(summary)
}

/// A digest mismatch is only reported; entries the manifest does not list pass.
fn digest_matches(manifest: &Manifest, path: &str, bytes: &[u8]) -> bool {
    let digest = sha256_hex(bytes);
    manifest
        .files
        .iter()
        .filter(|file| file.path == path)
        .all(|file| file.sha256.eq_ignore_ascii_case(&digest))
}

fn import_table<T: Transaction>(
    entry: &TableEntry,
    bytes: &[u8],
    tx: &T,
) -> BackupResult<TableReport> {
    let table = entry.table;
    let decode_error = |source| BackupError::Decode {
        table: table.to_string(),
        entry: entry.path.clone(),
        source,
    };

    let columns = load_columns(tx, table)?;
    let rows = decode_stream(bytes, entry.format).map_err(decode_error)?;
    let replaced = tx.delete_all(table).map_err(|source| database_error(table, source))?;

    let mut report = TableReport {
        table: table.to_string(),
        entry: entry.path.clone(),
        replaced,
        ..TableReport::default()
    };
    for decoded in rows {
        let raw = decoded.map_err(decode_error)?;
        report.decoded += 1;
        let Some(row) = normalize_row(table, raw, &columns) else {
            report.dropped += 1;
            continue;
        };
        match tx.insert_row(table, &row) {
            Ok(()) => report.inserted += 1,
            Err(err) => {
                let err = BackupError::from_insert(table, err);
                if !err.is_recoverable() {
                    return Err(err);
                }
                tracing::debug!(table, error = %err, "skipping duplicate row");
                report.duplicates += 1;
            }
        }
    }

    tracing::info!(
        table,
        entry = entry.path.as_str(),
        decoded = report.decoded,
        inserted = report.inserted,
        duplicates = report.duplicates,
        dropped = report.dropped,
        "restored table"
    );
    Ok(report)
}

fn database_error(table: &str, source: DbError) -> BackupError {
    BackupError::Database { table: table.to_string(), source }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    use time::OffsetDateTime;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    use crate::archive::{FileDigest, MANIFEST_FORMAT, MANIFEST_VERSION};
    use crate::codec::encode_rows;
    use crate::export::export_archive;
    use crate::settings::BackupSettings;
    use crate::testing::{blog_db, FakeDb};
    use crate::value::{Row, RowValue};

    fn zip_archive(entries: &[(&str, Vec<u8>)]) -> Cursor<Vec<u8>> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, bytes) in entries {
            zip.start_file(*name, SimpleFileOptions::default())
                .unwrap_or_else(|err| panic!("start {name}: {err}"));
            zip.write_all(bytes).unwrap_or_else(|err| panic!("write {name}: {err}"));
        }
        let cursor = zip.finish().unwrap_or_else(|err| panic!("finish archive: {err}"));
        Cursor::new(cursor.into_inner())
    }

    fn row(fields: &[(&str, RowValue)]) -> Row {
        fields.iter().map(|(key, value)| ((*key).to_string(), value.clone())).collect()
    }

    fn post(index: usize) -> Row {
        row(&[
            ("_id", RowValue::from(format!("p{index}"))),
            ("title", RowValue::from(format!("Post {index}"))),
            ("slug", RowValue::from(format!("post-{index}"))),
            ("text", RowValue::from("body")),
        ])
    }

    fn bson(rows: &[Row]) -> Vec<u8> {
        encode_rows(rows).unwrap_or_else(|err| panic!("encode: {err}"))
    }

    fn seeded_source() -> FakeDb {
        let mut table = blog_db().tables.remove("posts").unwrap_or_default();
        for index in 1..=3 {
            let mut seeded = post(index);
            let id = seeded.remove("_id").unwrap_or(RowValue::Null);
            seeded.insert("id".to_string(), id);
            seeded.insert("created_at".to_string(), RowValue::from("2023-11-14 22:13:20"));
            table.rows.push(seeded);
        }
        blog_db().with_table("posts", table)
    }

    #[test]
    fn exported_archive_restores_into_a_fresh_database() -> anyhow::Result<()> {
        let source = seeded_source();
        let mut buffer = Cursor::new(Vec::new());
        let exported = export_archive(&source, &mut buffer, &BackupSettings::default())?;
        assert_eq!(exported.manifest.tables, vec!["posts", "comments", "options"]);

        let mut target = blog_db();
        let summary = restore_archive(&mut target, Cursor::new(buffer.into_inner()))?;

        assert_eq!(target.rows("posts").len(), 3);
        assert_eq!(target.rows("comments").len(), 0);
        for (restored, original) in target.rows("posts").iter().zip(source.rows("posts")) {
            for column in ["title", "slug", "text"] {
                assert_eq!(restored.get(column), original.get(column));
            }
            assert!(matches!(restored.get("created_at"), Some(RowValue::Timestamp(_))));
        }
        assert_eq!(summary.table("posts").map(|report| report.inserted), Some(3));
        assert!(summary.digest_mismatches.is_empty());
        assert_eq!(target.commits, 1);
        Ok(())
    }

    #[test]
    fn restoring_twice_replaces_rather_than_accumulates() -> anyhow::Result<()> {
        let archive = zip_archive(&[("backup/db/posts.bson", bson(&[post(1), post(2), post(3)]))]);
        let mut target = blog_db();
        restore_archive(&mut target, archive.clone())?;
        let summary = restore_archive(&mut target, archive)?;
        assert_eq!(target.rows("posts").len(), 3);
        assert_eq!(summary.table("posts").map(|report| report.replaced), Some(3));
        assert_eq!(summary.table("posts").map(|report| report.duplicates), Some(0));
        Ok(())
    }

    #[test]
    fn json_only_archive_restores_every_row() -> anyhow::Result<()> {
        let posts = br#"[
            {"_id":"p1","title":"Post 1","slug":"post-1","text":"body"},
            {"_id":"p2","title":"Post 2","slug":"post-2","text":"body"}
        ]"#;
        let mut target = blog_db();
        let archive = zip_archive(&[("backup/db/posts.json", posts.to_vec())]);
        let summary = restore_archive(&mut target, archive)?;

        assert_eq!(target.rows("posts").len(), 2);
        let report = summary.table("posts").unwrap_or_else(|| panic!("posts report"));
        assert_eq!(report.entry, "backup/db/posts.json");
        assert_eq!((report.decoded, report.inserted), (2, 2));
        assert_eq!(target.commits, 1);
        Ok(())
    }

    #[test]
    fn duplicate_rows_are_skipped_and_the_rest_commit() -> anyhow::Result<()> {
        let mut rows: Vec<Row> = (1..=100).map(post).collect();
        rows[49].insert("slug".to_string(), RowValue::from("post-1"));
        let mut target = blog_db();
        let archive = zip_archive(&[("backup/db/posts.bson", bson(&rows))]);
        let summary = restore_archive(&mut target, archive)?;

        assert_eq!(target.rows("posts").len(), 99);
        let report = summary.table("posts").unwrap_or_else(|| panic!("posts report"));
        assert_eq!((report.inserted, report.duplicates), (99, 1));
        assert_eq!(target.commits, 1);
        Ok(())
    }

    #[test]
    fn a_fatal_insert_rolls_back_every_table() {
        let existing_comment =
            row(&[("id", RowValue::from("c0")), ("text", RowValue::from("keep me"))]);
        let mut target = blog_db();
        if let Some(comments) = target.tables.get_mut("comments") {
            comments.rows.push(existing_comment.clone());
        }
        if let Some(posts) = target.tables.get_mut("posts") {
            posts.rows.push(post(999));
        }
        target.fail_insert = Some(("comments".to_string(), 50));

        let comments: Vec<Row> = (1..=60)
            .map(|index| {
                row(&[
                    ("_id", RowValue::from(format!("c{index}"))),
                    ("refType", RowValue::from("Posts")),
                ])
            })
            .collect();
        let archive = zip_archive(&[
            ("backup/db/posts.bson", bson(&[post(1), post(2)])),
            ("backup/db/comments.bson", bson(&comments)),
        ]);

        let err = restore_archive(&mut target, archive).err();
        assert!(matches!(
            err,
            Some(BackupError::Database { ref table, .. }) if table == "comments"
        ));
        assert_eq!(target.rows("comments"), &[existing_comment]);
        assert_eq!(target.rows("posts"), &[post(999)]);
        assert_eq!((target.commits, target.rollbacks), (0, 1));
    }

    #[test]
    fn foreign_key_checks_are_restored_on_every_path() {
        let mut target = blog_db();
        target.deferred_foreign_keys = true;
        let archive = zip_archive(&[("backup/db/posts.bson", bson(&[post(1)]))]);
        let ok = restore_archive(&mut target, archive);
        assert!(ok.is_ok());
        assert_eq!(target.foreign_key_log, vec![false, true]);

        let mut target = blog_db();
        target.deferred_foreign_keys = true;
        let truncated = zip_archive(&[("backup/db/posts.bson", vec![9, 0, 0, 0, 1])]);
        let failed = restore_archive(&mut target, truncated);
        assert!(matches!(failed, Err(BackupError::Decode { .. })));
        assert_eq!(target.foreign_key_log, vec![false, true]);
        assert_eq!(target.rollbacks, 1);
    }

    #[test]
    fn engines_without_deferral_are_never_toggled() -> anyhow::Result<()> {
        let mut target = blog_db();
        restore_archive(&mut target, zip_archive(&[("backup/db/posts.bson", bson(&[post(1)]))]))?;
        assert!(target.foreign_key_log.is_empty());
        Ok(())
    }

    #[test]
    fn corrupt_table_payload_aborts_the_restore() {
        let mut target = blog_db();
        let archive = zip_archive(&[
            ("backup/db/posts.bson", bson(&[post(1)])),
            ("backup/db/comments.bson", vec![0xff, 0xff, 0xff, 0x7f]),
        ]);
        let err = restore_archive(&mut target, archive).err();
        assert!(matches!(err, Some(BackupError::Decode { ref table, .. }) if table == "comments"));
        assert!(target.rows("posts").is_empty());
    }

    #[test]
    fn tables_missing_from_the_target_are_fatal() {
        let mut target = blog_db();
        let notes = bson(&[row(&[("title", RowValue::from("n"))])]);
        let archive = zip_archive(&[("backup/db/notes.bson", notes)]);
        let err = restore_archive(&mut target, archive).err();
        assert!(matches!(
            err,
            Some(BackupError::SchemaIntrospection { ref table, .. }) if table == "notes"
        ));
    }

    #[test]
    fn unknown_entries_and_columns_are_ignored() -> anyhow::Result<()> {
        let mut with_extra = post(1);
        with_extra.insert("legacyOnlyField".to_string(), RowValue::Int(1));
        let archive = zip_archive(&[
            ("backup/db/posts.bson", bson(&[with_extra])),
            ("backup/db/system.indexes.bson", bson(&[row(&[("v", RowValue::Int(1))])])),
        ]);
        let mut target = blog_db();
        let summary = restore_archive(&mut target, archive)?;
        assert_eq!(summary.ignored_entries, vec!["backup/db/system.indexes.bson".to_string()]);
        assert!(!target.rows("posts")[0].contains_key("legacy_only_field"));
        Ok(())
    }

    #[test]
    fn binary_entry_wins_over_legacy_json_alias() -> anyhow::Result<()> {
        let json = serde_json::to_vec(&serde_json::json!([
            {"_id": "j1", "title": "from json", "slug": "j"}
        ]))?;
        let archive = zip_archive(&[
            ("backup/db/posts.json", json),
            ("backup/db/post.bson", bson(&[post(7)])),
        ]);
        let mut target = blog_db();
        let summary = restore_archive(&mut target, archive)?;
        assert_eq!(target.rows("posts").len(), 1);
        assert_eq!(target.rows("posts")[0].get("title"), Some(&RowValue::from("Post 7")));
        assert_eq!(summary.shadowed_entries, vec!["backup/db/posts.json".to_string()]);
        Ok(())
    }

    #[test]
    fn comment_ref_types_are_canonicalized() -> anyhow::Result<()> {
        let comment = row(&[
            ("_id", RowValue::from("c1")),
            ("ref", RowValue::from("p1")),
            ("refType", RowValue::from("Posts")),
            ("created", RowValue::Int(0)),
        ]);
        let mut target = blog_db();
        restore_archive(&mut target, zip_archive(&[("db/comments.bson", bson(&[comment]))]))?;
        let stored = &target.rows("comments")[0];
        assert_eq!(stored.get("ref_type"), Some(&RowValue::from("post")));
        assert_eq!(stored.get("created_at"), Some(&RowValue::Null));
        Ok(())
    }

    #[test]
    fn legacy_mail_options_row_lands_in_the_unified_config() -> anyhow::Result<()> {
        let options = bson(&[
            row(&[
                ("name", RowValue::from("MailOptions")),
                ("value", RowValue::from(r#"{"enable":true,"smtpHost":"mx"}"#)),
            ]),
            row(&[("name", RowValue::from("unrelated")), ("value", RowValue::from("1"))]),
        ]);
        let mut target = blog_db();
        let archive = zip_archive(&[("backup/db/options.bson", options)]);
        let summary = restore_archive(&mut target, archive)?;

        assert_eq!(summary.migrated_sections, vec!["mail_options".to_string()]);
        let blob = target.option("configs").unwrap_or_else(|| panic!("config blob missing"));
        let config: serde_json::Value = serde_json::from_str(&blob)?;
        assert_eq!(config["mail_options"]["enable"], serde_json::json!(true));
        assert_eq!(config["mail_options"]["smtp_host"], serde_json::json!("mx"));
        assert!(config.get("seo").is_some());
        Ok(())
    }

    #[test]
    fn later_legacy_row_wins_a_shared_section() -> anyhow::Result<()> {
        let options = bson(&[
            row(&[
                ("name", RowValue::from("mail_options")),
                ("value", RowValue::from(r#"{"user":"b"}"#)),
            ]),
            row(&[
                ("name", RowValue::from("MailOptions")),
                ("value", RowValue::from(r#"{"user":"a"}"#)),
            ]),
        ]);
        let mut target = blog_db();
        restore_archive(&mut target, zip_archive(&[("backup/db/options.bson", options)]))?;
        let blob = target.option("configs").unwrap_or_default();
        let config: serde_json::Value = serde_json::from_str(&blob)?;
        assert_eq!(config["mail_options"], serde_json::json!({"user": "b"}));
        Ok(())
    }

    #[test]
    fn config_blob_is_untouched_without_legacy_rows() -> anyhow::Result<()> {
        let mut target = blog_db();
        restore_archive(&mut target, zip_archive(&[("backup/db/posts.bson", bson(&[post(1)]))]))?;
        assert_eq!(target.option("configs"), None);
        Ok(())
    }

    #[test]
    fn legacy_templates_become_option_rows() -> anyhow::Result<()> {
        let archive = zip_archive(&[
            ("backup/assets/email-template/owner.template.ejs", b"  <p>owner</p>\n".to_vec()),
            ("backup/assets/email-template/guest.template.ejs", b"   ".to_vec()),
        ]);
        let mut target = blog_db();
        let summary = restore_archive(&mut target, archive)?;
        assert_eq!(summary.imported_assets, vec!["email_template_owner".to_string()]);
        assert_eq!(target.option("email_template_owner").as_deref(), Some("<p>owner</p>"));
        assert_eq!(target.option("email_template_guest"), None);
        Ok(())
    }

    #[test]
    fn digest_mismatch_is_reported_but_not_fatal() -> anyhow::Result<()> {
        let payload = bson(&[post(1)]);
        let manifest = Manifest {
            format: MANIFEST_FORMAT.to_string(),
            version: MANIFEST_VERSION,
            engine: "fake".to_string(),
            created_at: OffsetDateTime::UNIX_EPOCH,
            tables: vec!["posts".to_string()],
            files: vec![FileDigest::compute("backup/db/posts.bson", b"something else", 1)],
        };
        let archive = zip_archive(&[
            ("backup/manifest.json", serde_json::to_vec(&manifest)?),
            ("backup/db/posts.bson", payload),
        ]);
        let mut target = blog_db();
        let summary = restore_archive(&mut target, archive)?;
        assert_eq!(summary.digest_mismatches, vec!["backup/db/posts.bson".to_string()]);
        assert_eq!(summary.manifest.map(|manifest| manifest.engine), Some("fake".to_string()));
        assert_eq!(target.rows("posts").len(), 1);
        Ok(())
    }

    #[test]
    fn archives_without_a_manifest_still_restore() -> anyhow::Result<()> {
        let mut target = blog_db();
        let summary =
            restore_archive(&mut target, zip_archive(&[("posts.bson", bson(&[post(1)]))]))?;
        assert!(summary.manifest.is_none());
        assert_eq!(target.rows("posts").len(), 1);
        Ok(())
    }

    #[test]
    fn unreadable_container_never_opens_a_transaction() {
        let mut target = blog_db();
        let err = restore_archive(&mut target, Cursor::new(b"PK but not really".to_vec())).err();
        assert!(matches!(err, Some(BackupError::ArchiveFormat(_))));
        assert_eq!((target.commits, target.rollbacks), (0, 0));
    }

    #[test]
    fn commit_failure_is_a_transaction_error() {
        let mut target = blog_db();
        target.fail_commit = true;
        let archive = zip_archive(&[("backup/db/posts.bson", bson(&[post(1)]))]);
        let err = restore_archive(&mut target, archive).err();
        assert!(matches!(err, Some(BackupError::Transaction(DbError::Other(_)))));
        assert!(target.rows("posts").is_empty());
    }

    #[test]
    fn inspection_reports_the_plan_without_touching_the_database() -> anyhow::Result<()> {
        let plan = inspect_archive(zip_archive(&[
            ("backup/db/user_sessions.bson", Vec::new()),
            ("backup/db/mystery.bson", Vec::new()),
        ]))?;
        assert_eq!(
            plan.tables.get("sessions").map(|entry| entry.path.as_str()),
            Some("backup/db/user_sessions.bson")
        );
        assert_eq!(plan.ignored, vec!["backup/db/mystery.bson".to_string()]);
        Ok(())
    }
}
