use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{BackupError, BackupResult};

/// Engine settings, loaded from an optional YAML file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackupSettings {
    /// Prefix of every entry written into an archive.
    pub archive_root: String,
    pub compression: Compression,
    pub log_level: String,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            archive_root: "backup".to_string(),
            compression: Compression::Deflated,
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    #[default]
    Deflated,
    Stored,
}

impl Compression {
    #[must_use]
    pub fn method(self) -> zip::CompressionMethod {
        match self {
            Self::Deflated => zip::CompressionMethod::Deflated,
            Self::Stored => zip::CompressionMethod::Stored,
        }
    }
}

impl BackupSettings {
    /// # Errors
    /// Returns [`BackupError::Settings`] when the file is unreadable or malformed.
    pub fn load(path: &Path) -> BackupResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| BackupError::Settings(format!("{}: {err}", path.display())))?;
        let settings: Self = serde_yaml::from_str(&raw)
            .map_err(|err| BackupError::Settings(format!("{}: {err}", path.display())))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Archive root with surrounding slashes removed.
    #[must_use]
    pub fn root(&self) -> &str {
        self.archive_root.trim_matches('/')
    }

    fn validate(&self) -> BackupResult<()> {
        if self.root().is_empty() {
            return Err(BackupError::Settings("archive_root must not be empty".to_string()));
        }
        if self.root().contains("..") {
            return Err(BackupError::Settings("archive_root must not contain `..`".to_string()));
        }
        Ok(())
    }
}
