use crate::codec::CodecError;

/// Failure reported by a database collaborator.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum DbError {
    /// A unique index or primary key rejected the row.
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),
    #[error("table does not exist: {0}")]
    MissingTable(String),
    #[error("database error: {0}")]
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    /// The archive container itself is unreadable. Raised before any transaction opens.
    #[error("invalid archive: {0}")]
    ArchiveFormat(String),
    #[error("failed to decode `{entry}` for table `{table}`: {source}")]
    Decode {
        table: String,
        entry: String,
        #[source]
        source: CodecError,
    },
    #[error("failed to introspect columns of `{table}`: {source}")]
    SchemaIntrospection {
        table: String,
        #[source]
        source: DbError,
    },
    /// A single row collided with an existing unique key. Restore skips the row.
    #[error("duplicate row in `{table}`: {message}")]
    ConstraintViolation { table: String, message: String },
    #[error("transaction failure: {0}")]
    Transaction(#[source] DbError),
    #[error("database failure on `{table}`: {source}")]
    Database {
        table: String,
        #[source]
        source: DbError,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid settings: {0}")]
    Settings(String),
}

impl BackupError {
    /// Classify a failed row insert. Unique-key collisions become
    /// [`BackupError::ConstraintViolation`], everything else is fatal.
    #[must_use]
    pub fn from_insert(table: &str, err: DbError) -> Self {
        match err {
            DbError::UniqueViolation(message) => {
                Self::ConstraintViolation { table: table.to_string(), message }
            }
            other => Self::Database { table: table.to_string(), source: other },
        }
    }

    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::ConstraintViolation { .. })
    }
}

pub type BackupResult<T> = Result<T, BackupError>;
