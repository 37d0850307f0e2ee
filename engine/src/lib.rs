// In engine/src/lib.rs

use std::path::PathBuf;
use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

use crate::alter::{BundleOrigin, ExecutedFile};
use crate::marker::AlterNgCode;
use crate::schema::DiffReport;

// The shared database pool type
pub type DbPool = Pool<SqliteConnectionManager>;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
    #[error(transparent)]
    Pool(#[from] r2d2::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Config(#[from] toml::de::Error),
    #[error(transparent)]
    Walk(#[from] walkdir::Error),
    #[error("marker {}: {reason}", .path.display())]
    Marker { path: PathBuf, reason: String },
    #[error("archive {}: {reason}", .path.display())]
    Archive { path: PathBuf, reason: String },
    #[error("{phase} failed")]
    Collaborator {
        phase: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("failed to build the next schema from {}", .resource_dir.display())]
    NextBuildFailure {
        resource_dir: PathBuf,
        #[source]
        source: BoxError,
    },
    #[error("failed to restore the previous schema from {}", .resource_dir.display())]
    PreviousRestoreFailure {
        resource_dir: PathBuf,
        archive: Option<PathBuf>,
        #[source]
        source: BoxError,
    },
    #[error("no alter script in {} and no placeholder could be created", .alter_dir.display())]
    AlterSqlNotFound {
        alter_dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("alter script failed: {message}")]
    AlterExecutionFailure {
        executed: Vec<ExecutedFile>,
        statement: Option<String>,
        message: String,
        elapsed: Duration,
    },
    #[error("take-finally assertion failed: {message}")]
    TakeFinallyAssertionFailure {
        executed: Vec<ExecutedFile>,
        statement: Option<String>,
        message: String,
        elapsed: Duration,
    },
    #[error(
        "altered previous schema differs from the next schema in {} table(s)",
        .report.tables.len()
    )]
    DifferenceFound {
        report: Box<DiffReport>,
        diff_file: PathBuf,
        summary_file: PathBuf,
    },
    #[error("alter check found no difference but the alter scripts changed nothing")]
    EmptyAlterSuccess {
        origin: BundleOrigin,
        files: Vec<PathBuf>,
    },
    #[error("cannot save previous while {} alter file(s) are pending", .pending.len())]
    SavePreviousInvalidStatus { pending: Vec<PathBuf> },
    #[error("saved previous archive {} could not be replayed", .archive.display())]
    CheckpointValidationFailure {
        archive: PathBuf,
        #[source]
        source: BoxError,
    },
    #[error("{0}")]
    Invalid(String),
}

impl Error {
    /// Sub-code recorded in the alter-NG marker for this failure, if any.
    pub fn alter_ng_code(&self) -> Option<AlterNgCode> {
        match self {
            Error::AlterExecutionFailure { .. } => Some(AlterNgCode::Alf),
            Error::TakeFinallyAssertionFailure { .. } => Some(AlterNgCode::Tff),
            Error::DifferenceFound { .. } => Some(AlterNgCode::Dif),
            _ => None,
        }
    }

    /// The file a failed alter or take-finally run stopped at.
    pub fn failed_file(&self) -> Option<&ExecutedFile> {
        match self {
            Error::AlterExecutionFailure { executed, .. }
            | Error::TakeFinallyAssertionFailure { executed, .. } => executed.last(),
            _ => None,
        }
    }
}

pub mod alter;
pub mod checkpoint;
pub mod config;
pub mod executor;
pub mod history;
pub mod marker;
pub mod orchestrator;
pub mod previous;
pub mod provenance;
pub mod replay;
pub mod runtime;
pub mod schema;
pub mod status;

pub use config::{MigrationConfig, MigrationEnv};
pub use executor::{SqlExecutor, SqliteExecutor};
pub use marker::{MarkerKind, MarkerStore};
pub use orchestrator::{AlterCheck, RunOutcome, SavePrevious, Task};
pub use replay::{SchemaReplayer, ScriptReplayer};
pub use schema::{SchemaInspector, SqliteInspector};
