// engine/src/config.rs
//!
//! Working-root configuration and the on-disk path contract.
//!
//! Every phase of the pipeline runs as a separate process, so the paths below
//! are the only shared state between runs. They must stay stable: wrapping CI
//! tooling checks the marker files and diff artifacts by name.
//!
//! Layout (relative to the working root, default names):
//! ```text
//! altercheck.toml
//! playsql/                      next baseline (replace-schema, data, take-finally)
//! migration/
//!   alter/                      alter-schema*.sql, take-finally*.sql
//!   previous/                   previous-<yyyyMMdd-HHmm>.zip (+ transient extraction)
//!   schema/                     transient next/previous snapshots
//!   history/                    unreleased and released alter archives
//!   *.mark                      markers
//!   alter-check-result.{json,txt}
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use r2d2_sqlite::SqliteConnectionManager;
use serde::{Deserialize, Serialize};

use crate::{DbPool, Error};

pub const CONFIG_FILE_NAME: &str = "altercheck.toml";

const ALTER_DIR_NAME: &str = "alter";
const PREVIOUS_DIR_NAME: &str = "previous";
const SCHEMA_DIR_NAME: &str = "schema";
const HISTORY_DIR_NAME: &str = "history";
const UNRELEASED_DIR_NAME: &str = "unreleased-checked-alter";
const NEXT_SNAPSHOT_FILE: &str = "next-schema.json";
const PREVIOUS_SNAPSHOT_FILE: &str = "previous-schema.json";
const DIFF_RESULT_FILE: &str = "alter-check-result.json";
const DIFF_SUMMARY_FILE: &str = "alter-check-result.txt";
const POOL_SIZE: u32 = 2;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MigrationConfig {
    /// SQLite database the pipeline replays into, relative to the root.
    #[serde(default = "default_database")]
    pub database: PathBuf,

    /// Next baseline resources (replace-schema, data, take-finally).
    #[serde(default = "default_playsql_dir")]
    pub playsql_dir: PathBuf,

    #[serde(default = "default_migration_dir")]
    pub migration_dir: PathBuf,

    #[serde(default = "default_alter_prefix")]
    pub alter_prefix: String,

    #[serde(default = "default_take_finally_prefix")]
    pub take_finally_prefix: String,

    #[serde(default = "default_replace_schema_prefix")]
    pub replace_schema_prefix: String,

    /// Replay a freshly saved previous archive before marking it OK.
    #[serde(default = "default_true")]
    pub validate_saved_previous: bool,

    /// Default tracing filter; `RUST_LOG` wins when set.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_database() -> PathBuf {
    PathBuf::from("db").join("app.sqlite")
}

fn default_playsql_dir() -> PathBuf {
    PathBuf::from("playsql")
}

fn default_migration_dir() -> PathBuf {
    PathBuf::from("migration")
}

fn default_alter_prefix() -> String {
    "alter-schema".to_string()
}

fn default_take_finally_prefix() -> String {
    "take-finally".to_string()
}

fn default_replace_schema_prefix() -> String {
    "replace-schema".to_string()
}

fn default_true() -> bool {
    true
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            playsql_dir: default_playsql_dir(),
            migration_dir: default_migration_dir(),
            alter_prefix: default_alter_prefix(),
            take_finally_prefix: default_take_finally_prefix(),
            replace_schema_prefix: default_replace_schema_prefix(),
            validate_saved_previous: default_true(),
            log_filter: default_log_filter(),
        }
    }
}

impl MigrationConfig {
    pub fn load_from_str(toml_str: &str) -> Result<Self, Error> {
        Ok(toml::from_str(toml_str)?)
    }

    pub fn load_from_path(path: &Path) -> Result<Self, Error> {
        let toml_str = fs::read_to_string(path)?;
        Self::load_from_str(&toml_str)
    }

    /// Reads `<root>/altercheck.toml` when present, defaults otherwise.
    pub fn load_or_default(root: &Path) -> Result<Self, Error> {
        let path = root.join(CONFIG_FILE_NAME);
        if path.is_file() {
            Self::load_from_path(&path)
        } else {
            Ok(Self::default())
        }
    }
}

/// A working root plus its configuration; resolves every contract path.
#[derive(Debug, Clone)]
pub struct MigrationEnv {
    root: PathBuf,
    config: MigrationConfig,
}

impl MigrationEnv {
    pub fn new(root: impl Into<PathBuf>, config: MigrationConfig) -> Self {
        Self {
            root: root.into(),
            config,
        }
    }

    pub fn discover(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = root.into();
        let config = MigrationConfig::load_or_default(&root)?;
        Ok(Self::new(root, config))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn database_path(&self) -> PathBuf {
        self.root.join(&self.config.database)
    }

    pub fn playsql_dir(&self) -> PathBuf {
        self.root.join(&self.config.playsql_dir)
    }

    pub fn migration_dir(&self) -> PathBuf {
        self.root.join(&self.config.migration_dir)
    }

    pub fn marker_dir(&self) -> PathBuf {
        self.migration_dir()
    }

    pub fn alter_dir(&self) -> PathBuf {
        self.migration_dir().join(ALTER_DIR_NAME)
    }

    pub fn canonical_alter_file(&self) -> PathBuf {
        self.alter_dir()
            .join(format!("{}.sql", self.config.alter_prefix))
    }

    pub fn previous_dir(&self) -> PathBuf {
        self.migration_dir().join(PREVIOUS_DIR_NAME)
    }

    /// Extracted previous baseline; mirrors the `playsql` layout.
    pub fn previous_playsql_dir(&self) -> PathBuf {
        self.previous_dir().join(&self.config.playsql_dir)
    }

    pub fn schema_dir(&self) -> PathBuf {
        self.migration_dir().join(SCHEMA_DIR_NAME)
    }

    pub fn next_snapshot_file(&self) -> PathBuf {
        self.schema_dir().join(NEXT_SNAPSHOT_FILE)
    }

    pub fn previous_snapshot_file(&self) -> PathBuf {
        self.schema_dir().join(PREVIOUS_SNAPSHOT_FILE)
    }

    pub fn history_dir(&self) -> PathBuf {
        self.migration_dir().join(HISTORY_DIR_NAME)
    }

    pub fn unreleased_dir(&self) -> PathBuf {
        self.history_dir().join(UNRELEASED_DIR_NAME)
    }

    pub fn diff_result_file(&self) -> PathBuf {
        self.migration_dir().join(DIFF_RESULT_FILE)
    }

    pub fn diff_summary_file(&self) -> PathBuf {
        self.migration_dir().join(DIFF_SUMMARY_FILE)
    }

    pub fn is_alter_file(&self, path: &Path) -> bool {
        has_sql_prefix(path, &self.config.alter_prefix)
    }

    pub fn is_take_finally_file(&self, path: &Path) -> bool {
        has_sql_prefix(path, &self.config.take_finally_prefix)
    }

    pub fn is_replace_schema_file(&self, path: &Path) -> bool {
        has_sql_prefix(path, &self.config.replace_schema_prefix)
    }

    /// Opens a pool on the configured SQLite database, creating its directory.
    pub fn open_pool(&self) -> Result<DbPool, Error> {
        let db_path = self.database_path();
        if let Some(dir) = db_path.parent() {
            fs::create_dir_all(dir)?;
        }
        let manager = SqliteConnectionManager::file(db_path);
        let pool = r2d2::Pool::builder().max_size(POOL_SIZE).build(manager)?;
        Ok(pool)
    }
}

pub(crate) fn has_sql_prefix(path: &Path, prefix: &str) -> bool {
    let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
        return false;
    };
    name.starts_with(prefix) && name.to_ascii_lowercase().ends_with(".sql")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let config = MigrationConfig::load_from_str(
            r#"
            database = "data/main.db"
            validate_saved_previous = false
            "#,
        )
        .unwrap();

        assert_eq!(config.database, PathBuf::from("data/main.db"));
        assert!(!config.validate_saved_previous);
        assert_eq!(config.alter_prefix, "alter-schema");
        assert_eq!(config.playsql_dir, PathBuf::from("playsql"));
    }

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let env = MigrationEnv::discover(temp_dir.path()).unwrap();
        assert_eq!(env.config(), &MigrationConfig::default());
        assert_eq!(
            env.canonical_alter_file(),
            temp_dir.path().join("migration/alter/alter-schema.sql")
        );
    }

    #[test]
    fn classifies_script_names_by_prefix() {
        let env = MigrationEnv::new("/work", MigrationConfig::default());
        assert!(env.is_alter_file(Path::new("alter-schema-add-member.sql")));
        assert!(env.is_alter_file(Path::new("alter-schema.SQL")));
        assert!(!env.is_alter_file(Path::new("alter-schema.txt")));
        assert!(env.is_take_finally_file(Path::new("take-finally-check.sql")));
        assert!(!env.is_take_finally_file(Path::new("alter-schema.sql")));
    }
}
