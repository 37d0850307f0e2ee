// In engine/src/replay.rs
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::config::{has_sql_prefix, MigrationConfig};
use crate::executor::{list_sql_files, SqlExecutor, SqliteExecutor};
use crate::DbPool;

const DATA_DIR_NAME: &str = "data";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayDirection {
    Next,
    Previous,
}

impl fmt::Display for ReplayDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplayDirection::Next => f.write_str("next"),
            ReplayDirection::Previous => f.write_str("previous"),
        }
    }
}

/// Rebuilds the live database from a baseline resource directory.
pub trait SchemaReplayer {
    fn replay(&self, direction: ReplayDirection, resource_dir: &Path) -> anyhow::Result<()>;
}

/// Replays `replace-schema*.sql`, `data/**/*.sql` and `take-finally*.sql`
/// into a SQLite database after dropping every user object.
#[derive(Clone)]
pub struct ScriptReplayer {
    pool: DbPool,
    executor: SqliteExecutor,
    replace_schema_prefix: String,
    take_finally_prefix: String,
}

impl ScriptReplayer {
    pub fn new(pool: DbPool, config: &MigrationConfig) -> Self {
        Self {
            executor: SqliteExecutor::new(pool.clone()),
            pool,
            replace_schema_prefix: config.replace_schema_prefix.clone(),
            take_finally_prefix: config.take_finally_prefix.clone(),
        }
    }

    fn drop_user_objects(&self) -> anyhow::Result<()> {
        let conn = self.pool.get()?;
        let objects: Vec<(String, String)> = {
            let mut stmt = conn.prepare(
                "SELECT type, name FROM sqlite_master
                 WHERE type IN ('view', 'trigger', 'table') AND name NOT LIKE 'sqlite_%'
                 ORDER BY CASE type WHEN 'view' THEN 0 WHEN 'trigger' THEN 1 ELSE 2 END, name",
            )?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<Result<_, _>>()?
        };

        // The pooled connection goes back with its original setting.
        let foreign_keys: i64 = conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA foreign_keys = OFF;")?;
        let dropped = objects.iter().try_for_each(|(kind, name)| {
            let sql = format!("DROP {} IF EXISTS \"{}\"", kind.to_uppercase(), name.replace('"', "\"\""));
            conn.execute(&sql, [])
                .map(|_| ())
                .with_context(|| format!("failed to drop {kind} {name}"))
        });
        conn.execute_batch(&format!("PRAGMA foreign_keys = {foreign_keys};"))?;
        dropped?;
        debug!(dropped = objects.len(), "dropped user objects");
        Ok(())
    }

    fn prefixed(&self, dir: &Path, prefix: &str) -> anyhow::Result<Vec<PathBuf>> {
        Ok(list_sql_files(dir, |path| has_sql_prefix(path, prefix))?)
    }

    fn data_files(&self, dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
        let data_dir = dir.join(DATA_DIR_NAME);
        if !data_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in WalkDir::new(&data_dir).sort_by_file_name() {
            let entry = entry?;
            let is_sql = entry
                .path()
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("sql"))
                .unwrap_or(false);
            if entry.file_type().is_file() && is_sql {
                files.push(entry.into_path());
            }
        }
        Ok(files)
    }
}

impl SchemaReplayer for ScriptReplayer {
    fn replay(&self, direction: ReplayDirection, resource_dir: &Path) -> anyhow::Result<()> {
        if !resource_dir.is_dir() {
            bail!("resource directory {} does not exist", resource_dir.display());
        }
        let schema_files = self.prefixed(resource_dir, &self.replace_schema_prefix)?;
        if schema_files.is_empty() {
            bail!(
                "no {}*.sql found in {}",
                self.replace_schema_prefix,
                resource_dir.display()
            );
        }

        let mut files = schema_files;
        files.extend(self.data_files(resource_dir)?);
        files.extend(self.prefixed(resource_dir, &self.take_finally_prefix)?);

        self.drop_user_objects()?;
        let result = self.executor.execute_files(&files)?;
        if let Some(failure) = result.first_failure() {
            return Err(anyhow!(
                "{} replay failed in {}: {}\n{}",
                direction,
                failure.file.display(),
                failure.message,
                failure.statement
            ));
        }

        info!(
            %direction,
            dir = %resource_dir.display(),
            files = files.len(),
            statements = result.statement_count,
            "schema replayed"
        );
        Ok(())
    }
}

/// True when `dir` holds a schema script a replayer could run.
pub fn has_replay_resources(dir: &Path, is_schema_file: impl Fn(&Path) -> bool) -> bool {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .any(|entry| entry.path().is_file() && is_schema_file(&entry.path()))
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use r2d2_sqlite::SqliteConnectionManager;
    use tempfile::TempDir;

    fn setup() -> (TempDir, DbPool) {
        let temp_dir = TempDir::new().unwrap();
        let manager = SqliteConnectionManager::file(temp_dir.path().join("replay.sqlite"));
        let pool = r2d2::Pool::builder().max_size(2).build(manager).unwrap();
        (temp_dir, pool)
    }

    fn table_names(pool: &DbPool) -> Vec<String> {
        let conn = pool.get().unwrap();
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .unwrap();
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        names
    }

    #[test]
    fn replay_replaces_existing_objects() -> anyhow::Result<()> {
        let (temp_dir, pool) = setup();
        let replayer = ScriptReplayer::new(pool.clone(), &MigrationConfig::default());

        let first = temp_dir.path().join("first");
        fs::create_dir_all(first.join("data"))?;
        fs::write(first.join("replace-schema.sql"), "create table old_one(id integer);")?;
        replayer.replay(ReplayDirection::Previous, &first)?;
        assert_eq!(table_names(&pool), vec!["old_one"]);

        let second = temp_dir.path().join("second");
        fs::create_dir_all(second.join("data/master"))?;
        fs::write(
            second.join("replace-schema.sql"),
            "create table member(id integer primary key, name text);\ncreate view v_member as select * from member;",
        )?;
        fs::write(second.join("data/master/01-member.sql"), "insert into member values (1, 'a');")?;
        fs::write(
            second.join("take-finally.sql"),
            "-- @assert-exists\nselect id from member;",
        )?;
        replayer.replay(ReplayDirection::Next, &second)?;
        assert_eq!(table_names(&pool), vec!["member"]);
        Ok(())
    }

    #[test]
    fn replay_requires_a_replace_schema_script() {
        let (temp_dir, pool) = setup();
        let replayer = ScriptReplayer::new(pool, &MigrationConfig::default());
        let dir = temp_dir.path().join("empty");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("take-finally.sql"), "select 1;").unwrap();

        let err = replayer.replay(ReplayDirection::Next, &dir).unwrap_err();
        assert!(err.to_string().contains("replace-schema"));
    }

    #[test]
    fn failing_statement_names_direction_and_file() {
        let (temp_dir, pool) = setup();
        let replayer = ScriptReplayer::new(pool, &MigrationConfig::default());
        let dir = temp_dir.path().join("broken");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("replace-schema.sql"), "create table t(;").unwrap();

        let err = replayer
            .replay(ReplayDirection::Previous, &dir)
            .unwrap_err()
            .to_string();
        assert!(err.starts_with("previous replay failed"), "{err}");
        assert!(err.contains("replace-schema.sql"));
    }

    #[test]
    fn only_schema_scripts_count_as_replay_resources() {
        let (temp_dir, _pool) = setup();
        let env = crate::MigrationEnv::new(temp_dir.path(), MigrationConfig::default());
        let dir = temp_dir.path().join("resources");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("replace-schema.bak"), "create table t(id integer);").unwrap();
        assert!(!has_replay_resources(&dir, |path| env.is_replace_schema_file(path)));

        fs::write(dir.join("replace-schema.sql"), "create table t(id integer);").unwrap();
        assert!(has_replay_resources(&dir, |path| env.is_replace_schema_file(path)));
    }

    #[test]
    fn foreign_key_setting_survives_replay() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let manager = SqliteConnectionManager::file(temp_dir.path().join("fk.sqlite"));
        let pool = r2d2::Pool::builder().max_size(1).build(manager)?;
        pool.get()?.execute_batch(
            "PRAGMA foreign_keys = ON;
             CREATE TABLE parent(id INTEGER PRIMARY KEY);
             CREATE TABLE child(parent_id INTEGER REFERENCES parent(id));",
        )?;

        let dir = temp_dir.path().join("resources");
        fs::create_dir_all(&dir)?;
        fs::write(dir.join("replace-schema.sql"), "create table member(id integer);")?;
        ScriptReplayer::new(pool.clone(), &MigrationConfig::default())
            .replay(ReplayDirection::Next, &dir)?;

        let foreign_keys: i64 = pool
            .get()?
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
        assert_eq!(foreign_keys, 1);
        assert_eq!(table_names(&pool), vec!["member"]);
        Ok(())
    }
}
