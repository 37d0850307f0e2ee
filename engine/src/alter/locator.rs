// In engine/src/alter/locator.rs
use std::fs;
use std::path::PathBuf;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::MigrationEnv;
use crate::executor::list_sql_files;
use crate::history::AlterHistory;
use crate::Error;

/// How the alter bundle for a run was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BundleOrigin {
    /// Scripts a developer wrote in the alter directory.
    Authored,
    /// The last checked bundle, restored from unreleased history.
    RecoveredUnreleased,
    /// Nothing was found; an empty alter-schema.sql was created.
    Placeholder,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlterScriptBundle {
    pub files: Vec<PathBuf>,
    pub origin: BundleOrigin,
}

impl AlterScriptBundle {
    pub fn is_placeholder(&self) -> bool {
        self.origin == BundleOrigin::Placeholder
    }
}

pub struct AlterLocator<'a> {
    env: &'a MigrationEnv,
    history: AlterHistory,
}

impl<'a> AlterLocator<'a> {
    pub fn new(env: &'a MigrationEnv) -> Self {
        Self {
            env,
            history: AlterHistory::new(env),
        }
    }

    pub fn list_alter_files(&self) -> Result<Vec<PathBuf>, Error> {
        Ok(list_sql_files(&self.env.alter_dir(), |path| {
            self.env.is_alter_file(path)
        })?)
    }

    pub fn list_take_finally_files(&self) -> Result<Vec<PathBuf>, Error> {
        Ok(list_sql_files(&self.env.alter_dir(), |path| {
            self.env.is_take_finally_file(path)
        })?)
    }

    /// Authored scripts first, then the unreleased checked bundle, then an
    /// empty placeholder.
    pub fn locate(&self) -> Result<AlterScriptBundle, Error> {
        let files = self.list_alter_files()?;
        if !files.is_empty() {
            return Ok(AlterScriptBundle {
                files,
                origin: BundleOrigin::Authored,
            });
        }

        let alter_dir = self.env.alter_dir();
        if !self.history.recover_unreleased(&alter_dir)?.is_empty() {
            let files = self.list_alter_files()?;
            if !files.is_empty() {
                return Ok(AlterScriptBundle {
                    files,
                    origin: BundleOrigin::RecoveredUnreleased,
                });
            }
        }

        let placeholder = self.env.canonical_alter_file();
        fs::create_dir_all(&alter_dir)
            .and_then(|()| fs::write(&placeholder, ""))
            .map_err(|source| Error::AlterSqlNotFound {
                alter_dir: alter_dir.clone(),
                source,
            })?;
        warn!(file = %placeholder.display(), "no alter script found, created an empty one");
        info!("write the alter statements there and run the check again");
        Ok(AlterScriptBundle {
            files: vec![placeholder],
            origin: BundleOrigin::Placeholder,
        })
    }
}

/// Everything in the alter directory except blank alter scripts and dotfiles.
pub fn pending_alter_files(env: &MigrationEnv) -> Result<Vec<PathBuf>, Error> {
    partition_alter_files(env).map(|(pending, _)| pending)
}

/// Alter scripts that are empty or whitespace-only.
pub fn blank_alter_files(env: &MigrationEnv) -> Result<Vec<PathBuf>, Error> {
    partition_alter_files(env).map(|(_, blank)| blank)
}

fn partition_alter_files(env: &MigrationEnv) -> Result<(Vec<PathBuf>, Vec<PathBuf>), Error> {
    let alter_dir = env.alter_dir();
    if !alter_dir.is_dir() {
        return Ok((Vec::new(), Vec::new()));
    }
    let mut entries = fs::read_dir(&alter_dir)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    let mut pending = Vec::new();
    let mut blank = Vec::new();
    for entry in entries {
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        let path = entry.path();
        let is_blank_alter = env.is_alter_file(&path)
            && entry.file_type()?.is_file()
            && fs::read_to_string(&path)?.trim().is_empty();
        if is_blank_alter {
            blank.push(path);
        } else {
            pending.push(path);
        }
    }
    Ok((pending, blank))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MigrationConfig;
    use chrono::Local;
    use tempfile::TempDir;

    fn env(temp_dir: &TempDir) -> MigrationEnv {
        MigrationEnv::new(temp_dir.path(), MigrationConfig::default())
    }

    #[test]
    fn authored_scripts_are_sorted_by_name() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let env = env(&temp_dir);
        fs::create_dir_all(env.alter_dir())?;
        fs::write(env.alter_dir().join("alter-schema-02-index.sql"), "x")?;
        fs::write(env.alter_dir().join("alter-schema-01-table.sql"), "x")?;
        fs::write(env.alter_dir().join("take-finally.sql"), "x")?;

        let locator = AlterLocator::new(&env);
        let bundle = locator.locate()?;
        assert_eq!(bundle.origin, BundleOrigin::Authored);
        assert_eq!(
            bundle.files,
            vec![
                env.alter_dir().join("alter-schema-01-table.sql"),
                env.alter_dir().join("alter-schema-02-index.sql"),
            ]
        );
        assert_eq!(locator.list_take_finally_files()?.len(), 1);
        Ok(())
    }

    #[test]
    fn empty_directory_gets_a_placeholder() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let env = env(&temp_dir);

        let bundle = AlterLocator::new(&env).locate()?;
        assert!(bundle.is_placeholder());
        assert_eq!(bundle.files, vec![env.canonical_alter_file()]);
        assert_eq!(fs::read_to_string(env.canonical_alter_file())?, "");
        assert_eq!(blank_alter_files(&env)?.len(), 1);
        assert!(pending_alter_files(&env)?.is_empty());
        Ok(())
    }

    #[test]
    fn take_finally_and_stray_files_are_pending() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let env = env(&temp_dir);
        fs::create_dir_all(env.alter_dir().join("notes"))?;
        fs::write(env.canonical_alter_file(), "  \n")?;
        fs::write(env.alter_dir().join("take-finally.sql"), "-- @assert-exists\nselect 1;")?;
        fs::write(env.alter_dir().join("readme.txt"), "")?;
        fs::write(env.alter_dir().join(".DS_Store"), "x")?;

        assert_eq!(
            pending_alter_files(&env)?,
            vec![
                env.alter_dir().join("notes"),
                env.alter_dir().join("readme.txt"),
                env.alter_dir().join("take-finally.sql"),
            ]
        );
        assert_eq!(blank_alter_files(&env)?, vec![env.canonical_alter_file()]);
        Ok(())
    }

    #[test]
    fn unreleased_bundle_is_recovered() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let env = env(&temp_dir);
        fs::create_dir_all(env.alter_dir())?;
        let alter = env.alter_dir().join("alter-schema.sql");
        fs::write(&alter, "create table purchase(id integer);")?;
        AlterHistory::new(&env).stage_unreleased(&env.alter_dir(), &[alter.clone()], &Local::now())?;
        assert!(!alter.exists());

        let bundle = AlterLocator::new(&env).locate()?;
        assert_eq!(bundle.origin, BundleOrigin::RecoveredUnreleased);
        assert_eq!(bundle.files, vec![alter]);
        Ok(())
    }

    #[test]
    fn placeholder_failure_is_alter_sql_not_found() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let env = env(&temp_dir);
        // A directory squatting on the placeholder name blocks creation.
        fs::create_dir_all(env.canonical_alter_file())?;

        let err = AlterLocator::new(&env).locate().unwrap_err();
        assert!(matches!(err, Error::AlterSqlNotFound { .. }), "{err:?}");
        Ok(())
    }
}
