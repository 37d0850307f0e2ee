// In engine/src/history.rs
//!
//! Bookkeeping for alter bundles that passed AlterCheck.
//!
//! A checked bundle is zipped into `history/unreleased-checked-alter/` and
//! removed from the alter directory. The next AlterCheck run recovers it
//! from there when nobody authored anything new, and SavePrevious releases
//! it into a dated `history/<yyyyMMdd>/<yyyyMMdd-HHmmss>/` directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::{DateTime, Local, NaiveDate};
use regex::Regex;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::checkpoint;
use crate::config::MigrationEnv;
use crate::Error;

fn unreleased_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^checked-alter-to-\d{8}-\d{6}\.zip$").expect("unreleased name pattern is valid")
    })
}

pub fn unreleased_archive_name(now: &DateTime<Local>) -> String {
    format!("checked-alter-to-{}.zip", now.format("%Y%m%d-%H%M%S"))
}

#[derive(Debug, Clone)]
pub struct AlterHistory {
    history_dir: PathBuf,
    unreleased_dir: PathBuf,
}

impl AlterHistory {
    pub fn new(env: &MigrationEnv) -> Self {
        Self {
            history_dir: env.history_dir(),
            unreleased_dir: env.unreleased_dir(),
        }
    }

    pub fn unreleased_archives(&self) -> Result<Vec<PathBuf>, Error> {
        let entries = match fs::read_dir(&self.unreleased_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut archives = Vec::new();
        for entry in entries {
            let entry = entry?;
            let matches = entry
                .file_name()
                .to_str()
                .map(|name| unreleased_pattern().is_match(name))
                .unwrap_or(false);
            if matches && entry.file_type()?.is_file() {
                archives.push(entry.path());
            }
        }
        archives.sort();
        Ok(archives)
    }

    /// Archives `files` (all under `alter_dir`) as the unreleased checked
    /// bundle, replacing older ones, then removes them from `alter_dir`.
    pub fn stage_unreleased(
        &self,
        alter_dir: &Path,
        files: &[PathBuf],
        now: &DateTime<Local>,
    ) -> Result<PathBuf, Error> {
        let archive = self.unreleased_dir.join(unreleased_archive_name(now));
        let written = checkpoint::compress(alter_dir, &archive, |path| {
            files.iter().any(|file| file == path)
        })?;

        for older in self.unreleased_archives()? {
            if older != archive {
                fs::remove_file(&older)?;
                debug!(archive = %older.display(), "replaced unreleased archive");
            }
        }
        for file in files {
            match fs::remove_file(file) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }

        info!(archive = %archive.display(), files = written.len(), "checked alter staged as unreleased");
        Ok(archive)
    }

    /// Extracts the latest unreleased bundle into `alter_dir`.
    pub fn recover_unreleased(&self, alter_dir: &Path) -> Result<Vec<PathBuf>, Error> {
        let Some(latest) = self.unreleased_archives()?.pop() else {
            return Ok(Vec::new());
        };
        let restored = checkpoint::extract(&latest, alter_dir)?;
        info!(archive = %latest.display(), files = restored.len(), "recovered unreleased checked alter");
        Ok(restored)
    }

    /// Moves every unreleased archive into a dated release directory.
    pub fn release_unreleased(&self, now: &DateTime<Local>) -> Result<Option<PathBuf>, Error> {
        let archives = self.unreleased_archives()?;
        if archives.is_empty() {
            return Ok(None);
        }

        let release_dir = self
            .history_dir
            .join(now.format("%Y%m%d").to_string())
            .join(now.format("%Y%m%d-%H%M%S").to_string());
        fs::create_dir_all(&release_dir)?;
        for archive in &archives {
            let Some(name) = archive.file_name() else { continue };
            fs::rename(archive, release_dir.join(name))?;
        }

        info!(dir = %release_dir.display(), archives = archives.len(), "released checked alter");
        Ok(Some(release_dir))
    }

    pub fn released_on(&self, date: NaiveDate) -> Result<Vec<PathBuf>, Error> {
        let day_dir = self.history_dir.join(date.format("%Y%m%d").to_string());
        self.released_under(&day_dir)
    }

    pub fn latest_released(&self) -> Result<Option<PathBuf>, Error> {
        Ok(self.released_under(&self.history_dir)?.pop())
    }

    fn released_under(&self, dir: &Path) -> Result<Vec<PathBuf>, Error> {
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut archives = Vec::new();
        let walker = WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| entry.path() != self.unreleased_dir);
        for entry in walker {
            let entry = entry?;
            let is_bundle = entry
                .file_name()
                .to_str()
                .map(|name| unreleased_pattern().is_match(name))
                .unwrap_or(false);
            if entry.file_type().is_file() && is_bundle {
                archives.push(entry.into_path());
            }
        }
        archives.sort();
        Ok(archives)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MigrationConfig;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn at(day: u32, hour: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 5, day, hour, 30, 15).unwrap()
    }

    #[test]
    fn stage_recover_and_release_cycle() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let env = MigrationEnv::new(temp_dir.path(), MigrationConfig::default());
        let history = AlterHistory::new(&env);
        let alter_dir = env.alter_dir();
        fs::create_dir_all(&alter_dir)?;
        let alter = alter_dir.join("alter-schema.sql");
        let take_finally = alter_dir.join("take-finally.sql");
        fs::write(&alter, "alter table member add column email text;")?;
        fs::write(&take_finally, "select 1;")?;
        fs::write(alter_dir.join("notes.md"), "not part of the bundle")?;

        history.stage_unreleased(&alter_dir, &[alter.clone(), take_finally.clone()], &at(1, 9))?;
        assert!(!alter.exists());
        assert!(alter_dir.join("notes.md").exists());

        fs::write(&alter, "alter table member add column phone text;")?;
        let latest = history.stage_unreleased(&alter_dir, &[alter.clone()], &at(1, 10))?;
        assert_eq!(history.unreleased_archives()?, vec![latest]);
        Ok(())
    }

    #[test]
    fn recovered_bundle_is_released_by_date() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let env = MigrationEnv::new(temp_dir.path(), MigrationConfig::default());
        let history = AlterHistory::new(&env);
        let alter_dir = env.alter_dir();
        fs::create_dir_all(&alter_dir)?;
        let alter = alter_dir.join("alter-schema.sql");
        fs::write(&alter, "create table purchase(id integer);")?;

        history.stage_unreleased(&alter_dir, &[alter.clone()], &at(2, 9))?;
        let restored = history.recover_unreleased(&alter_dir)?;
        assert_eq!(restored, vec![alter.clone()]);
        assert_eq!(
            fs::read_to_string(&alter)?,
            "create table purchase(id integer);"
        );

        let release_dir = history.release_unreleased(&at(3, 18))?.unwrap();
        assert!(release_dir.ends_with("20240503/20240503-183015"));
        assert!(history.unreleased_archives()?.is_empty());

        let released = history.released_on(NaiveDate::from_ymd_opt(2024, 5, 3).unwrap())?;
        assert_eq!(released.len(), 1);
        assert_eq!(history.latest_released()?, released.last().cloned());
        assert!(history
            .released_on(NaiveDate::from_ymd_opt(2024, 5, 2).unwrap())?
            .is_empty());
        Ok(())
    }

    #[test]
    fn nothing_to_recover_or_release() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let env = MigrationEnv::new(temp_dir.path(), MigrationConfig::default());
        let history = AlterHistory::new(&env);
        assert!(history.recover_unreleased(&env.alter_dir())?.is_empty());
        assert!(history.release_unreleased(&at(1, 1))?.is_none());
        assert!(history.latest_released()?.is_none());
        Ok(())
    }
}
