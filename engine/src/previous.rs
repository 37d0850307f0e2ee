// In engine/src/previous.rs
//!
//! Restores the previous baseline into the live database.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::checkpoint;
use crate::config::MigrationEnv;
use crate::marker::{MarkerKind, MarkerStore};
use crate::replay::{has_replay_resources, ReplayDirection, SchemaReplayer};
use crate::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreSource {
    Archive(PathBuf),
    /// Resources were already extracted; no archive involved.
    Extracted,
    /// Nothing to restore from.
    Skipped,
}

#[derive(Debug, Clone)]
pub struct PreviousRestore {
    pub source: RestoreSource,
    pub extracted: Vec<PathBuf>,
    pub elapsed: Duration,
}

pub struct PreviousAgent<'a> {
    env: &'a MigrationEnv,
    replayer: &'a dyn SchemaReplayer,
    markers: MarkerStore,
}

impl<'a> PreviousAgent<'a> {
    pub fn new(env: &'a MigrationEnv, replayer: &'a dyn SchemaReplayer) -> Self {
        Self {
            env,
            replayer,
            markers: MarkerStore::new(env.marker_dir()),
        }
    }

    /// Extract the latest archive (if any), replay it, purge the extraction.
    pub fn restore_previous(&self) -> Result<PreviousRestore, Error> {
        let started = Instant::now();
        let previous_dir = self.env.previous_dir();
        let resource_dir = self.env.previous_playsql_dir();

        let (source, extracted) = match checkpoint::find_latest_archive(&previous_dir)? {
            Some(archive) => {
                checkpoint::purge_extracted(&previous_dir)?;
                match checkpoint::extract(&archive, &previous_dir) {
                    Ok(extracted) => (RestoreSource::Archive(archive), extracted),
                    Err(err) => {
                        self.mark_restore_failure(&resource_dir, &err.to_string())?;
                        return Err(Error::PreviousRestoreFailure {
                            resource_dir,
                            archive: Some(archive),
                            source: err.into(),
                        });
                    }
                }
            }
            None if has_replay_resources(&resource_dir, |path| self.env.is_replace_schema_file(path)) => {
                (RestoreSource::Extracted, Vec::new())
            }
            None => {
                warn!(dir = %previous_dir.display(), "no previous archive or resources, restore skipped");
                return Ok(PreviousRestore {
                    source: RestoreSource::Skipped,
                    extracted: Vec::new(),
                    elapsed: started.elapsed(),
                });
            }
        };

        let replayed = self.replayer.replay(ReplayDirection::Previous, &resource_dir);
        let archive = match &source {
            RestoreSource::Archive(archive) => Some(archive.clone()),
            _ => None,
        };
        if let Err(err) = replayed {
            self.mark_restore_failure(&resource_dir, &format!("{err:#}"))?;
            if archive.is_some() {
                if let Err(purge_err) = checkpoint::purge_extracted(&previous_dir) {
                    warn!(error = %purge_err, "failed to purge extracted previous resources");
                }
            }
            return Err(Error::PreviousRestoreFailure {
                resource_dir,
                archive,
                source: err.into(),
            });
        }
        if archive.is_some() {
            checkpoint::purge_extracted(&previous_dir)?;
        }

        let restore = PreviousRestore {
            source,
            extracted,
            elapsed: started.elapsed(),
        };
        info!(source = ?restore.source, elapsed_ms = restore.elapsed.as_millis() as u64, "previous schema restored");
        Ok(restore)
    }

    /// Replays a freshly written archive to prove it can be restored.
    pub fn validate_archive(&self, archive: &Path) -> Result<(), Error> {
        let previous_dir = self.env.previous_dir();
        let resource_dir = self.env.previous_playsql_dir();

        let outcome = checkpoint::extract(archive, &previous_dir)
            .map_err(|err| -> crate::BoxError { err.into() })
            .and_then(|_| {
                self.replayer
                    .replay(ReplayDirection::Previous, &resource_dir)
                    .map_err(Into::into)
            });
        let purged = checkpoint::purge_extracted(&previous_dir);

        if let Err(source) = outcome {
            let notice = format!(
                "The saved previous archive could not be replayed.\narchive: {}\ncause: {source}",
                archive.display()
            );
            self.markers.write(MarkerKind::PreviousNg, &notice)?;
            return Err(Error::CheckpointValidationFailure {
                archive: archive.to_path_buf(),
                source,
            });
        }
        purged?;
        info!(archive = %archive.display(), "previous archive validated");
        Ok(())
    }

    fn mark_restore_failure(&self, resource_dir: &Path, cause: &str) -> Result<(), Error> {
        let notice = format!(
            "Failed to roll the database back to the previous schema.\nresources: {}\ncause: {cause}\n\
             Fix the previous resources or save a new previous, then run the check again.",
            resource_dir.display()
        );
        self.markers.write(MarkerKind::PreviousNg, &notice)?;
        Ok(())
    }
}
