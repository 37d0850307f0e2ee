// In engine/src/orchestrator/save_previous.rs
use std::collections::BTreeMap;
use std::fs;

use chrono::Local;

use super::{RunOutcome, Task, Trail};
use crate::alter::{blank_alter_files, pending_alter_files};
use crate::checkpoint;
use crate::config::MigrationEnv;
use crate::history::AlterHistory;
use crate::marker::{MarkerKind, MarkerStore};
use crate::previous::PreviousAgent;
use crate::provenance;
use crate::replay::SchemaReplayer;
use crate::Error;

/// Checkpoints the current `playsql/` baseline as the new previous archive.
pub struct SavePrevious<'a> {
    env: &'a MigrationEnv,
    replayer: &'a dyn SchemaReplayer,
    markers: MarkerStore,
}

impl<'a> SavePrevious<'a> {
    pub fn new(env: &'a MigrationEnv, replayer: &'a dyn SchemaReplayer) -> Self {
        Self {
            env,
            replayer,
            markers: MarkerStore::new(env.marker_dir()),
        }
    }

    pub fn save_previous(&self) -> RunOutcome {
        let mut trail = Trail::new(Task::SavePrevious);
        match self.run(&mut trail) {
            Ok(()) => trail.succeed(),
            Err(err) => trail.fail(err),
        }
    }

    fn run(&self, trail: &mut Trail) -> Result<(), Error> {
        let pending = pending_alter_files(self.env)?;
        if !pending.is_empty() {
            return Err(Error::SavePreviousInvalidStatus { pending });
        }

        self.markers
            .write(MarkerKind::SavePrevious, "save-previous is in progress.")?;
        let now = Local::now();

        for blank in blank_alter_files(self.env)? {
            fs::remove_file(&blank)?;
            trail.note(format!("removed empty alter placeholder {}", blank.display()));
        }

        if let Some(release_dir) = AlterHistory::new(self.env).release_unreleased(&now)? {
            trail.note(format!("checked alter released to {}", release_dir.display()));
            trail.file(release_dir);
        }

        let previous_dir = self.env.previous_dir();
        let playsql_dir = self.env.playsql_dir();
        checkpoint::purge_extracted(&previous_dir)?;
        let copied = checkpoint::copy_tree(&playsql_dir, &self.env.previous_playsql_dir())?;
        if copied.is_empty() {
            return Err(Error::Invalid(format!(
                "no baseline resources found in {}",
                playsql_dir.display()
            )));
        }
        let manifest = provenance::manifest(&previous_dir, &copied)?;

        let removed = checkpoint::delete_archives(&previous_dir)?;
        let archive = previous_dir.join(checkpoint::archive_name(&now));
        let written = checkpoint::compress(&previous_dir, &archive, |_| true)?;
        checkpoint::purge_extracted(&previous_dir)?;
        trail.note(format!(
            "saved {} file(s) to {} (replaced {removed} archive(s))",
            written.len(),
            archive.display()
        ));
        trail.file(archive.clone());

        let notice = if self.env.config().validate_saved_previous {
            PreviousAgent::new(self.env, self.replayer).validate_archive(&archive)?;
            trail.note("saved archive replays cleanly");
            "The previous schema was saved and validated."
        } else {
            "The previous schema was saved without validation."
        };

        let mut metadata: BTreeMap<String, String> = manifest
            .into_iter()
            .map(|(path, sha256)| (format!("sha256:{path}"), sha256))
            .collect();
        metadata.insert("archive".to_string(), archive.display().to_string());
        self.markers.write_with_metadata(
            MarkerKind::PreviousOk,
            notice,
            metadata,
        )?;
        self.markers.delete(MarkerKind::SavePrevious)?;
        self.markers.delete(MarkerKind::AlterCheck)?;
        Ok(())
    }
}
