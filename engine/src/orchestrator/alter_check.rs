// In engine/src/orchestrator/alter_check.rs
use std::collections::BTreeMap;

use chrono::Local;
use tracing::warn;

use super::{RunOutcome, Task, Trail};
use crate::alter::{AlterLocator, AlterStage, BundleOrigin};
use crate::config::MigrationEnv;
use crate::executor::SqlExecutor;
use crate::history::AlterHistory;
use crate::marker::{MarkerKind, MarkerStore};
use crate::previous::{PreviousAgent, RestoreSource};
use crate::replay::{ReplayDirection, SchemaReplayer};
use crate::schema::{SchemaInspector, SnapshotAdapter};
use crate::Error;

/// Verifies that the alter bundle turns the previous schema into the next one.
pub struct AlterCheck<'a> {
    env: &'a MigrationEnv,
    replayer: &'a dyn SchemaReplayer,
    executor: &'a dyn SqlExecutor,
    inspector: &'a dyn SchemaInspector,
    markers: MarkerStore,
}

impl<'a> AlterCheck<'a> {
    pub fn new(
        env: &'a MigrationEnv,
        replayer: &'a dyn SchemaReplayer,
        executor: &'a dyn SqlExecutor,
        inspector: &'a dyn SchemaInspector,
    ) -> Self {
        Self {
            env,
            replayer,
            executor,
            inspector,
            markers: MarkerStore::new(env.marker_dir()),
        }
    }

    pub fn check_alter(&self) -> RunOutcome {
        let mut trail = Trail::new(Task::AlterCheck);
        let adapter = SnapshotAdapter::new(self.env, self.inspector);

        let result = self.run(&mut trail, &adapter);
        if let Err(err) = adapter.delete_snapshots() {
            warn!(error = %err, "failed to delete schema snapshots");
        }

        match result {
            Ok(()) => trail.succeed(),
            Err(err) => trail.fail(err),
        }
    }

    fn run(&self, trail: &mut Trail, adapter: &SnapshotAdapter<'_>) -> Result<(), Error> {
        self.markers.delete_all_ng()?;
        self.markers.delete(MarkerKind::AlterCheck)?;
        adapter.delete_snapshots()?;

        let playsql_dir = self.env.playsql_dir();
        if let Err(err) = self.replayer.replay(ReplayDirection::Next, &playsql_dir) {
            let notice = format!(
                "Failed to build the next schema.\nresources: {}\ncause: {err:#}",
                playsql_dir.display()
            );
            self.markers.write(MarkerKind::NextNg, &notice)?;
            return Err(Error::NextBuildFailure {
                resource_dir: playsql_dir,
                source: err.into(),
            });
        }
        let next = adapter.snapshot_next()?;
        trail.note(format!("next schema built: {} table(s)", next.table_count()));

        let restore = PreviousAgent::new(self.env, self.replayer).restore_previous()?;
        match &restore.source {
            RestoreSource::Archive(archive) => {
                trail.note(format!("previous schema restored from {}", archive.display()));
                trail.file(archive.clone());
            }
            RestoreSource::Extracted => trail.note("previous schema restored from extracted resources"),
            RestoreSource::Skipped => {
                trail.note("no previous schema saved yet, the alter runs against the next schema")
            }
        }

        let bundle = AlterLocator::new(self.env).locate()?;
        trail.note(format!(
            "alter bundle: {} file(s), {}",
            bundle.files.len(),
            origin_label(bundle.origin)
        ));
        trail.files(bundle.files.iter().cloned());

        let report = match AlterStage::new(self.env, self.executor).apply_and_assert(&bundle) {
            Ok(report) => report,
            Err(err) => {
                self.mark_alter_ng(&err)?;
                return Err(err);
            }
        };
        trail.files(report.take_finally.touched_files.iter().cloned());
        trail.note(format!(
            "alter applied: {} statement(s), {} take-finally file(s) passed",
            report.alter_statement_count(),
            report.take_finally.touched_files.len()
        ));

        let previous = adapter.snapshot_previous()?;
        let diff = adapter.diff(&next, &previous);
        if diff.has_diff {
            let (diff_file, summary_file) = adapter.write_diff_result(&diff)?;
            let err = Error::DifferenceFound {
                report: Box::new(diff),
                diff_file,
                summary_file,
            };
            self.mark_alter_ng(&err)?;
            return Err(err);
        }
        trail.note("altered previous schema matches the next schema");

        if report.alter_statement_count() == 0 {
            return Err(Error::EmptyAlterSuccess {
                origin: bundle.origin,
                files: bundle.files,
            });
        }

        let staged = report.executed_files();
        let archive = AlterHistory::new(self.env).stage_unreleased(
            &self.env.alter_dir(),
            &staged,
            &Local::now(),
        )?;
        trail.note(format!("checked alter staged at {}", archive.display()));
        trail.file(archive.clone());

        let mut metadata = BTreeMap::new();
        metadata.insert("unreleased".to_string(), archive.display().to_string());
        for (index, file) in staged.iter().enumerate() {
            metadata.insert(format!("file.{index:02}"), file.display().to_string());
        }
        self.markers.write_with_metadata(
            MarkerKind::AlterCheck,
            "The alter bundle was verified and is waiting for save-previous.",
            metadata,
        )?;
        self.markers.delete_all_ng()?;
        adapter.delete_diff_result()?;
        Ok(())
    }

    fn mark_alter_ng(&self, err: &Error) -> Result<(), Error> {
        let Some(code) = err.alter_ng_code() else {
            return Ok(());
        };

        let mut notice = err.to_string();
        let mut metadata = BTreeMap::new();
        if let Some(file) = err.failed_file() {
            notice.push_str(&format!("\nfailed file: {}", file.path.display()));
            metadata.insert("failed_file".to_string(), file.path.display().to_string());
        }
        match err {
            Error::AlterExecutionFailure {
                statement, elapsed, ..
            }
            | Error::TakeFinallyAssertionFailure {
                statement, elapsed, ..
            } => {
                if let Some(statement) = statement {
                    notice.push_str(&format!("\nstatement: {statement}"));
                }
                metadata.insert("elapsed_ms".to_string(), elapsed.as_millis().to_string());
            }
            Error::DifferenceFound {
                report, diff_file, ..
            } => {
                notice.push('\n');
                notice.push_str(&report.summary_lines().join("\n"));
                metadata.insert("diff_file".to_string(), diff_file.display().to_string());
                metadata.insert(
                    "table_count_delta".to_string(),
                    report.table_count_delta().to_string(),
                );
            }
            _ => {}
        }

        self.markers
            .write_with_metadata(MarkerKind::AlterNg(code), &notice, metadata)?;
        Ok(())
    }
}

fn origin_label(origin: BundleOrigin) -> &'static str {
    match origin {
        BundleOrigin::Authored => "authored",
        BundleOrigin::RecoveredUnreleased => "recovered from unreleased history",
        BundleOrigin::Placeholder => "empty placeholder",
    }
}
