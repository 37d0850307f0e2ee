// In engine/src/schema/adapter.rs
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::{diff_schemas, DiffReport, SchemaInspector, SchemaSnapshot};
use crate::config::MigrationEnv;
use crate::Error;

/// Takes snapshots through an inspector and manages their transient files
/// plus the durable diff artifacts.
pub struct SnapshotAdapter<'a> {
    inspector: &'a dyn SchemaInspector,
    next_file: PathBuf,
    previous_file: PathBuf,
    result_file: PathBuf,
    summary_file: PathBuf,
}

impl<'a> SnapshotAdapter<'a> {
    pub fn new(env: &MigrationEnv, inspector: &'a dyn SchemaInspector) -> Self {
        Self {
            inspector,
            next_file: env.next_snapshot_file(),
            previous_file: env.previous_snapshot_file(),
            result_file: env.diff_result_file(),
            summary_file: env.diff_summary_file(),
        }
    }

    pub fn snapshot_next(&self) -> Result<SchemaSnapshot, Error> {
        self.capture("snapshot next schema", &self.next_file)
    }

    pub fn snapshot_previous(&self) -> Result<SchemaSnapshot, Error> {
        self.capture("snapshot previous schema", &self.previous_file)
    }

    fn capture(&self, phase: &'static str, file: &Path) -> Result<SchemaSnapshot, Error> {
        let snapshot = self
            .inspector
            .snapshot()
            .map_err(|err| Error::Collaborator {
                phase,
                source: err.into(),
            })?;
        snapshot.save(file)?;
        debug!(
            file = %file.display(),
            tables = snapshot.table_count(),
            "schema snapshot written"
        );
        Ok(snapshot)
    }

    pub fn diff(&self, next: &SchemaSnapshot, previous: &SchemaSnapshot) -> DiffReport {
        diff_schemas(next, previous)
    }

    /// Writes the JSON diff document and its text summary; returns the JSON path.
    /// Writes the JSON report and the text summary, returning both paths.
    pub fn write_diff_result(&self, report: &DiffReport) -> Result<(PathBuf, PathBuf), Error> {
        if let Some(parent) = self.result_file.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.result_file, serde_json::to_vec_pretty(report)?)?;
        let mut summary = report.summary_lines().join("\n");
        summary.push('\n');
        fs::write(&self.summary_file, summary)?;
        info!(file = %self.result_file.display(), tables = report.tables.len(), "diff result written");
        Ok((self.result_file.clone(), self.summary_file.clone()))
    }

    pub fn delete_diff_result(&self) -> Result<(), Error> {
        remove_if_exists(&self.result_file)?;
        remove_if_exists(&self.summary_file)
    }

    pub fn delete_snapshots(&self) -> Result<(), Error> {
        remove_if_exists(&self.next_file)?;
        remove_if_exists(&self.previous_file)
    }
}

fn remove_if_exists(path: &Path) -> Result<(), Error> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}
