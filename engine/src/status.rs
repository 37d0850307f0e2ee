// In engine/src/status.rs
use std::path::PathBuf;

use serde::Serialize;

use crate::alter::pending_alter_files;
use crate::checkpoint;
use crate::config::MigrationEnv;
use crate::history::AlterHistory;
use crate::marker::{AlterNgCode, MarkerKind, MarkerRecord, MarkerStore};
use crate::Error;

#[derive(Debug, Clone, Serialize)]
pub struct MarkerState {
    pub kind: String,
    pub file: PathBuf,
    pub record: Option<MarkerRecord>,
}

/// Snapshot of the working root between runs.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub markers: Vec<MarkerState>,
    pub pending_alter: Vec<PathBuf>,
    pub unreleased: Vec<PathBuf>,
    pub latest_previous: Option<PathBuf>,
}

impl PipelineStatus {
    pub fn load(env: &MigrationEnv) -> Result<Self, Error> {
        let store = MarkerStore::new(env.marker_dir());
        let mut markers = Vec::new();
        for kind in MarkerKind::ALL {
            if let Some(record) = store.read(kind)? {
                let kind = match (kind, record.code) {
                    (MarkerKind::AlterNg(_), Some(code)) => MarkerKind::AlterNg(code),
                    _ => kind,
                };
                markers.push(MarkerState {
                    kind: kind.to_string(),
                    file: store.path_of(kind),
                    record: Some(record),
                });
            }
        }

        Ok(Self {
            markers,
            pending_alter: pending_alter_files(env)?,
            unreleased: AlterHistory::new(env).unreleased_archives()?,
            latest_previous: checkpoint::find_latest_archive(&env.previous_dir())?,
        })
    }

    pub fn has_marker(&self, label: &str) -> bool {
        self.markers.iter().any(|marker| marker.kind.starts_with(label))
    }

    /// One-line hint for the operator.
    pub fn next_step(&self) -> String {
        if self.has_marker(MarkerKind::NextNg.label()) {
            return "fix playsql/ so the next schema builds, then run check-alter".to_string();
        }
        if self.has_marker(MarkerKind::PreviousNg.label()) {
            return "fix or re-save the previous archive, then run check-alter".to_string();
        }
        if self.has_marker(&MarkerKind::AlterNg(AlterNgCode::Alf).to_string()) {
            return "fix the failing alter statement, then run check-alter".to_string();
        }
        if self.has_marker(&MarkerKind::AlterNg(AlterNgCode::Tff).to_string()) {
            return "fix the alter or the take-finally assertion, then run check-alter".to_string();
        }
        if self.has_marker(&MarkerKind::AlterNg(AlterNgCode::Dif).to_string()) {
            return "complete the alter script using alter-check-result.txt, then run check-alter".to_string();
        }
        if self.has_marker(MarkerKind::SavePrevious.label()) {
            return "a save-previous did not finish; run save-previous again".to_string();
        }
        if !self.pending_alter.is_empty() {
            return "run check-alter to verify the pending alter scripts".to_string();
        }
        if self.latest_previous.is_none() {
            return "no previous saved yet; run save-previous on the released schema".to_string();
        }
        if !self.unreleased.is_empty() {
            return "alter verified; run save-previous after releasing".to_string();
        }
        "up to date; change playsql/ and write an alter script to start".to_string()
    }
}
